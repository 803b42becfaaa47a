/*
    MIT License

    Copyright (c) 2020 Philipp Schuster

    Permission is hereby granted, free of charge, to any person obtaining a copy
    of this software and associated documentation files (the "Software"), to deal
    in the Software without restriction, including without limitation the rights
    to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
    copies of the Software, and to permit persons to whom the Software is
    furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in all
    copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
    OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
    SOFTWARE.
*/

//! Thin CLI front end over [`filemonitor`]'s reconciliation loop: parse
//! `Config`, set the umask, build the loop, install the signal handlers, run
//! it, and translate its result into the exit codes from the spec's §6/§7.

use std::process::ExitCode;

/// `ReconciliationLoop` only exists on kqueue-family platforms (see
/// `filemonitor::event`); everywhere else, say so instead of failing to link.
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
fn main() -> ExitCode {
    eprintln!("filemonitor: only supported on kqueue-based platforms (macOS, the BSDs)");
    ExitCode::from(1)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn main() -> ExitCode {
    use filemonitor::{Config, ReconciliationLoop};

    let args: Vec<String> = std::env::args().collect();
    let program_name = args.first().cloned().unwrap_or_else(|| "filemonitor".to_string());

    // Owner-only permissions on anything we create (shadow, log).
    unsafe {
        libc::umask(0o077);
    }

    let config = match Config::parse(&args) {
        Ok(config) => config,
        Err(usage) => {
            eprintln!("{}", usage);
            return ExitCode::from(1);
        }
    };

    let engine = match ReconciliationLoop::new(&config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{}: {}", program_name, err);
            return ExitCode::from(1);
        }
    };

    if let Some(fd) = engine.log_fd() {
        filemonitor::signals::install(fd);
    }

    match engine.run() {
        Ok(code) => {
            filemonitor::signals::clear_log_fd();
            ExitCode::from(code as u8)
        }
        Err(err) => {
            eprintln!("{}: {}", program_name, err);
            filemonitor::signals::clear_log_fd();
            ExitCode::from(1)
        }
    }
}
