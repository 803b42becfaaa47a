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

//! Installs the orderly-exit handler for fatal signals. Kept deliberately
//! outside the reconciliation loop's `Error` plumbing: the handler must not
//! allocate or lock anything, so it talks to a raw fd through an atomic
//! rather than going through [`crate::log::LogWriter`]'s buffered `File`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Raw fd of the currently open log file, or -1 if none/closed. Only an
/// atomic, never a `Mutex`: the handler must stay async-signal-safe.
static LOG_FD: AtomicI32 = AtomicI32::new(-1);

/// The signals the original treats as fatal-but-catchable. A few rare,
/// platform-specific ones from the original's `#ifdef`-guarded list
/// (`SIGEMT`, `SIGIOT`, `SIGTHR`) are left out here: `libc` only exposes the
/// constants that exist for the compilation target, so there is no portable
/// way to list them unconditionally the way C's preprocessor could.
const FATAL_SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGBUS,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGXCPU,
    libc::SIGXFSZ,
    libc::SIGVTALRM,
    libc::SIGPROF,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// Registers the orderly-exit handler on every signal in [`FATAL_SIGNALS`]
/// and sets `SIGPIPE` to be ignored (a dead notify child must not kill the
/// monitor). `log_fd` is the raw descriptor the handler writes one line to
/// before calling `_exit(255)`.
pub fn install(log_fd: RawFd) {
    LOG_FD.store(log_fd, Ordering::SeqCst);
    unsafe {
        for &sig in FATAL_SIGNALS {
            libc::signal(sig, handle_fatal as libc::sighandler_t);
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Called after the log is closed through the ordinary shutdown path, so a
/// signal arriving during process teardown doesn't write to a dangling fd.
pub fn clear_log_fd() {
    LOG_FD.store(-1, Ordering::SeqCst);
}

extern "C" fn handle_fatal(sig: libc::c_int) {
    // Reset to default first: a recursive fault (e.g. SIGSEGV inside this
    // handler) then terminates the process immediately instead of looping.
    unsafe {
        libc::signal(sig, libc::SIG_DFL as libc::sighandler_t);
    }

    let fd = LOG_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        write_single_line(fd, "SIGNAL => EXITING");
    }

    unsafe {
        libc::_exit(255);
    }
}

fn write_single_line(fd: RawFd, message: &str) {
    let line = format!("##### [{}] {} #####\n", timestamp(), message);
    unsafe {
        libc::write(fd, line.as_ptr() as *const libc::c_void, line.len());
    }
}

fn timestamp() -> String {
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        let format = std::ffi::CString::new("%c").unwrap();
        let mut buffer = [0i8; 256];
        let written = libc::strftime(buffer.as_mut_ptr(), buffer.len(), format.as_ptr(), &tm);
        let bytes: Vec<u8> = buffer[..written].iter().map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
