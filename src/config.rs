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

//! Positional command-line configuration: `[monitor file] [storage file] [log file]
//! (notify command) (diff command)`.

use std::fmt;

/// Parsed and validated command-line invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub monitor_path: String,
    pub storage_path: String,
    pub log_path: String,
    pub notify_command: Option<String>,
    pub diff_command: Option<String>,
}

/// Fewer than three positional arguments were given.
#[derive(Debug)]
pub struct UsageError {
    pub program_name: String,
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [monitor file] [storage file] [log file] (notify command) (diff command)",
            self.program_name
        )
    }
}

impl Config {
    /// Parses `args` as given by `std::env::args().collect::<Vec<_>>()`, i.e.
    /// `args[0]` is the program name and the positional parameters start at
    /// `args[1]`.
    pub fn parse(args: &[String]) -> Result<Config, UsageError> {
        let program_name = args.first().map(String::as_str).unwrap_or("filemonitor");

        if args.len() < 4 {
            return Err(UsageError {
                program_name: program_name.to_owned(),
            });
        }

        let non_empty = |s: &str| -> Option<String> {
            if s.is_empty() {
                None
            } else {
                Some(s.to_owned())
            }
        };

        Ok(Config {
            monitor_path: args[1].clone(),
            storage_path: args[2].clone(),
            log_path: args[3].clone(),
            notify_command: args.get(4).and_then(|s| non_empty(s)),
            diff_command: args.get(5).and_then(|s| non_empty(s)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_too_few_arguments() {
        let err = Config::parse(&args(&["prog", "a", "b"])).unwrap_err();
        assert_eq!(err.program_name, "prog");
    }

    #[test]
    fn accepts_minimal_invocation() {
        let cfg = Config::parse(&args(&["prog", "target", "shadow", "log"])).unwrap();
        assert_eq!(cfg.monitor_path, "target");
        assert_eq!(cfg.storage_path, "shadow");
        assert_eq!(cfg.log_path, "log");
        assert!(cfg.notify_command.is_none());
        assert!(cfg.diff_command.is_none());
    }

    #[test]
    fn empty_optional_commands_disable_the_feature() {
        let cfg = Config::parse(&args(&["prog", "t", "s", "l", "", ""])).unwrap();
        assert!(cfg.notify_command.is_none());
        assert!(cfg.diff_command.is_none());
    }

    #[test]
    fn non_empty_optional_commands_are_kept() {
        let cfg = Config::parse(&args(&["prog", "t", "s", "l", "mail -s x", "diff -u"])).unwrap();
        assert_eq!(cfg.notify_command.as_deref(), Some("mail -s x"));
        assert_eq!(cfg.diff_command.as_deref(), Some("diff -u"));
    }
}
