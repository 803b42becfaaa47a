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

//! Error type shared by every fallible operation in this crate.
//!
//! Every syscall wrapper in this crate fails with an [`io::Error`] that, on its
//! own, says nothing about which path or which step was involved. [`Error`]
//! pairs the OS error with that context so the startup messages in the binary
//! can be reproduced verbatim.

use std::{borrow::Cow, error, fmt, io};

#[derive(Debug)]
pub struct Error {
    /// Which error ultimately occurred.
    pub inner: io::Error,
    /// Which step the error comes from, e.g. "open target file 'foo.log'".
    pub context: Cow<'static, str>,
}

impl Error {
    /// Builds an `Error` from a raw `errno` value.
    pub fn from_raw_os_error<C>(code: i32, context: C) -> Self
    where
        C: Into<Cow<'static, str>>,
    {
        Self {
            inner: io::Error::from_raw_os_error(code),
            context: context.into(),
        }
    }

    /// Builds an `Error` from the current value of `errno`.
    pub fn last_os_error<C>(context: C) -> Self
    where
        C: Into<Cow<'static, str>>,
    {
        Self {
            inner: io::Error::last_os_error(),
            context: context.into(),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.inner)
    }
}

/// Attaches operation context to an [`io::Result`], turning it into a
/// `Result<T, Error>`.
pub trait ResultExt {
    type Ok;

    fn context<C>(self, context: C) -> Result<Self::Ok, Error>
    where
        C: Into<Cow<'static, str>>;
}

impl<T> ResultExt for Result<T, io::Error> {
    type Ok = T;

    fn context<C>(self, context: C) -> Result<T, Error>
    where
        C: Into<Cow<'static, str>>,
    {
        self.map_err(|inner| Error {
            inner,
            context: context.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_combines_context_and_inner() {
        let err = Error::from_raw_os_error(libc::ENOENT, "open target file 'foo'");
        let rendered = err.to_string();
        assert!(rendered.starts_with("open target file 'foo': "));
    }

    #[test]
    fn result_ext_attaches_context() {
        let io_err: io::Result<()> = Err(io::Error::from_raw_os_error(libc::EACCES));
        let err = io_err.context("open log file 'x'").unwrap_err();
        assert_eq!(err.context, "open log file 'x'");
    }
}
