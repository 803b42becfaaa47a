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

//! Structured, section-delimited log records. Timestamps are formatted with
//! `strftime`/`localtime_r` directly, matching the original's `TIME_FORMAT
//! "%c"` byte-for-byte instead of switching to whatever a calendar crate's
//! default rendering would be.

use crate::error::{Error, ResultExt};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

const TIME_BUFFER_LEN: usize = 256;

/// Append-mode log sink for single-line, section, and raw-blob records.
pub struct LogWriter {
    file: Option<File>,
}

impl LogWriter {
    /// Opens (creating if absent) and truncates the log to zero, per §6.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .context(format!("open log file '{}'", path.display()))?;
        file.set_len(0)
            .context(format!("truncate log file '{}'", path.display()))?;
        Ok(Self { file: Some(file) })
    }

    pub fn single_line(&mut self, message: &str) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            write!(file, "##### [{}] {} #####\n", timestamp(), message).context("write log")?;
        }
        Ok(())
    }

    pub fn section_start(&mut self, label: &str) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            write!(file, "##### [{}] {} >>>>>\n", timestamp(), label).context("write log")?;
        }
        Ok(())
    }

    pub fn section_end(&mut self, label: &str) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            write!(file, "<<<<< [{}] {} #####\n", timestamp(), label).context("write log")?;
        }
        Ok(())
    }

    pub fn raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes).context("write log")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            file.flush().context("flush log")?;
        }
        Ok(())
    }

    /// Idempotent: safe to call more than once, including from a signal
    /// handler path that races the normal shutdown path.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// The raw fd backing the log, for [`crate::signals::install`] to keep a
    /// copy for its async-signal-safe write.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }
}

fn timestamp() -> String {
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);

        let format = std::ffi::CString::new("%c").unwrap();
        let mut buffer = [0i8; TIME_BUFFER_LEN];
        let written = libc::strftime(buffer.as_mut_ptr(), TIME_BUFFER_LEN, format.as_ptr(), &tm);
        let bytes: Vec<u8> = buffer[..written]
            .iter()
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_and_section_records_are_well_formed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut log = LogWriter::open(&path).unwrap();
            log.single_line("STARTED").unwrap();
            log.section_start("ADDED").unwrap();
            log.raw(b"hello\n").unwrap();
            log.section_end("ADDED").unwrap();
            log.flush().unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("STARTED #####\n"));
        assert!(contents.contains("ADDED >>>>>\n"));
        assert!(contents.contains("hello\n"));
        assert!(contents.contains("<<<<<"));
        assert!(contents.ends_with("ADDED #####\n"));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogWriter::open(dir.path().join("log")).unwrap();
        log.close();
        log.close();
        // Writes after close are silently dropped rather than panicking.
        log.single_line("ignored").unwrap();
    }

    #[test]
    fn open_truncates_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"leftover").unwrap();
        let mut log = LogWriter::open(&path).unwrap();
        log.single_line("STARTED").unwrap();
        drop(log);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("leftover"));
    }
}
