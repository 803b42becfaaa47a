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

//! The shadow file: a private mirror of the portion of the target the engine
//! has observed so far.

use crate::error::{Error, ResultExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Append-only mirror of the target's observed contents, plus full reload for
/// the diff-triggered recovery path.
pub struct ShadowStore {
    file: File,
    size: u64,
}

impl ShadowStore {
    /// Opens (creating if absent) and truncates the shadow file to zero, per
    /// the startup contract in §6.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(format!("open storage file '{}'", path.display()))?;
        file.set_len(0)
            .context(format!("truncate storage file '{}'", path.display()))?;
        Ok(Self { file, size: 0 })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends `bytes` to the end of the shadow. Durable before returning:
    /// a subsequent `read_tail` will see the written bytes.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::End(0))
            .context("seek storage file to end")?;
        self.file
            .write_all(bytes)
            .context("write to storage file")?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Removes the last `n` bytes from the shadow.
    pub fn trim(&mut self, n: u64) -> Result<(), Error> {
        if n > self.size {
            return Err(Error::last_os_error(format!(
                "trim {} bytes from storage file shorter than that",
                n
            )));
        }
        let new_size = self.size - n;
        self.file
            .set_len(new_size)
            .context("truncate storage file")?;
        self.size = new_size;
        Ok(())
    }

    /// Reads and removes the last `n` bytes of the shadow (used to stream
    /// removed content to the notify child before trimming).
    pub fn read_tail(&mut self, n: u64) -> Result<Vec<u8>, Error> {
        let n = n.min(self.size);
        let start = self.size - n;
        self.file
            .seek(SeekFrom::Start(start))
            .context("seek storage file to tail")?;
        let mut buf = vec![0u8; n as usize];
        self.file
            .read_exact(&mut buf)
            .context("read tail of storage file")?;
        Ok(buf)
    }

    /// Truncates the shadow to zero and copies `source`'s entire contents
    /// into it, used to resynchronize after an in-place edit.
    pub fn reload(&mut self, source: &mut File) -> Result<(), Error> {
        self.file.set_len(0).context("truncate storage file")?;
        self.file
            .seek(SeekFrom::Start(0))
            .context("seek storage file to start")?;
        source
            .seek(SeekFrom::Start(0))
            .context("seek monitor file to start")?;

        let mut buffer = [0u8; 1024];
        let mut total: u64 = 0;
        loop {
            let read = source
                .read(&mut buffer)
                .context("read monitor file during reload")?;
            if read == 0 {
                break;
            }
            self.file
                .write_all(&buffer[..read])
                .context("write storage file during reload")?;
            total += read as u64;
        }
        self.size = total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn shadow() -> (tempfile::TempDir, ShadowStore) {
        let dir = tempfile::tempdir().unwrap();
        let shadow = ShadowStore::open(dir.path().join("shadow")).unwrap();
        (dir, shadow)
    }

    #[test]
    fn append_then_read_tail_round_trips() {
        let (_dir, mut shadow) = shadow();
        shadow.append(b"hello\n").unwrap();
        assert_eq!(shadow.size(), 6);
        assert_eq!(shadow.read_tail(6).unwrap(), b"hello\n");
    }

    #[test]
    fn trim_shrinks_and_errors_past_size() {
        let (_dir, mut shadow) = shadow();
        shadow.append(b"abcdef").unwrap();
        shadow.trim(2).unwrap();
        assert_eq!(shadow.size(), 4);
        assert!(shadow.trim(100).is_err());
    }

    #[test]
    fn reload_mirrors_source_exactly() {
        let (_dir, mut shadow) = shadow();
        shadow.append(b"stale contents").unwrap();

        let mut target = NamedTempFile::new().unwrap();
        target.write_all(b"a\nX\nc\n").unwrap();
        let mut target_file = target.reopen().unwrap();

        shadow.reload(&mut target_file).unwrap();
        assert_eq!(shadow.size(), 6);
        assert_eq!(shadow.read_tail(6).unwrap(), b"a\nX\nc\n");
    }
}
