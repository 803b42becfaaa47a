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

//! The integration component: consumes events, classifies each as an append,
//! truncate, or in-place edit, and drives the shadow store, log writer, and
//! child pipe harness to match. This is the only module that reads the
//! target file directly.

use crate::child::{self, Direction};
use crate::config::Config;
use crate::error::{Error, ResultExt};
use crate::event::{Event, EventSource, VnodeEvent};
use crate::log::LogWriter;
use crate::shadow::ShadowStore;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

const TRANSFER_BUFFER: usize = 1024;
const DIFF_SETTLE_DELAY: Duration = Duration::from_millis(100);
const MONITOR_MSG_VAR: &str = "MONITOR_MSG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DevIno {
    dev: u64,
    ino: u64,
}

impl DevIno {
    fn from_stat(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        }
    }
}

/// The monitored file: an open, close-on-exec handle plus the (device, inode)
/// pair captured at startup, and the cursor (== shadow size) the
/// reconciliation loop keeps in lockstep with it.
struct Target {
    file: File,
    path: String,
    dev_ino: DevIno,
    cursor: u64,
}

impl Target {
    fn open(path: &str) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .context(format!("unable to open monitor file '{}'", path))?;
        set_cloexec(file.as_raw_fd())?;
        let st = fstat_fd(file.as_raw_fd())?;
        Ok(Self {
            file,
            path: path.to_owned(),
            dev_ino: DevIno::from_stat(&st),
            cursor: 0,
        })
    }

    fn fstat(&self) -> Result<libc::stat, Error> {
        fstat_fd(self.file.as_raw_fd())
    }

    fn seek_to_cursor(&mut self) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(self.cursor))
            .context("seek monitor file")?;
        Ok(())
    }
}

fn set_cloexec(fd: std::os::unix::io::RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(Error::last_os_error("fcntl F_GETFD"));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error("fcntl F_SETFD"));
        }
    }
    Ok(())
}

fn fstat_fd(fd: std::os::unix::io::RawFd) -> Result<libc::stat, Error> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(Error::last_os_error("fstat"));
    }
    Ok(st)
}

fn stat_path(path: &str) -> Result<libc::stat, Error> {
    let cpath =
        CString::new(path).map_err(|_| Error::last_os_error(format!("stat '{}'", path)))?;
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::stat(cpath.as_ptr(), &mut st) } != 0 {
        return Err(Error::last_os_error(format!("stat '{}'", path)));
    }
    Ok(st)
}

fn format_attrib(st: &libc::stat) -> String {
    let mtime = unsafe {
        let mut tm: libc::tm = mem::zeroed();
        let secs = st.st_mtime;
        libc::localtime_r(&secs, &mut tm);
        let format = CString::new("%c").unwrap();
        let mut buffer = [0i8; 256];
        let written = libc::strftime(buffer.as_mut_ptr(), buffer.len(), format.as_ptr(), &tm);
        let bytes: Vec<u8> = buffer[..written].iter().map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };
    format!(
        "{}:{} {:04o} {}",
        st.st_uid,
        st.st_gid,
        st.st_mode & 0o7777,
        mtime
    )
}

/// Owns the single mutable view of cursor/shadow/child-sessions and drives
/// the classification algorithm.
pub struct ReconciliationLoop {
    target: Target,
    shadow: ShadowStore,
    log: LogWriter,
    events: EventSource,
    notify_command: Option<String>,
    diff_command: Option<String>,
}

impl ReconciliationLoop {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let target = Target::open(&config.monitor_path)?;
        let shadow = ShadowStore::open(&config.storage_path)?;
        let log = LogWriter::open(&config.log_path)?;
        let events = EventSource::new(target.file.as_raw_fd())
            .context("unable to create event queue")?;
        Ok(Self {
            target,
            shadow,
            log,
            events,
            notify_command: config.notify_command.clone(),
            diff_command: config.diff_command.clone(),
        })
    }

    /// Raw fd of the log file, for the caller to hand to [`crate::signals::install`].
    pub fn log_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.log.raw_fd()
    }

    /// Runs until a terminal event or an unrecoverable event-source error.
    /// Returns the process exit code.
    pub fn run(mut self) -> Result<i32, Error> {
        self.log.single_line("STARTED")?;
        self.log.flush()?;

        let code = loop {
            let event = self.events.next()?;
            let mut diff_candidate = false;

            let terminal = match event {
                Event::Vnode(vnode) => self.handle_vnode(vnode, &mut diff_candidate)?,
                Event::Written(delta) => {
                    self.handle_written(delta, &mut diff_candidate)?;
                    None
                }
            };

            if let Some(code) = terminal {
                break code;
            }

            if diff_candidate {
                self.handle_diff_candidate()?;
            }
        };

        self.log.flush()?;
        self.log.close();
        Ok(code)
    }

    /// Returns `Some(exit code)` if this event terminates the loop.
    fn handle_vnode(
        &mut self,
        vnode: VnodeEvent,
        diff_candidate: &mut bool,
    ) -> Result<Option<i32>, Error> {
        if vnode.deleted {
            self.log.single_line("DELETED => EXITING")?;
            self.log.flush()?;
            return Ok(Some(0));
        }
        if vnode.revoked {
            self.log.single_line("REVOKED => EXITING")?;
            self.log.flush()?;
            return Ok(Some(0));
        }
        if vnode.write {
            let size = self.target.fstat()?.st_size as u64;
            if self.target.cursor == size {
                *diff_candidate = true;
            }
        }
        if vnode.attrib {
            let st = self.target.fstat()?;
            self.log
                .single_line(&format!("ATTRIBUTE CHANGE: {}", format_attrib(&st)))?;
        }
        if vnode.renamed {
            self.log.single_line("RENAMED => EXITING")?;
            self.log.flush()?;
            return Ok(Some(0));
        }
        if vnode.link {
            let st = self.target.fstat()?;
            self.log
                .single_line(&format!("LINK COUNT CHANGED: {}", st.st_nlink))?;
        }
        self.log.flush()?;
        Ok(None)
    }

    fn handle_written(&mut self, delta: i64, diff_candidate: &mut bool) -> Result<(), Error> {
        if delta == 0 {
            return Ok(());
        }

        if delta > 0 {
            self.ingest_append(delta as u64)?;
            *diff_candidate = true;
        } else {
            self.ingest_truncate((-delta) as u64)?;
        }

        self.target.seek_to_cursor()?;
        Ok(())
    }

    fn ingest_append(&mut self, mut remaining: u64) -> Result<(), Error> {
        self.log.section_start("ADDED")?;
        let mut buffer = [0u8; TRANSFER_BUFFER];

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = self
                .target
                .file
                .read(&mut buffer[..want])
                .context("read monitor file")?;
            if read == 0 {
                // Short read: stop for this event, a later event resyncs.
                break;
            }
            self.shadow.append(&buffer[..read])?;
            self.log.raw(&buffer[..read])?;
            self.target.cursor += read as u64;
            remaining -= read as u64;
        }

        self.log.section_end("ADDED")?;
        self.log.flush()?;
        Ok(())
    }

    fn ingest_truncate(&mut self, amount: u64) -> Result<(), Error> {
        let mut notify = self.notify_command.as_deref().and_then(|cmd| {
            std::env::set_var(MONITOR_MSG_VAR, "truncated");
            let session = child::spawn(cmd, Direction::Write);
            std::env::remove_var(MONITOR_MSG_VAR);
            session
        });
        if let Some(session) = notify.as_ref() {
            child::ready(session);
        }

        self.log.section_start("REMOVED")?;
        let tail = self.shadow.read_tail(amount)?;
        self.log.raw(&tail)?;
        if let Some(session) = notify.as_mut() {
            let _ = session.pipe().write_all(&tail);
        }
        self.log.section_end("REMOVED")?;
        self.log.flush()?;

        if let Some(session) = notify.take() {
            child::close(session)?;
        }

        self.shadow.trim(amount)?;
        self.target.cursor -= amount;
        Ok(())
    }

    fn handle_diff_candidate(&mut self) -> Result<(), Error> {
        std::thread::sleep(DIFF_SETTLE_DELAY);

        let handle_stat = self.target.fstat()?;
        let path_stat = match stat_path(&self.target.path) {
            Ok(st) => st,
            // The path may no longer resolve to this inode (rotated away);
            // that disagreement is itself the signal to skip.
            Err(_) => return Ok(()),
        };

        let shadow_size = self.shadow.size();
        let target_size = handle_stat.st_size as u64;
        let consistent = DevIno::from_stat(&handle_stat) == DevIno::from_stat(&path_stat)
            && shadow_size == target_size
            && self.target.cursor == target_size;

        if !consistent {
            return Ok(());
        }

        let diff_command = match self.diff_command.as_deref() {
            Some(cmd) => cmd,
            None => return Ok(()),
        };
        let mut diff_session = match child::spawn(diff_command, Direction::Read) {
            Some(session) => session,
            None => return Ok(()),
        };
        child::ready(&diff_session);

        let mut buffer = [0u8; TRANSFER_BUFFER];
        let mut total: u64 = 0;
        let mut notify_session = None;

        loop {
            let read = match diff_session.pipe().read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };

            // The file may already be under a fresh write; a diff of a stale
            // shadow is worse than no diff.
            let current_size = self.target.fstat()?.st_size as u64;
            if current_size != shadow_size {
                break;
            }

            if total == 0 {
                self.log.section_start("DIFF")?;
                if let Some(cmd) = self.notify_command.as_deref() {
                    std::env::set_var(MONITOR_MSG_VAR, "edited");
                    let session = child::spawn(cmd, Direction::Write);
                    std::env::remove_var(MONITOR_MSG_VAR);
                    if let Some(session) = session.as_ref() {
                        child::ready(session);
                    }
                    notify_session = session;
                }
            }

            total += read as u64;
            if let Some(session) = notify_session.as_mut() {
                let _ = session.pipe().write_all(&buffer[..read]);
            }
            self.log.raw(&buffer[..read])?;
        }

        if let Some(session) = notify_session.take() {
            child::close(session)?;
        }
        child::close(diff_session)?;

        if total > 0 {
            self.log.section_end("DIFF")?;
            self.log.flush()?;
            self.shadow.reload(&mut self.target.file)?;
            self.target.cursor = self.shadow.size();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write as _;

    fn args(monitor: &str, storage: &str, log: &str) -> Vec<String> {
        vec![
            "prog".to_string(),
            monitor.to_string(),
            storage.to_string(),
            log.to_string(),
        ]
    }

    #[test]
    fn append_then_truncate_round_trips_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = dir.path().join("target");
        std::fs::write(&target_path, b"").unwrap();

        let storage_path = dir.path().join("shadow");
        let log_path = dir.path().join("log");

        let cfg = Config::parse(&args(
            target_path.to_str().unwrap(),
            storage_path.to_str().unwrap(),
            log_path.to_str().unwrap(),
        ))
        .unwrap();

        let mut target = std::fs::OpenOptions::new()
            .append(true)
            .open(&target_path)
            .unwrap();

        let mut engine = ReconciliationLoop::new(&cfg).unwrap();

        target.write_all(b"hello\n").unwrap();
        target.flush().unwrap();
        engine.ingest_append(6).unwrap();
        engine.target.cursor = 6;

        assert_eq!(engine.shadow.size(), 6);

        engine.ingest_truncate(6).unwrap();
        assert_eq!(engine.shadow.size(), 0);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("ADDED >>>>>"));
        assert!(contents.contains("hello\n"));
        assert!(contents.contains("REMOVED >>>>>"));
    }

    #[test]
    fn diff_candidate_skips_silently_when_sizes_disagree() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = dir.path().join("target");
        std::fs::write(&target_path, b"a\nb\nc\n").unwrap();
        let storage_path = dir.path().join("shadow");
        let log_path = dir.path().join("log");

        let cfg = Config::parse(&args(
            target_path.to_str().unwrap(),
            storage_path.to_str().unwrap(),
            log_path.to_str().unwrap(),
        ))
        .unwrap();
        let mut engine = ReconciliationLoop::new(&cfg).unwrap();
        // Shadow is still empty (no ADDED has happened yet), so sizes disagree
        // and the diff candidate must be skipped without touching the shadow.
        engine.handle_diff_candidate().unwrap();
        assert_eq!(engine.shadow.size(), 0);
    }
}
