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

//! Spawns a `/bin/sh -c <command>` child, frozen with `SIGSTOP` until the
//! parent has its side of the pipe ready, generalizing the fork/exec/pipe
//! plumbing this crate inherited from a sibling-process piping library to the
//! single-child-at-a-time notify/diff use case with a stop/continue
//! rendezvous.

use crate::error::Error;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;

/// Which end of the pipe the parent keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The parent writes; the child reads from its stdin. Used for the
    /// notify command.
    Write,
    /// The parent reads; the child writes to its stdout. Used for the diff
    /// command.
    Read,
}

impl Direction {
    /// The pipe array index the parent retains, which happens to equal the
    /// standard descriptor number the child exposes on the other end
    /// (`STDIN_FILENO` for `Read`, `STDOUT_FILENO` for `Write`) because
    /// `pipe(2)` already orders its two descriptors read-then-write.
    fn parent_index(self) -> usize {
        match self {
            Direction::Read => libc::STDIN_FILENO as usize,
            Direction::Write => libc::STDOUT_FILENO as usize,
        }
    }
}

/// A running (or stopped-pending-resume) notify/diff child plus the parent's
/// side of its pipe.
pub struct ChildSession {
    pipe: Option<File>,
    pid: libc::pid_t,
    /// Set once the child has been reaped, by [`close`] or by `Drop`, so the
    /// two never race to `waitpid` the same pid.
    reaped: bool,
}

impl ChildSession {
    /// The parent's end of the pipe: write it for a notify session, read it
    /// for a diff session.
    ///
    /// Panics if called after the session has been closed; every caller in
    /// this crate uses the session strictly before handing it to [`close`].
    pub fn pipe(&mut self) -> &mut File {
        self.pipe.as_mut().expect("pipe used after child session was closed")
    }
}

/// Force-kills and reaps a child that a caller dropped mid-flight instead of
/// closing cleanly, the way `KillGuard::drop` does for the containers it
/// supervises: a `?` between spawn and close must not leave a running,
/// unreaped process behind.
impl Drop for ChildSession {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.pipe = None;
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        reap(self.pid);
        self.reaped = true;
    }
}

/// Blocking `waitpid` with `EINTR` retry, discarding the exit status: used
/// only to reap a child whose outcome no longer matters.
fn reap(pid: libc::pid_t) {
    loop {
        let mut status: libc::c_int = 0;
        let res = unsafe { libc::waitpid(pid, &mut status, 0) };
        if res == -1 && errno::errno().0 == libc::EINTR {
            continue;
        }
        break;
    }
}

/// Spawns `command` via `/bin/sh -c`, returning `None` if `command` is empty
/// or spawning fails for any reason (per §7, child spawn failures degrade
/// silently).
pub fn spawn(command: &str, direction: Direction) -> Option<ChildSession> {
    if command.is_empty() {
        return None;
    }

    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return None;
    }

    let use_fd = direction.parent_index();
    let other_fd = 1 - use_fd;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return None;
    }

    if pid == 0 {
        run_child(command, &fds, use_fd, other_fd);
        // run_child never returns.
    }

    // Parent: close the end the child uses, keep the other.
    unsafe {
        libc::close(fds[other_fd]);
    }
    let parent_fd = fds[use_fd];
    unsafe {
        let flags = libc::fcntl(parent_fd, libc::F_GETFD);
        libc::fcntl(parent_fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }

    let mut status: libc::c_int = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &mut status, libc::WUNTRACED) };
        if res == -1 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            // Can't determine the child's state; it is still alive and
            // SIGSTOP'd (or about to be), so it must be killed and reaped
            // here rather than abandoned as an orphan.
            unsafe {
                libc::close(parent_fd);
            }
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
            reap(pid);
            return None;
        }
        break;
    }

    if !wifstopped(status) {
        unsafe {
            libc::close(parent_fd);
            libc::kill(pid, libc::SIGKILL);
        }
        if !wifexited(status) {
            unsafe {
                libc::waitpid(pid, ptr::null_mut(), 0);
            }
        }
        return None;
    }

    let pipe = unsafe { File::from_raw_fd(parent_fd as RawFd) };
    Some(ChildSession {
        pipe: Some(pipe),
        pid,
        reaped: false,
    })
}

/// Sends `SIGCONT`, unblocking the child so its `exec` proceeds.
pub fn ready(session: &ChildSession) {
    if session.pid > 0 {
        unsafe {
            libc::kill(session.pid, libc::SIGCONT);
        }
    }
}

/// Closes the parent's pipe end and blocks until the child exits.
pub fn close(mut session: ChildSession) -> Result<(), Error> {
    let pid = session.pid;
    session.pipe = None; // closes the fd before waiting, so the child sees EOF

    let result = loop {
        let mut status: libc::c_int = 0;
        let res = unsafe { libc::waitpid(pid, &mut status, 0) };
        if res == -1 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            break Err(Error::last_os_error("reap child process"));
        }
        break Ok(());
    };

    // Reaped (or gave up trying) either way; Drop must not wait on this pid
    // again when `session` goes out of scope at the end of this function.
    session.reaped = true;
    result
}

/// Runs in the forked child. Never returns: either `execvp` replaces this
/// process image, or it exits with status 255.
fn run_child(command: &str, fds: &[libc::c_int; 2], use_fd: usize, other_fd: usize) -> ! {
    unsafe {
        libc::close(fds[use_fd]);
        libc::dup2(fds[other_fd], other_fd as libc::c_int);
        if fds[other_fd] != other_fd as libc::c_int {
            libc::close(fds[other_fd]);
        }

        // Freeze here so the parent has a deterministic window to attach its
        // side of the pipe before the shell (and whatever it execs) starts
        // touching stdin/stdout.
        libc::raise(libc::SIGSTOP);

        libc::setsid();

        let shell = CString::new("/bin/sh").unwrap_or_else(|_| CString::new("sh").unwrap());
        let flag = CString::new("-c").unwrap();
        let cmd = match CString::new(command) {
            Ok(cmd) => cmd,
            Err(_) => libc::_exit(255),
        };
        let mut argv: [*mut libc::c_char; 4] = [
            shell.as_ptr() as *mut libc::c_char,
            flag.as_ptr() as *mut libc::c_char,
            cmd.as_ptr() as *mut libc::c_char,
            ptr::null_mut(),
        ];
        libc::execvp(shell.as_ptr(), argv.as_mut_ptr());
        libc::_exit(255);
    }
}

fn wifstopped(status: libc::c_int) -> bool {
    unsafe { libc::WIFSTOPPED(status) }
}

fn wifexited(status: libc::c_int) -> bool {
    unsafe { libc::WIFEXITED(status) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn empty_command_spawns_nothing() {
        assert!(spawn("", Direction::Write).is_none());
    }

    #[test]
    fn write_direction_delivers_bytes_to_child_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.txt");
        let command = format!("cat > {}", out_path.display());

        let mut session = spawn(&command, Direction::Write).expect("spawn should succeed");
        ready(&session);
        session.pipe().write_all(b"hello\n").unwrap();
        close(session).unwrap();

        let contents = std::fs::read(&out_path).unwrap();
        assert_eq!(contents, b"hello\n");
    }

    #[test]
    fn read_direction_captures_child_stdout() {
        let mut session = spawn("echo -n from-child", Direction::Read).expect("spawn");
        ready(&session);
        let mut buf = Vec::new();
        session.pipe().read_to_end(&mut buf).unwrap();
        close(session).unwrap();
        assert_eq!(buf, b"from-child");
    }

    #[test]
    fn dropping_a_live_session_without_close_still_reaps_the_child() {
        // Simulates an early `?` return between spawn/ready and close: the
        // child is still running (sleeping) when the session is dropped.
        let session = spawn("sleep 30", Direction::Write).expect("spawn");
        ready(&session);
        let pid = session.pid;
        drop(session);

        // The child must already be gone (killed and reaped by `Drop`), so a
        // second `waitpid` on the same pid fails with ECHILD rather than
        // blocking on a still-running process.
        let mut status: libc::c_int = 0;
        let res = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(res, -1);
        assert_eq!(errno::errno().0, libc::ECHILD);
    }
}
