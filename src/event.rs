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

//! Blocking filesystem event stream for the monitored target, built directly on
//! `kqueue(2)`/`kevent(2)` the way the original C implementation is, rather than
//! through a generic cross-platform watcher abstraction. `EVFILT_VNODE` delivers
//! the delete/revoke/rename/attrib/link/write family; `EVFILT_READ` delivers a
//! signed byte delta (negative if the file has shrunk below the current read
//! position).
//!
//! Only BSD-family kqueue platforms implement `EVFILT_VNODE`; this module is
//! compiled only there.

use crate::error::Error;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// One notification delivered by the kernel about the monitored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A vnode-level change; possibly several flags set at once.
    Vnode(VnodeEvent),
    /// `EVFILT_READ` fired with the given signed delta. Positive means that
    /// many new bytes are available past the cursor; negative means the file
    /// has shrunk by that many bytes; zero is a no-op that the reconciliation
    /// loop should ignore.
    Written(i64),
}

/// Bitmask of `NOTE_*` flags from a single `EVFILT_VNODE` notification. More
/// than one flag can be set because the kernel coalesces events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VnodeEvent {
    pub deleted: bool,
    pub revoked: bool,
    pub renamed: bool,
    pub write: bool,
    pub attrib: bool,
    pub link: bool,
}

impl VnodeEvent {
    fn from_fflags(fflags: u32) -> Self {
        Self {
            deleted: fflags & libc::NOTE_DELETE as u32 != 0,
            revoked: fflags & libc::NOTE_REVOKE as u32 != 0,
            renamed: fflags & libc::NOTE_RENAME as u32 != 0,
            write: fflags & libc::NOTE_WRITE as u32 != 0,
            attrib: fflags & libc::NOTE_ATTRIB as u32 != 0,
            link: fflags & libc::NOTE_LINK as u32 != 0,
        }
    }
}

/// Owns the kqueue descriptor and yields one [`Event`] per `next()` call.
pub struct EventSource {
    queue: RawFd,
}

impl EventSource {
    /// Creates a new event queue and registers interest in both filters on
    /// `monitor_fd`. `monitor_fd` is borrowed; the caller keeps owning it.
    pub fn new(monitor_fd: RawFd) -> Result<Self, Error> {
        let queue = unsafe { libc::kqueue() };
        if queue < 0 {
            return Err(Error::last_os_error("create event queue"));
        }

        let changes: [libc::kevent; 2] = [
            libc::kevent {
                ident: monitor_fd as usize,
                filter: libc::EVFILT_VNODE,
                flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR | libc::EV_RECEIPT,
                fflags: (libc::NOTE_DELETE
                    | libc::NOTE_ATTRIB
                    | libc::NOTE_RENAME
                    | libc::NOTE_WRITE
                    | libc::NOTE_LINK
                    | libc::NOTE_REVOKE) as u32,
                data: 0,
                udata: ptr::null_mut(),
            },
            libc::kevent {
                ident: monitor_fd as usize,
                filter: libc::EVFILT_READ,
                flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR | libc::EV_RECEIPT,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            },
        ];

        // A single receipt slot is enough: EV_RECEIPT makes each registration
        // report back individually, and we only need to know the call
        // succeeded (mirrors the original's "register both, discard the
        // receipt" sequencing).
        let mut receipt: libc::kevent = unsafe { mem::zeroed() };
        let res = unsafe {
            libc::kevent(
                queue,
                changes.as_ptr(),
                changes.len() as i32,
                &mut receipt,
                1,
                ptr::null(),
            )
        };
        if res < 0 {
            let err = Error::last_os_error("register event filters");
            unsafe {
                libc::close(queue);
            }
            return Err(err);
        }

        Ok(Self { queue })
    }

    /// Blocks until the kernel delivers the next notification.
    pub fn next(&mut self) -> Result<Event, Error> {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        loop {
            let res = unsafe { libc::kevent(self.queue, ptr::null(), 0, &mut ev, 1, ptr::null()) };
            if res < 0 {
                if errno::errno().0 == libc::EINTR {
                    continue;
                }
                return Err(Error::last_os_error("poll for events"));
            }
            if res == 0 {
                // No timeout was given, so this shouldn't happen in practice;
                // retry rather than return a bogus event.
                continue;
            }
            break;
        }

        if ev.filter == libc::EVFILT_VNODE {
            Ok(Event::Vnode(VnodeEvent::from_fflags(ev.fflags)))
        } else {
            Ok(Event::Written(ev.data as i64))
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fflags_decodes_multiple_bits() {
        let fflags = (libc::NOTE_WRITE | libc::NOTE_ATTRIB) as u32;
        let vnode = VnodeEvent::from_fflags(fflags);
        assert!(vnode.write);
        assert!(vnode.attrib);
        assert!(!vnode.deleted);
        assert!(!vnode.renamed);
        assert!(!vnode.link);
        assert!(!vnode.revoked);
    }

    #[test]
    fn from_fflags_decodes_single_bit() {
        let vnode = VnodeEvent::from_fflags(libc::NOTE_DELETE as u32);
        assert!(vnode.deleted);
        assert!(!vnode.write);
    }
}
