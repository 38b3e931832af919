//! Readiness selector with cross-thread wakeup
//!
//! Platform-specific backends behind one interface:
//!
//! **Linux:** `epoll`, level-triggered, via nix.
//!
//! **Non-Linux (macOS, BSD):** mio (kqueue).
//!
//! Every multiplexer carries a wakeup source registered under the reserved
//! [`WAKE_TOKEN`]: an `eventfd` on Linux, a `mio::Waker` elsewhere. A blocked
//! `wait()` returns when any other thread invokes [`Waker::wake`] on a waker
//! cloned from this multiplexer. Wake events are consumed internally and never
//! surface in the returned event list.
//!
//! Only the owning thread may call `register`/`reregister`/`deregister`/`wait`;
//! all methods take `&mut self` to make accidental sharing a compile error.
//! The [`Waker`] is the only handle that crosses threads.

use crate::{Error, Result};
use std::os::fd::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
#[cfg(target_os = "linux")]
use std::sync::Arc;

#[cfg(not(target_os = "linux"))]
use mio::{Events, Interest as MioInterest, Poll, Token};
#[cfg(not(target_os = "linux"))]
use std::collections::HashMap;
#[cfg(not(target_os = "linux"))]
use std::sync::Arc;

/// Token reserved for the internal wakeup source. User registrations must
/// never use this value.
pub const WAKE_TOKEN: usize = usize::MAX;

/// Interest flags for registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Event returned by `wait()`
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

// =============================================================================
// Epoll backend (Linux)
// =============================================================================

/// Handle for waking a blocked `wait()` from another thread.
#[cfg(target_os = "linux")]
#[derive(Clone)]
pub struct Waker {
    event_fd: Arc<OwnedFd>,
}

#[cfg(target_os = "linux")]
impl Waker {
    /// Wake the owning multiplexer. Never blocks; an already-pending wakeup
    /// is coalesced by the kernel.
    pub fn wake(&self) {
        let one = 1u64.to_ne_bytes();
        let ret = unsafe {
            libc::write(self.event_fd.as_raw_fd(), one.as_ptr() as *const libc::c_void, 8)
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN means the counter is saturated and a wakeup is already
            // pending, which is exactly what we wanted.
            if err.kind() != std::io::ErrorKind::WouldBlock {
                tracing::warn!("failed to signal selector waker: {err}");
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub struct Multiplexer {
    epoll: Epoll,
    events: Vec<EpollEvent>,
    event_fd: Arc<OwnedFd>,
}

#[cfg(target_os = "linux")]
impl Multiplexer {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let wake_event = EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN as u64);
        epoll.add(&event_fd, wake_event)?;

        Ok(Self { epoll, events: Vec::with_capacity(64), event_fd: Arc::new(event_fd) })
    }

    /// Obtain a thread-safe wakeup handle for this multiplexer.
    pub fn waker(&self) -> Waker {
        Waker { event_fd: self.event_fd.clone() }
    }

    pub fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        let event = EpollEvent::new(epoll_flags(interest), token as u64);
        self.epoll.add(unsafe { BorrowedFd::borrow_raw(fd) }, event)?;
        Ok(())
    }

    /// Replace the interest mask of a registered descriptor. An empty mask
    /// leaves the registration in place but suppresses read/write readiness
    /// (error and hangup conditions still surface).
    pub fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(epoll_flags(interest), token as u64);
        self.epoll.modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event)?;
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd, _token: usize) -> Result<()> {
        self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) })?;
        Ok(())
    }

    /// Wait for events. `None` blocks until an event or a wakeup arrives.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        self.events.clear();
        self.events.resize(64, EpollEvent::empty());

        let timeout_val = match timeout {
            Some(d) => {
                // Cap at u32::MAX ms (~49 days) to avoid overflow
                let ms = d.as_millis().min(u32::MAX as u128) as u32;
                EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::NONE)
            }
            None => EpollTimeout::NONE,
        };

        let n = self.epoll.wait(&mut self.events, timeout_val)?;

        let mut woken = false;
        let events: Vec<Event> = self.events[..n]
            .iter()
            .filter_map(|e| {
                if e.data() as usize == WAKE_TOKEN {
                    woken = true;
                    return None;
                }
                let flags = e.events();
                Some(Event {
                    token: e.data() as usize,
                    // Treat error conditions as readable so they surface to the
                    // worker and the connection can be properly torn down
                    readable: flags.contains(EpollFlags::EPOLLIN)
                        || flags.contains(EpollFlags::EPOLLHUP)
                        || flags.contains(EpollFlags::EPOLLERR)
                        || flags.contains(EpollFlags::EPOLLRDHUP),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                })
            })
            .collect();

        if woken {
            self.drain_wakeups();
        }

        Ok(events)
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 8];
        loop {
            let ret = unsafe {
                libc::read(self.event_fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8)
            };
            if ret < 0 {
                break;
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn epoll_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.readable {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.writable {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

// =============================================================================
// Mio backend (non-Linux)
// =============================================================================

/// Handle for waking a blocked `wait()` from another thread.
#[cfg(not(target_os = "linux"))]
#[derive(Clone)]
pub struct Waker {
    inner: Arc<mio::Waker>,
}

#[cfg(not(target_os = "linux"))]
impl Waker {
    pub fn wake(&self) {
        if let Err(e) = self.inner.wake() {
            tracing::warn!("failed to signal selector waker: {e}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<mio::Waker>,
    /// token -> whether the fd currently holds a kernel-side registration.
    /// mio has no empty interest set, so masking a descriptor means
    /// deregistering it and re-registering when interest returns.
    registrations: HashMap<usize, bool>,
}

#[cfg(not(target_os = "linux"))]
impl Multiplexer {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), Token(WAKE_TOKEN))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            waker: Arc::new(waker),
            registrations: HashMap::new(),
        })
    }

    pub fn waker(&self) -> Waker {
        Waker { inner: self.waker.clone() }
    }

    pub fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        if interest.is_empty() {
            self.registrations.insert(token, false);
            return Ok(());
        }
        let mut source = mio::unix::SourceFd(&fd);
        self.poll.registry().register(&mut source, Token(token), mio_interest(interest))?;
        self.registrations.insert(token, true);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        let active = self.registrations.get(&token).copied().unwrap_or(false);
        let mut source = mio::unix::SourceFd(&fd);
        if interest.is_empty() {
            if active {
                self.poll.registry().deregister(&mut source)?;
                self.registrations.insert(token, false);
            }
        } else if active {
            self.poll.registry().reregister(&mut source, Token(token), mio_interest(interest))?;
        } else {
            self.poll.registry().register(&mut source, Token(token), mio_interest(interest))?;
            self.registrations.insert(token, true);
        }
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd, token: usize) -> Result<()> {
        if self.registrations.remove(&token) == Some(true) {
            let mut source = mio::unix::SourceFd(&fd);
            self.poll.registry().deregister(&mut source)?;
        }
        Ok(())
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        self.events.clear();
        self.poll.poll(&mut self.events, timeout)?;

        let events = self
            .events
            .iter()
            .filter(|e| e.token() != Token(WAKE_TOKEN))
            .map(|e| Event {
                token: e.token().0,
                readable: e.is_readable() || e.is_read_closed() || e.is_error(),
                writable: e.is_writable(),
            })
            .collect();

        Ok(events)
    }
}

#[cfg(not(target_os = "linux"))]
fn mio_interest(interest: Interest) -> MioInterest {
    match (interest.readable, interest.writable) {
        (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
        (false, true) => MioInterest::WRITABLE,
        // is_empty() is handled by the callers; default to readable
        _ => MioInterest::READABLE,
    }
}
