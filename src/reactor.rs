//! Downward interface to the event loop.
//!
//! The core never owns the loop. It registers descriptors and timers with a
//! [`Reactor`] under a token, and the loop hands the token back to
//! [`crate::dispatch`] when the descriptor is readable or the timer fires.
//! Tokens are plain data, so the dispatcher a descriptor feeds is fixed at
//! registration time without storing closures that borrow session state.
//!
//! [`PollReactor`] is a minimal `poll(2)` loop for the binary and tests.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Per-interface auxiliary socket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IfaceSocket {
    /// Management-frame subscription socket.
    Mgmt,
    /// Connection-owner socket.
    Connect,
}

/// Which dispatcher a readable descriptor feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadToken {
    /// Global multicast event handle.
    GlobalEvents,
    /// Auxiliary handle of one virtual interface.
    Interface {
        /// Interface index.
        ifindex: u32,
        /// Which of the interface's handles.
        kind: IfaceSocket,
    },
    /// Shared beacon listener of one physical radio.
    RadioListener {
        /// Physical radio (wiphy) index.
        phy: u32,
    },
}

/// Deferred work scheduled with the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerToken {
    /// Re-resolve family and group ids after a family reload.
    RegroupFamilies,
}

/// Reactor registration state of a handle's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    /// Registered for read readiness.
    Registered(RawFd),
    /// Open but not watched.
    Unregistered(RawFd),
}

impl FdState {
    /// The descriptor, whatever the state.
    pub fn fd(self) -> RawFd {
        match self {
            Self::Registered(fd) | Self::Unregistered(fd) => fd,
        }
    }

    /// True while the reactor watches the descriptor.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered(_))
    }
}

/// Event-loop services the core depends on.
pub trait Reactor {
    /// Watch `fd` for readability, reporting `token`.
    fn register_read(&mut self, fd: RawFd, token: ReadToken) -> Result<()>;

    /// Stop watching `fd`. Unknown descriptors are ignored.
    fn unregister_read(&mut self, fd: RawFd);

    /// Fire `token` once after `delay`. Re-registering a pending token
    /// replaces its deadline.
    fn register_timeout(&mut self, delay: Duration, token: TimerToken);

    /// Cancel a pending timer. Returns true if one was pending.
    fn cancel_timeout(&mut self, token: TimerToken) -> bool;
}

/// Something the loop observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorEvent {
    /// A watched descriptor became readable.
    Readable(ReadToken),
    /// A timer expired.
    Timeout(TimerToken),
}

/// `poll(2)`-based reactor.
#[derive(Debug, Default)]
pub struct PollReactor {
    reads: Vec<(RawFd, ReadToken)>,
    timers: Vec<(Instant, TimerToken)>,
}

impl PollReactor {
    /// Empty reactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watched descriptors and their tokens.
    pub fn registered(&self) -> &[(RawFd, ReadToken)] {
        &self.reads
    }

    /// Token registered for `fd`.
    pub fn token_for(&self, fd: RawFd) -> Option<ReadToken> {
        self.reads.iter().find(|(f, _)| *f == fd).map(|(_, t)| *t)
    }

    /// True if `token` has a pending timer.
    pub fn has_timer(&self, token: TimerToken) -> bool {
        self.timers.iter().any(|(_, t)| *t == token)
    }

    fn take_expired(&mut self, now: Instant) -> Vec<ReactorEvent> {
        let mut fired = Vec::new();
        self.timers.retain(|(deadline, token)| {
            if *deadline <= now {
                fired.push(ReactorEvent::Timeout(*token));
                false
            } else {
                true
            }
        });
        fired
    }

    /// Wait up to `max_wait` for readiness or timer expiry.
    ///
    /// Returns an empty list on timeout or when interrupted by a signal.
    pub fn wait(&mut self, max_wait: Duration) -> Result<Vec<ReactorEvent>> {
        let now = Instant::now();
        let mut events = self.take_expired(now);
        if !events.is_empty() {
            return Ok(events);
        }

        let wait = self
            .timers
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .fold(max_wait, Duration::min);
        let timeout_ms = libc::c_int::try_from(wait.as_millis()).unwrap_or(libc::c_int::MAX);

        let mut fds: Vec<libc::pollfd> = self
            .reads
            .iter()
            .map(|(fd, _)| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        // SAFETY: fds is a valid array of fds.len() pollfd entries.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }

        for pfd in &fds {
            if pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                if let Some(token) = self.token_for(pfd.fd) {
                    events.push(ReactorEvent::Readable(token));
                }
            }
        }
        events.extend(self.take_expired(Instant::now()));
        Ok(events)
    }
}

impl Reactor for PollReactor {
    fn register_read(&mut self, fd: RawFd, token: ReadToken) -> Result<()> {
        self.reads.retain(|(f, _)| *f != fd);
        self.reads.push((fd, token));
        Ok(())
    }

    fn unregister_read(&mut self, fd: RawFd) {
        self.reads.retain(|(f, _)| *f != fd);
    }

    fn register_timeout(&mut self, delay: Duration, token: TimerToken) {
        self.cancel_timeout(token);
        self.timers.push((Instant::now() + delay, token));
    }

    fn cancel_timeout(&mut self, token: TimerToken) -> bool {
        let before = self.timers.len();
        self.timers.retain(|(_, t)| *t != token);
        self.timers.len() != before
    }
}
