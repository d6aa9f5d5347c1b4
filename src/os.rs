//! The minimal OS abstraction the transport is built on: register a file
//! descriptor for readability, schedule a one-shot timer, cancel a timer,
//! run one pending event. A default implementation on top of `mio` 0.8 is
//! provided as [`MioEventLoop`], but the transport only ever depends on the
//! [`EventLoop`] trait so it can be embedded in a caller's own reactor.

use std::{
  collections::HashMap,
  io,
  os::unix::io::RawFd,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, trace, warn};
use mio::{unix::SourceFd, Events, Interest, Poll, Token};

pub type FdWatchId = usize;
pub type TimerId = u64;

/// Implementers provide: add-fd-watch, remove-fd-watch, add-timer,
/// remove-timer, perform-one-op. Absence of any of these (a [`EventLoop`]
/// that returns [`crate::error::Error::NotSupported`] from a method) makes
/// connection setup fail the same way.
pub trait EventLoop: Send {
  /// Watch `fd` for readability; `on_readable` runs once per readiness
  /// notification until the watch is removed.
  fn add_fd_watch(&mut self, fd: RawFd, on_readable: Box<dyn FnMut() + Send>) -> io::Result<FdWatchId>;

  fn remove_fd_watch(&mut self, id: FdWatchId) -> io::Result<()>;

  /// Schedule `on_fire` to run once, after `after` has elapsed. The
  /// callback is dropped (never invoked) if the timer is cancelled first.
  fn add_timer(&mut self, after: Duration, on_fire: Box<dyn FnOnce() + Send>) -> TimerId;

  /// Attempt to cancel a pending timer. Returns `true` if the timer was
  /// still pending and has now been removed -- `on_fire` will never run.
  /// Returns `false` if the timer has already fired (or is currently
  /// firing): the caller lost the race and must treat the resource as
  /// owned by the timer callback instead.
  fn remove_timer(&mut self, id: TimerId) -> bool;

  /// Block for up to `max_wait` (or indefinitely if `None`) and run
  /// whatever fd readiness and timer callbacks are due. Returns `true` if
  /// anything was dispatched.
  fn run_one(&mut self, max_wait: Option<Duration>) -> io::Result<bool>;
}

struct TimerEntry {
  id: TimerId,
  deadline: Instant,
  callback: Box<dyn FnOnce() + Send>,
}

struct FdEntry {
  fd: RawFd,
  on_readable: Box<dyn FnMut() + Send>,
}

/// [`EventLoop`] built on `mio` 0.8. Good enough for a single IPMI
/// connection's fd plus the handful of in-flight timers a discovery
/// sequence or a bus scan produces; timers are kept in a flat `Vec` and
/// scanned linearly, which is cheap at this scale and keeps the
/// cancel-before-fire discipline easy to audit.
pub struct MioEventLoop {
  poll: Poll,
  events: Events,
  fds: HashMap<FdWatchId, FdEntry>,
  next_fd_token: usize,
  timers: Vec<TimerEntry>,
  next_timer_id: TimerId,
}

impl MioEventLoop {
  pub fn new() -> io::Result<Self> {
    Ok(MioEventLoop {
      poll: Poll::new()?,
      events: Events::with_capacity(16),
      fds: HashMap::new(),
      next_fd_token: 0,
      timers: Vec::new(),
      next_timer_id: 0,
    })
  }

  fn next_deadline(&self) -> Option<Instant> {
    self.timers.iter().map(|t| t.deadline).min()
  }

  /// Remove and run every timer whose deadline has passed. Entries are
  /// unlinked from `self.timers` *before* their callback runs, mirroring
  /// the response/timeout "unlink before invoke" rule used throughout the
  /// transport: a callback that reentrantly calls `remove_timer` on its
  /// own id must see it as already gone.
  fn fire_expired_timers(&mut self) -> bool {
    let now = Instant::now();
    let mut fired = false;
    loop {
      let idx = self.timers.iter().position(|t| t.deadline <= now);
      let Some(idx) = idx else { break };
      let entry = self.timers.remove(idx);
      fired = true;
      (entry.callback)();
    }
    fired
  }
}

impl EventLoop for MioEventLoop {
  fn add_fd_watch(&mut self, fd: RawFd, on_readable: Box<dyn FnMut() + Send>) -> io::Result<FdWatchId> {
    let token_num = self.next_fd_token;
    self.next_fd_token += 1;
    self
      .poll
      .registry()
      .register(&mut SourceFd(&fd), Token(token_num), Interest::READABLE)?;
    self.fds.insert(token_num, FdEntry { fd, on_readable });
    Ok(token_num)
  }

  fn remove_fd_watch(&mut self, id: FdWatchId) -> io::Result<()> {
    if let Some(entry) = self.fds.remove(&id) {
      self.poll.registry().deregister(&mut SourceFd(&entry.fd))?;
    }
    Ok(())
  }

  fn add_timer(&mut self, after: Duration, on_fire: Box<dyn FnOnce() + Send>) -> TimerId {
    let id = self.next_timer_id;
    self.next_timer_id += 1;
    self.timers.push(TimerEntry {
      id,
      deadline: Instant::now() + after,
      callback: on_fire,
    });
    id
  }

  fn remove_timer(&mut self, id: TimerId) -> bool {
    if let Some(idx) = self.timers.iter().position(|t| t.id == id) {
      self.timers.remove(idx);
      true
    } else {
      false
    }
  }

  fn run_one(&mut self, max_wait: Option<Duration>) -> io::Result<bool> {
    let wait = match (max_wait, self.next_deadline()) {
      (Some(max), Some(deadline)) => Some(max.min(deadline.saturating_duration_since(Instant::now()))),
      (Some(max), None) => Some(max),
      (None, Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
      (None, None) => None,
    };

    self.poll.poll(&mut self.events, wait)?;

    let mut dispatched = false;
    let ready_tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
    for Token(token_num) in ready_tokens {
      if let Some(entry) = self.fds.get_mut(&token_num) {
        dispatched = true;
        (entry.on_readable)();
      }
    }

    if self.fire_expired_timers() {
      dispatched = true;
    }

    Ok(dispatched)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use super::*;

  #[test]
  fn cancel_before_fire_drops_the_callback() {
    let mut ev = MioEventLoop::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let id = ev.add_timer(Duration::from_secs(30), Box::new(move || {
      fired2.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(ev.remove_timer(id));
    assert!(!ev.remove_timer(id), "cancelling twice must fail the second time");
    assert_eq!(fired.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn reentrant_cancel_of_the_firing_timer_loses_the_race() {
    let mut ev = MioEventLoop::new().unwrap();
    let id_cell: Arc<std::sync::Mutex<Option<TimerId>>> = Arc::new(std::sync::Mutex::new(None));
    let id_cell2 = Arc::clone(&id_cell);
    let id = ev.add_timer(Duration::from_millis(0), Box::new(move || {
      // Simulate the callback reading its own id and trying to cancel
      // itself after it has already started running.
      let _ = id_cell2;
    }));
    *id_cell.lock().unwrap() = Some(id);
    std::thread::sleep(Duration::from_millis(5));
    assert!(ev.fire_expired_timers());
    assert!(!ev.remove_timer(id));
  }
}
