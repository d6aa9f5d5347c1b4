//! The low-level connection: owns the kernel device handle, multiplexes
//! pending commands, event subscribers, and incoming-command handlers over
//! it, and performs per-request timeouts.

use std::{
  collections::HashMap,
  os::unix::io::RawFd,
  sync::{Arc, Mutex, OnceLock, RwLock, Weak},
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use super::{
  device::{Device, RawRecv, RecvType},
  pending::{PendingCommand, PendingCommandId, PendingTable},
};
use crate::{
  address::Address,
  config::Config,
  error::{Error, Result},
  message::{completion_code, Message, NetFn},
  os::{EventLoop, FdWatchId, MioEventLoop, TimerId},
};

pub type ResponseHandler = Box<dyn FnOnce(Message) + Send>;
pub type EventHandler = Box<dyn FnMut(Message, Address) + Send>;
pub type CommandHandler = Box<dyn FnMut(Message, Address, u64) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct EventSubscriber {
  handler: EventHandler,
}

/// The subscriber list. Removal is by id, not by position, and a
/// dispatch in progress reads the *current length* up front so that a
/// handler deregistering another subscriber mid fan-out only ever erases a
/// slot, never shifts one -- the iteration index stays valid even across a
/// self-deregistration.
#[derive(Default)]
struct EventSubscribers {
  slots: Vec<Option<EventSubscriber>>,
  ids: HashMap<u64, usize>,
  next_id: u64,
}

impl EventSubscribers {
  fn register(&mut self, handler: EventHandler) -> SubscriptionId {
    let id = self.next_id;
    self.next_id += 1;
    let idx = self.slots.len();
    self.slots.push(Some(EventSubscriber { handler }));
    self.ids.insert(id, idx);
    SubscriptionId(id)
  }

  fn deregister(&mut self, id: SubscriptionId) -> Result<()> {
    let idx = self
      .ids
      .remove(&id.0)
      .ok_or_else(|| Error::NotFound(format!("event subscription {:?} already detached", id)))?;
    self.slots[idx] = None;
    Ok(())
  }

  fn active_count(&self) -> usize {
    self.slots.iter().filter(|s| s.is_some()).count()
  }
}

struct CommandHandlerEntry {
  handler: CommandHandler,
}

pub(crate) struct ConnectionInner {
  device: Mutex<Device>,
  event_loop: Mutex<Box<dyn EventLoop>>,
  fd_watch: Mutex<Option<FdWatchId>>,
  pending: Mutex<PendingTable>,
  event_subscribers: Mutex<EventSubscribers>,
  command_handlers: Mutex<HashMap<(u8, u8), CommandHandlerEntry>>,
  response_timeout: Duration,
  my_addr: u8,
}

static CONNECTIONS: OnceLock<RwLock<Vec<Weak<ConnectionInner>>>> = OnceLock::new();

fn registry() -> &'static RwLock<Vec<Weak<ConnectionInner>>> {
  CONNECTIONS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Validate that a weakly-held connection is still live, under the
/// registry's read lock -- the library's sole defense against
/// use-after-free from a racing `close`. The lock is dropped before the
/// caller does anything with the upgraded `Arc`, so no internal lock is
/// ever held across a user callback.
fn validate(weak: &Weak<ConnectionInner>) -> Option<Arc<ConnectionInner>> {
  let _guard = registry().read().unwrap();
  weak.upgrade()
}

/// A handle to an open connection to the kernel IPMI character device.
#[derive(Clone)]
pub struct Connection {
  pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
  pub fn open(config: &Config) -> Result<Self> {
    let mut device = Device::open(config)?;
    let my_addr = device.my_address().unwrap_or(crate::address::BMC_SLAVE_ADDR);
    let event_loop: Box<dyn EventLoop> = Box::new(MioEventLoop::new()?);

    let inner = Arc::new(ConnectionInner {
      device: Mutex::new(device),
      event_loop: Mutex::new(event_loop),
      fd_watch: Mutex::new(None),
      pending: Mutex::new(PendingTable::new()),
      event_subscribers: Mutex::new(EventSubscribers::default()),
      command_handlers: Mutex::new(HashMap::new()),
      response_timeout: config.response_timeout,
      my_addr,
    });

    let fd = inner.device.lock().unwrap().as_raw_fd();
    let weak = Arc::downgrade(&inner);
    let watch_weak = weak.clone();
    let watch_id = inner
      .event_loop
      .lock()
      .unwrap()
      .add_fd_watch(fd, Box::new(move || on_fd_readable(&watch_weak)))?;
    *inner.fd_watch.lock().unwrap() = Some(watch_id);

    registry().write().unwrap().push(weak);

    Ok(Connection { inner })
  }

  pub fn raw_fd(&self) -> RawFd {
    self.inner.device.lock().unwrap().as_raw_fd()
  }

  /// Run one pending event-loop operation: a readable fd, a fired timer,
  /// or nothing if `max_wait` elapses first.
  pub fn run_one(&self, max_wait: Option<Duration>) -> Result<bool> {
    let dispatched = self.inner.event_loop.lock().unwrap().run_one(max_wait)?;
    Ok(dispatched)
  }

  pub fn send_command(&self, target: Address, msg: Message, on_response: ResponseHandler) -> Result<PendingCommandId> {
    send_command_inner(&self.inner, target, msg, on_response)
  }

  pub fn send_response(&self, target: Address, msg: &Message, sequence: u64) -> Result<()> {
    self.inner.device.lock().unwrap().send(target, msg, sequence)
  }

  pub fn register_event_handler(&self, handler: EventHandler) -> Result<SubscriptionId> {
    let mut subs = self.inner.event_subscribers.lock().unwrap();
    let was_empty = subs.active_count() == 0;
    let id = subs.register(handler);
    if was_empty {
      drop(subs);
      self.inner.device.lock().unwrap().enable_events(true)?;
    }
    Ok(id)
  }

  pub fn deregister_event_handler(&self, id: SubscriptionId) -> Result<()> {
    let mut subs = self.inner.event_subscribers.lock().unwrap();
    subs.deregister(id)?;
    let now_empty = subs.active_count() == 0;
    drop(subs);
    if now_empty {
      self.inner.device.lock().unwrap().enable_events(false)?;
    }
    Ok(())
  }

  pub fn register_command_handler(&self, netfn: NetFn, cmd: u8, handler: CommandHandler) -> Result<()> {
    let key = (netfn.raw(), cmd);
    let mut handlers = self.inner.command_handlers.lock().unwrap();
    if handlers.contains_key(&key) {
      return Err(Error::AlreadyExists(format!(
        "command handler for netfn=0x{:02x} cmd=0x{:02x}",
        key.0, key.1
      )));
    }
    self.inner.device.lock().unwrap().register_for_cmd(netfn, cmd)?;
    handlers.insert(key, CommandHandlerEntry { handler });
    Ok(())
  }

  pub fn deregister_command_handler(&self, netfn: NetFn, cmd: u8) -> Result<()> {
    let key = (netfn.raw(), cmd);
    let mut handlers = self.inner.command_handlers.lock().unwrap();
    if handlers.remove(&key).is_none() {
      return Err(Error::NotFound(format!(
        "no command handler for netfn=0x{:02x} cmd=0x{:02x}",
        key.0, key.1
      )));
    }
    drop(handlers);
    self.inner.device.lock().unwrap().unregister_for_cmd(netfn, cmd)?;
    Ok(())
  }

  /// Unlinks the connection from the process-wide registry, cancels every
  /// outstanding timer (abandoning the record to the timer if cancellation
  /// loses the race), drops the command-handler and event-subscriber
  /// tables, removes the fd from the event loop, and drops the device fd.
  pub fn close(self) {
    {
      let mut reg = registry().write().unwrap();
      reg.retain(|w| w.upgrade().map(|a| !Arc::ptr_eq(&a, &self.inner)).unwrap_or(false));
    }

    let ids = self.inner.pending.lock().unwrap().live_ids();
    for id in ids {
      let entry = self.inner.pending.lock().unwrap().take(id);
      if let Some(entry) = entry {
        let cancelled = self.inner.event_loop.lock().unwrap().remove_timer(entry.timer_id);
        if !cancelled {
          warn!("lost the cancellation race for a pending command during close; its timer will free it");
        }
      }
    }

    *self.inner.event_subscribers.lock().unwrap() = EventSubscribers::default();
    self.inner.command_handlers.lock().unwrap().clear();

    if let Some(watch_id) = self.inner.fd_watch.lock().unwrap().take() {
      let _ = self.inner.event_loop.lock().unwrap().remove_fd_watch(watch_id);
    }
  }
}

fn send_command_inner(
  inner: &Arc<ConnectionInner>,
  target: Address,
  msg: Message,
  on_response: ResponseHandler,
) -> Result<PendingCommandId> {
  let timeout = inner.response_timeout;
  let request_copy = msg.clone();

  // Reserve the slot first, purely to learn its id: the timer closure
  // needs that id to look the entry back up when it fires, and the kernel
  // needs it as the correlation token on the wire.
  let id = inner.pending.lock().unwrap().insert(PendingCommand {
    request: request_copy.clone(),
    target,
    on_response,
    timer_id: 0,
  });
  let raw_token = id.to_raw();

  let weak = Arc::downgrade(inner);
  let timer_id = inner
    .event_loop
    .lock()
    .unwrap()
    .add_timer(timeout, Box::new(move || on_command_timeout(&weak, id, request_copy)));
  inner.pending.lock().unwrap().set_timer_id(id, timer_id);

  match inner.device.lock().unwrap().send(target, &msg, raw_token) {
    Ok(()) => Ok(id),
    Err(e) => {
      let cancelled = inner.event_loop.lock().unwrap().remove_timer(timer_id);
      let removed = inner.pending.lock().unwrap().take(id);
      if !cancelled && removed.is_some() {
        warn!("lost the cancellation race right after a failed send; the timer will free the record");
      }
      Err(e)
    }
  }
}

fn on_command_timeout(weak: &Weak<ConnectionInner>, id: PendingCommandId, request: Message) {
  let Some(inner) = validate(weak) else {
    return;
  };
  let entry = inner.pending.lock().unwrap().take(id);
  let Some(entry) = entry else {
    // Already claimed by the response path; nothing to do.
    return;
  };
  let response = Message::synthetic(request.netfn, request.cmd, completion_code::TIMEOUT);
  (entry.on_response)(response);
}

fn on_fd_readable(weak: &Weak<ConnectionInner>) {
  let Some(inner) = validate(weak) else {
    return;
  };
  let raw = match inner.device.lock().unwrap().recv() {
    Ok(raw) => raw,
    Err(e) => {
      error!("error reading from IPMI device: {e}");
      return;
    }
  };
  dispatch_raw_recv(&inner, raw);
}

fn dispatch_raw_recv(inner: &Arc<ConnectionInner>, raw: RawRecv) {
  match raw.recv_type {
    RecvType::Response => dispatch_response(inner, raw),
    RecvType::AsyncEvent => dispatch_event(inner, raw),
    RecvType::Cmd => dispatch_cmd(inner, raw),
  }
}

fn dispatch_response(inner: &Arc<ConnectionInner>, raw: RawRecv) {
  let id = PendingCommandId::from_raw(raw.msg_id);
  let entry = inner.pending.lock().unwrap().take(id);
  let Some(entry) = entry else {
    trace!("response for unknown or already-settled pending command id {}; dropping", raw.msg_id);
    return;
  };
  let cancelled = inner.event_loop.lock().unwrap().remove_timer(entry.timer_id);
  if !cancelled {
    warn!("response arrived in the same tick as its timeout firing; response wins the race");
  }
  (entry.on_response)(raw.message);
}

fn dispatch_event(inner: &Arc<ConnectionInner>, raw: RawRecv) {
  let len = inner.event_subscribers.lock().unwrap().slots.len();
  let mut i = 0;
  while i < len {
    let taken = {
      let mut subs = inner.event_subscribers.lock().unwrap();
      subs.slots.get_mut(i).and_then(|s| s.take())
    };
    if let Some(mut sub) = taken {
      (sub.handler)(raw.message.clone(), raw.addr);
      let mut subs = inner.event_subscribers.lock().unwrap();
      if i < subs.slots.len() && subs.slots[i].is_none() {
        subs.slots[i] = Some(sub);
      }
    }
    i += 1;
  }
}

fn dispatch_cmd(inner: &Arc<ConnectionInner>, raw: RawRecv) {
  let key = (raw.message.netfn.raw(), raw.message.cmd);
  let handled = {
    let mut handlers = inner.command_handlers.lock().unwrap();
    if let Some(entry) = handlers.get_mut(&key) {
      (entry.handler)(raw.message.clone(), raw.addr, raw.msg_id);
      true
    } else {
      false
    }
  };
  if !handled {
    let response = Message::synthetic(raw.message.netfn, raw.message.cmd, completion_code::INVALID_CMD);
    if let Err(e) = inner.device.lock().unwrap().send(raw.addr, &response, raw.msg_id) {
      error!("failed to send INVALID_CMD for unroutable command: {e}");
    }
  }
}
