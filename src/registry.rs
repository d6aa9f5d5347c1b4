//! The MC registry: address resolution, the BMC's satellite list, and the
//! stable, outside-the-event-loop `McId` handle.

use std::sync::{Arc, Mutex, Weak};

#[allow(unused_imports)]
use log::debug;

use crate::{
  address::{Address, BMC_SLAVE_ADDR},
  discovery::DiscoveryState,
  error::{Error, Result},
  mc::{ChannelInfo, DeviceId, McData, McView},
  message::Message,
  sdr::SdrSet,
  sensor::EntityRegistry,
  transport::Connection,
};

pub type NewMcHook = Box<dyn FnMut(McId) + Send>;
pub type NewEntityHook = Box<dyn FnMut() + Send>;
pub type OemEventFilter = Box<dyn FnMut(&Message, Address) -> bool + Send>;
pub type SystemEventHandler = Box<dyn FnMut(Message, Address) + Send>;
/// A pluggable OEM device-id hook: run over the BMC's freshly parsed
/// `DeviceId` right after Get Device ID comes back, before discovery
/// advances past it. Populated by whatever OEM table a caller layers on
/// top of this core; the registry itself ships with none registered.
pub type OemDeviceIdHook = Box<dyn FnMut(&mut DeviceId) + Send>;

struct SystemEventSubscriber {
  id: u64,
  handler: Option<SystemEventHandler>,
}

/// The live BMC object: the transport connection plus every piece of state
/// the discovery engine and event plumbing accumulate. Satellite MCs never
/// get one of these -- they are plain [`McData`] entries in `mc_list`, and
/// every BMC-only operation (`close_connection` foremost among them)
/// simply has no `Bmc` to call it on when all a caller holds is a
/// satellite's [`McId`].
pub struct Bmc {
  pub connection: Connection,
  inner: Mutex<BmcInner>,
}

struct BmcInner {
  bmc_data: McData,
  main_sdrs: SdrSet,
  channels: [ChannelInfo; 8],
  msg_int_type: u8,
  event_msg_int_type: u8,
  discovery_state: DiscoveryState,
  mc_list: Vec<McData>,
  entities: EntityRegistry,
  do_bus_scan: bool,
  event_subscribers: Vec<SystemEventSubscriber>,
  next_subscriber_id: u64,
  oem_event_filter: Option<OemEventFilter>,
  oem_device_id_hooks: Vec<Option<OemDeviceIdHook>>,
  new_mc_hook: Option<NewMcHook>,
  new_entity_hook: Option<NewEntityHook>,
}

/// An opaque, stable handle to an MC (the BMC itself, when `mc_num == 0`,
/// or a satellite). Safe to store outside the event loop: resolving it
/// always re-validates that the owning BMC is still live.
#[derive(Clone)]
pub struct McId {
  pub(crate) bmc: Weak<Bmc>,
  pub(crate) channel: u8,
  pub(crate) mc_num: u8,
}

impl std::fmt::Debug for McId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("McId")
      .field("channel", &self.channel)
      .field("mc_num", &format_args!("{:#04x}", self.mc_num))
      .finish()
  }
}

impl Bmc {
  pub fn new(connection: Connection, device_id: DeviceId, do_bus_scan: bool) -> Arc<Bmc> {
    let bmc_data = McData::new(Address::SystemInterface { channel: 0 }, device_id);
    Arc::new(Bmc {
      connection,
      inner: Mutex::new(BmcInner {
        bmc_data,
        main_sdrs: SdrSet::new(),
        channels: [ChannelInfo::default(); 8],
        msg_int_type: 0xFF,
        event_msg_int_type: 0xFF,
        discovery_state: DiscoveryState::Dead,
        mc_list: Vec::new(),
        entities: EntityRegistry::new(),
        do_bus_scan,
        event_subscribers: Vec::new(),
        next_subscriber_id: 0,
        oem_event_filter: None,
        oem_device_id_hooks: Vec::new(),
        new_mc_hook: None,
        new_entity_hook: None,
      }),
    })
  }

  pub fn id(self: &Arc<Self>) -> McId {
    McId {
      bmc: Arc::downgrade(self),
      channel: 0,
      mc_num: 0,
    }
  }

  pub fn discovery_state(&self) -> DiscoveryState {
    self.inner.lock().unwrap().discovery_state
  }

  /// Advance the discovery state. Panics (a programmer error, not a
  /// runtime fault) if the new state would move the machine backwards --
  /// the only legitimate way out of an in-progress discovery is either
  /// forward progress or a full reset back to `Dead` via `close`.
  pub(crate) fn advance_state(&self, new_state: DiscoveryState) {
    let mut inner = self.inner.lock().unwrap();
    assert!(
      new_state >= inner.discovery_state,
      "discovery state must be monotonically non-decreasing: {:?} -> {:?}",
      inner.discovery_state,
      new_state
    );
    inner.discovery_state = new_state;
  }

  pub(crate) fn with_device_id_mut<R>(&self, f: impl FnOnce(&mut DeviceId) -> R) -> R {
    let mut inner = self.inner.lock().unwrap();
    f(&mut inner.bmc_data.device_id)
  }

  pub(crate) fn device_id(&self) -> DeviceId {
    self.inner.lock().unwrap().bmc_data.device_id.clone()
  }

  pub(crate) fn with_main_sdrs_mut<R>(&self, f: impl FnOnce(&mut SdrSet) -> R) -> R {
    f(&mut self.inner.lock().unwrap().main_sdrs)
  }

  pub(crate) fn with_device_sdrs_mut<R>(&self, f: impl FnOnce(&mut SdrSet) -> R) -> R {
    f(&mut self.inner.lock().unwrap().bmc_data.device_sdrs)
  }

  pub(crate) fn with_channels_mut<R>(&self, f: impl FnOnce(&mut [ChannelInfo; 8]) -> R) -> R {
    f(&mut self.inner.lock().unwrap().channels)
  }

  pub fn channels(&self) -> [ChannelInfo; 8] {
    self.inner.lock().unwrap().channels
  }

  pub(crate) fn set_msg_int_types(&self, msg_int_type: u8, event_msg_int_type: u8) {
    let mut inner = self.inner.lock().unwrap();
    inner.msg_int_type = msg_int_type;
    inner.event_msg_int_type = event_msg_int_type;
  }

  pub fn do_bus_scan(&self) -> bool {
    self.inner.lock().unwrap().do_bus_scan
  }

  pub fn set_new_mc_hook(&self, hook: NewMcHook) {
    self.inner.lock().unwrap().new_mc_hook = Some(hook);
  }

  pub fn set_new_entity_hook(&self, hook: NewEntityHook) {
    self.inner.lock().unwrap().new_entity_hook = Some(hook);
  }

  pub fn set_oem_event_filter(&self, filter: OemEventFilter) {
    self.inner.lock().unwrap().oem_event_filter = Some(filter);
  }

  /// Append one OEM device-id hook. Hooks run in registration order,
  /// each getting the same `&mut DeviceId` in turn, right after Get
  /// Device ID parses and before discovery advances past it.
  pub fn add_oem_device_id_hook(&self, hook: OemDeviceIdHook) {
    self.inner.lock().unwrap().oem_device_id_hooks.push(Some(hook));
  }

  /// Run every registered OEM device-id hook over `device_id`, in the
  /// same take/call/putback discipline `fan_out_system_event` uses so no
  /// hook ever runs while `inner` is locked, and a hook that registers
  /// another hook mid-run can only extend the list, never corrupt it.
  pub(crate) fn run_oem_device_id_hooks(&self, device_id: &mut DeviceId) {
    let len = self.inner.lock().unwrap().oem_device_id_hooks.len();
    for i in 0..len {
      let taken = {
        let mut inner = self.inner.lock().unwrap();
        inner.oem_device_id_hooks.get_mut(i).and_then(|h| h.take())
      };
      if let Some(mut hook) = taken {
        hook(device_id);
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.oem_device_id_hooks.get_mut(i) {
          if slot.is_none() {
            *slot = Some(hook);
          }
        }
      }
    }
  }

  /// Address lookup: slave address `0x20` on IPMB always resolves to the
  /// BMC, before anything is searched; otherwise a linear search over the
  /// satellite list by structural address equality.
  pub fn lookup_addr(self: &Arc<Self>, addr: Address) -> Option<McId> {
    if matches!(addr, Address::SystemInterface { .. }) || addr.is_bmc_shorthand() {
      return Some(self.id());
    }
    let inner = self.inner.lock().unwrap();
    inner.mc_list.iter().find(|m| m.addr == addr).map(|m| McId {
      bmc: Arc::downgrade(self),
      channel: m.addr.channel(),
      mc_num: mc_num_of(&m.addr),
    })
  }

  /// True if a satellite is already known at this address -- used by the
  /// bus scan to avoid creating duplicate MC entries for a device that
  /// answers to more than one probe.
  pub fn has_satellite(&self, addr: Address) -> bool {
    let inner = self.inner.lock().unwrap();
    inner.mc_list.iter().any(|m| m.addr == addr)
  }

  pub fn satellite_count(&self) -> usize {
    self.inner.lock().unwrap().mc_list.len()
  }

  /// Add a newly discovered satellite MC and invoke the new-MC hook
  /// exactly once. The hook is taken out of the registry before being
  /// called (and put back afterward, unless it removed itself), so it
  /// never runs while `inner` is locked.
  pub fn add_satellite(self: &Arc<Self>, mut data: McData) -> McId {
    data.in_bmc_list = true;
    let channel = data.addr.channel();
    let mc_num = mc_num_of(&data.addr);
    {
      let mut inner = self.inner.lock().unwrap();
      inner.mc_list.push(data);
    }
    let id = McId {
      bmc: Arc::downgrade(self),
      channel,
      mc_num,
    };

    let hook = self.inner.lock().unwrap().new_mc_hook.take();
    if let Some(mut hook) = hook {
      hook(id.clone());
      let mut inner = self.inner.lock().unwrap();
      if inner.new_mc_hook.is_none() {
        inner.new_mc_hook = Some(hook);
      }
    }
    id
  }

  /// The MC-registry "pointer_cb" scope: `f` runs with the `McView`
  /// borrowed directly out of the registry lock, so it cannot outlive the
  /// lock guard backing it. This is the one place the design deliberately
  /// calls into user code while holding an internal lock -- the coarse
  /// `mc_list` lock stands in for a per-MC lock the source material does
  /// not otherwise provide.
  pub fn resolve<R>(id: &McId, f: impl FnOnce(McView<'_>) -> R) -> Result<R> {
    let bmc = id
      .bmc
      .upgrade()
      .ok_or_else(|| Error::InvalidArgument("BMC connection no longer live".into()))?;
    let inner = bmc.inner.lock().unwrap();
    if id.mc_num == 0 {
      Ok(f(McView::new(true, &inner.bmc_data)))
    } else {
      let data = inner
        .mc_list
        .iter()
        .find(|m| m.addr.channel() == id.channel && mc_num_of(&m.addr) == id.mc_num)
        .ok_or_else(|| Error::NotFound(format!("no MC at channel {} slave {:#04x}", id.channel, id.mc_num)))?;
      Ok(f(McView::new(false, data)))
    }
  }

  pub fn is_bmc(id: &McId) -> bool {
    id.mc_num == 0
  }

  /// Dispatch to the per-sensor handler registered for `sensor_number` on
  /// the MC named by `id`. Returns `Ok(false)` when the MC exists but has
  /// no handler registered for that sensor -- the caller treats that as
  /// "fall through to the system-level subscribers", not an error.
  /// `id.bmc` is not reconsulted here: callers only ever pass an `McId`
  /// they just obtained from this same `Bmc` via `lookup_addr`.
  pub(crate) fn dispatch_sensor_event(&self, id: &McId, sensor_number: u8) -> Result<bool> {
    let mut inner = self.inner.lock().unwrap();
    if id.mc_num == 0 {
      Ok(inner.bmc_data.sensors.dispatch(sensor_number))
    } else {
      let data = inner
        .mc_list
        .iter_mut()
        .find(|m| m.addr.channel() == id.channel && mc_num_of(&m.addr) == id.mc_num)
        .ok_or_else(|| Error::NotFound(format!("no MC at channel {} slave {:#04x}", id.channel, id.mc_num)))?;
      Ok(data.sensors.dispatch(sensor_number))
    }
  }

  pub fn register_system_event_handler(&self, handler: SystemEventHandler) -> u64 {
    let mut inner = self.inner.lock().unwrap();
    let id = inner.next_subscriber_id;
    inner.next_subscriber_id += 1;
    inner.event_subscribers.push(SystemEventSubscriber {
      id,
      handler: Some(handler),
    });
    id
  }

  pub fn deregister_system_event_handler(&self, id: u64) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    let slot = inner.event_subscribers.iter_mut().find(|s| s.id == id);
    match slot {
      Some(s) if s.handler.is_some() => {
        s.handler = None;
        Ok(())
      }
      _ => Err(Error::NotFound(format!("event subscriber {id} already detached"))),
    }
  }

  pub(crate) fn apply_oem_filter(&self, msg: &Message, addr: Address) -> bool {
    let mut inner = self.inner.lock().unwrap();
    match inner.oem_event_filter.as_mut() {
      Some(filter) => filter(msg, addr),
      None => false,
    }
  }

  /// Fan out `msg` to every system-level subscriber, snapshotting the
  /// count up front so a subscriber that deregisters a later one during
  /// its own call can only erase a slot, never shift the rest.
  pub(crate) fn fan_out_system_event(&self, msg: &Message, addr: Address) {
    let len = self.inner.lock().unwrap().event_subscribers.len();
    for i in 0..len {
      let taken = {
        let mut inner = self.inner.lock().unwrap();
        inner
          .event_subscribers
          .get_mut(i)
          .and_then(|s| s.handler.take())
      };
      if let Some(mut handler) = taken {
        handler(msg.clone(), addr);
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.event_subscribers.get_mut(i) {
          if slot.handler.is_none() {
            slot.handler = Some(handler);
          }
        }
      }
    }
  }

  /// Teardown order per the discovery spec: device SDRs, sensors,
  /// controls, main SDRs, event subscribers, MC list, entities, then the
  /// transport itself. Called on a fatal discovery error or an explicit
  /// `close_connection` against the BMC.
  pub fn teardown(self: Arc<Self>) {
    {
      let mut inner = self.inner.lock().unwrap();
      inner.bmc_data.device_sdrs = SdrSet::new();
      inner.bmc_data.sensors = crate::sensor::SensorSet::new();
      inner.bmc_data.controls = crate::sensor::ControlSet::new();
      inner.main_sdrs = SdrSet::new();
      inner.event_subscribers.clear();
      inner.mc_list.clear();
      inner.entities = EntityRegistry::new();
    }
    let connection = self.connection.clone();
    connection.close();
  }
}

/// Close the BMC connection named by `id`. Rejects a satellite handle
/// outright -- a satellite MC has no transport of its own to close -- and
/// performs no teardown in that case.
pub fn close_connection(id: &McId) -> Result<()> {
  if id.mc_num != 0 {
    return Err(Error::InvalidArgument("close_connection may only be called on a BMC, not a satellite MC".into()));
  }
  let bmc = id
    .bmc
    .upgrade()
    .ok_or_else(|| Error::InvalidArgument("BMC connection no longer live".into()))?;
  Bmc::teardown(bmc);
  Ok(())
}

fn mc_num_of(addr: &Address) -> u8 {
  match addr {
    Address::Ipmb { slave_addr, .. } | Address::IpmbBroadcast { slave_addr, .. } => *slave_addr,
    Address::SystemInterface { .. } => BMC_SLAVE_ADDR,
  }
}

#[cfg(test)]
mod tests {
  use hex_literal::hex;

  use super::*;
  use crate::{config::Config, mc::DeviceId, transport::Connection as Conn};

  fn sample_device_id() -> DeviceId {
    DeviceId::parse(&hex!("00 20 01 80 00 51 00 00 1B F2 01 00")).unwrap()
  }

  // A Bmc needs a live Connection; these tests only exercise the pure
  // address-resolution and fan-out logic using a `Weak` that never
  // upgrades, which is enough to check the short-circuit rule without
  // opening a real device.
  #[test]
  fn bmc_num_zero_always_resolves_to_the_bmc_view() {
    let dangling: Weak<Bmc> = Weak::new();
    let id = McId {
      bmc: dangling,
      channel: 0,
      mc_num: 0,
    };
    assert!(Bmc::is_bmc(&id));
    // Resolving against a dead Weak must fail cleanly, not panic.
    let result = Bmc::resolve(&id, |_| ());
    assert!(result.is_err());
    let _ = sample_device_id();
    let _ = Config::default();
    let _: Option<Conn> = None;
  }
}
