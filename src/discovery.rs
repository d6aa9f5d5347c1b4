//! The discovery state machine: device-id query, SDR population, channel
//! probing, and the optional IPMB bus scan that follows reaching
//! `Operational`. Every step below fires a command and resumes from its
//! response callback -- discovery only progresses as the caller keeps
//! pumping the connection's event loop.

use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, warn};

use crate::{
  address::{Address, BMC_SLAVE_ADDR, BUS_SCAN_FIRST_ADDR, BUS_SCAN_LAST_ADDR},
  config::Config,
  error::{Error, Result},
  events,
  mc::{Capability, ChannelInfo, DeviceId, McData, MEDIUM_IPMB},
  message::{completion_code, Message, NetFn},
  registry::Bmc,
  sdr::{SdrEntry, SdrSet},
  transport::Connection,
};

const CMD_GET_DEVICE_ID: u8 = 0x01;
const CMD_GET_CHANNEL_INFO: u8 = 0x42;
const STORAGE_NETFN_REQUEST: NetFn = NetFn::new(0x0A);
const CMD_RESERVE_SDR_REPOSITORY: u8 = 0x22;
const CMD_GET_SDR: u8 = 0x23;
const CMD_RESERVE_DEVICE_SDR_REPOSITORY: u8 = 0x22;
const CMD_GET_DEVICE_SDR: u8 = 0x21;

/// Safety cap on how many records a single SDR repository walk will fetch,
/// in case a misbehaving device's "next record id" never reaches the
/// 0xFFFF end marker.
const MAX_SDR_RECORDS: u32 = 4096;

/// How discovery is progressing. States only ever move forward; any fatal
/// error tears the `Bmc` straight back down rather than stepping backward
/// through the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryState {
  Dead,
  QueryingDeviceId,
  QueryingMainSdrs,
  QueryingSensorSdrs,
  QueryingChannelInfo,
  Operational,
}

pub type SetupCallback = Box<dyn FnOnce(Result<Arc<Bmc>>) + Send>;

/// Take out whatever callback is still waiting, if any, and run it. A
/// second call after the first is a silent no-op -- the same discipline
/// [`crate::transport::pending::PendingTable::take`] uses for the
/// response/timeout race, applied here to the response/send-failure race
/// at every discovery step.
fn finish<T>(cb: &Arc<Mutex<Option<Box<dyn FnOnce(Result<T>) + Send>>>>, result: Result<T>) {
  if let Some(f) = cb.lock().unwrap().take() {
    f(result);
  }
}

fn fail(bmc: &Arc<Bmc>, on_ready: &Arc<Mutex<Option<SetupCallback>>>, e: Error) {
  finish(on_ready, Err(e));
  Bmc::teardown(Arc::clone(bmc));
}

/// Open a connection and drive it toward `Operational`, invoking
/// `on_ready` exactly once with the outcome. Returns the (not-yet-ready)
/// `Bmc` handle immediately; satellite discovery from the bus scan, if
/// enabled, continues in the background after `on_ready` fires.
pub fn start(config: Config, on_ready: SetupCallback) -> Result<Arc<Bmc>> {
  let connection = Connection::open(&config)?;
  let placeholder = DeviceId::parse(&[0u8; 16]).expect("an all-zero buffer always parses");
  let bmc = Bmc::new(connection, placeholder, config.do_bus_scan);
  bmc.advance_state(DiscoveryState::QueryingDeviceId);

  let event_bmc = Arc::clone(&bmc);
  bmc
    .connection
    .register_event_handler(Box::new(move |msg, addr| events::handle_async_event(&event_bmc, msg, addr)))?;

  let on_ready: Arc<Mutex<Option<SetupCallback>>> = Arc::new(Mutex::new(Some(on_ready)));
  query_device_id(Arc::clone(&bmc), on_ready);
  Ok(bmc)
}

fn query_device_id(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>) {
  let request = Message::request(NetFn::APP_REQUEST, CMD_GET_DEVICE_ID, Vec::new());
  let target = Address::SystemInterface { channel: 0 };
  let cb_bmc = Arc::clone(&bmc);
  let cb_on_ready = Arc::clone(&on_ready);
  let result = bmc.connection.send_command(
    target,
    request,
    Box::new(move |response| on_device_id_response(cb_bmc, cb_on_ready, response)),
  );
  if let Err(e) = result {
    fail(&bmc, &on_ready, e);
  }
}

fn on_device_id_response(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>, response: Message) {
  if !response.is_success() {
    fail(
      &bmc,
      &on_ready,
      Error::Protocol(format!("Get Device ID failed with completion code {:#04x}", response.completion_code())),
    );
    return;
  }
  let mut device_id = match DeviceId::parse(&response.data) {
    Ok(id) => id,
    Err(e) => {
      fail(&bmc, &on_ready, e);
      return;
    }
  };
  bmc.run_oem_device_id_hooks(&mut device_id);
  bmc.with_device_id_mut(|d| *d = device_id.clone());
  bmc.advance_state(DiscoveryState::QueryingMainSdrs);
  begin_main_sdrs(bmc, on_ready, device_id);
}

/// Main-SDR population branches three ways off the device-id capability
/// bits: with `SdrRepository`, walk the main repository first and only
/// then fetch device SDRs if the device-id's `provides_device_sdrs` bit
/// says there's anything to fetch; without it but with `SensorDevice`,
/// skip straight to device SDRs; with neither, there is nothing to
/// populate and discovery goes straight to channel probing.
fn begin_main_sdrs(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>, device_id: DeviceId) {
  if device_id.capabilities.contains(Capability::SdrRepository) {
    let target = Address::SystemInterface { channel: 0 };
    let done_bmc = Arc::clone(&bmc);
    let done_on_ready = Arc::clone(&on_ready);
    walk_sdr_repository(
      bmc.connection.clone(),
      target,
      SdrKind::Main,
      Box::new(move |result| match result {
        Ok(sdrs) => {
          done_bmc.with_main_sdrs_mut(|dst| *dst = sdrs);
          done_bmc.advance_state(DiscoveryState::QueryingSensorSdrs);
          if device_id.provides_device_sdrs {
            begin_device_sdrs(done_bmc, done_on_ready, device_id);
          } else {
            done_bmc.advance_state(DiscoveryState::QueryingChannelInfo);
            begin_channel_info(done_bmc, done_on_ready, device_id);
          }
        }
        Err(e) => fail(&done_bmc, &done_on_ready, e),
      }),
    );
  } else if device_id.capabilities.contains(Capability::SensorDevice) {
    bmc.advance_state(DiscoveryState::QueryingSensorSdrs);
    begin_device_sdrs(bmc, on_ready, device_id);
  } else {
    bmc.advance_state(DiscoveryState::QueryingChannelInfo);
    begin_channel_info(bmc, on_ready, device_id);
  }
}

fn begin_device_sdrs(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>, device_id: DeviceId) {
  let target = Address::SystemInterface { channel: 0 };
  let done_bmc = Arc::clone(&bmc);
  let done_on_ready = Arc::clone(&on_ready);
  walk_sdr_repository(
    bmc.connection.clone(),
    target,
    SdrKind::Device,
    Box::new(move |result| match result {
      Ok(sdrs) => {
        done_bmc.with_device_sdrs_mut(|dst| *dst = sdrs);
        done_bmc.advance_state(DiscoveryState::QueryingChannelInfo);
        begin_channel_info(done_bmc, done_on_ready, device_id);
      }
      Err(e) => fail(&done_bmc, &done_on_ready, e),
    }),
  );
}

fn begin_channel_info(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>, device_id: DeviceId) {
  if device_id.is_at_least_ipmi_1_5() {
    probe_channels(bmc, on_ready, 0);
  } else {
    synthesize_channels_from_sdr(&bmc);
    finish_channel_probe(bmc, on_ready);
  }
}

/// A default IPMB channel entry, used wherever no better information is
/// available: slot 0 on an IPMI < 1.5 device with no type-0x14 SDR, and
/// slot 0 on an IPMI >= 1.5 device whose very first Get Channel Info
/// fails.
fn default_ipmb_channel() -> ChannelInfo {
  ChannelInfo {
    medium: MEDIUM_IPMB,
    xmit_support: true,
    recv_lun: 0,
    protocol: 1,
    session_support: 0,
    vendor_id: 0,
    aux_info: 0,
  }
}

/// Get Channel Info, one channel at a time -- the IPMI channel numbering
/// space has 8 slots (0 through 7). The first channel that fails to
/// answer ends the probe early rather than working through the rest; if
/// that failure happens at channel 0, a default IPMB entry is installed
/// there so the bus scan still has somewhere to start.
fn probe_channels(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>, channel: u8) {
  if channel > 7 {
    finish_channel_probe(bmc, on_ready);
    return;
  }
  let request = Message::request(NetFn::APP_REQUEST, CMD_GET_CHANNEL_INFO, vec![channel]);
  let target = Address::SystemInterface { channel: 0 };
  let cb_bmc = Arc::clone(&bmc);
  let cb_on_ready = Arc::clone(&on_ready);
  let result = bmc.connection.send_command(
    target,
    request,
    Box::new(move |response| {
      if response.is_success() && response.data.len() >= 10 {
        let info = ChannelInfo {
          medium: response.data[2] & 0x7F,
          protocol: response.data[3] & 0x1F,
          session_support: (response.data[4] >> 6) & 0x03,
          vendor_id: u32::from(response.data[5]) | (u32::from(response.data[6]) << 8) | (u32::from(response.data[7]) << 16),
          aux_info: u16::from(response.data[8]) | (u16::from(response.data[9]) << 8),
          xmit_support: true,
          recv_lun: 0,
        };
        cb_bmc.with_channels_mut(|channels| channels[channel as usize] = info);
        probe_channels(cb_bmc, cb_on_ready, channel + 1);
      } else {
        if channel == 0 {
          cb_bmc.with_channels_mut(|channels| channels[0] = default_ipmb_channel());
        }
        finish_channel_probe(cb_bmc, cb_on_ready);
      }
    }),
  );
  if let Err(e) = result {
    warn!("Get Channel Info failed to send for channel {channel}: {e}");
    if channel == 0 {
      bmc.with_channels_mut(|channels| channels[0] = default_ipmb_channel());
    }
    finish_channel_probe(bmc, on_ready);
  }
}

/// On IPMI < 1.5, the channel table has no `Get Channel Info` to probe:
/// the only source is a type-0x14 SDR in the main repository, one packed
/// byte per channel. If there is no such SDR, a default IPMB channel is
/// installed in slot 0.
fn synthesize_channels_from_sdr(bmc: &Arc<Bmc>) {
  let record: Option<SdrEntry> = bmc.with_main_sdrs_mut(|sdrs| sdrs.channel_info_record().cloned());
  let Some(record) = record else {
    bmc.with_channels_mut(|channels| channels[0] = default_ipmb_channel());
    return;
  };
  bmc.with_channels_mut(|channels| {
    for (i, byte) in record.data.iter().take(8).enumerate() {
      let byte = *byte;
      if byte == 0 {
        continue;
      }
      channels[i] = ChannelInfo {
        medium: MEDIUM_IPMB,
        protocol: byte & 0x0F,
        xmit_support: (byte >> 7) & 1 != 0,
        recv_lun: (byte >> 4) & 0x03,
        session_support: 0,
        vendor_id: 0,
        aux_info: 0,
      };
    }
  });
  if record.data.len() > 9 {
    bmc.set_msg_int_types(record.data[8], record.data[9]);
  }
}

fn finish_channel_probe(bmc: Arc<Bmc>, on_ready: Arc<Mutex<Option<SetupCallback>>>) {
  bmc.advance_state(DiscoveryState::Operational);
  let scan_bmc = Arc::clone(&bmc);
  finish(&on_ready, Ok(bmc));
  maybe_start_bus_scan(scan_bmc);
}

#[derive(Clone, Copy)]
enum SdrKind {
  Main,
  Device,
}

impl SdrKind {
  fn netfn(self) -> NetFn {
    match self {
      SdrKind::Main => STORAGE_NETFN_REQUEST,
      SdrKind::Device => NetFn::SENSOR_EVENT_REQUEST,
    }
  }

  fn reserve_cmd(self) -> u8 {
    match self {
      SdrKind::Main => CMD_RESERVE_SDR_REPOSITORY,
      SdrKind::Device => CMD_RESERVE_DEVICE_SDR_REPOSITORY,
    }
  }

  fn get_cmd(self) -> u8 {
    match self {
      SdrKind::Main => CMD_GET_SDR,
      SdrKind::Device => CMD_GET_DEVICE_SDR,
    }
  }
}

type SdrDoneCallback = Box<dyn FnOnce(Result<SdrSet>) + Send>;

fn walk_sdr_repository(connection: Connection, target: Address, kind: SdrKind, on_done: SdrDoneCallback) {
  let done: Arc<Mutex<Option<SdrDoneCallback>>> = Arc::new(Mutex::new(Some(on_done)));
  let reserve = Message::request(kind.netfn(), kind.reserve_cmd(), Vec::new());
  let conn = connection.clone();
  let done2 = Arc::clone(&done);
  let result = connection.send_command(
    target,
    reserve,
    Box::new(move |response| on_reservation(conn, target, kind, response, done2)),
  );
  if let Err(e) = result {
    finish(&done, Err(e));
  }
}

fn on_reservation(connection: Connection, target: Address, kind: SdrKind, response: Message, done: Arc<Mutex<Option<SdrDoneCallback>>>) {
  if !response.is_success() || response.data.len() < 3 {
    finish(
      &done,
      Err(Error::Protocol(format!(
        "reserve SDR repository failed with completion code {:#04x}",
        response.completion_code()
      ))),
    );
    return;
  }
  let reservation_id = u16::from(response.data[1]) | (u16::from(response.data[2]) << 8);
  fetch_sdr_record(connection, target, kind, reservation_id, 0x0000, SdrSet::new(), MAX_SDR_RECORDS, done);
}

#[allow(clippy::too_many_arguments)]
fn fetch_sdr_record(
  connection: Connection,
  target: Address,
  kind: SdrKind,
  reservation_id: u16,
  record_id: u16,
  collected: SdrSet,
  remaining_budget: u32,
  done: Arc<Mutex<Option<SdrDoneCallback>>>,
) {
  if remaining_budget == 0 {
    finish(&done, Err(Error::Protocol("SDR repository walk exceeded the maximum record budget".into())));
    return;
  }
  let request_data = vec![
    (reservation_id & 0xFF) as u8,
    (reservation_id >> 8) as u8,
    (record_id & 0xFF) as u8,
    (record_id >> 8) as u8,
    0x00,
    0xFF,
  ];
  let request = Message::request(kind.netfn(), kind.get_cmd(), request_data);
  let conn = connection.clone();
  let done2 = Arc::clone(&done);
  let result = connection.send_command(
    target,
    request,
    Box::new(move |response| on_sdr_record(conn, target, kind, reservation_id, collected, remaining_budget - 1, response, done2)),
  );
  if let Err(e) = result {
    finish(&done, Err(e));
  }
}

#[allow(clippy::too_many_arguments)]
fn on_sdr_record(
  connection: Connection,
  target: Address,
  kind: SdrKind,
  reservation_id: u16,
  mut collected: SdrSet,
  remaining_budget: u32,
  response: Message,
  done: Arc<Mutex<Option<SdrDoneCallback>>>,
) {
  if !response.is_success() || response.data.len() < 6 {
    finish(
      &done,
      Err(Error::Protocol(format!("Get SDR failed with completion code {:#04x}", response.completion_code()))),
    );
    return;
  }
  let data = &response.data[1..];
  let next_record_id = u16::from(data[0]) | (u16::from(data[1]) << 8);
  let record_type = data.get(5).copied().unwrap_or(0);
  collected.push(SdrEntry {
    record_type,
    data: data[2..].to_vec(),
  });

  if next_record_id == 0xFFFF {
    finish(&done, Ok(collected));
  } else {
    fetch_sdr_record(connection, target, kind, reservation_id, next_record_id, collected, remaining_budget, done);
  }
}

fn maybe_start_bus_scan(bmc: Arc<Bmc>) {
  if !bmc.do_bus_scan() {
    return;
  }
  let channels = bmc.channels();
  for (idx, info) in channels.iter().enumerate() {
    if info.medium == MEDIUM_IPMB {
      scan_channel(Arc::clone(&bmc), idx as u8, BUS_SCAN_FIRST_ADDR);
    }
  }
}

/// Broadcast Get Device ID to every slave address in the scan range on one
/// channel, one address at a time. The BMC's own reserved address is
/// skipped; everything else that answers becomes a satellite.
fn scan_channel(bmc: Arc<Bmc>, channel: u8, slave_addr: u8) {
  if slave_addr > BUS_SCAN_LAST_ADDR {
    return;
  }
  if slave_addr == BMC_SLAVE_ADDR {
    scan_channel(bmc, channel, slave_addr + 1);
    return;
  }
  let target = Address::ipmb_broadcast(channel, slave_addr, 0);
  let request = Message::request(NetFn::APP_REQUEST, CMD_GET_DEVICE_ID, Vec::new());
  let cb_bmc = Arc::clone(&bmc);
  let result = bmc.connection.send_command(
    target,
    request,
    Box::new(move |response| {
      if response.is_success() {
        if let Ok(device_id) = DeviceId::parse(&response.data) {
          let addr = Address::ipmb(channel, slave_addr, 0);
          if !cb_bmc.has_satellite(addr) {
            fetch_satellite_device_sdrs(cb_bmc, channel, slave_addr, device_id);
            return;
          }
        }
      }
      scan_channel(cb_bmc, channel, slave_addr + 1);
    }),
  );
  if let Err(e) = result {
    warn!("bus scan probe to slave {slave_addr:#04x} on channel {channel} failed to send: {e}");
    scan_channel(bmc, channel, slave_addr + 1);
  }
}

/// Before a newly discovered satellite is added to the BMC's list, its
/// device SDRs are fetched the same way the BMC's own are: reserve, then
/// walk by "next record id". A satellite that fails to answer the
/// reservation is still added -- an empty `SdrSet` is a normal, if
/// sensor-less, starting point -- so one uncooperative satellite can't
/// stall the rest of the scan.
fn fetch_satellite_device_sdrs(bmc: Arc<Bmc>, channel: u8, slave_addr: u8, device_id: DeviceId) {
  let addr = Address::ipmb(channel, slave_addr, 0);
  let target = Address::ipmb(channel, slave_addr, 0);
  let cb_bmc = Arc::clone(&bmc);
  walk_sdr_repository(
    bmc.connection.clone(),
    target,
    SdrKind::Device,
    Box::new(move |result| {
      let mut data = McData::new(addr, device_id);
      if let Ok(sdrs) = result {
        data.device_sdrs = sdrs;
      }
      if !cb_bmc.has_satellite(addr) {
        cb_bmc.add_satellite(data);
      }
      scan_channel(cb_bmc, channel, slave_addr + 1);
    }),
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn discovery_states_are_ordered_dead_to_operational() {
    assert!(DiscoveryState::Dead < DiscoveryState::QueryingDeviceId);
    assert!(DiscoveryState::QueryingDeviceId < DiscoveryState::QueryingMainSdrs);
    assert!(DiscoveryState::QueryingMainSdrs < DiscoveryState::QueryingSensorSdrs);
    assert!(DiscoveryState::QueryingSensorSdrs < DiscoveryState::QueryingChannelInfo);
    assert!(DiscoveryState::QueryingChannelInfo < DiscoveryState::Operational);
  }

  #[test_log::test]
  fn completion_code_timeout_is_not_success() {
    let response = Message::synthetic(NetFn::APP_REQUEST, CMD_GET_DEVICE_ID, completion_code::TIMEOUT);
    assert!(!response.is_success());
  }
}
