//! Event plumbing: the OEM pre-filter, sensor-specific dispatch, and the
//! system-level fan-out fallback for anything the first two steps leave
//! unhandled.

use std::sync::Arc;

use crate::{address::Address, message::Message, registry::Bmc};

/// Minimum platform event message length needed to reach the sensor
/// number at `data[11]`.
const MIN_EVENT_LEN: usize = 12;

const SYSTEM_EVENT_RECORD_TYPE: u8 = 0x02;
const SOFTWARE_GENERATOR_BIT: u8 = 0x01;
/// Generator channel value `0x03` means "system interface", which
/// collapses to channel 0 rather than naming an IPMB channel directly.
const GENERATOR_CHANNEL_SYSTEM_INTERFACE: u8 = 0x03;

struct SensorEvent {
  channel: u8,
  mc_num: u8,
  lun: u8,
  sensor_number: u8,
}

/// Classify a platform event message as MC-generated sensor traffic, per
/// the System Event Record layout: `data[2]` is the record type (`0x02`
/// for a system event record), `data[7]` is the generator id -- its low
/// bit set means a software id, not an MC, generated the event -- and
/// `data[8]` packs the generator's channel in the high nibble (`0x03`
/// meaning "system interface", folded to channel 0) and LUN in the low
/// two bits. `data[11]` is the sensor number. Anything that isn't an
/// MC-generated system event record returns `None` and falls straight
/// through to the system-level subscribers.
fn sensor_event_of(msg: &Message) -> Option<SensorEvent> {
  let data = &msg.data;
  if data.len() < MIN_EVENT_LEN {
    return None;
  }
  if data[2] != SYSTEM_EVENT_RECORD_TYPE {
    return None;
  }
  if data[7] & SOFTWARE_GENERATOR_BIT != 0 {
    return None;
  }
  let channel = if data[8] == GENERATOR_CHANNEL_SYSTEM_INTERFACE {
    0
  } else {
    data[8] >> 4
  };
  Some(SensorEvent {
    channel,
    mc_num: data[7],
    lun: data[8] & 0x3,
    sensor_number: data[11],
  })
}

/// Route one asynchronously delivered event. Order of precedence: the OEM
/// filter gets first look and can swallow the event outright; failing
/// that, a sensor-specific handler registered on the originating MC
/// (resolved from the fields the event itself carries, not from whatever
/// address the transport happened to receive it on); and only if neither
/// consumes it, every system-level subscriber.
pub fn handle_async_event(bmc: &Arc<Bmc>, msg: Message, addr: Address) {
  if bmc.apply_oem_filter(&msg, addr) {
    return;
  }

  if let Some(event) = sensor_event_of(&msg) {
    let mc_addr = Address::ipmb(event.channel, event.mc_num, event.lun);
    if let Some(id) = bmc.lookup_addr(mc_addr) {
      if let Ok(true) = bmc.dispatch_sensor_event(&id, event.sensor_number) {
        return;
      }
    }
  }

  bmc.fan_out_system_event(&msg, addr);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::NetFn;

  fn event_bytes(record_type: u8, generator: u8, channel_lun: u8, sensor_number: u8) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data[2] = record_type;
    data[7] = generator;
    data[8] = channel_lun;
    data[11] = sensor_number;
    data
  }

  #[test]
  fn mc_generated_system_event_yields_channel_mc_lun_and_sensor() {
    let data = event_bytes(0x02, 0x24, (3 << 4) | 0x01, 0x2A);
    let msg = Message::request(NetFn::SENSOR_EVENT_REQUEST, 0x02, data);
    let event = sensor_event_of(&msg).expect("MC-generated system event");
    assert_eq!(event.channel, 3);
    assert_eq!(event.mc_num, 0x24);
    assert_eq!(event.lun, 0x01);
    assert_eq!(event.sensor_number, 0x2A);
  }

  #[test]
  fn generator_channel_0x03_folds_to_channel_zero() {
    let data = event_bytes(0x02, 0x20, 0x03, 0x10);
    let msg = Message::request(NetFn::SENSOR_EVENT_REQUEST, 0x02, data);
    let event = sensor_event_of(&msg).expect("MC-generated system event");
    assert_eq!(event.channel, 0);
  }

  #[test]
  fn software_generated_event_is_not_sensor_specific() {
    let data = event_bytes(0x02, 0x01, 0x00, 0x10);
    let msg = Message::request(NetFn::SENSOR_EVENT_REQUEST, 0x02, data);
    assert!(sensor_event_of(&msg).is_none());
  }

  #[test]
  fn non_system_event_record_is_not_sensor_specific() {
    let data = event_bytes(0xC0, 0x20, 0x00, 0x10);
    let msg = Message::request(NetFn::SENSOR_EVENT_REQUEST, 0x02, data);
    assert!(sensor_event_of(&msg).is_none());
  }

  #[test]
  fn short_event_message_has_no_sensor_event() {
    let msg = Message::request(NetFn::SENSOR_EVENT_REQUEST, 0x02, vec![0; 5]);
    assert!(sensor_event_of(&msg).is_none());
  }
}
