//! Per-MC data: device-id fields, capability bits, and the channel table
//! layout shared by the BMC and every satellite it discovers.

use enumflags2::{bitflags, BitFlags};

use crate::{
  address::Address,
  error::{Error, Result},
  sdr::SdrSet,
  sensor::{ControlSet, SensorSet},
};

/// The eight capability bits from Get Device ID byte `data[6]`, in the
/// order the source material lists them.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
  Chassis = 1 << 0,
  Bridge = 1 << 1,
  IpmbEventGenerator = 1 << 2,
  IpmbEventReceiver = 1 << 3,
  Fru = 1 << 4,
  Sel = 1 << 5,
  SdrRepository = 1 << 6,
  SensorDevice = 1 << 7,
}

/// The parsed contents of a Get Device ID response, `data[1..16]`. Parsing
/// is a pure function of the bytes: the same input always yields the same
/// `DeviceId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
  pub device_id: u8,
  pub device_rev: u8,
  pub provides_device_sdrs: bool,
  pub device_available: bool,
  pub fw_major: u8,
  pub fw_minor: u8,
  pub ipmi_major: u8,
  pub ipmi_minor: u8,
  pub capabilities: BitFlags<Capability>,
  /// 24-bit manufacturer id, combined with a true bitwise-or. The source
  /// material combines these bytes with `||` instead of `|`, collapsing
  /// the value to 0 or 1; this is a known source bug (see design notes)
  /// and is never reproduced here.
  pub manufacturer_id: u32,
  pub product_id: u16,
  pub aux_fw: [u8; 4],
}

impl DeviceId {
  /// Minimum response length: completion code + 15 bytes of device-id
  /// payload through `aux_fw[0]`. Shorter than this, the response cannot
  /// even be parsed up to `product_id` and is rejected outright.
  pub const MIN_RESPONSE_LEN: usize = 12;

  /// Parse `data`, the full response payload (`data[0]` is the completion
  /// code, already checked by the caller). `aux_fw` bytes beyond the end
  /// of a short (but still valid, 12..16 byte) response are zero-filled.
  pub fn parse(data: &[u8]) -> Result<Self> {
    if data.len() < Self::MIN_RESPONSE_LEN {
      return Err(Error::Protocol(format!(
        "Get Device ID response too short: {} bytes, need at least {}",
        data.len(),
        Self::MIN_RESPONSE_LEN
      )));
    }

    let byte = |i: usize| -> u8 { data.get(i).copied().unwrap_or(0) };

    let device_id = byte(1);
    let device_rev = byte(2) & 0x0F;
    let provides_device_sdrs = byte(2) & 0x80 != 0;
    let device_available = byte(3) & 0x80 != 0;
    let fw_major = byte(3) & 0x7F;
    let fw_minor = byte(4);
    let ipmi_major = byte(5) & 0x0F;
    let ipmi_minor = (byte(5) >> 4) & 0x0F;
    let cap_byte = byte(6);
    let mut capabilities = BitFlags::<Capability>::empty();
    for (bit, flag) in [
      (0x01, Capability::Chassis),
      (0x02, Capability::Bridge),
      (0x04, Capability::IpmbEventGenerator),
      (0x08, Capability::IpmbEventReceiver),
      (0x10, Capability::Fru),
      (0x20, Capability::Sel),
      (0x40, Capability::SdrRepository),
      (0x80, Capability::SensorDevice),
    ] {
      if cap_byte & bit != 0 {
        capabilities |= flag;
      }
    }
    let manufacturer_id = u32::from(byte(7)) | (u32::from(byte(8)) << 8) | (u32::from(byte(9)) << 16);
    let product_id = u16::from(byte(10)) | (u16::from(byte(11)) << 8);
    let aux_fw = [byte(12), byte(13), byte(14), byte(15)];

    Ok(DeviceId {
      device_id,
      device_rev,
      provides_device_sdrs,
      device_available,
      fw_major,
      fw_minor,
      ipmi_major,
      ipmi_minor,
      capabilities,
      manufacturer_id,
      product_id,
      aux_fw,
    })
  }

  /// True when the MC speaks IPMI 1.5 or later, the threshold at which
  /// Get Channel Info becomes available (below it, channel information is
  /// synthesized from an SDR of type 0x14).
  pub fn is_at_least_ipmi_1_5(&self) -> bool {
    (self.ipmi_major, self.ipmi_minor) >= (1, 5)
  }
}

/// One slot of the BMC's channel table, describing either a physical
/// channel learned via Get Channel Info (IPMI >= 1.5) or synthesized from
/// an SDR type 0x14 record (IPMI < 1.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelInfo {
  pub medium: u8,
  pub xmit_support: bool,
  pub recv_lun: u8,
  pub protocol: u8,
  pub session_support: u8,
  pub vendor_id: u32,
  pub aux_info: u16,
}

/// IPMB is channel medium `1` in the IPMI channel-medium-type table.
pub const MEDIUM_IPMB: u8 = 0x01;

/// Per-MC state shared by the BMC and every satellite: identity, parsed
/// device-id fields, and the (currently unparsed) sensor data record sets
/// and sensor/control collections an external SDR-parsing collaborator
/// would populate.
pub struct McData {
  pub addr: Address,
  pub device_id: DeviceId,
  pub device_sdrs: SdrSet,
  pub sensors: SensorSet,
  pub controls: ControlSet,
  /// Set once the MC has been added to its owning BMC's satellite list.
  /// A BMC's own `McData` never sets this; the BMC is reachable by
  /// address but is never a member of its own list.
  pub in_bmc_list: bool,
}

impl McData {
  pub fn new(addr: Address, device_id: DeviceId) -> Self {
    McData {
      addr,
      device_id,
      device_sdrs: SdrSet::new(),
      sensors: SensorSet::new(),
      controls: ControlSet::new(),
      in_bmc_list: false,
    }
  }
}

/// A borrowed view into one MC, valid only for the duration of the
/// closure it was handed to -- the tagged-variant analogue of the source
/// material's `pointer_cb` scope discipline. Because the lifetime is tied
/// to the registry lock guard that produced it, nothing can retain a
/// `McView` past the point where the lock (and the guarantee that the
/// entry hasn't been concurrently torn down) is released.
pub struct McView<'a> {
  pub is_bmc: bool,
  pub data: &'a McData,
}

impl<'a> McView<'a> {
  pub fn new(is_bmc: bool, data: &'a McData) -> Self {
    McView { is_bmc, data }
  }
}

#[cfg(test)]
mod tests {
  use hex_literal::hex;
  use test_case::test_case;

  use super::*;

  fn sample_bytes() -> Vec<u8> {
    // cc=0, id=0x20, rev=0x01, avail|fw=0x80|0x00, fw_minor=0x00,
    // ipmi=0x51 (major=1, minor=5), cap=0x00, mfg=0x00 0x1B 0xF2,
    // prod=0x01 0x00
    hex!("00 20 01 80 00 51 00 00 1B F2 01 00").to_vec()
  }

  #[test]
  fn parse_is_pure_and_idempotent() -> anyhow::Result<()> {
    let bytes = sample_bytes();
    let a = DeviceId::parse(&bytes)?;
    let b = DeviceId::parse(&bytes)?;
    assert_eq!(a, b);
    assert_eq!(a.device_id, 0x20);
    assert_eq!(a.ipmi_major, 1);
    assert_eq!(a.ipmi_minor, 5);
    assert!(a.is_at_least_ipmi_1_5());
    assert_eq!(a.manufacturer_id, 0x00 | (0x1B << 8) | (0xF2 << 16));
    Ok(())
  }

  #[test]
  fn response_shorter_than_twelve_bytes_is_a_protocol_error() {
    let short = vec![0x00; 11];
    assert!(matches!(DeviceId::parse(&short), Err(Error::Protocol(_))));
  }

  #[test_case(12, 0; "exactly the minimum length")]
  #[test_case(13, 1; "one aux_fw byte present")]
  #[test_case(14, 2; "two aux_fw bytes present")]
  #[test_case(15, 3; "three aux_fw bytes present")]
  fn aux_fw_is_zero_filled_past_the_response_length(len: usize, expected_nonzero: usize) {
    let bytes = vec![0xAAu8; len];
    let parsed = DeviceId::parse(&bytes).unwrap();
    for (i, b) in parsed.aux_fw.iter().enumerate() {
      if i < expected_nonzero {
        assert_eq!(*b, 0xAA);
      } else {
        assert_eq!(*b, 0);
      }
    }
  }

  #[test]
  fn manufacturer_id_is_combined_with_bitwise_or_not_boolean_or() {
    // If this were combined with `||` it would collapse to 0 or 1.
    let mut bytes = sample_bytes();
    bytes[7] = 0xFF;
    bytes[8] = 0x00;
    bytes[9] = 0x00;
    let parsed = DeviceId::parse(&bytes).unwrap();
    assert_eq!(parsed.manufacturer_id, 0xFF);
  }
}
