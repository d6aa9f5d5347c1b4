//! IPMI addressing: system-interface and IPMB target/broadcast addresses.

/// An IPMI address. Equality is structural on the active variant's fields;
/// `channel` is always compared, even though on a `SystemInterface` address
/// it is usually the single local channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
  /// The BMC reached directly through the local system interface.
  SystemInterface { channel: u8 },
  /// A specific target on the IPMB bus.
  Ipmb {
    channel: u8,
    slave_addr: u8,
    lun: u8,
  },
  /// A broadcast "Get Device ID" probe on the IPMB bus. `slave_addr` carries
  /// the address being probed so that a matching response can be correlated
  /// back to the scan step that sent it.
  IpmbBroadcast {
    channel: u8,
    slave_addr: u8,
    lun: u8,
  },
}

/// The slave address IPMB reserves for the BMC itself.
pub const BMC_SLAVE_ADDR: u8 = 0x20;

/// First slave address a bus scan may probe. Addresses below this are
/// reserved by the specification and are never sent to.
pub const BUS_SCAN_FIRST_ADDR: u8 = 0x10;

/// Last slave address a bus scan probes (inclusive).
pub const BUS_SCAN_LAST_ADDR: u8 = 0xEF;

impl Address {
  pub fn channel(&self) -> u8 {
    match self {
      Address::SystemInterface { channel }
      | Address::Ipmb { channel, .. }
      | Address::IpmbBroadcast { channel, .. } => *channel,
    }
  }

  /// True for any IPMB-flavored address (unicast or broadcast) whose slave
  /// address is the reserved BMC address. Per the registry short-circuit
  /// rule, such an address always resolves to the BMC, never to a
  /// satellite MC, regardless of what else might be registered at that
  /// address.
  pub fn is_bmc_shorthand(&self) -> bool {
    matches!(
      self,
      Address::Ipmb { slave_addr, .. } | Address::IpmbBroadcast { slave_addr, .. }
      if *slave_addr == BMC_SLAVE_ADDR
    )
  }

  pub fn ipmb(channel: u8, slave_addr: u8, lun: u8) -> Self {
    Address::Ipmb {
      channel,
      slave_addr,
      lun,
    }
  }

  pub fn ipmb_broadcast(channel: u8, slave_addr: u8, lun: u8) -> Self {
    Address::IpmbBroadcast {
      channel,
      slave_addr,
      lun,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bmc_shorthand_only_for_ipmb_0x20() {
    assert!(Address::ipmb(0, BMC_SLAVE_ADDR, 0).is_bmc_shorthand());
    assert!(Address::ipmb_broadcast(0, BMC_SLAVE_ADDR, 0).is_bmc_shorthand());
    assert!(!Address::ipmb(0, 0x24, 0).is_bmc_shorthand());
    assert!(!Address::SystemInterface { channel: 0 }.is_bmc_shorthand());
  }

  #[test]
  fn channel_is_always_compared() {
    let a = Address::ipmb(0, 0x24, 0);
    let b = Address::ipmb(1, 0x24, 0);
    assert_ne!(a, b);
  }
}
