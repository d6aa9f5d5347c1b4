//! Client-side IPMI library: a connection to the kernel's IPMI character
//! device, discovery of the local BMC and its satellite MCs over IPMB,
//! and the event and command plumbing that runs on top.
//!
//! The entry point is [`open`]: it opens the device, drives discovery to
//! `Operational` (or a fatal error), and hands back an [`McId`] for the
//! BMC through a completion closure. Everything afterward -- sending
//! commands, registering event and command handlers, looking up
//! satellite MCs -- goes through that handle plus [`transport::Connection`]
//! methods reachable via [`Bmc::resolve`].
//!
//! Nothing here spawns a thread. The caller owns the event loop: after
//! `open`, repeatedly call [`Connection::run_one`] (directly, or via the
//! `Bmc`'s own connection handle) to pump fd readiness and timers.
//!
//! The transport talks directly to the Linux kernel's `ipmidev` character
//! device via `ioctl`; there is no portable fallback for other kernels.

pub mod address;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mc;
pub mod message;
pub mod os;
pub mod registry;
pub mod sdr;
pub mod sensor;
pub mod transport;

pub use address::Address;
pub use config::Config;
pub use discovery::DiscoveryState;
pub use error::{Error, Result};
pub use mc::{Capability, ChannelInfo, DeviceId, McData, McView};
pub use message::{completion_code, Message, NetFn};
pub use registry::{close_connection, Bmc, McId};
pub use sdr::{SdrEntry, SdrSet};
pub use transport::{CommandHandler, Connection, EventHandler, ResponseHandler, SubscriptionId};

/// Completion closure for [`open`]: called exactly once with the BMC's
/// handle, or the error that made discovery give up.
pub type OpenCallback = Box<dyn FnOnce(Result<McId>) + Send>;

/// Open the IPMI device named by `config` and drive discovery to
/// completion, invoking `on_ready` exactly once with either the BMC's
/// [`McId`] or the error that made discovery give up.
///
/// This is the crate's `setup_con`: the single call a caller needs to get
/// from "nothing open" to "usable BMC handle", with the bus scan (if
/// `config.do_bus_scan`) continuing to populate satellite MCs in the
/// background afterward.
pub fn open(config: Config, on_ready: OpenCallback) -> Result<()> {
  discovery::start(config, Box::new(move |result| on_ready(result.map(|bmc| bmc.id()))))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_tries_the_three_documented_device_paths() {
    let cfg = Config::default();
    assert_eq!(cfg.device_paths, config::DEFAULT_DEVICE_PATHS);
  }
}
