//! Connection-level configuration.
//!
//! A library has no config file of its own; what would be one in a daemon
//! is instead the set of parameters a caller hands to [`crate::transport::Connection::open`].

use std::time::Duration;

/// Default per-request timeout (`IPMI_RSP_TIMEOUT` in the source material).
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Character device paths tried, in order, by [`Config::default`].
pub const DEFAULT_DEVICE_PATHS: &[&str] = &["/dev/ipmidev/0", "/dev/ipmi/0", "/dev/ipmi0"];

#[derive(Debug, Clone)]
pub struct Config {
  /// Candidate device paths, tried in order; the first that opens wins.
  pub device_paths: Vec<String>,
  /// How long `send_command` waits for a response before synthesizing a
  /// timeout response.
  pub response_timeout: Duration,
  /// Whether reaching `Operational` should trigger an IPMB bus scan for
  /// satellite MCs.
  pub do_bus_scan: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      device_paths: DEFAULT_DEVICE_PATHS.iter().map(|s| s.to_string()).collect(),
      response_timeout: DEFAULT_RESPONSE_TIMEOUT,
      do_bus_scan: true,
    }
  }
}

impl Config {
  pub fn with_device_path(mut self, path: impl Into<String>) -> Self {
    self.device_paths = vec![path.into()];
    self
  }

  pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
    self.response_timeout = timeout;
    self
  }

  pub fn with_bus_scan(mut self, do_bus_scan: bool) -> Self {
    self.do_bus_scan = do_bus_scan;
    self
  }
}
