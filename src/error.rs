use thiserror::Error;

use crate::address::Address;

/// Failure domains surfaced by the connection, discovery, and registry
/// layers. Completion-code failures reported by a device are not
/// represented here -- they travel inside a [`crate::message::Message`]
/// response and are handed to the caller's own callback untouched.
#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("out of memory")]
  OutOfMemory,

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("no response within the deadline")]
  Timeout,

  #[error("protocol error: {0}")]
  Protocol(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("already exists: {0}")]
  AlreadyExists(String),

  #[error("not supported: {0}")]
  NotSupported(String),
}

impl Error {
  pub(crate) fn invalid_address(addr: Address) -> Self {
    Error::InvalidArgument(format!("address not usable here: {addr:?}"))
  }
}

pub type Result<T> = std::result::Result<T, Error>;
