//! The low-level connection and discovery engine: transport multiplexing,
//! pending-command bookkeeping, and the raw kernel device interface.

mod connection;
mod device;
mod pending;

pub use connection::{Connection, CommandHandler, EventHandler, ResponseHandler, SubscriptionId};
pub use device::{Device, RawRecv, RecvType};
pub use pending::PendingCommandId;
