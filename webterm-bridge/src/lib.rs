//! Connects client terminal channels to shell processes.
//!
//! A [`Bridge`] owns nothing transport specific. Anything implementing
//! [`ChannelSource`] and [`ChannelSink`] can be bridged to a shell; the
//! [`SessionRegistry`] tracks every live pairing so the server can tear them
//! all down on exit.

mod bridge;
mod channel;
mod protocol;
mod record;
mod registry;

pub use bridge::{Bridge, BridgeConfig, BridgeState, TerminationReason};
pub use channel::{ChannelSink, ChannelSource};
pub use protocol::{
    ChannelEvent, ClientMessage, SPAWN_FAILURE_NOTICE, TERMINATION_NOTICE, TransportError,
};
pub use record::{ConnectionId, ConnectionRecord};
pub use registry::{RegistryError, SessionRegistry};
