//! Push-channel transport
pub mod connection;
pub mod dialer;
pub mod protocol;

pub use connection::{
    ConnectionSettings, ConnectionState, ConnectionStatus, MessageSink, TransportConnection,
};
pub use dialer::{Dialer, PushStream, WsDialer};
pub use protocol::PushEvent;
