//! Client-side connection state machine.
//!
//! A [`ChatSocket`] is the single logical connection a client process holds:
//! it reconnects with exponential backoff, queues outbound messages while the
//! transport is down, and multiplexes inbound frames to registered listeners.

mod listeners;
mod queue;
mod socket;
mod transport;

pub use listeners::{ListenerRegistry, ListenerToken};
pub use queue::OutboundQueue;
pub use socket::{reconnect_delay, ChatSocket, ConnectionStatus, SendOutcome};
pub use transport::{
    Transport, TransportEvent, TransportFactory, WsTransport, WsTransportFactory, CLOSE_ABNORMAL,
    CLOSE_NORMAL,
};
