//! Transport layer: socket pairing, framing, authentication and the
//! per-connection tasks.

pub mod ack;
pub mod auth;
pub mod connection;
pub mod framed;
pub mod sockpair;

pub use connection::{Channel, Connection, Outbound, run_connection};
pub use framed::{FrameReader, FrameWriter};
pub use sockpair::{AcceptQueue, ListenerSet, SocketPair, establish_pair};
