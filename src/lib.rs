pub mod backing;
pub mod config;
pub mod error;
pub mod meta;
pub mod net;
pub mod proto;
pub mod repl;
pub mod types;

pub use backing::{BackendCaps, BlockBackend, MemoryBackend, NullActivityLog, NullHelper};
pub use config::{AfterSbPolicy, NetConfig, SyncConfig, WireProtocol};
pub use error::ReplError;
pub use meta::{MetaStore, StoredUuids};
pub use net::{Connection, ListenerSet, run_connection};
pub use repl::{Device, PeerDevice, ReplState, Resource, SyncDecision, WriteOrdering};
pub use types::*;
