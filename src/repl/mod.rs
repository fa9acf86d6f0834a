//! Replication engine: epochs, requests, conflicts, resync, the UUID
//! handshake and cluster state changes.

pub mod bitmap;
pub mod epoch;
pub mod interval;
pub mod peer_seq;
pub mod pool;
pub mod request;
pub mod resource;
pub mod resync;
pub mod state;
pub mod twopc;
pub mod uuids;
pub mod writes;

pub use bitmap::{BitmapChunk, BitmapReceiver, SyncBitmap};
pub use epoch::{EpochAction, EpochList, WriteOrdering};
pub use interval::{IntervalId, IntervalTree};
pub use peer_seq::{PeerSeq, seq_greater, seq_le, seq_max};
pub use pool::{PagePool, PooledBuf};
pub use request::{Cookie, EeFlags, PeerRequest, ReqQueue, RequestStore};
pub use resource::{Device, DeviceCore, PeerDevice, Resource, TransmitLog};
pub use state::{ConnState, DiskState, ReplState, Role, UnifiedState};
pub use twopc::{AggregatorState, ReplyAggregator, TwopcReceiver, TwopcVerdict};
pub use uuids::{CompareResult, SyncDecision, UuidView, sync_handshake, uuid_compare};
