//! Resource / Device / PeerDevice runtime state.
//!
//! A resource owns its volumes and the connections replicating them.
//! References between the pieces are arena indices plus weak pointers, so
//! a stale id resolves to None instead of a dangling object.

use super::bitmap::{BitmapReceiver, SyncBitmap};
use super::interval::IntervalTree;
use super::peer_seq::PeerSeq;
use super::request::RequestStore;
use super::state::{ReplState, UnifiedState};
use super::twopc::{ReplyAggregator, TwopcReceiver};
use crate::backing::{ActivityLog, BlockBackend, HelperHook};
use crate::config::SyncConfig;
use crate::meta::StoredUuids;
use super::pool::PagePool;
use super::uuids::UuidView;
use crate::types::{DeviceId, NodeId, Sector};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::info;

/// One write we sent to the peer, awaiting its acks. Entries are released
/// in bulk by BarrierAck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRequest {
    pub sector: Sector,
    pub size: u32,
    pub block_id: u64,
    pub barrier: u32,
}

/// Transmit log of outgoing writes, ordered, delimited by barrier numbers.
#[derive(Debug, Default)]
pub struct TransmitLog {
    entries: VecDeque<LocalRequest>,
    current_barrier: u32,
}

impl TransmitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_barrier(&self) -> u32 {
        self.current_barrier
    }

    pub fn register(&mut self, sector: Sector, size: u32, block_id: u64) {
        self.entries.push_back(LocalRequest {
            sector,
            size,
            block_id,
            barrier: self.current_barrier,
        });
    }

    /// Close the current barrier group and move on to `nr + 1`.
    pub fn barrier(&mut self) -> u32 {
        let nr = self.current_barrier;
        self.current_barrier = self.current_barrier.wrapping_add(1);
        nr
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Positive ack for one request: remove and return it.
    pub fn block_ack(&mut self, sector: Sector, block_id: u64) -> Option<LocalRequest> {
        let pos = self
            .entries
            .iter()
            .position(|r| r.sector == sector && r.block_id == block_id)?;
        self.entries.remove(pos)
    }

    /// Release every entry of the acked barrier group.
    pub fn release_barrier(&mut self, barrier: u32) -> Vec<LocalRequest> {
        let mut released = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.barrier == barrier {
                released.push(self.entries.pop_front().expect("front exists"));
            } else {
                break;
            }
        }
        released
    }
}

/// State behind the device's request lock.
#[derive(Debug)]
pub struct DeviceCore {
    pub requests: RequestStore,
    pub write_requests: IntervalTree,
    pub bitmap: SyncBitmap,
    pub uuids: StoredUuids,
    pub state: UnifiedState,
    pub tx_log: TransmitLog,
    pub size_sectors: u64,
}

pub struct Device {
    pub id: DeviceId,
    pub pool: Arc<PagePool>,
    pub core: Mutex<DeviceCore>,
    /// Woken whenever an interval leaves the write-request tree.
    pub tree_notify: Notify,
}

impl Device {
    pub fn new(id: DeviceId, size_sectors: u64, max_buffers: usize) -> Arc<Self> {
        let bits = size_sectors.div_ceil(super::bitmap::BM_BLOCK_SIZE >> crate::types::SECTOR_SHIFT);
        Arc::new(Self {
            id,
            pool: PagePool::new(max_buffers),
            core: Mutex::new(DeviceCore {
                requests: RequestStore::new(),
                write_requests: IntervalTree::new(),
                bitmap: SyncBitmap::new(bits),
                uuids: StoredUuids::default(),
                state: UnifiedState::default(),
                tx_log: TransmitLog::new(),
                size_sectors,
            }),
            tree_notify: Notify::new(),
        })
    }
}

/// Resync progress counters for one peer device.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResyncCounters {
    pub rs_total: u64,
    pub rs_done: u64,
    pub rs_failed: u64,
    pub ov_left: u64,
    /// Next bitmap bit the target's requester will look at.
    pub cursor: u64,
    /// Resync requests currently on the wire.
    pub in_flight: u32,
}

/// Per (connection, device) state.
pub struct PeerDevice {
    pub device: DeviceId,
    pub peer_node_id: NodeId,
    pub peer_seq: PeerSeq,
    pub repl: Mutex<ReplState>,
    pub peer_state: Mutex<UnifiedState>,
    pub peer_uuids: Mutex<Option<UuidView>>,
    pub bitmap_rx: Mutex<BitmapReceiver>,
    /// Resync writes currently in flight, for the overlap wait in the
    /// write pipeline.
    pub rs_in_flight: Mutex<IntervalTree>,
    pub rs_notify: Notify,
    pub resync: Mutex<ResyncCounters>,
    pub sync_cfg: Mutex<SyncConfig>,
}

impl PeerDevice {
    pub fn new(device: DeviceId, peer_node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            device,
            peer_node_id,
            peer_seq: PeerSeq::new(),
            repl: Mutex::new(ReplState::Off),
            peer_state: Mutex::new(UnifiedState::default()),
            peer_uuids: Mutex::new(None),
            bitmap_rx: Mutex::new(BitmapReceiver::new()),
            rs_in_flight: Mutex::new(IntervalTree::new()),
            rs_notify: Notify::new(),
            resync: Mutex::new(ResyncCounters::default()),
            sync_cfg: Mutex::new(SyncConfig::default()),
        })
    }

    pub fn repl_state(&self) -> ReplState {
        *self.repl.lock().unwrap()
    }

    pub fn set_repl_state(&self, state: ReplState) {
        let mut repl = self.repl.lock().unwrap();
        if *repl != state {
            info!(device = self.device.0, from = ?*repl, to = ?state, "repl state");
            *repl = state;
        }
    }
}

/// Reply slot for one-phase state change requests we initiated.
#[derive(Debug, Default)]
pub struct StateChangeReply {
    pub retcode: Mutex<Option<i32>>,
    pub notify: Notify,
}

/// The unit of replication: one or more volumes plus their peers.
pub struct Resource {
    pub name: String,
    pub node_id: NodeId,
    pub backend: Arc<dyn BlockBackend>,
    pub activity_log: Arc<dyn ActivityLog>,
    pub helper: Arc<dyn HelperHook>,
    pub devices: Vec<Arc<Device>>,
    pub twopc: Mutex<TwopcReceiver>,
    pub aggregator: Mutex<Option<ReplyAggregator>>,
    /// Woken when the aggregator settles (all replied, timeout, abort).
    pub aggregator_notify: Notify,
    /// A remote two-pc transaction is engaged.
    pub remote_state_change: AtomicBool,
    pub state_change_reply: StateChangeReply,
    /// Weak backrefs to live connections for nested two-pc propagation.
    connections: Mutex<Vec<(NodeId, Weak<dyn TwopcForward + Send + Sync>)>>,
}

/// A connection's ability to forward a prepared two-pc transaction.
pub trait TwopcForward {
    fn forward_twopc(&self, cmd: crate::proto::Command, payload: Vec<u8>);
    fn peer_node(&self) -> NodeId;
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        node_id: NodeId,
        backend: Arc<dyn BlockBackend>,
        activity_log: Arc<dyn ActivityLog>,
        helper: Arc<dyn HelperHook>,
        devices: Vec<Arc<Device>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node_id,
            backend,
            activity_log,
            helper,
            devices,
            twopc: Mutex::new(TwopcReceiver::new()),
            aggregator: Mutex::new(None),
            aggregator_notify: Notify::new(),
            remote_state_change: AtomicBool::new(false),
            state_change_reply: StateChangeReply::default(),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn device(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.devices.get(id.0 as usize)
    }

    /// Resolve the volume of a frame header; -1 means volume 0 on the old
    /// dialects.
    pub fn device_for_volume(&self, volume: i16) -> Option<&Arc<Device>> {
        let idx = if volume < 0 { 0 } else { volume as usize };
        self.devices.get(idx)
    }

    pub fn register_connection(
        &self,
        node: NodeId,
        conn: Weak<dyn TwopcForward + Send + Sync>,
    ) {
        let mut conns = self.connections.lock().unwrap();
        conns.retain(|(n, w)| *n != node && w.strong_count() > 0);
        conns.push((node, conn));
    }

    pub fn unregister_connection(&self, node: NodeId) {
        self.connections
            .lock()
            .unwrap()
            .retain(|(n, _)| *n != node);
    }

    /// Queue a prepared two-pc frame toward every directly-connected peer
    /// except the initiator and the sender.
    pub fn propagate_twopc(
        &self,
        cmd: crate::proto::Command,
        payload: Vec<u8>,
        initiator: NodeId,
        from: NodeId,
    ) {
        let conns = self.connections.lock().unwrap();
        for (node, weak) in conns.iter() {
            if *node == initiator || *node == from {
                continue;
            }
            if let Some(conn) = weak.upgrade() {
                conn.forward_twopc(cmd, payload.clone());
            }
        }
    }

    pub fn begin_remote_state_change(&self) -> bool {
        !self.remote_state_change.swap(true, Ordering::SeqCst)
    }

    pub fn end_remote_state_change(&self) {
        self.remote_state_change.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_log_barrier_release() {
        let mut log = TransmitLog::new();
        log.register(0, 4096, 1);
        log.register(8, 4096, 2);
        let nr = log.barrier();
        log.register(16, 4096, 3);

        let released = log.release_barrier(nr);
        assert_eq!(released.len(), 2);
        assert_eq!(log.len(), 1);
        // remaining entry belongs to the next barrier group
        assert_eq!(log.release_barrier(nr).len(), 0);
    }

    #[test]
    fn transmit_log_block_ack_removes_entry() {
        let mut log = TransmitLog::new();
        log.register(0, 4096, 1);
        log.register(8, 4096, 2);
        assert!(log.block_ack(8, 2).is_some());
        assert!(log.block_ack(8, 2).is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn device_bitmap_sized_from_sectors() {
        // 1 GiB device: 2^21 sectors, 4KiB per bit = 2^18 bits
        let dev = Device::new(DeviceId(0), 1 << 21, 128);
        let core = dev.core.lock().unwrap();
        assert_eq!(core.bitmap.bits(), 1 << 18);
    }
}
