//! Peer-request store.
//!
//! Every inbound write, read or resync request lives here from receive to
//! final ack. A request is in exactly one queue at any time and each move
//! names the expected source queue, so a misrouted completion is an error
//! instead of a corrupted list. Wire-visible ids are generation-tagged
//! cookies; an ack for a freed request fails the lookup instead of
//! touching recycled memory.

use super::interval::IntervalId;
use super::pool::PooledBuf;
use crate::error::ReplError;
use crate::types::Sector;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EeFlags: u32 {
        /// Activity-log coverage was taken and must be put on completion.
        const CALL_AL_COMPLETE_IO = 0x01;
        /// Completion may clear out-of-sync bits.
        const MAY_SET_IN_SYNC     = 0x02;
        /// Postponed local requests must restart after this one completes.
        const RESTART_REQUESTS    = 0x04;
        /// Backing device reported an error for this request.
        const WAS_ERROR           = 0x08;
        /// Discard rather than write.
        const TRIM                = 0x10;
        /// Payload digest was received and verified.
        const HAS_DIGEST          = 0x20;
        /// Net send of the payload has completed; pages reclaimable.
        const NET_DONE            = 0x40;
        /// Resync write (sync_ee lifecycle, RSWriteAck on completion).
        const IS_RESYNC           = 0x80;
        /// Read serving a DataRequest: reply DataReply with payload.
        const SERVE_DATA          = 0x100;
        /// Read serving an RSDataRequest: reply RSDataReply.
        const SERVE_RS            = 0x200;
        /// Read serving an OVRequest: reply OVReply with a digest.
        const SERVE_OV            = 0x400;
        /// Read comparing against a received OVReply digest.
        const COMPARE_OV          = 0x800;
        /// Read comparing against a CsumRSRequest digest.
        const COMPARE_CSUM        = 0x1000;
        /// Protocol C: emit WriteAck once the write is stable.
        const SEND_WRITE_ACK      = 0x2000;
        /// Target-side checksum resync: digest the local block, then send
        /// CsumRSRequest instead of RSDataRequest.
        const SEND_CSUM_REQUEST   = 0x4000;
        /// First write of a fresh epoch carrying barrier flags; its
        /// completion releases the predecessor epoch.
        const EPOCH_BARRIER       = 0x8000;
    }
}

/// The queue a peer request currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqQueue {
    /// Received writes, not yet completed by the backing device.
    Active,
    /// Resync writes.
    Sync,
    /// Reads serving DataRequest/OVRequest.
    Read,
    /// Completed, waiting for the worker to emit the ack.
    Done,
    /// Acked, payload pages possibly still owned by an outbound socket.
    Net,
}

const QUEUE_COUNT: usize = 5;

impl ReqQueue {
    fn index(self) -> usize {
        match self {
            ReqQueue::Active => 0,
            ReqQueue::Sync => 1,
            ReqQueue::Read => 2,
            ReqQueue::Done => 3,
            ReqQueue::Net => 4,
        }
    }
}

/// Opaque wire-safe request id: generation in the high half, slot index in
/// the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u64);

impl Cookie {
    fn new(idx: u32, generation: u32) -> Self {
        Cookie(((generation as u64) << 32) | idx as u64)
    }

    fn idx(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug)]
pub struct PeerRequest {
    pub sector: Sector,
    pub size: u32,
    /// Opaque echo from the peer, returned verbatim in acks.
    pub block_id: u64,
    /// Connection the request arrived on, for disconnect teardown.
    pub owner: u32,
    pub payload: Option<PooledBuf>,
    /// Epoch this write is chained to.
    pub epoch: Option<u64>,
    pub flags: EeFlags,
    pub interval: Option<IntervalId>,
    pub dagtag: u64,
    pub digest: Option<Vec<u8>>,
    queue: ReqQueue,
}

impl PeerRequest {
    pub fn queue(&self) -> ReqQueue {
        self.queue
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    req: Option<PeerRequest>,
}

/// Store plus per-queue membership lists, receive order preserved.
#[derive(Debug, Default)]
pub struct RequestStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    queues: [Vec<Cookie>; QUEUE_COUNT],
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        sector: Sector,
        size: u32,
        block_id: u64,
        queue: ReqQueue,
        payload: Option<PooledBuf>,
    ) -> Cookie {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        slot.req = Some(PeerRequest {
            sector,
            size,
            block_id,
            owner: 0,
            payload,
            epoch: None,
            flags: EeFlags::empty(),
            interval: None,
            dagtag: 0,
            digest: None,
            queue,
        });
        let cookie = Cookie::new(idx, slot.generation);
        self.queues[queue.index()].push(cookie);
        cookie
    }

    pub fn get(&self, cookie: Cookie) -> Option<&PeerRequest> {
        let slot = self.slots.get(cookie.idx() as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        slot.req.as_ref()
    }

    pub fn get_mut(&mut self, cookie: Cookie) -> Option<&mut PeerRequest> {
        let slot = self.slots.get_mut(cookie.idx() as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        slot.req.as_mut()
    }

    /// Transfer a request between queues, validating the source.
    pub fn move_to(&mut self, cookie: Cookie, from: ReqQueue, to: ReqQueue) -> Result<(), ReplError> {
        let req = self
            .get_mut(cookie)
            .ok_or_else(|| ReplError::Resource(format!("stale request cookie {cookie}")))?;
        if req.queue != from {
            return Err(ReplError::Resource(format!(
                "request {cookie} moved from {:?} but is on {:?}",
                from, req.queue
            )));
        }
        req.queue = to;
        self.queues[from.index()].retain(|c| *c != cookie);
        self.queues[to.index()].push(cookie);
        Ok(())
    }

    /// Remove a request from the store entirely.
    pub fn release(&mut self, cookie: Cookie) -> Option<PeerRequest> {
        let slot = self.slots.get_mut(cookie.idx() as usize)?;
        if slot.generation != cookie.generation() {
            return None;
        }
        let req = slot.req.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(cookie.idx());
        self.queues[req.queue.index()].retain(|c| *c != cookie);
        Some(req)
    }

    pub fn queue_len(&self, queue: ReqQueue) -> usize {
        self.queues[queue.index()].len()
    }

    pub fn queue_cookies(&self, queue: ReqQueue) -> Vec<Cookie> {
        self.queues[queue.index()].clone()
    }

    /// Pop the oldest entry of a queue.
    pub fn pop_front(&mut self, queue: ReqQueue) -> Option<Cookie> {
        if self.queues[queue.index()].is_empty() {
            return None;
        }
        Some(self.queues[queue.index()].remove(0))
    }

    /// Put back an entry popped with `pop_front` (queue order preserved by
    /// pushing to the front).
    pub fn push_front(&mut self, queue: ReqQueue, cookie: Cookie) {
        self.queues[queue.index()].insert(0, cookie);
    }

    /// Free all net-queue entries whose send completed, dropping their
    /// payload pages back into the pool. Returns how many were reclaimed.
    pub fn reclaim_net(&mut self) -> usize {
        let done: Vec<Cookie> = self.queues[ReqQueue::Net.index()]
            .iter()
            .copied()
            .filter(|c| {
                self.get(*c)
                    .map(|r| r.flags.contains(EeFlags::NET_DONE))
                    .unwrap_or(false)
            })
            .collect();
        let n = done.len();
        for cookie in done {
            self.release(cookie);
        }
        n
    }

    /// Find the newest request whose dagtag does not exceed `dagtag`.
    pub fn find_by_dagtag(&self, dagtag: u64) -> Option<Cookie> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let req = slot.req.as_ref()?;
                if req.dagtag != 0 && req.dagtag <= dagtag {
                    Some((req.dagtag, Cookie::new(idx as u32, slot.generation)))
                } else {
                    None
                }
            })
            .max_by_key(|(tag, _)| *tag)
            .map(|(_, cookie)| cookie)
    }

    /// Cookies across every queue, for disconnect teardown.
    pub fn all_cookies(&self) -> Vec<Cookie> {
        self.queues.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves() {
        let mut store = RequestStore::new();
        let c = store.alloc(64, 4096, 7, ReqQueue::Active, None);
        assert_eq!(store.queue_len(ReqQueue::Active), 1);

        store.move_to(c, ReqQueue::Active, ReqQueue::Done).unwrap();
        assert_eq!(store.queue_len(ReqQueue::Active), 0);
        assert_eq!(store.queue_len(ReqQueue::Done), 1);

        store.move_to(c, ReqQueue::Done, ReqQueue::Net).unwrap();
        assert_eq!(store.get(c).unwrap().queue(), ReqQueue::Net);
    }

    #[test]
    fn wrong_source_queue_is_an_error() {
        let mut store = RequestStore::new();
        let c = store.alloc(0, 4096, 1, ReqQueue::Active, None);
        assert!(store.move_to(c, ReqQueue::Done, ReqQueue::Net).is_err());
        // still where it was
        assert_eq!(store.get(c).unwrap().queue(), ReqQueue::Active);
    }

    #[test]
    fn stale_cookie_rejected() {
        let mut store = RequestStore::new();
        let c = store.alloc(0, 4096, 1, ReqQueue::Active, None);
        store.release(c).unwrap();
        assert!(store.get(c).is_none());

        // slot is recycled under a new generation
        let c2 = store.alloc(8, 4096, 2, ReqQueue::Sync, None);
        assert!(store.get(c).is_none());
        assert_eq!(store.get(c2).unwrap().sector, 8);
    }

    #[test]
    fn reclaim_only_completed_net_sends() {
        let mut store = RequestStore::new();
        let a = store.alloc(0, 4096, 1, ReqQueue::Net, None);
        let b = store.alloc(8, 4096, 2, ReqQueue::Net, None);
        store.get_mut(a).unwrap().flags |= EeFlags::NET_DONE;
        assert_eq!(store.reclaim_net(), 1);
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_some());
    }

    #[test]
    fn dagtag_lookup() {
        let mut store = RequestStore::new();
        let a = store.alloc(0, 4096, 1, ReqQueue::Active, None);
        let b = store.alloc(8, 4096, 2, ReqQueue::Active, None);
        store.get_mut(a).unwrap().dagtag = 8;
        store.get_mut(b).unwrap().dagtag = 16;
        assert_eq!(store.find_by_dagtag(12), Some(a));
        assert_eq!(store.find_by_dagtag(16), Some(b));
        assert_eq!(store.find_by_dagtag(4), None);
    }
}
