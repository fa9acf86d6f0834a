//! Payload codecs. All multi-byte fields big-endian.

use crate::error::ReplError;
use crate::types::{MAX_NODES, Sector};
use byteorder::{BigEndian, ByteOrder};

/// Fixed width of algorithm-name fields on the wire, zero padded.
pub const ALG_NAME_LEN: usize = 64;

/// Auth challenge length, 64 random bytes.
pub const CHALLENGE_LEN: usize = 64;

bitflags::bitflags! {
    /// Per-write flags carried in Data/Trim headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DpFlags: u32 {
        const HARDBARRIER      = 0x0001;
        const RW_SYNC          = 0x0002;
        const MAY_SET_IN_SYNC  = 0x0004;
        const UNPLUG           = 0x0008;
        const FUA              = 0x0010;
        const FLUSH            = 0x0020;
        const DISCARD          = 0x0040;
        const SEND_RECEIVE_ACK = 0x0080;
        const SEND_WRITE_ACK   = 0x0100;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReplError> {
        if self.pos + n > self.buf.len() {
            return Err(ReplError::malformed("short payload"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, ReplError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn i32(&mut self) -> Result<i32, ReplError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, ReplError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn alg_name(&mut self) -> Result<Option<String>, ReplError> {
        let raw = self.take(ALG_NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(ALG_NAME_LEN);
        if end == 0 {
            return Ok(None);
        }
        let s = std::str::from_utf8(&raw[..end])
            .map_err(|_| ReplError::malformed("algorithm name not utf-8"))?;
        Ok(Some(s.to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn alg_name(&mut self, name: Option<&str>) -> &mut Self {
        let mut field = [0u8; ALG_NAME_LEN];
        if let Some(name) = name {
            let bytes = name.as_bytes();
            let n = bytes.len().min(ALG_NAME_LEN - 1);
            field[..n].copy_from_slice(&bytes[..n]);
        }
        self.buf.extend_from_slice(&field);
        self
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// First packet on each socket of a fresh pairing, before auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionFeatures {
    pub protocol_min: u32,
    pub protocol_max: u32,
    pub sender_node_id: u32,
    pub feature_flags: u32,
}

impl ConnectionFeatures {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.protocol_min)
            .u32(self.protocol_max)
            .u32(self.sender_node_id)
            .u32(self.feature_flags);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            protocol_min: r.u32()?,
            protocol_max: r.u32()?,
            sender_node_id: r.u32()?,
            feature_flags: r.u32()?,
        })
    }
}

/// Replication settings announced over P_PROTOCOL; both sides must agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPayload {
    pub protocol: u32,
    pub after_sb_0p: u32,
    pub after_sb_1p: u32,
    pub after_sb_2p: u32,
    pub two_primaries: u32,
    pub integrity_alg: Option<String>,
}

impl ProtocolPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.protocol)
            .u32(self.after_sb_0p)
            .u32(self.after_sb_1p)
            .u32(self.after_sb_2p)
            .u32(self.two_primaries)
            .alg_name(self.integrity_alg.as_deref());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            protocol: r.u32()?,
            after_sb_0p: r.u32()?,
            after_sb_1p: r.u32()?,
            after_sb_2p: r.u32()?,
            two_primaries: r.u32()?,
            integrity_alg: r.alg_name()?,
        })
    }
}

/// Resync tuning. The 89 dialect added the algorithm names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncParamPayload {
    pub resync_rate: u32,
    pub csums_alg: Option<String>,
    pub verify_alg: Option<String>,
}

impl SyncParamPayload {
    pub fn encode(&self, with_algs: bool) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.resync_rate);
        if with_algs {
            w.alg_name(self.verify_alg.as_deref());
            w.alg_name(self.csums_alg.as_deref());
        }
        w.finish()
    }

    pub fn decode(buf: &[u8], with_algs: bool) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        let resync_rate = r.u32()?;
        let (verify_alg, csums_alg) = if with_algs {
            (r.alg_name()?, r.alg_name()?)
        } else {
            (None, None)
        };
        Ok(Self {
            resync_rate,
            csums_alg,
            verify_alg,
        })
    }
}

/// Header of Data / DataReply / RSDataReply, followed by the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub sector: Sector,
    pub block_id: u64,
    pub seq_num: u32,
    pub dp_flags: DpFlags,
}

pub const DATA_HEADER_LEN: usize = 24;

impl DataHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.sector)
            .u64(self.block_id)
            .u32(self.seq_num)
            .u32(self.dp_flags.bits());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            sector: r.u64()?,
            block_id: r.u64()?,
            seq_num: r.u32()?,
            dp_flags: DpFlags::from_bits_truncate(r.u32()?),
        })
    }
}

/// Trim is a Data header plus the discard length in bytes (no payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPayload {
    pub head: DataHeader,
    pub size: u32,
}

impl TrimPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.head.encode();
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let head = DataHeader::decode(buf)?;
        let mut r = Reader::new(&buf[DATA_HEADER_LEN.min(buf.len())..]);
        Ok(Self {
            head,
            size: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPayload {
    pub barrier: u32,
}

impl BarrierPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.barrier).u32(0);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { barrier: r.u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierAckPayload {
    pub barrier: u32,
    pub set_size: u32,
}

impl BarrierAckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.barrier).u32(self.set_size);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            barrier: r.u32()?,
            set_size: r.u32()?,
        })
    }
}

/// Ack family: RecvAck, WriteAck, RSWriteAck, Superseded, RetryWrite,
/// NegAck, NegDReply, NegRSDReply, OVResult, RSIsInSync, RSCancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAckPayload {
    pub sector: Sector,
    pub block_id: u64,
    pub blksize: u32,
    pub seq_num: u32,
}

impl BlockAckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.sector)
            .u64(self.block_id)
            .u32(self.blksize)
            .u32(self.seq_num);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            sector: r.u64()?,
            block_id: r.u64()?,
            blksize: r.u32()?,
            seq_num: r.u32()?,
        })
    }
}

/// DataRequest / RSDataRequest / OVRequest / OVReply / CsumRSRequest.
/// Checksum requests append the digest after the fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequestPayload {
    pub sector: Sector,
    pub block_id: u64,
    pub blksize: u32,
    pub digest: Vec<u8>,
}

impl BlockRequestPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.sector)
            .u64(self.block_id)
            .u32(self.blksize)
            .bytes(&self.digest);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            sector: r.u64()?,
            block_id: r.u64()?,
            blksize: r.u32()?,
            digest: r.rest().to_vec(),
        })
    }
}

bitflags::bitflags! {
    /// Size-exchange flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DdsFlags: u32 {
        const FORCED = 1;
        const NO_RESYNC = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizesPayload {
    /// Backing device size, sectors.
    pub d_size: u64,
    /// User-configured size limit, sectors; 0 means none.
    pub u_size: u64,
    /// Committed (agreed) size, sectors.
    pub c_size: u64,
    pub max_bio_size: u32,
    pub dds_flags: DdsFlags,
}

impl SizesPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.d_size)
            .u64(self.u_size)
            .u64(self.c_size)
            .u32(self.max_bio_size)
            .u32(self.dds_flags.bits());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            d_size: r.u64()?,
            u_size: r.u64()?,
            c_size: r.u64()?,
            max_bio_size: r.u32()?,
            dds_flags: DdsFlags::from_bits_truncate(r.u32()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePayload {
    pub state: u32,
}

impl StatePayload {
    pub fn encode(&self) -> Vec<u8> {
        self.state.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { state: r.u32()? })
    }
}

/// One-phase state change request: mask picks the fields, val the targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChgReqPayload {
    pub mask: u32,
    pub val: u32,
}

impl StateChgReqPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.mask).u32(self.val);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            mask: r.u32()?,
            val: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChgReplyPayload {
    pub retcode: i32,
}

impl StateChgReplyPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.retcode.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { retcode: r.i32()? })
    }
}

/// Two-phase commit request (Prepare / Commit / Abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwopcRequestPayload {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub target_node_id: i32,
    pub nodes_to_reach: u64,
    pub primary_nodes: u64,
    pub mask: u32,
    pub val: u32,
}

impl TwopcRequestPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.tid)
            .u32(self.initiator_node_id)
            .i32(self.target_node_id)
            .u64(self.nodes_to_reach)
            .u64(self.primary_nodes)
            .u32(self.mask)
            .u32(self.val);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            tid: r.u32()?,
            initiator_node_id: r.u32()?,
            target_node_id: r.i32()?,
            nodes_to_reach: r.u64()?,
            primary_nodes: r.u64()?,
            mask: r.u32()?,
            val: r.u32()?,
        })
    }
}

/// Two-phase commit reply (Yes / No / Retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwopcReplyPayload {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
}

impl TwopcReplyPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.tid)
            .u32(self.initiator_node_id)
            .u64(self.reachable_nodes)
            .u64(self.primary_nodes)
            .u64(self.weak_nodes);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            tid: r.u32()?,
            initiator_node_id: r.u32()?,
            reachable_nodes: r.u64()?,
            primary_nodes: r.u64()?,
            weak_nodes: r.u64()?,
        })
    }
}

bitflags::bitflags! {
    /// Flags sent alongside UUID vectors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UuidFlags: u64 {
        /// Sender considers its data inconsistent.
        const INCONSISTENT  = 0x01;
        /// Sender crashed while primary.
        const CRASHED_PRIMARY = 0x02;
        /// Sender is currently primary.
        const PRIMARY       = 0x04;
        /// Sender wants a full resync regardless of comparison.
        const FULL_SYNC     = 0x08;
        /// Sender can not reach all primaries.
        const WEAK          = 0x10;
    }
}

/// Legacy UUID packet (dialect < 110): one bitmap slot only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidsPayload {
    pub current: u64,
    pub bitmap: u64,
    pub history: [u64; 2],
    pub flags: UuidFlags,
}

impl UuidsPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.current)
            .u64(self.bitmap)
            .u64(self.history[0])
            .u64(self.history[1])
            .u64(self.flags.bits());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            current: r.u64()?,
            bitmap: r.u64()?,
            history: [r.u64()?, r.u64()?],
            flags: UuidFlags::from_bits_truncate(r.u64()?),
        })
    }
}

/// UUID packet for the multi-peer dialect: one bitmap UUID per node slot
/// named in `node_mask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uuids110Payload {
    pub current: u64,
    /// Sender's out-of-sync block count toward the receiver.
    pub dirty_bits: u64,
    pub flags: UuidFlags,
    pub node_mask: u64,
    pub bitmap_uuids: Vec<u64>,
    pub history: [u64; 2],
}

impl Uuids110Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.current)
            .u64(self.dirty_bits)
            .u64(self.flags.bits())
            .u64(self.node_mask);
        for uuid in &self.bitmap_uuids {
            w.u64(*uuid);
        }
        w.u64(self.history[0]).u64(self.history[1]);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        let current = r.u64()?;
        let dirty_bits = r.u64()?;
        let flags = UuidFlags::from_bits_truncate(r.u64()?);
        let node_mask = r.u64()?;
        let slots = node_mask.count_ones() as usize;
        if slots > MAX_NODES {
            return Err(ReplError::malformed("uuid node mask too wide"));
        }
        let mut bitmap_uuids = Vec::with_capacity(slots);
        for _ in 0..slots {
            bitmap_uuids.push(r.u64()?);
        }
        Ok(Self {
            current,
            dirty_bits,
            flags,
            node_mask,
            bitmap_uuids,
            history: [r.u64()?, r.u64()?],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncUuidPayload {
    pub uuid: u64,
}

impl SyncUuidPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.uuid.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { uuid: r.u64()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSyncPayload {
    pub sector: Sector,
    pub blksize: u32,
}

impl OutOfSyncPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.sector).u32(self.blksize);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            sector: r.u64()?,
            blksize: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayProbePayload {
    pub seqn: u32,
}

impl DelayProbePayload {
    pub fn encode(&self) -> Vec<u8> {
        self.seqn.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { seqn: r.u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagtagPayload {
    pub dagtag: u64,
}

impl DagtagPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.dagtag.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self { dagtag: r.u64()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDagtagPayload {
    pub dagtag: u64,
    pub node_id: u32,
}

impl PeerDagtagPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.dagtag).u32(self.node_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            dagtag: r.u64()?,
            node_id: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUuidPayload {
    pub uuid: u64,
    pub weak_nodes: u64,
}

impl CurrentUuidPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.uuid).u64(self.weak_nodes);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            uuid: r.u64()?,
            weak_nodes: r.u64()?,
        })
    }
}

/// PeerAck: which nodes acked the write stream up to `dagtag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAckPayload {
    pub mask: u64,
    pub dagtag: u64,
}

impl PeerAckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.mask).u64(self.dagtag);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            mask: r.u64()?,
            dagtag: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeersInSyncPayload {
    pub sector: Sector,
    pub size: u32,
    pub mask: u64,
}

impl PeersInSyncPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u64(self.sector).u32(self.size).u64(self.mask);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            sector: r.u64()?,
            size: r.u32()?,
            mask: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriReachablePayload {
    pub primary_nodes: u64,
}

impl PriReachablePayload {
    pub fn encode(&self) -> Vec<u8> {
        self.primary_nodes.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ReplError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            primary_nodes: r.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_roundtrip() {
        let h = DataHeader {
            sector: 0x1234_5678_9abc,
            block_id: 42,
            seq_num: 7,
            dp_flags: DpFlags::FLUSH | DpFlags::FUA,
        };
        assert_eq!(DataHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn protocol_payload_algorithm_padding() {
        let p = ProtocolPayload {
            protocol: 3,
            after_sb_0p: 0,
            after_sb_1p: 0,
            after_sb_2p: 0,
            two_primaries: 1,
            integrity_alg: Some("sha3-256".into()),
        };
        let buf = p.encode();
        assert_eq!(buf.len(), 20 + ALG_NAME_LEN);
        assert_eq!(ProtocolPayload::decode(&buf).unwrap(), p);

        let none = ProtocolPayload {
            integrity_alg: None,
            ..p
        };
        assert_eq!(ProtocolPayload::decode(&none.encode()).unwrap(), none);
    }

    #[test]
    fn uuids110_slot_count_follows_mask() {
        let p = Uuids110Payload {
            current: 0xAAAA,
            dirty_bits: 12,
            flags: UuidFlags::CRASHED_PRIMARY,
            node_mask: 0b101,
            bitmap_uuids: vec![0x1111, 0x2222],
            history: [0x10, 0x20],
        };
        let decoded = Uuids110Payload::decode(&p.encode()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn short_payload_is_malformed() {
        assert!(BlockAckPayload::decode(&[0u8; 10]).is_err());
        assert!(TwopcRequestPayload::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn csum_request_carries_digest() {
        let p = BlockRequestPayload {
            sector: 8,
            block_id: 1,
            blksize: 4096,
            digest: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let decoded = BlockRequestPayload::decode(&p.encode()).unwrap();
        assert_eq!(decoded.digest, p.digest);
    }
}
