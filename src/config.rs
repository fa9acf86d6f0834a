//! Configuration for resources, connections and resync.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Replication wire protocol. Decides the ack class of a peer write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WireProtocol {
    /// Asynchronous: no data-channel ack expected by the peer.
    A,
    /// Memory-synchronous: RecvAck as soon as the payload is in memory.
    B,
    /// Synchronous: WriteAck only after the write hit stable storage.
    #[default]
    C,
}

/// Automatic split-brain recovery policy, per primary count at detection
/// time (0, 1 or 2 primaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum AfterSbPolicy {
    #[default]
    Disconnect = 0,
    DiscardYounger = 1,
    DiscardOlder = 2,
    DiscardZeroChanges = 3,
    DiscardLeastChanges = 4,
    DiscardLocal = 5,
    DiscardRemote = 6,
    Consensus = 7,
    Violently = 8,
    CallHelper = 9,
    DiscardSecondary = 10,
}

impl AfterSbPolicy {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        use AfterSbPolicy::*;
        Some(match v {
            0 => Disconnect,
            1 => DiscardYounger,
            2 => DiscardOlder,
            3 => DiscardZeroChanges,
            4 => DiscardLeastChanges,
            5 => DiscardLocal,
            6 => DiscardRemote,
            7 => Consensus,
            8 => Violently,
            9 => CallHelper,
            10 => DiscardSecondary,
            _ => return None,
        })
    }
}

/// Per-connection network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Local bind address; connections with equal bind share a listener.
    pub bind_addr: SocketAddr,
    /// Peer address, both for outbound connect and accept dispatch.
    pub peer_addr: SocketAddr,
    pub protocol: WireProtocol,
    /// Inbound payload buffering limit, in 4KiB pages per device.
    pub max_buffers: usize,
    /// Ping round trip allowance, tenths of a second.
    pub ping_timeo: u32,
    /// Idle interval before a ping is sent, seconds.
    pub ping_int: u64,
    /// Connect retry pacing, seconds.
    pub connect_int: u64,
    /// Both sides may carry writes concurrently; enables conflict
    /// resolution and the peer-seq wait.
    pub two_primaries: bool,
    /// Shared secret for the challenge-response; None disables auth.
    pub cram_hmac_secret: Option<String>,
    /// Digest over every data payload; None disables integrity checking.
    pub integrity_alg: Option<String>,
    pub after_sb_0p: AfterSbPolicy,
    pub after_sb_1p: AfterSbPolicy,
    pub after_sb_2p: AfterSbPolicy,
}

impl NetConfig {
    pub fn new(bind_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            peer_addr,
            protocol: WireProtocol::C,
            max_buffers: 2048,
            ping_timeo: 5,
            ping_int: 10,
            connect_int: 10,
            two_primaries: false,
            cram_hmac_secret: None,
            integrity_alg: None,
            after_sb_0p: AfterSbPolicy::Disconnect,
            after_sb_1p: AfterSbPolicy::Disconnect,
            after_sb_2p: AfterSbPolicy::Disconnect,
        }
    }

    pub fn ping_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_timeo as u64 * 100)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_int)
    }
}

/// Resync tuning and digest algorithms, negotiated via SyncParam packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Resync throughput target, KiB/s.
    pub resync_rate: u32,
    /// Digest for checksum-based resync; None requests full-block resync.
    pub csums_alg: Option<String>,
    /// Digest for online verify.
    pub verify_alg: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_rate: 250,
            csums_alg: None,
            verify_alg: None,
        }
    }
}

/// Digest algorithms this build understands. The HMAC set for auth is the
/// same list.
pub const SUPPORTED_ALGS: &[&str] = &["sha3-256", "sha3-512"];

pub fn alg_supported(name: &str) -> bool {
    SUPPORTED_ALGS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = NetConfig::new(
            "127.0.0.1:7788".parse().unwrap(),
            "127.0.0.1:7789".parse().unwrap(),
        );
        assert_eq!(cfg.protocol, WireProtocol::C);
        assert!(!cfg.two_primaries);
        assert_eq!(cfg.ping_timeout().as_millis(), 500);
    }

    #[test]
    fn alg_whitelist() {
        assert!(alg_supported("sha3-256"));
        assert!(!alg_supported("md5"));
    }
}
