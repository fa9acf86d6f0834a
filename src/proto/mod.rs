//! Wire protocol: frame headers, command space, payload codecs.

pub mod command;
pub mod header;
pub mod vli;
pub mod wire;

pub use command::Command;
pub use header::{HeaderVersion, PacketInfo, decode_header, encode_header};

/// Oldest dialect this build can speak.
pub const PROTOCOL_MIN: u32 = 86;
/// Newest dialect this build can speak.
pub const PROTOCOL_MAX: u32 = 117;

/// Checksum-based resync requires this dialect.
pub const PROTOCOL_CSUM_RS: u32 = 89;
/// RLE-compressed bitmap transfer requires this dialect.
pub const PROTOCOL_COMPRESSED_BITMAP: u32 = 90;
/// Frame headers carry a volume number from this dialect on.
pub const PROTOCOL_VOLUMES: u32 = 100;
/// Multi-peer features: two-phase commit, node-id auth suffix, UUIDS110.
pub const PROTOCOL_MULTI_PEER: u32 = 110;

bitflags::bitflags! {
    /// Feature bits exchanged in ConnectionFeatures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureFlags: u32 {
        /// Peer accepts Trim (discard) requests.
        const TRIM = 1;
    }
}

/// Upper bound on any frame payload; malformed lengths above this are
/// rejected before allocation.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024 + 4096;
