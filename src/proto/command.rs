//! Command code space, shared by the data and meta sockets.

/// Every frame command this engine receives or emits.
///
/// Codes below 0x40 are regular protocol traffic; the 0xfffx block is the
/// pre-handshake channel (socket role bytes, feature exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Data = 0x00,
    DataReply = 0x01,
    RsDataReply = 0x02,
    Barrier = 0x03,
    Bitmap = 0x04,
    UnplugRemote = 0x07,
    DataRequest = 0x08,
    RsDataRequest = 0x09,
    SyncParam = 0x0a,
    Protocol = 0x0b,
    Uuids = 0x0c,
    Sizes = 0x0d,
    State = 0x0e,
    SyncUuid = 0x0f,
    AuthChallenge = 0x10,
    AuthResponse = 0x11,
    StateChgReq = 0x12,
    Ping = 0x13,
    PingAck = 0x14,
    RecvAck = 0x15,
    WriteAck = 0x16,
    RsWriteAck = 0x17,
    Superseded = 0x18,
    NegAck = 0x19,
    NegDReply = 0x1a,
    NegRsDReply = 0x1b,
    BarrierAck = 0x1c,
    StateChgReply = 0x1d,
    OvRequest = 0x1e,
    OvReply = 0x1f,
    OvResult = 0x20,
    CsumRsRequest = 0x21,
    RsIsInSync = 0x22,
    SyncParam89 = 0x23,
    CompressedBitmap = 0x24,
    DelayProbe = 0x27,
    OutOfSync = 0x28,
    RsCancel = 0x29,
    ConnStChgReq = 0x2a,
    ConnStChgReply = 0x2b,
    RetryWrite = 0x2c,
    ProtocolUpdate = 0x2d,
    TwopcPrepare = 0x2e,
    TwopcYes = 0x2f,
    TwopcNo = 0x30,
    TwopcRetry = 0x31,
    TwopcCommit = 0x32,
    TwopcAbort = 0x33,
    Dagtag = 0x34,
    PeerAck = 0x35,
    Uuids110 = 0x36,
    PeersInSync = 0x37,
    CurrentUuid = 0x38,
    Trim = 0x39,
    PeerDagtag = 0x3a,
    PriReachable = 0x3b,

    InitialMeta = 0xfff1,
    InitialData = 0xfff2,
    ConnectionFeatures = 0xfffe,
}

impl Command {
    pub fn from_u16(code: u16) -> Option<Command> {
        use Command::*;
        Some(match code {
            0x00 => Data,
            0x01 => DataReply,
            0x02 => RsDataReply,
            0x03 => Barrier,
            0x04 => Bitmap,
            0x07 => UnplugRemote,
            0x08 => DataRequest,
            0x09 => RsDataRequest,
            0x0a => SyncParam,
            0x0b => Protocol,
            0x0c => Uuids,
            0x0d => Sizes,
            0x0e => State,
            0x0f => SyncUuid,
            0x10 => AuthChallenge,
            0x11 => AuthResponse,
            0x12 => StateChgReq,
            0x13 => Ping,
            0x14 => PingAck,
            0x15 => RecvAck,
            0x16 => WriteAck,
            0x17 => RsWriteAck,
            0x18 => Superseded,
            0x19 => NegAck,
            0x1a => NegDReply,
            0x1b => NegRsDReply,
            0x1c => BarrierAck,
            0x1d => StateChgReply,
            0x1e => OvRequest,
            0x1f => OvReply,
            0x20 => OvResult,
            0x21 => CsumRsRequest,
            0x22 => RsIsInSync,
            0x23 => SyncParam89,
            0x24 => CompressedBitmap,
            0x27 => DelayProbe,
            0x28 => OutOfSync,
            0x29 => RsCancel,
            0x2a => ConnStChgReq,
            0x2b => ConnStChgReply,
            0x2c => RetryWrite,
            0x2d => ProtocolUpdate,
            0x2e => TwopcPrepare,
            0x2f => TwopcYes,
            0x30 => TwopcNo,
            0x31 => TwopcRetry,
            0x32 => TwopcCommit,
            0x33 => TwopcAbort,
            0x34 => Dagtag,
            0x35 => PeerAck,
            0x36 => Uuids110,
            0x37 => PeersInSync,
            0x38 => CurrentUuid,
            0x39 => Trim,
            0x3a => PeerDagtag,
            0x3b => PriReachable,
            0xfff1 => InitialMeta,
            0xfff2 => InitialData,
            0xfffe => ConnectionFeatures,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        use Command::*;
        match self {
            Data => "Data",
            DataReply => "DataReply",
            RsDataReply => "RSDataReply",
            Barrier => "Barrier",
            Bitmap => "Bitmap",
            UnplugRemote => "UnplugRemote",
            DataRequest => "DataRequest",
            RsDataRequest => "RSDataRequest",
            SyncParam => "SyncParam",
            Protocol => "Protocol",
            Uuids => "Uuids",
            Sizes => "Sizes",
            State => "State",
            SyncUuid => "SyncUuid",
            AuthChallenge => "AuthChallenge",
            AuthResponse => "AuthResponse",
            StateChgReq => "StateChgReq",
            Ping => "Ping",
            PingAck => "PingAck",
            RecvAck => "RecvAck",
            WriteAck => "WriteAck",
            RsWriteAck => "RSWriteAck",
            Superseded => "Superseded",
            NegAck => "NegAck",
            NegDReply => "NegDReply",
            NegRsDReply => "NegRSDReply",
            BarrierAck => "BarrierAck",
            StateChgReply => "StateChgReply",
            OvRequest => "OVRequest",
            OvReply => "OVReply",
            OvResult => "OVResult",
            CsumRsRequest => "CsumRSRequest",
            RsIsInSync => "RSIsInSync",
            SyncParam89 => "SyncParam89",
            CompressedBitmap => "CompressedBitmap",
            DelayProbe => "DelayProbe",
            OutOfSync => "OutOfSync",
            RsCancel => "RSCancel",
            ConnStChgReq => "ConnStChgReq",
            ConnStChgReply => "ConnStChgReply",
            RetryWrite => "RetryWrite",
            ProtocolUpdate => "ProtocolUpdate",
            TwopcPrepare => "TwopcPrepare",
            TwopcYes => "TwopcYes",
            TwopcNo => "TwopcNo",
            TwopcRetry => "TwopcRetry",
            TwopcCommit => "TwopcCommit",
            TwopcAbort => "TwopcAbort",
            Dagtag => "Dagtag",
            PeerAck => "PeerAck",
            Uuids110 => "Uuids110",
            PeersInSync => "PeersInSync",
            CurrentUuid => "CurrentUuid",
            Trim => "Trim",
            PeerDagtag => "PeerDagtag",
            PriReachable => "PriReachable",
            InitialMeta => "InitialMeta",
            InitialData => "InitialData",
            ConnectionFeatures => "ConnectionFeatures",
        }
    }

    /// Commands the acknowledgement reader handles on the meta socket.
    pub fn is_meta(self) -> bool {
        use Command::*;
        matches!(
            self,
            Ping | PingAck
                | RecvAck
                | WriteAck
                | RsWriteAck
                | Superseded
                | NegAck
                | NegDReply
                | NegRsDReply
                | BarrierAck
                | StateChgReply
                | ConnStChgReply
                | OvResult
                | RsIsInSync
                | RsCancel
                | RetryWrite
                | PeerAck
                | PeersInSync
                | TwopcYes
                | TwopcNo
                | TwopcRetry
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_codes() {
        for code in 0u16..0x40 {
            if let Some(cmd) = Command::from_u16(code) {
                assert_eq!(cmd.as_u16(), code);
            }
        }
        assert_eq!(
            Command::from_u16(0xfffe),
            Some(Command::ConnectionFeatures)
        );
        assert_eq!(Command::from_u16(0x3c), None);
    }

    #[test]
    fn meta_channel_split() {
        assert!(Command::WriteAck.is_meta());
        assert!(Command::TwopcYes.is_meta());
        assert!(!Command::Data.is_meta());
        assert!(!Command::TwopcPrepare.is_meta());
    }
}
