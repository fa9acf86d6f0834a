//! Per-connection runtime.
//!
//! Three tasks per peer: the receiver on the data socket (this module's
//! main loop), the acknowledgement reader on the meta socket, and a worker
//! draining block-layer completions and outbound frames. Handlers return
//! typed errors; only the lifecycle loop here transitions connection state
//! and tears down, so teardown stays centralized and idempotent.

use super::ack;
use super::auth::authenticate;
use super::framed::{FrameReader, FrameWriter};
use super::sockpair::{self, ListenerSet, SocketPair};
use crate::backing::BlockCompletion;
use crate::config::{NetConfig, WireProtocol, alg_supported};
use crate::error::ReplError;
use crate::proto::header::HeaderVersion;
use crate::proto::wire::{
    ConnectionFeatures, CurrentUuidPayload, DagtagPayload, DelayProbePayload, OutOfSyncPayload,
    PeerDagtagPayload, ProtocolPayload, SizesPayload, StateChgReplyPayload, StateChgReqPayload,
    StatePayload, SyncParamPayload, SyncUuidPayload, TwopcReplyPayload, TwopcRequestPayload,
    UuidFlags, Uuids110Payload, UuidsPayload,
};
use crate::proto::{
    Command, FeatureFlags, PROTOCOL_CSUM_RS, PROTOCOL_MAX, PROTOCOL_MIN, PROTOCOL_MULTI_PEER,
    PacketInfo,
};
use crate::repl::epoch::{EpochAction, EpochList, WriteOrdering};
use crate::repl::resource::{Device, PeerDevice, Resource, TwopcForward};
use crate::repl::state::{
    ConnState, ReplState, Role, SS_IN_TRANSIENT_STATE, SS_SUCCESS, UnifiedState,
    evaluate_state_change,
};
use crate::repl::twopc::TwopcVerdict;
use crate::repl::uuids::{SplitBrainContext, SyncDecision, UuidView, sync_handshake};
use crate::repl::{resync, writes};
use crate::types::{ConnectionId, DeviceId, NodeId, UUID_PRIMARY_BIT, now};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

const TWOPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Which socket an outbound frame goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Data,
    Meta,
}

#[derive(Debug)]
pub struct Outbound {
    pub channel: Channel,
    pub cmd: Command,
    pub volume: i16,
    pub payload: Vec<u8>,
}

pub struct Connection {
    pub id: ConnectionId,
    pub peer_node_id: NodeId,
    pub cfg: NetConfig,
    pub resource: Arc<Resource>,
    pub peer_devices: Vec<Arc<PeerDevice>>,
    agreed_version: AtomicU32,
    agreed_features: AtomicU32,
    resolve_conflicts: AtomicBool,
    state: Mutex<ConnState>,
    pub state_notify: Notify,
    pub epochs: Mutex<EpochList>,
    pub last_dagtag: AtomicU64,
    outbound_tx: Mutex<mpsc::UnboundedSender<Outbound>>,
    completions_tx: Mutex<mpsc::UnboundedSender<BlockCompletion>>,
    /// Unix seconds of the last frame on either socket.
    pub last_received: AtomicU64,
    pub ping_outstanding: AtomicBool,
    /// Unix millis after which an unanswered ping is fatal.
    pub ping_deadline: AtomicU64,
}

impl Connection {
    pub fn new(
        resource: Arc<Resource>,
        id: ConnectionId,
        peer_node_id: NodeId,
        cfg: NetConfig,
    ) -> Arc<Self> {
        // placeholder channels; each connect attempt installs fresh ones
        let (outbound_tx, _) = mpsc::unbounded_channel();
        let (completions_tx, _) = mpsc::unbounded_channel();
        let peer_devices = resource
            .devices
            .iter()
            .map(|d| PeerDevice::new(d.id, peer_node_id))
            .collect();
        let caps = resource.backend.capabilities();
        let initial_wo = if caps.contains(crate::backing::BackendCaps::FLUSH) {
            WriteOrdering::BdevFlush
        } else {
            WriteOrdering::DrainIo
        };
        Arc::new(Self {
            id,
            peer_node_id,
            cfg,
            resource,
            peer_devices,
            agreed_version: AtomicU32::new(PROTOCOL_MIN),
            agreed_features: AtomicU32::new(0),
            resolve_conflicts: AtomicBool::new(false),
            state: Mutex::new(ConnState::StandAlone),
            state_notify: Notify::new(),
            epochs: Mutex::new(EpochList::new(initial_wo)),
            last_dagtag: AtomicU64::new(0),
            outbound_tx: Mutex::new(outbound_tx),
            completions_tx: Mutex::new(completions_tx),
            last_received: AtomicU64::new(now()),
            ping_outstanding: AtomicBool::new(false),
            ping_deadline: AtomicU64::new(0),
        })
    }

    pub fn protocol_version(&self) -> u32 {
        self.agreed_version.load(Ordering::Relaxed)
    }

    pub fn features(&self) -> FeatureFlags {
        FeatureFlags::from_bits_truncate(self.agreed_features.load(Ordering::Relaxed))
    }

    pub fn resolve_conflicts(&self) -> bool {
        self.resolve_conflicts.load(Ordering::Relaxed)
    }

    pub fn conn_state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_conn_state(&self, new: ConnState) {
        let mut state = self.state.lock().unwrap();
        if *state == new {
            return;
        }
        info!(id = self.id.0, from = ?*state, to = ?new, "connection state");
        *state = new;
        drop(state);
        self.state_notify.notify_waiters();
    }

    /// Fail the connection from any task; the lifecycle loop picks the
    /// transition up.
    pub fn fail(&self, state: ConnState) {
        self.set_conn_state(state);
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.conn_state(),
            ConnState::Connecting | ConnState::Connected
        )
    }

    pub fn queue(&self, channel: Channel, cmd: Command, volume: i16, payload: Vec<u8>) {
        let tx = self.outbound_tx.lock().unwrap().clone();
        let _ = tx.send(Outbound {
            channel,
            cmd,
            volume,
            payload,
        });
    }

    pub fn completions_tx(&self) -> mpsc::UnboundedSender<BlockCompletion> {
        self.completions_tx.lock().unwrap().clone()
    }

    pub fn device(&self, volume: i16) -> Result<&Arc<Device>, ReplError> {
        self.resource
            .device_for_volume(volume)
            .ok_or_else(|| ReplError::malformed(format!("unknown volume {volume}")))
    }

    pub fn peer_device(&self, volume: i16) -> Result<&Arc<PeerDevice>, ReplError> {
        let idx = if volume < 0 { 0 } else { volume as usize };
        self.peer_devices
            .get(idx)
            .ok_or_else(|| ReplError::malformed(format!("unknown volume {volume}")))
    }

    /// Translate epoch actions into frames and flushes.
    pub fn perform_epoch_actions(&self, actions: Vec<EpochAction>) {
        for action in actions {
            match action {
                EpochAction::SendBarrierAck { barrier, set_size } => {
                    let payload = crate::proto::wire::BarrierAckPayload { barrier, set_size }
                        .encode();
                    self.queue(Channel::Meta, Command::BarrierAck, 0, payload);
                }
                EpochAction::IssueFlush { epoch } => {
                    // one flush covers the shared backing store
                    let tx = self.completions_tx();
                    self.resource.backend.submit(
                        DeviceId(0),
                        crate::backing::BlockOp::Flush { epoch },
                        &tx,
                    );
                }
            }
        }
    }
}

impl TwopcForward for Connection {
    fn forward_twopc(&self, cmd: Command, payload: Vec<u8>) {
        self.queue(Channel::Data, cmd, 0, payload);
    }

    fn peer_node(&self) -> NodeId {
        self.peer_node_id
    }
}

/// Connection restart loop: Connecting, Connected, failure, retry, until
/// an admin disconnect or a standalone-grade error.
pub async fn run_connection(conn: Arc<Connection>, listeners: Arc<ListenerSet>) {
    loop {
        conn.set_conn_state(ConnState::Connecting);
        let mut queue = match listeners
            .register(conn.cfg.bind_addr, conn.cfg.peer_addr.ip())
            .await
        {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "listener registration failed");
                conn.set_conn_state(ConnState::StandAlone);
                return;
            }
        };

        let pair = match sockpair::establish_pair(&mut queue, &conn.cfg).await {
            Ok(p) => p,
            Err(e) if e.is_transient() => {
                drop(queue);
                debug!(error = %e, "pairing failed, retrying");
                tokio::time::sleep(Duration::from_secs(conn.cfg.connect_int)).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "pairing failed fatally");
                conn.set_conn_state(ConnState::StandAlone);
                return;
            }
        };

        let result = handshake_and_serve(&conn, pair).await;
        teardown(&conn);
        drop(queue);

        match result {
            Ok(()) => {
                conn.set_conn_state(ConnState::StandAlone);
                return;
            }
            Err(e) if e.is_standalone() => {
                warn!(error = %e, "going standalone");
                conn.set_conn_state(ConnState::StandAlone);
                return;
            }
            Err(e) => {
                let state = if e.is_transient() {
                    ConnState::Unconnected
                } else {
                    ConnState::NetworkFailure
                };
                warn!(error = %e, ?state, "connection lost, restarting");
                conn.set_conn_state(state);
                tokio::time::sleep(Duration::from_secs(conn.cfg.connect_int)).await;
            }
        }
    }
}

async fn exchange_features(
    conn: &Arc<Connection>,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<(), ReplError> {
    let ours = ConnectionFeatures {
        protocol_min: PROTOCOL_MIN,
        protocol_max: PROTOCOL_MAX,
        sender_node_id: conn.resource.node_id,
        feature_flags: FeatureFlags::TRIM.bits(),
    };
    writer
        .send(Command::ConnectionFeatures, -1, &ours.encode())
        .await?;

    let (info, payload) = reader.recv().await?;
    if info.command != Command::ConnectionFeatures {
        return Err(ReplError::ProtocolIncompatible(format!(
            "expected connection features, got {}",
            info.command
        )));
    }
    let theirs = ConnectionFeatures::decode(&payload)?;
    if theirs.protocol_max < PROTOCOL_MIN || theirs.protocol_min > PROTOCOL_MAX {
        return Err(ReplError::ProtocolIncompatible(format!(
            "incompatible protocols: peer speaks {}..{}",
            theirs.protocol_min, theirs.protocol_max
        )));
    }
    if theirs.sender_node_id != conn.peer_node_id {
        return Err(ReplError::ProtocolIncompatible(format!(
            "peer announced node id {} but {} was configured",
            theirs.sender_node_id, conn.peer_node_id
        )));
    }
    let agreed = PROTOCOL_MAX.min(theirs.protocol_max);
    let features = FeatureFlags::TRIM.bits() & theirs.feature_flags;
    conn.agreed_version.store(agreed, Ordering::Relaxed);
    conn.agreed_features.store(features, Ordering::Relaxed);
    info!(version = agreed, features, "connection features agreed");
    Ok(())
}

async fn exchange_protocol(
    conn: &Arc<Connection>,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<(), ReplError> {
    let cfg = &conn.cfg;
    let ours = ProtocolPayload {
        protocol: match cfg.protocol {
            WireProtocol::A => 1,
            WireProtocol::B => 2,
            WireProtocol::C => 3,
        },
        after_sb_0p: cfg.after_sb_0p.as_u32(),
        after_sb_1p: cfg.after_sb_1p.as_u32(),
        after_sb_2p: cfg.after_sb_2p.as_u32(),
        two_primaries: cfg.two_primaries as u32,
        integrity_alg: cfg.integrity_alg.clone(),
    };
    writer.send(Command::Protocol, -1, &ours.encode()).await?;

    let (info, payload) = reader.recv().await?;
    if info.command != Command::Protocol {
        return Err(ReplError::ProtocolIncompatible(format!(
            "expected protocol settings, got {}",
            info.command
        )));
    }
    let theirs = ProtocolPayload::decode(&payload)?;
    if theirs.protocol != ours.protocol {
        return Err(ReplError::ProtocolIncompatible("protocol mismatch".into()));
    }
    if theirs.two_primaries != ours.two_primaries {
        return Err(ReplError::ProtocolIncompatible(
            "allow-two-primaries mismatch".into(),
        ));
    }
    if theirs.after_sb_0p != ours.after_sb_0p
        || theirs.after_sb_1p != ours.after_sb_1p
        || theirs.after_sb_2p != ours.after_sb_2p
    {
        return Err(ReplError::ProtocolIncompatible(
            "after-sb policy mismatch".into(),
        ));
    }
    match (&theirs.integrity_alg, &ours.integrity_alg) {
        (None, None) => {}
        (Some(t), Some(o)) if t == o && alg_supported(t) => {}
        _ => {
            return Err(ReplError::ProtocolIncompatible(
                "data-integrity-alg mismatch".into(),
            ));
        }
    }
    Ok(())
}

/// Push our parameters so the peer can run its side of the handshake.
async fn send_startup_packets(
    conn: &Arc<Connection>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<(), ReplError> {
    let version = conn.protocol_version();
    for device in &conn.resource.devices {
        let volume = device.id.0 as i16;
        let pd = conn.peer_device(volume)?;
        let sync_cfg = pd.sync_cfg.lock().unwrap().clone();
        let sp = SyncParamPayload {
            resync_rate: sync_cfg.resync_rate,
            csums_alg: sync_cfg.csums_alg.clone(),
            verify_alg: sync_cfg.verify_alg.clone(),
        };
        if version >= PROTOCOL_CSUM_RS {
            writer
                .send(Command::SyncParam89, volume, &sp.encode(true))
                .await?;
        } else {
            writer
                .send(Command::SyncParam, volume, &sp.encode(false))
                .await?;
        }

        let (sizes, uuid_cmd, uuid_frame, state_word) = {
            let core = device.core.lock().unwrap();
            let sizes = SizesPayload {
                d_size: conn.resource.backend.size_sectors(device.id),
                u_size: 0,
                c_size: core.size_sectors,
                max_bio_size: 1 << 20,
                dds_flags: Default::default(),
            };
            let uuids = &core.uuids;
            let mut flags = UuidFlags::empty();
            if uuids.crashed_primary {
                flags |= UuidFlags::CRASHED_PRIMARY;
            }
            let (uuid_cmd, uuid_frame) = if version >= PROTOCOL_MULTI_PEER {
                let mut entries = uuids.bitmap.clone();
                entries.sort_by_key(|(node, _)| *node);
                let mut node_mask = 0u64;
                let mut bitmap_uuids = Vec::with_capacity(entries.len());
                for (node, uuid) in entries {
                    node_mask |= 1 << node;
                    bitmap_uuids.push(uuid);
                }
                (
                    Command::Uuids110,
                    Uuids110Payload {
                        current: uuids.current,
                        dirty_bits: core.bitmap.count_set(),
                        flags,
                        node_mask,
                        bitmap_uuids,
                        history: uuids.history,
                    }
                    .encode(),
                )
            } else {
                (
                    Command::Uuids,
                    UuidsPayload {
                        current: uuids.current,
                        bitmap: uuids.bitmap_for(conn.peer_node_id),
                        history: uuids.history,
                        flags,
                    }
                    .encode(),
                )
            };
            (sizes, uuid_cmd, uuid_frame, core.state.pack())
        };
        writer.send(Command::Sizes, volume, &sizes.encode()).await?;
        writer.send(uuid_cmd, volume, &uuid_frame).await?;
        writer
            .send(
                Command::State,
                volume,
                &StatePayload { state: state_word }.encode(),
            )
            .await?;
    }
    Ok(())
}

async fn handshake_and_serve(conn: &Arc<Connection>, pair: SocketPair) -> Result<(), ReplError> {
    let SocketPair {
        data,
        meta,
        meta_inbound,
    } = pair;
    conn.resolve_conflicts.store(meta_inbound, Ordering::Relaxed);

    let (data_read, data_write) = data.into_split();
    let (meta_read, meta_write) = meta.into_split();
    let mut data_r = FrameReader::new(data_read);
    let mut data_w = FrameWriter::new(data_write);
    let mut meta_r = FrameReader::new(meta_read);
    let mut meta_w = FrameWriter::new(meta_write);

    exchange_features(conn, &mut data_r, &mut data_w).await?;
    let header = HeaderVersion::for_protocol(conn.protocol_version());
    data_r.set_version(header);
    data_w.set_version(header);
    meta_r.set_version(header);
    meta_w.set_version(header);

    if let Some(secret) = conn.cfg.cram_hmac_secret.clone() {
        authenticate(
            &mut meta_r,
            &mut meta_w,
            &secret,
            conn.resource.node_id,
            conn.peer_node_id,
            conn.protocol_version(),
        )
        .await?;
    }

    exchange_protocol(conn, &mut data_r, &mut data_w).await?;
    send_startup_packets(conn, &mut data_w).await?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    *conn.outbound_tx.lock().unwrap() = outbound_tx;
    *conn.completions_tx.lock().unwrap() = completions_tx;

    conn.set_conn_state(ConnState::Connected);
    let cloned_conn: Arc<Connection> = Arc::clone(conn);
    let dyn_conn: Arc<dyn TwopcForward + Send + Sync> = cloned_conn;
    conn.resource
        .register_connection(conn.peer_node_id, Arc::downgrade(&dyn_conn));

    let worker = tokio::spawn(worker_loop(
        Arc::clone(conn),
        data_w,
        meta_w,
        outbound_rx,
        completions_rx,
    ));
    let ack = tokio::spawn(ack::ack_reader(Arc::clone(conn), meta_r));
    let ping = tokio::spawn(ack::ping_scheduler(Arc::clone(conn)));

    let result = receive_loop(conn, &mut data_r).await;

    worker.abort();
    ack.abort();
    ping.abort();
    result
}

async fn receive_loop(
    conn: &Arc<Connection>,
    data_r: &mut FrameReader<OwnedReadHalf>,
) -> Result<(), ReplError> {
    loop {
        if !conn.is_running() {
            return Ok(());
        }
        let (info, payload) = tokio::select! {
            frame = data_r.recv() => frame?,
            _ = conn.state_notify.notified() => continue,
        };
        conn.last_received.store(now(), Ordering::Relaxed);
        dispatch(conn, info, payload).await?;
    }
}

async fn dispatch(
    conn: &Arc<Connection>,
    info: PacketInfo,
    payload: Vec<u8>,
) -> Result<(), ReplError> {
    use Command::*;
    match info.command {
        Data => writes::receive_data(conn, info.volume, &payload).await,
        DataReply => {
            // this node never issues remote reads; a reply has nothing to
            // complete
            debug!("data reply without a pending read request");
            Ok(())
        }
        Barrier => writes::receive_barrier(conn, &payload),
        Trim => writes::receive_trim(conn, info.volume, &payload).await,
        UnplugRemote => {
            debug!("remote unplug hint");
            Ok(())
        }
        DataRequest | RsDataRequest | OvRequest | CsumRsRequest => {
            resync::receive_block_request(conn, info.command, info.volume, &payload)
        }
        OvReply => resync::receive_ov_reply(conn, info.volume, &payload),
        RsDataReply => resync::receive_rs_data_reply(conn, info.volume, &payload).await,
        Bitmap => resync::receive_bitmap(conn, info.volume, &payload, false),
        CompressedBitmap => resync::receive_bitmap(conn, info.volume, &payload, true),
        SyncParam | SyncParam89 => receive_sync_param(conn, info.command, info.volume, &payload),
        Sizes => receive_sizes(conn, info.volume, &payload),
        Uuids => receive_uuids_legacy(conn, info.volume, &payload),
        Uuids110 => receive_uuids110(conn, info.volume, &payload),
        State => receive_state(conn, info.volume, &payload),
        SyncUuid => receive_sync_uuid(conn, info.volume, &payload),
        StateChgReq => receive_state_chg(conn, info.volume, &payload),
        ConnStChgReq => receive_conn_state_chg(conn, &payload),
        TwopcPrepare | TwopcCommit | TwopcAbort => receive_twopc(conn, info.command, &payload),
        OutOfSync => receive_out_of_sync(conn, info.volume, &payload),
        Dagtag => {
            let p = DagtagPayload::decode(&payload)?;
            conn.last_dagtag.store(p.dagtag, Ordering::Relaxed);
            Ok(())
        }
        PeerDagtag => {
            let p = PeerDagtagPayload::decode(&payload)?;
            debug!(dagtag = p.dagtag, node = p.node_id, "peer dagtag");
            Ok(())
        }
        CurrentUuid => receive_current_uuid(conn, info.volume, &payload),
        PriReachable => {
            let p = crate::proto::wire::PriReachablePayload::decode(&payload)?;
            debug!(mask = p.primary_nodes, "reachable primaries update");
            Ok(())
        }
        DelayProbe => {
            let p = DelayProbePayload::decode(&payload)?;
            debug!(seqn = p.seqn, "delay probe");
            Ok(())
        }
        ProtocolUpdate => {
            let p = ProtocolPayload::decode(&payload)?;
            debug!(two_primaries = p.two_primaries, "protocol update");
            Ok(())
        }
        other => Err(ReplError::malformed(format!(
            "unexpected {other} on the data socket"
        ))),
    }
}

fn receive_sync_param(
    conn: &Arc<Connection>,
    cmd: Command,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let with_algs = cmd == Command::SyncParam89;
    let p = SyncParamPayload::decode(payload, with_algs)?;
    for alg in [&p.csums_alg, &p.verify_alg].into_iter().flatten() {
        if !alg_supported(alg) {
            return Err(ReplError::ProtocolIncompatible(format!(
                "unknown digest algorithm {alg:?}"
            )));
        }
    }
    let pd = conn.peer_device(volume)?;
    let mut sync_cfg = pd.sync_cfg.lock().unwrap();
    sync_cfg.resync_rate = p.resync_rate;
    sync_cfg.csums_alg = p.csums_alg;
    sync_cfg.verify_alg = p.verify_alg;
    Ok(())
}

fn receive_sizes(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = SizesPayload::decode(payload)?;
    let device = conn.device(volume)?;
    let mut core = device.core.lock().unwrap();
    if p.d_size > 0 && core.size_sectors > 0 && p.d_size < core.size_sectors {
        return Err(ReplError::ProtocolIncompatible(format!(
            "peer disk shrank below the committed size ({} < {})",
            p.d_size, core.size_sectors
        )));
    }
    if core.size_sectors == 0 {
        core.size_sectors = p.d_size;
    }
    debug!(d_size = p.d_size, c_size = p.c_size, "peer sizes received");
    Ok(())
}

fn peer_view_from_110(conn: &Arc<Connection>, p: &Uuids110Payload) -> UuidView {
    let my_node = conn.resource.node_id;
    let mut bitmap = 0;
    let mut bitmap_other = Vec::new();
    let mut idx = 0usize;
    for node in 0..64u32 {
        if p.node_mask & (1 << node) != 0 {
            let uuid = p.bitmap_uuids.get(idx).copied().unwrap_or(0);
            idx += 1;
            if node == my_node {
                bitmap = uuid;
            } else {
                bitmap_other.push((node, uuid));
            }
        }
    }
    UuidView {
        current: p.current,
        bitmap,
        bitmap_other,
        history: p.history,
        crashed_primary: p.flags.contains(UuidFlags::CRASHED_PRIMARY),
    }
}

fn receive_uuids110(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = Uuids110Payload::decode(payload)?;
    let view = peer_view_from_110(conn, &p);
    store_peer_uuids(conn, volume, view, p.dirty_bits)
}

fn receive_uuids_legacy(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = UuidsPayload::decode(payload)?;
    let view = UuidView {
        current: p.current,
        bitmap: p.bitmap,
        bitmap_other: Vec::new(),
        history: p.history,
        crashed_primary: p.flags.contains(UuidFlags::CRASHED_PRIMARY),
    };
    store_peer_uuids(conn, volume, view, 0)
}

fn store_peer_uuids(
    conn: &Arc<Connection>,
    volume: i16,
    view: UuidView,
    peer_dirty: u64,
) -> Result<(), ReplError> {
    let pd = conn.peer_device(volume)?;
    *pd.peer_uuids.lock().unwrap() = Some(view);
    if pd.repl_state() == ReplState::Off {
        run_uuid_handshake(conn, volume, peer_dirty)?;
    }
    Ok(())
}

/// The resync role decision, run once the peer's UUIDs are in.
fn run_uuid_handshake(
    conn: &Arc<Connection>,
    volume: i16,
    peer_dirty: u64,
) -> Result<(), ReplError> {
    let pd = conn.peer_device(volume)?;
    let device = conn.device(volume)?;
    let peer_view = pd
        .peer_uuids
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| ReplError::malformed("handshake without peer uuids"))?;

    let (local_view, ch_self, local_primary) = {
        let core = device.core.lock().unwrap();
        let uuids = &core.uuids;
        let bitmap_other = uuids
            .bitmap
            .iter()
            .filter(|(node, _)| *node != conn.peer_node_id)
            .copied()
            .collect();
        (
            UuidView {
                current: uuids.current,
                bitmap: uuids.bitmap_for(conn.peer_node_id),
                bitmap_other,
                history: uuids.history,
                crashed_primary: uuids.crashed_primary,
            },
            core.bitmap.count_set(),
            core.state.role == Role::Primary,
        )
    };

    let peer_primary = pd.peer_state.lock().unwrap().role == Role::Primary;
    let ctx = SplitBrainContext {
        ch_self,
        ch_peer: peer_dirty,
        self_younger: local_view.bitmap & UUID_PRIMARY_BIT != 0,
        peer_younger: peer_view.bitmap & UUID_PRIMARY_BIT != 0,
        local_primary,
        peer_primary,
        resolve_conflicts: conn.resolve_conflicts(),
    };

    let decision = match sync_handshake(
        &local_view,
        &peer_view,
        conn.protocol_version(),
        (
            conn.cfg.after_sb_0p,
            conn.cfg.after_sb_1p,
            conn.cfg.after_sb_2p,
        ),
        &ctx,
    ) {
        Ok(d) => d,
        Err(ReplError::SplitBrain(policy)) => {
            conn.resource
                .helper
                .call(crate::backing::HelperEvent::SplitBrain, &conn.resource.name);
            return Err(ReplError::SplitBrain(policy));
        }
        Err(e) => return Err(e),
    };

    let apply_slots = |set_bitmap: bool, copy_slot: Option<NodeId>| {
        let mut core = device.core.lock().unwrap();
        if set_bitmap {
            core.bitmap.set_all();
        }
        if let Some(slot) = copy_slot {
            let uuid = core.uuids.bitmap_for(slot);
            core.uuids.set_bitmap_for(conn.peer_node_id, uuid);
            info!(slot, "copied bitmap uuid from another peer slot");
        }
    };

    match decision {
        SyncDecision::NoSync => {
            pd.set_repl_state(ReplState::Established);
        }
        SyncDecision::SyncSource {
            set_bitmap,
            copy_slot,
        } => {
            apply_slots(set_bitmap, copy_slot);
            pd.set_repl_state(ReplState::WFBitmapS);
            resync::send_bitmap(conn, volume)?;
        }
        SyncDecision::SyncTarget {
            set_bitmap,
            copy_slot,
        } => {
            apply_slots(set_bitmap, copy_slot);
            pd.set_repl_state(ReplState::WFBitmapT);
        }
    }
    announce_state(conn, volume);
    Ok(())
}

pub(crate) fn announce_state(conn: &Arc<Connection>, volume: i16) {
    if let (Ok(device), Ok(pd)) = (conn.device(volume), conn.peer_device(volume)) {
        let mut state = device.core.lock().unwrap().state;
        state.repl = pd.repl_state();
        conn.queue(
            Channel::Data,
            Command::State,
            volume.max(0),
            StatePayload {
                state: state.pack(),
            }
            .encode(),
        );
    }
}

fn receive_state(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = StatePayload::decode(payload)?;
    let peer = UnifiedState::unpack(p.state)?;
    let pd = conn.peer_device(volume)?;
    *pd.peer_state.lock().unwrap() = peer;
    debug!(repl = ?peer.repl, disk = ?peer.disk, "peer state");

    // the target announced itself: our bitmap went out, resync starts
    if peer.repl == ReplState::SyncTarget && pd.repl_state() == ReplState::WFBitmapS {
        pd.set_repl_state(ReplState::SyncSource);
        announce_state(conn, volume);
    }
    if peer.repl == ReplState::Ahead && pd.repl_state() == ReplState::Established {
        pd.set_repl_state(ReplState::Behind);
    }
    Ok(())
}

fn receive_sync_uuid(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = SyncUuidPayload::decode(payload)?;
    let pd = conn.peer_device(volume)?;
    let device = conn.device(volume)?;
    if pd.repl_state() != ReplState::WFSyncUuid && !pd.repl_state().is_sync_target() {
        debug!("sync uuid outside target handshake, ignoring");
        return Ok(());
    }
    device.core.lock().unwrap().uuids.new_current(p.uuid);
    pd.set_repl_state(ReplState::SyncTarget);
    resync::fill_resync_requests(conn, volume)?;
    Ok(())
}

fn receive_current_uuid(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = CurrentUuidPayload::decode(payload)?;
    let pd = conn.peer_device(volume)?;
    if let Some(view) = pd.peer_uuids.lock().unwrap().as_mut() {
        view.current = p.uuid;
    }
    debug!(uuid = format_args!("{:#018x}", p.uuid), "peer current uuid");
    Ok(())
}

fn receive_state_chg(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = StateChgReqPayload::decode(payload)?;
    let device = conn.device(volume)?;
    let retcode = {
        let mut core = device.core.lock().unwrap();
        match core.state.apply_mask_val(p.mask, p.val) {
            Ok(requested) => {
                let rv = evaluate_state_change(&core.state, &requested, conn.cfg.two_primaries);
                if rv == SS_SUCCESS {
                    core.state = requested;
                }
                rv
            }
            Err(_) => SS_IN_TRANSIENT_STATE,
        }
    };
    conn.queue(
        Channel::Meta,
        Command::StateChgReply,
        volume.max(0),
        StateChgReplyPayload { retcode }.encode(),
    );
    Ok(())
}

fn receive_conn_state_chg(conn: &Arc<Connection>, payload: &[u8]) -> Result<(), ReplError> {
    let p = StateChgReqPayload::decode(payload)?;
    debug!(mask = p.mask, val = p.val, "connection state change request");
    conn.queue(
        Channel::Meta,
        Command::ConnStChgReply,
        0,
        StateChgReplyPayload {
            retcode: SS_SUCCESS,
        }
        .encode(),
    );
    Ok(())
}

fn receive_out_of_sync(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = OutOfSyncPayload::decode(payload)?;
    let device = conn.device(volume)?;
    let mut core = device.core.lock().unwrap();
    let start_bit = p.sector >> 3;
    let bits = (p.blksize as u64).div_ceil(crate::repl::bitmap::BM_BLOCK_SIZE);
    core.bitmap.set_range(start_bit, bits.max(1));
    Ok(())
}

fn receive_twopc(conn: &Arc<Connection>, cmd: Command, payload: &[u8]) -> Result<(), ReplError> {
    let p = TwopcRequestPayload::decode(payload)?;
    let resource = &conn.resource;
    match cmd {
        Command::TwopcPrepare => {
            let outcome = {
                let mut rx = resource.twopc.lock().unwrap();
                rx.on_prepare(&p, |req| {
                    let core = resource.devices[0].core.lock().unwrap();
                    match core.state.apply_mask_val(req.mask, req.val) {
                        Ok(requested) => {
                            if evaluate_state_change(&core.state, &requested, conn.cfg.two_primaries)
                                == SS_SUCCESS
                            {
                                TwopcVerdict::Yes
                            } else {
                                TwopcVerdict::No
                            }
                        }
                        Err(_) => TwopcVerdict::No,
                    }
                })
            };
            if outcome.fresh {
                resource.begin_remote_state_change();
                let res = Arc::clone(resource);
                let tid = p.tid;
                tokio::spawn(async move {
                    tokio::time::sleep(TWOPC_TIMEOUT).await;
                    if res.twopc.lock().unwrap().on_timeout(tid) {
                        res.end_remote_state_change();
                    }
                });
                resource.propagate_twopc(
                    cmd,
                    payload.to_vec(),
                    p.initiator_node_id,
                    conn.peer_node_id,
                );
            }
            let reply_cmd = match outcome.verdict {
                TwopcVerdict::Yes => Command::TwopcYes,
                TwopcVerdict::No => Command::TwopcNo,
                TwopcVerdict::Retry => Command::TwopcRetry,
            };
            let primary_nodes = {
                let core = resource.devices[0].core.lock().unwrap();
                if core.state.role == Role::Primary {
                    1u64 << resource.node_id
                } else {
                    0
                }
            };
            let reply = TwopcReplyPayload {
                tid: p.tid,
                initiator_node_id: p.initiator_node_id,
                reachable_nodes: 1u64 << resource.node_id,
                primary_nodes,
                weak_nodes: 0,
            };
            conn.queue(Channel::Meta, reply_cmd, 0, reply.encode());
            Ok(())
        }
        Command::TwopcCommit => {
            let fin = resource
                .twopc
                .lock()
                .unwrap()
                .on_commit(p.tid, p.initiator_node_id);
            if let Some(req) = fin.apply {
                for device in &resource.devices {
                    let mut core = device.core.lock().unwrap();
                    if let Ok(new) = core.state.apply_mask_val(req.mask, req.val) {
                        core.state = new;
                    }
                }
                info!(tid = p.tid, "two-pc transaction committed");
            }
            if fin.disarm_timer {
                resource.end_remote_state_change();
                resource.propagate_twopc(
                    cmd,
                    payload.to_vec(),
                    p.initiator_node_id,
                    conn.peer_node_id,
                );
            }
            Ok(())
        }
        Command::TwopcAbort => {
            let fin = resource
                .twopc
                .lock()
                .unwrap()
                .on_abort(p.tid, p.initiator_node_id);
            if fin.disarm_timer {
                resource.end_remote_state_change();
                resource.propagate_twopc(
                    cmd,
                    payload.to_vec(),
                    p.initiator_node_id,
                    conn.peer_node_id,
                );
                info!(tid = p.tid, "two-pc transaction aborted");
            }
            Ok(())
        }
        _ => unreachable!("dispatch guarantees a two-pc command"),
    }
}

async fn worker_loop(
    conn: Arc<Connection>,
    mut data_w: FrameWriter<OwnedWriteHalf>,
    mut meta_w: FrameWriter<OwnedWriteHalf>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut completions_rx: mpsc::UnboundedReceiver<BlockCompletion>,
) {
    loop {
        tokio::select! {
            out = outbound_rx.recv() => {
                let Some(out) = out else { break };
                let writer = match out.channel {
                    Channel::Data => &mut data_w,
                    Channel::Meta => &mut meta_w,
                };
                if let Err(e) = writer.send(out.cmd, out.volume, &out.payload).await {
                    warn!(error = %e, cmd = %out.cmd, "outbound send failed");
                    conn.fail(ConnState::BrokenPipe);
                    break;
                }
            }
            done = completions_rx.recv() => {
                let Some(done) = done else { break };
                if let Err(e) = handle_completion(&conn, done) {
                    warn!(error = %e, "completion handling failed");
                    conn.fail(ConnState::NetworkFailure);
                    break;
                }
            }
        }
    }
}

fn handle_completion(conn: &Arc<Connection>, done: BlockCompletion) -> Result<(), ReplError> {
    use crate::backing::CompletionKind::*;
    match done.kind {
        Write { cookie } | Discard { cookie } => {
            writes::complete_write(conn, done.device, cookie, done.ok)
        }
        Read { cookie } => resync::complete_read(conn, done.device, cookie, done.ok, done.data),
        Flush { epoch } => {
            let actions = conn.epochs.lock().unwrap().flush_done(epoch, done.ok);
            conn.perform_epoch_actions(actions);
            Ok(())
        }
    }
}

/// Centralized, idempotent teardown after the serve loop exits.
fn teardown(conn: &Arc<Connection>) {
    conn.resource.unregister_connection(conn.peer_node_id);

    // finish whatever epochs can finish without further io
    let actions = conn.epochs.lock().unwrap().cleanup();
    conn.perform_epoch_actions(actions);

    for device in &conn.resource.devices {
        let mut core = device.core.lock().unwrap();
        for cookie in core.requests.all_cookies() {
            let owned = core
                .requests
                .get(cookie)
                .map(|r| r.owner == conn.id.0)
                .unwrap_or(false);
            if owned {
                if let Some(req) = core.requests.release(cookie) {
                    // resync intervals live in the per-peer rs tree, which
                    // is cleared wholesale below
                    if let Some(interval) = req.interval {
                        if !req.flags.contains(crate::repl::request::EeFlags::IS_RESYNC) {
                            core.write_requests.remove(interval);
                        }
                    }
                }
            }
        }
        drop(core);
        device.tree_notify.notify_waiters();
    }

    for pd in &conn.peer_devices {
        pd.set_repl_state(ReplState::Off);
        let mut tree = pd.rs_in_flight.lock().unwrap();
        let stale: Vec<_> = tree.overlaps(0, u64::MAX).into_iter().map(|(id, _)| id).collect();
        for id in stale {
            tree.remove(id);
        }
        drop(tree);
        pd.rs_notify.notify_waiters();
        pd.resync.lock().unwrap().in_flight = 0;
    }

    conn.ping_outstanding.store(false, Ordering::Relaxed);
    debug!(id = conn.id.0, "connection torn down");
}
