//! Acknowledgement reader: the meta-socket loop and the ping scheduler.
//!
//! Everything the peer answers travels here: block acks, barrier acks,
//! state-change and two-pc replies, verify results. Data traffic on the
//! data socket also counts as liveness; pings only flow when the link has
//! gone quiet.

use super::connection::{Channel, Connection};
use crate::error::ReplError;
use crate::proto::wire::{
    BarrierAckPayload, BlockAckPayload, PeerAckPayload, PeersInSyncPayload, StateChgReplyPayload,
    TwopcReplyPayload,
};
use crate::proto::{Command, PacketInfo};
use crate::repl::bitmap::BM_BLOCK_SIZE;
use crate::repl::resync;
use crate::repl::state::{ConnState, ReplState};
use crate::repl::twopc::TwopcVerdict;
use crate::types::{ID_OUT_OF_SYNC, ID_SYNCER, now};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, warn};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn ack_reader(
    conn: Arc<Connection>,
    mut meta_r: super::framed::FrameReader<OwnedReadHalf>,
) {
    loop {
        if !conn.is_running() {
            return;
        }
        let frame = tokio::select! {
            frame = meta_r.recv() => frame,
            _ = conn.state_notify.notified() => continue,
        };
        let (info, payload) = match frame {
            Ok(f) => f,
            Err(e) => {
                if conn.is_running() {
                    warn!(error = %e, "meta socket failed");
                    conn.fail(ConnState::BrokenPipe);
                }
                return;
            }
        };
        conn.last_received.store(now(), Ordering::Relaxed);
        if let Err(e) = handle_ack(&conn, info, &payload) {
            warn!(error = %e, cmd = %info.command, "ack handling failed");
            conn.fail(ConnState::ProtocolError);
            return;
        }
    }
}

fn handle_ack(conn: &Arc<Connection>, info: PacketInfo, payload: &[u8]) -> Result<(), ReplError> {
    use Command::*;
    match info.command {
        Ping => {
            conn.queue(Channel::Meta, PingAck, 0, Vec::new());
            Ok(())
        }
        PingAck => {
            conn.ping_outstanding.store(false, Ordering::Relaxed);
            Ok(())
        }
        RecvAck | WriteAck | RsWriteAck | Superseded | RetryWrite => {
            got_block_ack(conn, info.command, info.volume, payload)
        }
        NegAck => got_neg_ack(conn, info.volume, payload),
        NegDReply | NegRsDReply => {
            let p = BlockAckPayload::decode(payload)?;
            warn!(sector = p.sector, cmd = %info.command, "peer failed our read request");
            Ok(())
        }
        BarrierAck => {
            let p = BarrierAckPayload::decode(payload)?;
            let mut released = 0usize;
            for device in &conn.resource.devices {
                released += device
                    .core
                    .lock()
                    .unwrap()
                    .tx_log
                    .release_barrier(p.barrier)
                    .len();
            }
            debug!(
                barrier = p.barrier,
                set_size = p.set_size,
                released,
                "barrier acked"
            );
            Ok(())
        }
        OvResult => got_ov_result(conn, info.volume, payload),
        StateChgReply | ConnStChgReply => {
            let p = StateChgReplyPayload::decode(payload)?;
            let reply = &conn.resource.state_change_reply;
            *reply.retcode.lock().unwrap() = Some(p.retcode);
            reply.notify.notify_waiters();
            Ok(())
        }
        TwopcYes | TwopcNo | TwopcRetry => {
            let verdict = match info.command {
                TwopcYes => TwopcVerdict::Yes,
                TwopcNo => TwopcVerdict::No,
                _ => TwopcVerdict::Retry,
            };
            let p = TwopcReplyPayload::decode(payload)?;
            let mut agg = conn.resource.aggregator.lock().unwrap();
            if let Some(agg) = agg.as_mut() {
                agg.record(conn.peer_node_id, verdict, &p);
            } else {
                debug!(tid = p.tid, "two-pc reply without an open transaction");
            }
            drop(agg);
            conn.resource.aggregator_notify.notify_waiters();
            Ok(())
        }
        PeerAck => got_peer_ack(conn, payload),
        PeersInSync => {
            let p = PeersInSyncPayload::decode(payload)?;
            let device = conn.device(info.volume)?;
            let start_bit = p.sector >> 3;
            let bits = ((p.size as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
            device
                .core
                .lock()
                .unwrap()
                .bitmap
                .clear_range(start_bit, bits);
            debug!(mask = p.mask, sector = p.sector, "peers in sync");
            Ok(())
        }
        RsIsInSync => got_rs_is_in_sync(conn, info.volume, payload),
        RsCancel => {
            let p = BlockAckPayload::decode(payload)?;
            let pd = conn.peer_device(info.volume)?;
            {
                let mut counters = pd.resync.lock().unwrap();
                counters.in_flight = counters.in_flight.saturating_sub(1);
                counters.rs_failed += 1;
            }
            debug!(sector = p.sector, "peer cancelled a resync request");
            resync::fill_resync_requests(conn, info.volume)?;
            resync::maybe_finish_resync(conn, info.volume)
        }
        other => Err(ReplError::malformed(format!(
            "unexpected {other} on the meta socket"
        ))),
    }
}

fn got_block_ack(
    conn: &Arc<Connection>,
    cmd: Command,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = BlockAckPayload::decode(payload)?;
    let pd = conn.peer_device(volume)?;
    pd.peer_seq.update(p.seq_num);
    let device = conn.device(volume)?;

    if cmd == Command::RsWriteAck && p.block_id == ID_SYNCER {
        // the sync target stored one of our resync replies
        let bits = ((p.blksize as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
        let start_bit = p.sector >> 3;
        device
            .core
            .lock()
            .unwrap()
            .bitmap
            .clear_range(start_bit, bits);
        let mut counters = pd.resync.lock().unwrap();
        counters.rs_done += bits;
        return Ok(());
    }

    let removed = device
        .core
        .lock()
        .unwrap()
        .tx_log
        .block_ack(p.sector, p.block_id);
    match (removed, cmd) {
        (Some(_), Command::Superseded) | (Some(_), Command::RetryWrite) => {
            debug!(sector = p.sector, cmd = %cmd, "peer resolved our conflicting write");
        }
        (Some(_), _) => {
            debug!(sector = p.sector, cmd = %cmd, "write acknowledged");
        }
        (None, _) => {
            debug!(sector = p.sector, block_id = p.block_id, "ack for unknown request");
        }
    }
    Ok(())
}

fn got_neg_ack(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = BlockAckPayload::decode(payload)?;
    let pd = conn.peer_device(volume)?;
    pd.peer_seq.update(p.seq_num);
    let device = conn.device(volume)?;
    let start_bit = p.sector >> 3;
    let bits = ((p.blksize as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
    {
        let mut core = device.core.lock().unwrap();
        core.bitmap.set_range(start_bit, bits);
        core.tx_log.block_ack(p.sector, p.block_id);
    }
    warn!(sector = p.sector, "peer failed our write, range marked out of sync");
    Ok(())
}

fn got_ov_result(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = BlockAckPayload::decode(payload)?;
    let device = conn.device(volume)?;
    let pd = conn.peer_device(volume)?;
    if p.block_id == ID_OUT_OF_SYNC {
        let start_bit = p.sector >> 3;
        let bits = ((p.blksize as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
        device
            .core
            .lock()
            .unwrap()
            .bitmap
            .set_range(start_bit, bits);
        debug!(sector = p.sector, "verify found an out-of-sync block");
    }
    let finished = {
        let mut counters = pd.resync.lock().unwrap();
        counters.ov_left = counters.ov_left.saturating_sub(1);
        counters.ov_left == 0
    };
    if finished && pd.repl_state().is_verify() {
        pd.set_repl_state(ReplState::Established);
        super::connection::announce_state(conn, volume);
    }
    Ok(())
}

fn got_peer_ack(conn: &Arc<Connection>, payload: &[u8]) -> Result<(), ReplError> {
    let p = PeerAckPayload::decode(payload)?;
    for device in &conn.resource.devices {
        let mut core = device.core.lock().unwrap();
        if let Some(cookie) = core.requests.find_by_dagtag(p.dagtag) {
            if let Some(req) = core.requests.get(cookie) {
                let start_bit = req.sector >> 3;
                let bits = ((req.size as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
                core.bitmap.clear_range(start_bit, bits);
            }
        }
        core.requests.reclaim_net();
    }
    debug!(mask = p.mask, dagtag = p.dagtag, "peer ack applied");
    Ok(())
}

fn got_rs_is_in_sync(conn: &Arc<Connection>, volume: i16, payload: &[u8]) -> Result<(), ReplError> {
    let p = BlockAckPayload::decode(payload)?;
    let device = conn.device(volume)?;
    let pd = conn.peer_device(volume)?;
    let start_bit = p.sector >> 3;
    let bits = ((p.blksize as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
    device
        .core
        .lock()
        .unwrap()
        .bitmap
        .clear_range(start_bit, bits);
    {
        let mut counters = pd.resync.lock().unwrap();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.rs_done += bits;
    }
    resync::fill_resync_requests(conn, volume)?;
    resync::maybe_finish_resync(conn, volume)
}

/// Idle-link ping loop. Data traffic resets the idle clock; an unanswered
/// ping within ping_timeo fails the connection.
pub async fn ping_scheduler(conn: Arc<Connection>) {
    let ping_int = conn.cfg.ping_interval();
    let ping_timeo = conn.cfg.ping_timeout();
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if !conn.is_running() {
            return;
        }
        if conn.ping_outstanding.load(Ordering::Relaxed) {
            if now_millis() > conn.ping_deadline.load(Ordering::Relaxed) {
                warn!("ping timed out");
                conn.fail(ConnState::Timeout);
                return;
            }
        } else {
            let idle = now().saturating_sub(conn.last_received.load(Ordering::Relaxed));
            if idle >= ping_int.as_secs() {
                conn.ping_outstanding.store(true, Ordering::Relaxed);
                conn.ping_deadline
                    .store(now_millis() + ping_timeo.as_millis() as u64, Ordering::Relaxed);
                conn.queue(Channel::Meta, Command::Ping, 0, Vec::new());
            }
        }
    }
}
