//! The write pipeline: receive_Data, conflict resolution and write
//! completion.

use super::bitmap::BM_BLOCK_SIZE;
use super::epoch::WriteOrdering;
use super::request::{Cookie, EeFlags, ReqQueue};
use super::resource::{Device, PeerDevice};
use crate::backing::{BlockOp, SubmitFlags};
use crate::error::ReplError;
use crate::net::connection::{Channel, Connection};
use crate::proto::Command;
use crate::proto::wire::{
    BarrierPayload, BlockAckPayload, DATA_HEADER_LEN, DataHeader, DpFlags, TrimPayload,
};
use crate::types::{DeviceId, Sector};
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

/// Re-check interval for interruptible conflict and resync waits.
const WAIT_SLICE: Duration = Duration::from_secs(1);

const DIGEST_LEN: usize = 32;

/// What conflict resolution decided for an incoming write.
enum Prepared {
    Submit(Cookie),
    Discarded,
}

/// Resolver-side verdict for a peer write overlapping a local request: a
/// fully contained write is discarded, anything else must be retried.
/// Dialects without RetryWrite signal both cases as Superseded.
fn resolver_verdict(contained: bool, protocol: u32) -> Command {
    if contained {
        Command::Superseded
    } else if protocol >= crate::proto::PROTOCOL_VOLUMES {
        Command::RetryWrite
    } else {
        Command::Superseded
    }
}

pub async fn receive_data(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let head = DataHeader::decode(payload)?;
    let mut rest = &payload[DATA_HEADER_LEN..];

    // integrity digest sits between the header and the payload
    if conn.cfg.integrity_alg.is_some() {
        if rest.len() < DIGEST_LEN {
            return Err(ReplError::malformed("data frame shorter than its digest"));
        }
        let (digest, data) = rest.split_at(DIGEST_LEN);
        let computed = Sha3_256::digest(data);
        if computed.as_slice() != digest {
            return Err(ReplError::NetworkFatal(
                "payload digest mismatch".into(),
            ));
        }
        rest = data;
    }

    let size = rest.len() as u32;
    if size == 0 || size % 512 != 0 {
        return Err(ReplError::malformed(format!("write of {size} bytes")));
    }
    let sectors = (size >> 9) as u64;
    let device = Arc::clone(conn.device(volume)?);
    let pd = Arc::clone(conn.peer_device(volume)?);

    // monotone dagtag over the connection's write stream
    let dagtag = conn
        .last_dagtag
        .fetch_add(sectors, Ordering::Relaxed)
        + sectors;

    let mut buf = device
        .pool
        .alloc(size as usize, || {
            device.core.lock().unwrap().requests.reclaim_net();
        })
        .await;
    buf.as_mut_slice().copy_from_slice(rest);

    // chain to the current epoch
    let mut extra_flags = EeFlags::empty();
    let (start, mut submit_flags) = {
        let mut epochs = conn.epochs.lock().unwrap();
        let start = epochs.start_write();
        let mut flags = SubmitFlags::empty();
        if start.is_new_epoch && epochs.write_ordering() == WriteOrdering::BioBarrier {
            epochs.mark_contains_barrier(start.epoch);
            flags |= SubmitFlags::FLUSH | SubmitFlags::FUA;
            extra_flags |= EeFlags::EPOCH_BARRIER;
        }
        (start, flags)
    };
    if head.dp_flags.contains(DpFlags::FLUSH) {
        submit_flags |= SubmitFlags::FLUSH;
    }
    if head.dp_flags.contains(DpFlags::FUA) {
        submit_flags |= SubmitFlags::FUA;
    }

    // serialize against the slower meta-socket ack flow
    if conn.cfg.two_primaries {
        if !pd
            .peer_seq
            .wait_for_and_update(head.seq_num, conn.cfg.ping_timeout())
            .await
        {
            let actions = conn.epochs.lock().unwrap().write_drained(start.epoch);
            conn.perform_epoch_actions(actions);
            return Err(ReplError::NetworkFatal(
                "timed out waiting for peer sequence".into(),
            ));
        }
    } else {
        pd.peer_seq.update(head.seq_num);
    }

    let prepared = prepare_write_request(
        conn,
        &device,
        volume,
        &head,
        size,
        Some(buf),
        Some(start.epoch),
        dagtag,
        extra_flags,
    )
    .await?;

    let cookie = match prepared {
        Prepared::Submit(cookie) => cookie,
        Prepared::Discarded => {
            // the write still counts against the epoch the sender sees
            let actions = conn.epochs.lock().unwrap().write_drained(start.epoch);
            conn.perform_epoch_actions(actions);
            return Ok(());
        }
    };

    // as sync target, let overlapping resync writes drain first
    if pd.repl_state().is_sync_target() {
        wait_resync_overlap(conn, &pd, head.sector, head.sector + sectors).await?;
    }

    // ack class: C acks after stable storage, B acks reception now
    match conn.cfg.protocol {
        crate::config::WireProtocol::C => {
            let mut core = device.core.lock().unwrap();
            if let Some(req) = core.requests.get_mut(cookie) {
                req.flags |= EeFlags::SEND_WRITE_ACK;
            }
        }
        crate::config::WireProtocol::B => {
            conn.queue(
                Channel::Meta,
                Command::RecvAck,
                volume.max(0),
                BlockAckPayload {
                    sector: head.sector,
                    block_id: head.block_id,
                    blksize: size,
                    seq_num: head.seq_num,
                }
                .encode(),
            );
        }
        crate::config::WireProtocol::A => {}
    }

    {
        let mut core = device.core.lock().unwrap();
        if let Some(req) = core.requests.get_mut(cookie) {
            req.flags |= EeFlags::CALL_AL_COMPLETE_IO;
        }
    }
    conn.resource
        .activity_log
        .begin_io(device.id, head.sector, size);

    let data = {
        let core = device.core.lock().unwrap();
        core.requests
            .get(cookie)
            .and_then(|r| r.payload.as_ref().map(|p| p.as_slice().to_vec()))
            .ok_or_else(|| ReplError::Resource("request vanished before submit".into()))?
    };
    conn.resource.backend.submit(
        device.id,
        BlockOp::Write {
            cookie,
            sector: head.sector,
            data,
            flags: submit_flags,
        },
        &conn.completions_tx(),
    );
    Ok(())
}

pub fn receive_barrier(conn: &Arc<Connection>, payload: &[u8]) -> Result<(), ReplError> {
    let p = BarrierPayload::decode(payload)?;
    let actions = conn.epochs.lock().unwrap().got_barrier(p.barrier)?;
    conn.perform_epoch_actions(actions);
    Ok(())
}

pub async fn receive_trim(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = TrimPayload::decode(payload)?;
    if !conn.features().contains(crate::proto::FeatureFlags::TRIM) {
        return Err(ReplError::malformed("trim without negotiated support"));
    }
    if p.size == 0 || p.size % 512 != 0 {
        return Err(ReplError::malformed(format!("trim of {} bytes", p.size)));
    }
    let device = Arc::clone(conn.device(volume)?);
    let pd = Arc::clone(conn.peer_device(volume)?);
    let sectors = (p.size >> 9) as u64;

    let dagtag = conn.last_dagtag.fetch_add(sectors, Ordering::Relaxed) + sectors;

    let start = conn.epochs.lock().unwrap().start_write();

    if conn.cfg.two_primaries {
        if !pd
            .peer_seq
            .wait_for_and_update(p.head.seq_num, conn.cfg.ping_timeout())
            .await
        {
            let actions = conn.epochs.lock().unwrap().write_drained(start.epoch);
            conn.perform_epoch_actions(actions);
            return Err(ReplError::NetworkFatal(
                "timed out waiting for peer sequence".into(),
            ));
        }
    } else {
        pd.peer_seq.update(p.head.seq_num);
    }

    let prepared = prepare_write_request(
        conn,
        &device,
        volume,
        &p.head,
        p.size,
        None,
        Some(start.epoch),
        dagtag,
        EeFlags::TRIM,
    )
    .await?;

    let cookie = match prepared {
        Prepared::Submit(cookie) => cookie,
        Prepared::Discarded => {
            let actions = conn.epochs.lock().unwrap().write_drained(start.epoch);
            conn.perform_epoch_actions(actions);
            return Ok(());
        }
    };

    conn.resource
        .activity_log
        .begin_io(device.id, p.head.sector, p.size);
    conn.resource.backend.submit(
        device.id,
        BlockOp::Discard {
            cookie,
            sector: p.head.sector,
            size: p.size,
        },
        &conn.completions_tx(),
    );
    Ok(())
}

/// One iteration of `prepare_write_request`'s loop body: either a final
/// verdict, or a signal that the caller must await a tree change and retry.
/// Split out as a plain (non-async) function so the `MutexGuard` taken here
/// never needs to be part of an async fn's generator state.
enum PrepareStep {
    Done(Result<Prepared, ReplError>),
    WaitTree,
}

#[allow(clippy::too_many_arguments)]
fn prepare_write_request_step(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    volume: i16,
    head: &DataHeader,
    size: u32,
    payload: &mut Option<super::pool::PooledBuf>,
    epoch: Option<u64>,
    dagtag: u64,
    extra_flags: EeFlags,
    start_s: Sector,
    end_s: Sector,
) -> PrepareStep {
    if !conn.is_running() {
        return PrepareStep::Done(Err(ReplError::NetworkFatal("cancelled".into())));
    }

    let mut core = device.core.lock().unwrap();

    if !conn.cfg.two_primaries {
        let cookie = core
            .requests
            .alloc(start_s, size, head.block_id, ReqQueue::Active, payload.take());
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.epoch = epoch;
        req.dagtag = dagtag;
        req.flags |= extra_flags;
        return PrepareStep::Done(Ok(Prepared::Submit(cookie)));
    }

    let overlaps = core.write_requests.overlaps(start_s, end_s);
    if overlaps.is_empty() {
        let interval = core.write_requests.insert(start_s, end_s, false);
        let cookie = core
            .requests
            .alloc(start_s, size, head.block_id, ReqQueue::Active, payload.take());
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.epoch = epoch;
        req.dagtag = dagtag;
        req.interval = Some(interval);
        req.flags |= extra_flags;
        return PrepareStep::Done(Ok(Prepared::Submit(cookie)));
    }

    let (id, entry) = overlaps[0];

    if !entry.local {
        // another peer write holds the range; wait for it to drain
        core.write_requests.set_waiting(id);
        drop(core);
        return PrepareStep::WaitTree;
    }

    if conn.resolve_conflicts() {
        // we decide: discard a fully contained write, ask for a retry
        // otherwise
        let contained = start_s >= entry.start && end_s <= entry.end;
        let cmd = resolver_verdict(contained, conn.protocol_version());
        drop(core);
        debug!(
            sector = start_s,
            contained, "conflicting peer write resolved, sending {cmd}"
        );
        conn.queue(
            Channel::Meta,
            cmd,
            volume.max(0),
            BlockAckPayload {
                sector: head.sector,
                block_id: head.block_id,
                blksize: size,
                seq_num: head.seq_num,
            }
            .encode(),
        );
        return PrepareStep::Done(Ok(Prepared::Discarded));
    }

    if entry.waiting {
        // the local request was postponed; apply the peer write and
        // restart the local one afterwards
        let interval = core.write_requests.insert(start_s, end_s, false);
        let cookie = core
            .requests
            .alloc(start_s, size, head.block_id, ReqQueue::Active, payload.take());
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.epoch = epoch;
        req.dagtag = dagtag;
        req.interval = Some(interval);
        req.flags |= extra_flags | EeFlags::RESTART_REQUESTS;
        return PrepareStep::Done(Ok(Prepared::Submit(cookie)));
    }

    // the resolver side will discard or retry; wait for its decision
    core.write_requests.set_waiting(id);
    drop(core);
    PrepareStep::WaitTree
}

/// Insert the write into the interval tree, resolving conflicts when two
/// primaries are allowed. `None` payload means a discard.
#[allow(clippy::too_many_arguments)]
async fn prepare_write_request(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    volume: i16,
    head: &DataHeader,
    size: u32,
    mut payload: Option<super::pool::PooledBuf>,
    epoch: Option<u64>,
    dagtag: u64,
    extra_flags: EeFlags,
) -> Result<Prepared, ReplError> {
    let start_s: Sector = head.sector;
    let end_s: Sector = head.sector + ((size >> 9) as u64);

    loop {
        match prepare_write_request_step(
            conn,
            device,
            volume,
            head,
            size,
            &mut payload,
            epoch,
            dagtag,
            extra_flags,
            start_s,
            end_s,
        ) {
            PrepareStep::Done(result) => return result,
            PrepareStep::WaitTree => wait_tree_change(conn, device).await?,
        }
    }
}

async fn wait_tree_change(conn: &Arc<Connection>, device: &Arc<Device>) -> Result<(), ReplError> {
    let notified = device.tree_notify.notified();
    if tokio::time::timeout(WAIT_SLICE, notified).await.is_err() && !conn.is_running() {
        return Err(ReplError::NetworkFatal("cancelled during conflict wait".into()));
    }
    Ok(())
}

async fn wait_resync_overlap(
    conn: &Arc<Connection>,
    pd: &Arc<PeerDevice>,
    start: Sector,
    end: Sector,
) -> Result<(), ReplError> {
    loop {
        if !conn.is_running() {
            return Err(ReplError::NetworkFatal("cancelled".into()));
        }
        if !pd.rs_in_flight.lock().unwrap().has_overlap(start, end) {
            return Ok(());
        }
        let notified = pd.rs_notify.notified();
        let _ = tokio::time::timeout(WAIT_SLICE, notified).await;
    }
}

/// Completion of a peer write or discard from the block layer.
pub fn complete_write(
    conn: &Arc<Connection>,
    device_id: DeviceId,
    cookie: Cookie,
    ok: bool,
) -> Result<(), ReplError> {
    let device = conn
        .resource
        .device(device_id)
        .ok_or_else(|| ReplError::malformed(format!("completion for unknown device {device_id}")))?;
    let volume = device_id.0 as i16;

    let (sector, size, block_id, flags, epoch, queue, interval) = {
        let mut core = device.core.lock().unwrap();
        let Some(req) = core.requests.get_mut(cookie) else {
            // request was torn down while the io was in flight
            return Ok(());
        };
        if !ok {
            req.flags |= EeFlags::WAS_ERROR;
        }
        let info = (
            req.sector,
            req.size,
            req.block_id,
            req.flags,
            req.epoch,
            req.queue(),
            req.interval.take(),
        );
        if let Some(interval) = info.6 {
            if !info.3.contains(EeFlags::IS_RESYNC) {
                core.write_requests.remove(interval);
            }
        }
        core.requests.move_to(cookie, info.5, ReqQueue::Done)?;
        core.requests.release(cookie);
        info
    };
    device.tree_notify.notify_waiters();

    if flags.contains(EeFlags::CALL_AL_COMPLETE_IO) {
        conn.resource
            .activity_log
            .complete_io(device.id, sector, size);
    }

    let pd = conn.peer_device(volume)?;

    if flags.contains(EeFlags::IS_RESYNC) {
        if let Some(interval) = interval {
            pd.rs_in_flight.lock().unwrap().remove(interval);
        }
        pd.rs_notify.notify_waiters();

        let start_bit = sector >> 3;
        let bits = ((size as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
        if ok {
            device
                .core
                .lock()
                .unwrap()
                .bitmap
                .clear_range(start_bit, bits);
            conn.queue(
                Channel::Meta,
                Command::RsWriteAck,
                volume.max(0),
                BlockAckPayload {
                    sector,
                    block_id,
                    blksize: size,
                    seq_num: 0,
                }
                .encode(),
            );
        } else {
            warn!(sector, "resync write failed");
            conn.queue(
                Channel::Meta,
                Command::NegAck,
                volume.max(0),
                BlockAckPayload {
                    sector,
                    block_id,
                    blksize: size,
                    seq_num: 0,
                }
                .encode(),
            );
        }
        {
            let mut counters = pd.resync.lock().unwrap();
            counters.in_flight = counters.in_flight.saturating_sub(1);
            if ok {
                counters.rs_done += bits;
            } else {
                counters.rs_failed += bits;
            }
        }
        crate::repl::resync::fill_resync_requests(conn, volume)?;
        crate::repl::resync::maybe_finish_resync(conn, volume)?;
        let _ = queue;
        return Ok(());
    }

    if ok {
        if flags.contains(EeFlags::SEND_WRITE_ACK) {
            // protocol C: the write is stable, close the loop
            conn.queue(
                Channel::Meta,
                Command::WriteAck,
                volume.max(0),
                BlockAckPayload {
                    sector,
                    block_id,
                    blksize: size,
                    seq_num: 0,
                }
                .encode(),
            );
        }
    } else {
        // local io failure: tell the peer and remember the range as dirty
        let start_bit = sector >> 3;
        let bits = ((size as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
        device
            .core
            .lock()
            .unwrap()
            .bitmap
            .set_range(start_bit, bits);
        conn.queue(
            Channel::Meta,
            Command::NegAck,
            volume.max(0),
            BlockAckPayload {
                sector,
                block_id,
                blksize: size,
                seq_num: 0,
            }
            .encode(),
        );
    }

    if let Some(epoch) = epoch {
        let actions = {
            let mut epochs = conn.epochs.lock().unwrap();
            let mut actions = epochs.write_drained(epoch);
            if flags.contains(EeFlags::EPOCH_BARRIER) {
                // the barrier write opening this epoch is durable; the
                // predecessor may finish without its own flush
                actions.extend(epochs.barrier_in_next_done(epoch));
            }
            actions
        };
        conn.perform_epoch_actions(actions);
    }

    if !ok {
        // the request is detached above; the connection itself goes down
        // and the peer gets fenced
        conn.resource
            .helper
            .call(crate::backing::HelperEvent::FencePeer, &conn.resource.name);
        return Err(ReplError::LocalIo(format!(
            "peer write at sector {sector} failed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_conflicting_write_is_superseded() {
        // concurrent writes to [100, 108) on both sides: exact containment
        // discards the peer's copy
        assert_eq!(resolver_verdict(true, 117), Command::Superseded);
    }

    #[test]
    fn partial_overlap_asks_for_retry() {
        assert_eq!(resolver_verdict(false, 117), Command::RetryWrite);
        // dialects before the volume header have no RetryWrite
        assert_eq!(resolver_verdict(false, 95), Command::Superseded);
    }
}
