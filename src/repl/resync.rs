//! Resync and online-verify pipeline.
//!
//! The sync target walks its out-of-sync bitmap and requests blocks (full
//! or checksum based); the source serves those requests from local reads.
//! Verify is the read-only variant: digests travel instead of data, and
//! only mismatches are marked.

use super::bitmap::{BM_BLOCK_SIZE, BitmapChunk, BitmapReceiver, encode_plain, encode_rle};
use super::request::{Cookie, EeFlags, ReqQueue};
use super::state::ReplState;
use crate::backing::BlockOp;
use crate::error::ReplError;
use crate::net::connection::{Channel, Connection};
use crate::proto::wire::{BlockAckPayload, BlockRequestPayload, DATA_HEADER_LEN, DataHeader};
use crate::proto::{Command, PROTOCOL_COMPRESSED_BITMAP, PROTOCOL_CSUM_RS};
use crate::types::{DeviceId, ID_IN_SYNC, ID_OUT_OF_SYNC, ID_SYNCER, UUID_PRIMARY_BIT};
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resync requests kept on the wire per peer device.
const RS_WINDOW: u32 = 32;

const DIGEST_LEN: usize = 32;

fn check_blksize(blksize: u32) -> Result<(), ReplError> {
    if blksize == 0 || blksize % 512 != 0 || blksize > 1024 * 1024 {
        return Err(ReplError::malformed(format!("block size {blksize}")));
    }
    Ok(())
}

/// Serve a read-class request: DataRequest, RSDataRequest, OVRequest or
/// CsumRSRequest.
pub fn receive_block_request(
    conn: &Arc<Connection>,
    cmd: Command,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = BlockRequestPayload::decode(payload)?;
    check_blksize(p.blksize)?;

    let flags = match cmd {
        Command::DataRequest => EeFlags::SERVE_DATA,
        Command::RsDataRequest => EeFlags::SERVE_RS,
        Command::OvRequest => EeFlags::SERVE_OV,
        Command::CsumRsRequest => {
            if conn.protocol_version() < PROTOCOL_CSUM_RS {
                return Err(ReplError::malformed(
                    "checksum resync before dialect 89",
                ));
            }
            if p.digest.len() != DIGEST_LEN {
                return Err(ReplError::malformed("checksum request digest length"));
            }
            EeFlags::COMPARE_CSUM
        }
        _ => unreachable!("dispatch guarantees a read request"),
    };

    let device = conn.device(volume)?;
    let cookie = {
        let mut core = device.core.lock().unwrap();
        let cookie = core
            .requests
            .alloc(p.sector, p.blksize, p.block_id, ReqQueue::Read, None);
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.flags |= flags;
        if !p.digest.is_empty() {
            req.digest = Some(p.digest.clone());
            req.flags |= EeFlags::HAS_DIGEST;
        }
        cookie
    };

    conn.resource.backend.submit(
        device.id,
        BlockOp::Read {
            cookie,
            sector: p.sector,
            size: p.blksize,
        },
        &conn.completions_tx(),
    );
    Ok(())
}

/// The verify peer answered with its digest; read our block to compare.
pub fn receive_ov_reply(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let p = BlockRequestPayload::decode(payload)?;
    check_blksize(p.blksize)?;
    if p.digest.len() != DIGEST_LEN {
        return Err(ReplError::malformed("ov reply digest length"));
    }
    let device = conn.device(volume)?;
    let cookie = {
        let mut core = device.core.lock().unwrap();
        let cookie = core
            .requests
            .alloc(p.sector, p.blksize, p.block_id, ReqQueue::Read, None);
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.flags |= EeFlags::COMPARE_OV | EeFlags::HAS_DIGEST;
        req.digest = Some(p.digest.clone());
        cookie
    };
    conn.resource.backend.submit(
        device.id,
        BlockOp::Read {
            cookie,
            sector: p.sector,
            size: p.blksize,
        },
        &conn.completions_tx(),
    );
    Ok(())
}

/// Resync payload arriving at the sync target.
pub async fn receive_rs_data_reply(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
) -> Result<(), ReplError> {
    let head = DataHeader::decode(payload)?;
    let mut rest = &payload[DATA_HEADER_LEN..];

    if conn.cfg.integrity_alg.is_some() {
        if rest.len() < DIGEST_LEN {
            return Err(ReplError::malformed("rs reply shorter than its digest"));
        }
        let (digest, data) = rest.split_at(DIGEST_LEN);
        if Sha3_256::digest(data).as_slice() != digest {
            return Err(ReplError::NetworkFatal("payload digest mismatch".into()));
        }
        rest = data;
    }

    let size = rest.len() as u32;
    check_blksize(size)?;
    let sectors = (size >> 9) as u64;

    let device = Arc::clone(conn.device(volume)?);
    let pd = Arc::clone(conn.peer_device(volume)?);
    if !pd.repl_state().is_sync_target() {
        debug!("resync payload outside target state, dropping");
        return Ok(());
    }

    let mut buf = device
        .pool
        .alloc(size as usize, || {
            device.core.lock().unwrap().requests.reclaim_net();
        })
        .await;
    buf.as_mut_slice().copy_from_slice(rest);

    let interval = pd
        .rs_in_flight
        .lock()
        .unwrap()
        .insert(head.sector, head.sector + sectors, false);

    let cookie = {
        let mut core = device.core.lock().unwrap();
        let cookie = core
            .requests
            .alloc(head.sector, size, head.block_id, ReqQueue::Sync, Some(buf));
        let req = core.requests.get_mut(cookie).expect("fresh cookie");
        req.owner = conn.id.0;
        req.flags |= EeFlags::IS_RESYNC | EeFlags::CALL_AL_COMPLETE_IO;
        req.interval = Some(interval);
        cookie
    };

    conn.resource
        .activity_log
        .begin_io(device.id, head.sector, size);

    let data = rest.to_vec();
    conn.resource.backend.submit(
        device.id,
        BlockOp::Write {
            cookie,
            sector: head.sector,
            data,
            flags: Default::default(),
        },
        &conn.completions_tx(),
    );
    Ok(())
}

/// One P_BITMAP / P_COMPRESSED_BITMAP chunk.
pub fn receive_bitmap(
    conn: &Arc<Connection>,
    volume: i16,
    payload: &[u8],
    compressed: bool,
) -> Result<(), ReplError> {
    if compressed && conn.protocol_version() < PROTOCOL_COMPRESSED_BITMAP {
        return Err(ReplError::malformed("compressed bitmap before dialect 90"));
    }
    let device = conn.device(volume)?;
    let pd = conn.peer_device(volume)?;

    let chunk = {
        let mut core = device.core.lock().unwrap();
        let mut rx = pd.bitmap_rx.lock().unwrap();
        if compressed {
            rx.recv_rle(&mut core.bitmap, payload)?
        } else {
            rx.recv_plain(&mut core.bitmap, payload)?
        }
    };

    if chunk == BitmapChunk::Done {
        *pd.bitmap_rx.lock().unwrap() = BitmapReceiver::new();
        match pd.repl_state() {
            ReplState::WFBitmapT => {
                let dirty = device.core.lock().unwrap().bitmap.count_set();
                {
                    let mut counters = pd.resync.lock().unwrap();
                    counters.cursor = 0;
                    counters.rs_done = 0;
                    counters.rs_failed = 0;
                    counters.rs_total = dirty;
                }
                info!(dirty, "bitmap received, starting resync");
                pd.set_repl_state(ReplState::SyncTarget);
                crate::net::connection::announce_state(conn, volume);
                fill_resync_requests(conn, volume)?;
                maybe_finish_resync(conn, volume)?;
            }
            other => {
                debug!(state = ?other, "bitmap transfer complete");
            }
        }
    }
    Ok(())
}

/// Ship our whole out-of-sync bitmap to the peer.
pub fn send_bitmap(conn: &Arc<Connection>, volume: i16) -> Result<(), ReplError> {
    let device = conn.device(volume)?;
    let core = device.core.lock().unwrap();
    let (cmd, frame) = if conn.protocol_version() >= PROTOCOL_COMPRESSED_BITMAP {
        (Command::CompressedBitmap, encode_rle(&core.bitmap))
    } else {
        (Command::Bitmap, encode_plain(&core.bitmap))
    };
    drop(core);
    conn.queue(Channel::Data, cmd, volume.max(0), frame);
    Ok(())
}

/// Keep the target's request window full.
pub fn fill_resync_requests(conn: &Arc<Connection>, volume: i16) -> Result<(), ReplError> {
    let device = conn.device(volume)?;
    let pd = conn.peer_device(volume)?;
    if !pd.repl_state().is_sync_target() {
        return Ok(());
    }
    let csums = pd.sync_cfg.lock().unwrap().csums_alg.is_some()
        && conn.protocol_version() >= PROTOCOL_CSUM_RS;

    loop {
        let next = {
            let core = device.core.lock().unwrap();
            let mut counters = pd.resync.lock().unwrap();
            if counters.in_flight >= RS_WINDOW {
                None
            } else {
                let bits = core.bitmap.bits();
                let mut found = None;
                let mut bit = counters.cursor;
                while bit < bits {
                    if core.bitmap.test(bit) {
                        found = Some(bit);
                        break;
                    }
                    bit += 1;
                }
                match found {
                    Some(bit) => {
                        counters.cursor = bit + 1;
                        counters.in_flight += 1;
                        Some(bit)
                    }
                    None => {
                        counters.cursor = bits;
                        None
                    }
                }
            }
        };
        let Some(bit) = next else { break };

        let sector = bit << 3;
        let blksize = BM_BLOCK_SIZE as u32;

        if csums {
            // digest the local stale block first
            let cookie = {
                let mut core = device.core.lock().unwrap();
                let cookie =
                    core.requests
                        .alloc(sector, blksize, ID_SYNCER, ReqQueue::Read, None);
                let req = core.requests.get_mut(cookie).expect("fresh cookie");
                req.owner = conn.id.0;
                req.flags |= EeFlags::SEND_CSUM_REQUEST;
                cookie
            };
            conn.resource.backend.submit(
                device.id,
                BlockOp::Read {
                    cookie,
                    sector,
                    size: blksize,
                },
                &conn.completions_tx(),
            );
        } else {
            conn.queue(
                Channel::Data,
                Command::RsDataRequest,
                volume.max(0),
                BlockRequestPayload {
                    sector,
                    block_id: ID_SYNCER,
                    blksize,
                    digest: Vec::new(),
                }
                .encode(),
            );
        }
    }
    Ok(())
}

/// Close out the resync when nothing is dirty or on the wire.
pub fn maybe_finish_resync(conn: &Arc<Connection>, volume: i16) -> Result<(), ReplError> {
    let device = conn.device(volume)?;
    let pd = conn.peer_device(volume)?;
    if !pd.repl_state().is_sync_target() {
        return Ok(());
    }
    let (dirty, in_flight, done, failed) = {
        let core = device.core.lock().unwrap();
        let counters = pd.resync.lock().unwrap();
        (
            core.bitmap.count_set(),
            counters.in_flight,
            counters.rs_done,
            counters.rs_failed,
        )
    };
    if in_flight > 0 {
        return Ok(());
    }
    if dirty == 0 {
        // adopt the source's generation: we now hold the same data
        let peer_current = pd
            .peer_uuids
            .lock()
            .unwrap()
            .as_ref()
            .map(|v| v.current & !UUID_PRIMARY_BIT)
            .unwrap_or(0);
        {
            let mut core = device.core.lock().unwrap();
            if peer_current != 0 {
                core.uuids.new_current(peer_current);
            }
            core.uuids.set_bitmap_for(conn.peer_node_id, 0);
        }
        info!(done, failed, "resync finished");
        pd.set_repl_state(ReplState::Established);
        crate::net::connection::announce_state(conn, volume);
    } else {
        // leftovers from failed writes: walk the bitmap again
        let bits = device.core.lock().unwrap().bitmap.bits();
        {
            let mut counters = pd.resync.lock().unwrap();
            if counters.cursor >= bits {
                warn!(dirty, "resync pass left dirty blocks, retrying");
                counters.cursor = 0;
            }
        }
        fill_resync_requests(conn, volume)?;
    }
    Ok(())
}

/// Completion of a read submitted by the serve or verify paths.
pub fn complete_read(
    conn: &Arc<Connection>,
    device_id: DeviceId,
    cookie: Cookie,
    ok: bool,
    data: Option<Vec<u8>>,
) -> Result<(), ReplError> {
    let device = conn
        .resource
        .device(device_id)
        .ok_or_else(|| ReplError::malformed(format!("completion for unknown device {device_id}")))?;
    let volume = device_id.0 as i16;

    let (sector, blksize, block_id, flags, digest) = {
        let mut core = device.core.lock().unwrap();
        let Some(req) = core.requests.get_mut(cookie) else {
            return Ok(());
        };
        let info = (
            req.sector,
            req.size,
            req.block_id,
            req.flags,
            req.digest.take(),
        );
        if info.3.intersects(EeFlags::SERVE_DATA | EeFlags::SERVE_RS | EeFlags::SERVE_OV) && ok {
            // the reply payload is about to enter the send path; the
            // request parks on the net queue until reclaimed
            core.requests.move_to(cookie, ReqQueue::Read, ReqQueue::Net)?;
            if let Some(req) = core.requests.get_mut(cookie) {
                req.flags |= EeFlags::NET_DONE;
            }
        } else {
            core.requests.move_to(cookie, ReqQueue::Read, ReqQueue::Done)?;
            core.requests.release(cookie);
        }
        info
    };

    // frames already handed to the socket have left their send state
    device.core.lock().unwrap().requests.reclaim_net();

    if !ok {
        let cmd = if flags.contains(EeFlags::SERVE_DATA) {
            Command::NegDReply
        } else {
            Command::NegRsDReply
        };
        warn!(sector, "local read failed, sending {cmd}");
        conn.queue(
            Channel::Meta,
            cmd,
            volume.max(0),
            BlockAckPayload {
                sector,
                block_id,
                blksize,
                seq_num: 0,
            }
            .encode(),
        );
        return Ok(());
    }
    let data = data.ok_or_else(|| ReplError::LocalIo("read completed without data".into()))?;

    if flags.contains(EeFlags::SERVE_DATA) || flags.contains(EeFlags::SERVE_RS) {
        let cmd = if flags.contains(EeFlags::SERVE_DATA) {
            Command::DataReply
        } else {
            Command::RsDataReply
        };
        let mut frame = DataHeader {
            sector,
            block_id,
            seq_num: 0,
            dp_flags: Default::default(),
        }
        .encode();
        frame.extend_from_slice(&data);
        conn.queue(Channel::Data, cmd, volume.max(0), frame);
        return Ok(());
    }

    if flags.contains(EeFlags::SERVE_OV) {
        let digest = Sha3_256::digest(&data).to_vec();
        conn.queue(
            Channel::Data,
            Command::OvReply,
            volume.max(0),
            BlockRequestPayload {
                sector,
                block_id,
                blksize,
                digest,
            }
            .encode(),
        );
        return Ok(());
    }

    if flags.contains(EeFlags::COMPARE_OV) {
        let expected = digest.unwrap_or_default();
        let local = Sha3_256::digest(&data);
        let in_sync = local.as_slice() == expected.as_slice();
        if !in_sync {
            let start_bit = sector >> 3;
            let bits = ((blksize as u64).div_ceil(BM_BLOCK_SIZE)).max(1);
            device.core.lock().unwrap().bitmap.set_range(start_bit, bits);
        }
        conn.queue(
            Channel::Meta,
            Command::OvResult,
            volume.max(0),
            BlockAckPayload {
                sector,
                block_id: if in_sync { ID_IN_SYNC } else { ID_OUT_OF_SYNC },
                blksize,
                seq_num: 0,
            }
            .encode(),
        );
        let pd = conn.peer_device(volume)?;
        let finished = {
            let mut counters = pd.resync.lock().unwrap();
            counters.ov_left = counters.ov_left.saturating_sub(1);
            counters.ov_left == 0
        };
        if finished && pd.repl_state().is_verify() {
            pd.set_repl_state(ReplState::Established);
            crate::net::connection::announce_state(conn, volume);
        }
        return Ok(());
    }

    if flags.contains(EeFlags::COMPARE_CSUM) {
        let expected = digest.unwrap_or_default();
        let local = Sha3_256::digest(&data);
        if local.as_slice() == expected.as_slice() {
            conn.queue(
                Channel::Meta,
                Command::RsIsInSync,
                volume.max(0),
                BlockAckPayload {
                    sector,
                    block_id,
                    blksize,
                    seq_num: 0,
                }
                .encode(),
            );
        } else {
            let mut frame = DataHeader {
                sector,
                block_id,
                seq_num: 0,
                dp_flags: Default::default(),
            }
            .encode();
            frame.extend_from_slice(&data);
            conn.queue(Channel::Data, Command::RsDataReply, volume.max(0), frame);
        }
        return Ok(());
    }

    if flags.contains(EeFlags::SEND_CSUM_REQUEST) {
        let digest = Sha3_256::digest(&data).to_vec();
        conn.queue(
            Channel::Data,
            Command::CsumRsRequest,
            volume.max(0),
            BlockRequestPayload {
                sector,
                block_id: ID_SYNCER,
                blksize,
                digest,
            }
            .encode(),
        );
        return Ok(());
    }

    debug!(sector, "read completion with no serve flag, dropping");
    Ok(())
}
