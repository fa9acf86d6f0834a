//! End-to-end tests: two real nodes pairing up, and a scripted peer
//! driving the write and resync pipelines over real sockets.

use blockrepl::backing::{BlockBackend, MemoryBackend, NullActivityLog, NullHelper};
use blockrepl::config::NetConfig;
use blockrepl::net::framed::{FrameReader, FrameWriter};
use blockrepl::net::{Connection, ListenerSet, run_connection};
use blockrepl::proto::header::{HeaderVersion, encode_header};
use blockrepl::proto::wire::{
    BarrierAckPayload, BarrierPayload, BlockAckPayload, BlockRequestPayload, ConnectionFeatures,
    DataHeader, ProtocolPayload, SizesPayload, StatePayload, SyncParamPayload, Uuids110Payload,
};
use blockrepl::proto::{Command, PROTOCOL_MAX, PROTOCOL_MIN};
use blockrepl::repl::resource::{Device, Resource};
use blockrepl::repl::state::ReplState;
use blockrepl::types::{ConnectionId, DeviceId, ID_SYNCER, UUID_JUST_CREATED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const DEV_SECTORS: u64 = 2048; // 1 MiB, 256 bitmap bits

fn make_node(
    name: &str,
    node_id: u32,
    bind: SocketAddr,
    peer: SocketAddr,
    peer_node_id: u32,
) -> (Arc<Resource>, Arc<Connection>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_device(DeviceId(0), DEV_SECTORS);
    let device = Device::new(DeviceId(0), DEV_SECTORS, 256);
    let backend_clone: Arc<MemoryBackend> = Arc::clone(&backend);
    let backend_dyn: Arc<dyn BlockBackend> = backend_clone;
    let resource = Resource::new(
        name,
        node_id,
        backend_dyn,
        Arc::new(NullActivityLog),
        Arc::new(NullHelper),
        vec![device],
    );
    let cfg = NetConfig::new(bind, peer);
    let conn = Connection::new(Arc::clone(&resource), ConnectionId(0), peer_node_id, cfg);
    (resource, conn, backend)
}

async fn wait_repl_state(conn: &Arc<Connection>, want: ReplState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if conn.peer_devices[0].repl_state() == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn two_fresh_nodes_reach_established() {
    let addr_a: SocketAddr = "127.0.0.1:19751".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:19752".parse().unwrap();

    let (_res_a, conn_a, _) = make_node("ra", 0, addr_a, addr_b, 1);
    let (_res_b, conn_b, _) = make_node("rb", 1, addr_b, addr_a, 0);

    let la = ListenerSet::new();
    let lb = ListenerSet::new();
    let ta = tokio::spawn(run_connection(Arc::clone(&conn_a), la));
    let tb = tokio::spawn(run_connection(Arc::clone(&conn_b), lb));

    // both devices are just-created: rule 10, no resync
    assert!(wait_repl_state(&conn_a, ReplState::Established, Duration::from_secs(20)).await);
    assert!(wait_repl_state(&conn_b, ReplState::Established, Duration::from_secs(20)).await);

    ta.abort();
    tb.abort();
}

/// A scripted peer: completes the socket dance and handshake by hand.
struct FakePeer {
    data_r: FrameReader<OwnedReadHalf>,
    data_w: FrameWriter<OwnedWriteHalf>,
    meta_r: FrameReader<OwnedReadHalf>,
    meta_w: FrameWriter<OwnedWriteHalf>,
}

impl FakePeer {
    async fn connect_role(target: SocketAddr, role: Command) -> TcpStream {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(target).await {
                Ok(mut s) => {
                    let header = encode_header(HeaderVersion::V80, role, 0, -1);
                    s.write_all(&header).await.unwrap();
                    return s;
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("fake peer cannot connect: {e}"),
            }
        }
    }

    /// Connect both sockets and run features + protocol + params, ending
    /// where the node's main loop begins.
    async fn establish(target: SocketAddr, my_node_id: u32, my_uuid: u64) -> Self {
        let data = Self::connect_role(target, Command::InitialData).await;
        let meta = Self::connect_role(target, Command::InitialMeta).await;

        let (dr, dw) = data.into_split();
        let (mr, mw) = meta.into_split();
        let mut peer = FakePeer {
            data_r: FrameReader::new(dr),
            data_w: FrameWriter::new(dw),
            meta_r: FrameReader::new(mr),
            meta_w: FrameWriter::new(mw),
        };

        // features
        let ours = ConnectionFeatures {
            protocol_min: PROTOCOL_MIN,
            protocol_max: PROTOCOL_MAX,
            sender_node_id: my_node_id,
            feature_flags: 1,
        };
        peer.data_w
            .send(Command::ConnectionFeatures, -1, &ours.encode())
            .await
            .unwrap();
        let (info, _) = peer.data_r.recv().await.unwrap();
        assert_eq!(info.command, Command::ConnectionFeatures);

        peer.data_r.set_version(HeaderVersion::V100);
        peer.data_w.set_version(HeaderVersion::V100);
        peer.meta_r.set_version(HeaderVersion::V100);
        peer.meta_w.set_version(HeaderVersion::V100);

        // protocol settings must match the node's defaults
        let proto = ProtocolPayload {
            protocol: 3,
            after_sb_0p: 0,
            after_sb_1p: 0,
            after_sb_2p: 0,
            two_primaries: 0,
            integrity_alg: None,
        };
        peer.data_w
            .send(Command::Protocol, -1, &proto.encode())
            .await
            .unwrap();
        let (info, _) = peer.data_r.recv().await.unwrap();
        assert_eq!(info.command, Command::Protocol);

        // the node's startup packets: SyncParam89, Sizes, Uuids110, State
        for _ in 0..4 {
            peer.data_r.recv().await.unwrap();
        }

        // our side of the parameter exchange
        peer.data_w
            .send(
                Command::SyncParam89,
                0,
                &SyncParamPayload {
                    resync_rate: 250,
                    csums_alg: None,
                    verify_alg: None,
                }
                .encode(true),
            )
            .await
            .unwrap();
        peer.data_w
            .send(
                Command::Sizes,
                0,
                &SizesPayload {
                    d_size: DEV_SECTORS,
                    u_size: 0,
                    c_size: DEV_SECTORS,
                    max_bio_size: 1 << 20,
                    dds_flags: Default::default(),
                }
                .encode(),
            )
            .await
            .unwrap();
        peer.data_w
            .send(
                Command::Uuids110,
                0,
                &Uuids110Payload {
                    current: my_uuid,
                    dirty_bits: 0,
                    flags: Default::default(),
                    node_mask: 0,
                    bitmap_uuids: Vec::new(),
                    history: [0, 0],
                }
                .encode(),
            )
            .await
            .unwrap();
        peer.data_w
            .send(
                Command::State,
                0,
                &StatePayload {
                    state: blockrepl::repl::state::UnifiedState::default().pack(),
                }
                .encode(),
            )
            .await
            .unwrap();

        peer
    }
}

#[tokio::test]
async fn scripted_peer_write_and_barrier() {
    let addr_node: SocketAddr = "127.0.0.1:19761".parse().unwrap();
    let addr_fake: SocketAddr = "127.0.0.1:19762".parse().unwrap();

    let (_res, conn, backend) = make_node("rw", 0, addr_node, addr_fake, 1);
    let listeners = ListenerSet::new();
    let node = tokio::spawn(run_connection(Arc::clone(&conn), listeners));

    let mut peer = FakePeer::establish(addr_node, 1, UUID_JUST_CREATED).await;

    assert!(wait_repl_state(&conn, ReplState::Established, Duration::from_secs(20)).await);

    // a 4 KiB write at sector 8, then the barrier closing its epoch
    let head = DataHeader {
        sector: 8,
        block_id: 0xdead_beef,
        seq_num: 1,
        dp_flags: Default::default(),
    };
    let mut frame = head.encode();
    frame.extend_from_slice(&[0xAB; 4096]);
    peer.data_w.send(Command::Data, 0, &frame).await.unwrap();
    peer.data_w
        .send(Command::Barrier, 0, &BarrierPayload { barrier: 7 }.encode())
        .await
        .unwrap();

    // protocol C: WriteAck first, then the barrier ack for the epoch
    let deadline = Duration::from_secs(10);
    let (info, payload) = tokio::time::timeout(deadline, peer.meta_r.recv())
        .await
        .expect("write ack in time")
        .unwrap();
    assert_eq!(info.command, Command::WriteAck);
    let ack = BlockAckPayload::decode(&payload).unwrap();
    assert_eq!(ack.sector, 8);
    assert_eq!(ack.block_id, 0xdead_beef);
    assert_eq!(ack.blksize, 4096);

    let (info, payload) = tokio::time::timeout(deadline, peer.meta_r.recv())
        .await
        .expect("barrier ack in time")
        .unwrap();
    assert_eq!(info.command, Command::BarrierAck);
    let back = BarrierAckPayload::decode(&payload).unwrap();
    assert_eq!(back.barrier, 7);
    assert_eq!(back.set_size, 1);

    // the payload made it to the backing store
    let stored = backend.read_range(DeviceId(0), 8, 4096).unwrap();
    assert_eq!(stored, vec![0xAB; 4096]);

    node.abort();
}

#[tokio::test]
async fn scripted_peer_serves_a_resync() {
    let addr_node: SocketAddr = "127.0.0.1:19771".parse().unwrap();
    let addr_fake: SocketAddr = "127.0.0.1:19772".parse().unwrap();

    let (_res, conn, backend) = make_node("rs", 0, addr_node, addr_fake, 1);
    let listeners = ListenerSet::new();
    let node = tokio::spawn(run_connection(Arc::clone(&conn), listeners));

    // the scripted peer has real data: the fresh node becomes sync target
    let mut peer = FakePeer::establish(addr_node, 1, 0x5000).await;

    assert!(wait_repl_state(&conn, ReplState::WFBitmapT, Duration::from_secs(20)).await);

    // ship a bitmap with every block dirty
    let mut bm = blockrepl::repl::bitmap::SyncBitmap::new(DEV_SECTORS / 8);
    bm.set_all();
    let chunk = blockrepl::repl::bitmap::encode_rle(&bm);
    peer.data_w
        .send(Command::CompressedBitmap, 0, &chunk)
        .await
        .unwrap();

    assert!(wait_repl_state(&conn, ReplState::SyncTarget, Duration::from_secs(20)).await);

    // serve RSDataRequests until the target reports Established
    let total_blocks = DEV_SECTORS / 8;
    let mut served = 0u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while served < total_blocks {
        assert!(
            tokio::time::Instant::now() < deadline,
            "served only {served}/{total_blocks} blocks"
        );
        let (info, payload) = tokio::time::timeout(Duration::from_secs(10), peer.data_r.recv())
            .await
            .expect("request in time")
            .unwrap();
        match info.command {
            Command::RsDataRequest => {
                let req = BlockRequestPayload::decode(&payload).unwrap();
                assert_eq!(req.block_id, ID_SYNCER);
                let head = DataHeader {
                    sector: req.sector,
                    block_id: req.block_id,
                    seq_num: 0,
                    dp_flags: Default::default(),
                };
                let mut frame = head.encode();
                let fill = (req.sector / 8) as u8;
                frame.extend_from_slice(&vec![fill; req.blksize as usize]);
                peer.data_w
                    .send(Command::RsDataReply, 0, &frame)
                    .await
                    .unwrap();
                served += 1;
            }
            Command::State => {}
            other => panic!("unexpected {other} during resync"),
        }
    }

    assert!(wait_repl_state(&conn, ReplState::Established, Duration::from_secs(30)).await);

    // spot-check the synced content and the adopted generation uuid
    let block0 = backend.read_range(DeviceId(0), 0, 4096).unwrap();
    assert_eq!(block0, vec![0u8; 4096]);
    let block5 = backend.read_range(DeviceId(0), 40, 4096).unwrap();
    assert_eq!(block5, vec![5u8; 4096]);

    let uuids = _res.devices[0].core.lock().unwrap().uuids.clone();
    assert_eq!(uuids.current, 0x5000);

    node.abort();
}
