//! Dual-socket connection establishment.
//!
//! Each connection needs a data socket and a meta socket. Both sides
//! connect outbound and accept inbound on a listener shared between
//! connections with the same local bind address; the first frame on a
//! fresh socket (InitialData / InitialMeta) binds its role. When both
//! sides race and claim the same role, both ends keep the socket dialed
//! by the lower address and the loser retries after a random pause.

use crate::config::NetConfig;
use crate::error::ReplError;
use crate::proto::Command;
use crate::proto::header::{HeaderVersion, decode_header, encode_header};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(200);

struct SharedListener {
    waiters: Mutex<HashMap<IpAddr, mpsc::UnboundedSender<TcpStream>>>,
    established: Mutex<HashSet<IpAddr>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for SharedListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Listeners keyed by local bind address, shared among connections that
/// differ only by peer address.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<HashMap<SocketAddr, Arc<SharedListener>>>,
}

impl ListenerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in accepts from `peer_ip` on `bind`. At most one
    /// waiter per peer address. The waiter is installed before the accept
    /// loop can route, so an early connect is never bounced.
    pub async fn register(
        self: &Arc<Self>,
        bind: SocketAddr,
        peer_ip: IpAddr,
    ) -> Result<AcceptQueue, ReplError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let add_waiter = |shared: &Arc<SharedListener>,
                          tx: mpsc::UnboundedSender<TcpStream>|
         -> Result<(), ReplError> {
            let mut waiters = shared.waiters.lock().unwrap();
            if waiters.contains_key(&peer_ip) {
                return Err(ReplError::ProtocolIncompatible(format!(
                    "peer {peer_ip} already has a pending connection"
                )));
            }
            waiters.insert(peer_ip, tx);
            Ok(())
        };

        let existing = self.listeners.lock().unwrap().get(&bind).cloned();
        let shared = match existing {
            Some(shared) => {
                add_waiter(&shared, tx)?;
                shared
            }
            None => {
                let listener = TcpListener::bind(bind)
                    .await
                    .map_err(ReplError::from_io)?;
                let mut map = self.listeners.lock().unwrap();
                if let Some(shared) = map.get(&bind).cloned() {
                    // a concurrent register won the bind race
                    drop(map);
                    add_waiter(&shared, tx)?;
                    shared
                } else {
                    info!(%bind, "listener started");
                    let shared = Arc::new(SharedListener {
                        waiters: Mutex::new(HashMap::from([(peer_ip, tx)])),
                        established: Mutex::new(HashSet::new()),
                        task: Mutex::new(None),
                    });
                    map.insert(bind, Arc::clone(&shared));
                    drop(map);
                    let weak = Arc::downgrade(&shared);
                    *shared.task.lock().unwrap() =
                        Some(tokio::spawn(accept_loop(listener, weak)));
                    shared
                }
            }
        };

        Ok(AcceptQueue {
            rx,
            shared,
            peer_ip,
        })
    }
}

async fn accept_loop(listener: TcpListener, shared: std::sync::Weak<SharedListener>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let waiters = shared.waiters.lock().unwrap();
        match waiters.get(&peer.ip()) {
            Some(tx) => {
                if tx.send(stream).is_err() {
                    debug!(%peer, "waiter gone, dropping accepted socket");
                }
            }
            None => {
                if shared.established.lock().unwrap().contains(&peer.ip()) {
                    warn!(%peer, "rejecting socket from already-connected peer");
                } else {
                    warn!(%peer, "rejecting socket from unknown peer");
                }
            }
        }
    }
}

/// Per-connection handle on the shared listener.
pub struct AcceptQueue {
    rx: mpsc::UnboundedReceiver<TcpStream>,
    shared: Arc<SharedListener>,
    peer_ip: IpAddr,
}

impl AcceptQueue {
    /// The pairing finished: future accepts from this peer are duplicates.
    pub fn mark_established(&self) {
        self.shared.established.lock().unwrap().insert(self.peer_ip);
        self.shared.waiters.lock().unwrap().remove(&self.peer_ip);
    }
}

impl Drop for AcceptQueue {
    fn drop(&mut self) {
        self.shared.waiters.lock().unwrap().remove(&self.peer_ip);
        self.shared.established.lock().unwrap().remove(&self.peer_ip);
    }
}

/// Both sockets of an established pairing.
pub struct SocketPair {
    pub data: TcpStream,
    pub meta: TcpStream,
    /// The meta socket came in via accept: the peer sent InitialMeta,
    /// making this side the conflict resolver.
    pub meta_inbound: bool,
}

async fn send_initial(stream: &mut TcpStream, command: Command) -> Result<(), ReplError> {
    let header = encode_header(HeaderVersion::V80, command, 0, -1);
    stream
        .write_all(&header)
        .await
        .map_err(ReplError::from_io)?;
    Ok(())
}

async fn read_initial(stream: &mut TcpStream) -> Result<Command, ReplError> {
    let mut header = [0u8; 8];
    tokio::time::timeout(FIRST_FRAME_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| ReplError::NetworkTransient(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
        .map_err(ReplError::from_io)?;
    let info = decode_header(&header)?;
    Ok(info.command)
}

/// Non-consuming liveness probe: a closed peer shows up as EOF on peek.
async fn socket_alive(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(10), stream.peek(&mut buf)).await {
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
        // not readable yet means the socket is idle and open
        Err(_) => true,
    }
}

fn addr_key(addr: SocketAddr) -> (u8, u128, u16) {
    match addr.ip() {
        IpAddr::V4(ip) => (4, u32::from_be_bytes(ip.octets()) as u128, addr.port()),
        IpAddr::V6(ip) => (6, u128::from_be_bytes(ip.octets()), addr.port()),
    }
}

/// Settle a role collision. Both ends evaluate the same rule, so exactly
/// one TCP connection survives per role: the lower-addressed side's
/// outbound socket wins; the dropped socket's owner retries after a
/// random pause.
fn settle_collision(
    slot: &mut Option<(TcpStream, bool)>,
    inbound: TcpStream,
    my_outbound_wins: bool,
) {
    match slot {
        Some((_, false)) if my_outbound_wins => {
            debug!("role collision, keeping outbound socket");
        }
        _ => {
            debug!("role collision, inbound socket takes the slot");
            *slot = Some((inbound, true));
        }
    }
}

/// Run the pairing dance until both roles are bound or the attempt budget
/// runs out. Transient failures return `NetworkTransient` so the caller's
/// restart loop keeps going.
pub async fn establish_pair(
    queue: &mut AcceptQueue,
    cfg: &NetConfig,
) -> Result<SocketPair, ReplError> {
    let mut data: Option<(TcpStream, bool)> = None;
    let mut meta: Option<(TcpStream, bool)> = None;
    let my_outbound_wins = addr_key(cfg.bind_addr) < addr_key(cfg.peer_addr);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cfg.connect_int.max(10) * 3);

    // initial jitter so mutual connects rarely cross
    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 200)).await;

    while tokio::time::Instant::now() < deadline {
        // inbound sockets first; the peer may already be mid-dance
        match tokio::time::timeout(ACCEPT_POLL, queue.rx.recv()).await {
            Ok(Some(mut stream)) => match read_initial(&mut stream).await {
                Ok(Command::InitialData) => {
                    if data.is_some() {
                        settle_collision(&mut data, stream, my_outbound_wins);
                        tokio::time::sleep(Duration::from_millis(
                            rand::random::<u64>() % 200 + 50,
                        ))
                        .await;
                    } else {
                        data = Some((stream, true));
                    }
                }
                Ok(Command::InitialMeta) => {
                    if meta.is_some() {
                        settle_collision(&mut meta, stream, my_outbound_wins);
                    } else {
                        meta = Some((stream, true));
                    }
                }
                Ok(other) => {
                    warn!(cmd = %other, "unexpected first frame, dropping socket");
                }
                Err(e) => {
                    debug!(error = %e, "failed to read first frame");
                }
            },
            Ok(None) => {
                return Err(ReplError::NetworkFatal("listener gone".into()));
            }
            Err(_) => {}
        }

        // outbound attempt for the next missing role
        if data.is_none() || meta.is_none() {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(cfg.peer_addr)).await {
                Ok(Ok(mut stream)) => {
                    if data.is_none() {
                        send_initial(&mut stream, Command::InitialData).await?;
                        debug!("outbound socket bound as data");
                        data = Some((stream, false));
                    } else {
                        send_initial(&mut stream, Command::InitialMeta).await?;
                        debug!("outbound socket bound as meta");
                        meta = Some((stream, false));
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "outbound connect failed");
                }
                Err(_) => {
                    debug!("outbound connect timed out");
                }
            }
        }

        if data.is_some() && meta.is_some() {
            let d_ok = socket_alive(&data.as_ref().expect("data bound").0).await;
            let m_ok = socket_alive(&meta.as_ref().expect("meta bound").0).await;
            if !d_ok {
                debug!("data socket failed the peek check, rebinding");
                data = None;
            }
            if !m_ok {
                debug!("meta socket failed the peek check, rebinding");
                meta = None;
            }
            if d_ok && m_ok {
                let (d, _) = data.take().expect("data bound");
                let (m, m_in) = meta.take().expect("meta bound");
                queue.mark_established();
                info!(meta_inbound = m_in, "socket pair established");
                return Ok(SocketPair {
                    data: d,
                    meta: m,
                    meta_inbound: m_in,
                });
            }
        }
    }

    Err(ReplError::NetworkTransient(std::io::Error::from(
        std::io::ErrorKind::TimedOut,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    fn cfg(bind: SocketAddr, peer: SocketAddr) -> NetConfig {
        NetConfig::new(bind, peer)
    }

    #[tokio::test]
    async fn mutual_pairing_completes() {
        let set_a = ListenerSet::new();
        let set_b = ListenerSet::new();

        let bind_a: SocketAddr = "127.0.0.1:19711".parse().unwrap();
        let bind_b: SocketAddr = "127.0.0.1:19712".parse().unwrap();

        let mut qa = set_a.register(bind_a, bind_b.ip()).await.unwrap();
        let mut qb = set_b.register(bind_b, bind_a.ip()).await.unwrap();

        let cfg_a = cfg(bind_a, bind_b);
        let cfg_b = cfg(bind_b, bind_a);

        let (pa, pb) = tokio::join!(
            establish_pair(&mut qa, &cfg_a),
            establish_pair(&mut qb, &cfg_b),
        );
        let pa = pa.unwrap();
        let pb = pb.unwrap();

        // exactly one side accepted the meta socket
        assert_ne!(pa.meta_inbound, pb.meta_inbound);
    }

    #[tokio::test]
    async fn duplicate_waiter_rejected() {
        let set = ListenerSet::new();
        let bind: SocketAddr = "127.0.0.1:19721".parse().unwrap();
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        let _q = set.register(bind, peer).await.unwrap();
        assert!(set.register(bind, peer).await.is_err());
    }

    #[tokio::test]
    async fn waiter_drop_allows_reregistration() {
        let set = ListenerSet::new();
        let bind: SocketAddr = "127.0.0.1:19722".parse().unwrap();
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        let q = set.register(bind, peer).await.unwrap();
        drop(q);
        assert!(set.register(bind, peer).await.is_ok());
    }
}
