//! Bounded pool for inbound payload buffers.
//!
//! Two counters per device: pages held by the receive path (`pp_in_use`)
//! and pages whose payload is still referenced by an outbound socket
//! (`pp_in_use_by_net`). Allocation waits once the combined use crosses
//! `max_buffers`, reclaiming opportunistically from completed net sends.
//! After enough throttled rounds the hard limit is relaxed so two peers
//! that are each other's backlog cannot deadlock.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const PAGE_SIZE: usize = 4096;

/// Throttled wait per round while the pool is tight.
const THROTTLE: Duration = Duration::from_millis(100);

/// Rounds of waiting before the hard limit is relaxed.
const RELAX_AFTER_ROUNDS: u32 = 20;

#[derive(Debug, Default)]
struct Counters {
    in_use: usize,
    in_use_by_net: usize,
}

#[derive(Debug)]
pub struct PagePool {
    max_buffers: usize,
    counters: Mutex<Counters>,
    notify: Notify,
}

impl PagePool {
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            max_buffers,
            counters: Mutex::new(Counters::default()),
            notify: Notify::new(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.counters.lock().unwrap().in_use
    }

    pub fn in_use_by_net(&self) -> usize {
        self.counters.lock().unwrap().in_use_by_net
    }

    fn try_take(&self, pages: usize, relaxed: bool) -> bool {
        let mut c = self.counters.lock().unwrap();
        if relaxed || c.in_use + c.in_use_by_net + pages <= self.max_buffers {
            c.in_use += pages;
            true
        } else {
            false
        }
    }

    /// Allocate a zeroed buffer of `bytes`, waiting for pool space.
    /// `reclaim` is invoked each round to let the caller free net-held
    /// pages whose send has completed.
    pub async fn alloc(self: &Arc<Self>, bytes: usize, mut reclaim: impl FnMut()) -> PooledBuf {
        let pages = bytes.div_ceil(PAGE_SIZE).max(1);
        let mut rounds = 0u32;
        loop {
            let relaxed = rounds >= RELAX_AFTER_ROUNDS;
            if self.try_take(pages, relaxed) {
                if relaxed {
                    warn!(pages, "page pool hard limit relaxed to avoid deadlock");
                }
                return PooledBuf {
                    data: vec![0u8; bytes],
                    pages,
                    pool: Arc::clone(self),
                    net: false,
                };
            }
            reclaim();
            rounds += 1;
            if rounds == 1 {
                debug!(pages, max = self.max_buffers, "page pool full, waiting");
            }
            // soft throttle: either a release wakes us or a tenth of a
            // second passes
            let _ = tokio::time::timeout(THROTTLE, self.notify.notified()).await;
        }
    }

    fn release(&self, pages: usize, net: bool) {
        let mut c = self.counters.lock().unwrap();
        if net {
            c.in_use_by_net = c.in_use_by_net.saturating_sub(pages);
        } else {
            c.in_use = c.in_use.saturating_sub(pages);
        }
        drop(c);
        self.notify.notify_waiters();
    }

    fn transfer_to_net(&self, pages: usize) {
        let mut c = self.counters.lock().unwrap();
        c.in_use = c.in_use.saturating_sub(pages);
        c.in_use_by_net += pages;
    }
}

/// Payload buffer accounted against a [`PagePool`]. Pages return to the
/// pool on drop, from whichever counter currently owns them.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    pages: usize,
    pool: Arc<PagePool>,
    net: bool,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Move accounting to the net counter once the payload is handed to an
    /// outbound socket.
    pub fn move_to_net(&mut self) {
        if !self.net {
            self.pool.transfer_to_net(self.pages);
            self.net = true;
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(self.pages, self.net);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_and_release() {
        let pool = PagePool::new(8);
        let buf = pool.alloc(PAGE_SIZE * 2, || {}).await;
        assert_eq!(pool.in_use(), 2);
        drop(buf);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn waits_until_release() {
        let pool = PagePool::new(2);
        let first = pool.alloc(PAGE_SIZE * 2, || {}).await;
        assert_eq!(pool.in_use(), 2);

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.alloc(PAGE_SIZE, || {}).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let buf = waiter.await.unwrap();
        assert_eq!(buf.pages(), 1);
    }

    #[tokio::test]
    async fn net_transfer_accounting() {
        let pool = PagePool::new(8);
        let mut buf = pool.alloc(PAGE_SIZE, || {}).await;
        buf.move_to_net();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.in_use_by_net(), 1);
        drop(buf);
        assert_eq!(pool.in_use_by_net(), 0);
    }

    #[tokio::test]
    async fn hard_limit_relaxes_eventually() {
        let pool = PagePool::new(1);
        let _held = pool.alloc(PAGE_SIZE, || {}).await;
        // would deadlock forever without the relaxation path
        let buf = pool.alloc(PAGE_SIZE, || {}).await;
        assert_eq!(buf.pages(), 1);
    }
}
