//! Peer sequence-number serialization.
//!
//! Data packets carry the sender's sequence number; acks flowing on the
//! slower meta socket advance `peer_seq`. With two primaries a data packet
//! must not be applied before every ack that precedes it has arrived, so
//! the pipeline blocks until `peer_seq` reaches `seq - 1`.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// True when `a` is newer than `b` under 2^32 wrap-around.
#[inline]
pub fn seq_greater(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// True when `a` is not newer than `b` under wrap-around.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    !seq_greater(a, b)
}

#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_greater(a, b) { a } else { b }
}

/// Highest sequence number observed from one peer device.
#[derive(Debug, Default)]
pub struct PeerSeq {
    seq: Mutex<u32>,
    notify: Notify,
}

impl PeerSeq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        *self.seq.lock().unwrap()
    }

    /// Advance monotonically (no wait); used when two-primaries is off.
    pub fn update(&self, seq: u32) {
        let mut cur = self.seq.lock().unwrap();
        *cur = seq_max(*cur, seq);
        drop(cur);
        self.notify.notify_waiters();
    }

    /// Wait until every ack preceding `seq` arrived, then advance.
    /// Returns false on timeout (caller disconnects).
    pub async fn wait_for_and_update(&self, seq: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut cur = self.seq.lock().unwrap();
                if seq_le(seq, cur.wrapping_add(1)) {
                    *cur = seq_max(*cur, seq);
                    drop(cur);
                    self.notify.notify_waiters();
                    return true;
                }
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wrap_around_comparison() {
        assert!(!seq_greater(0x8000_0001, 0x0000_0001));
        assert!(seq_greater(0x0000_0001, 0x8000_0001));
        assert!(seq_greater(1, 0));
        assert!(!seq_greater(5, 5));
        assert_eq!(seq_max(0x8000_0001, 0x0000_0001), 0x0000_0001);
    }

    #[tokio::test]
    async fn in_order_packet_passes_immediately() {
        let ps = PeerSeq::new();
        ps.update(97);
        assert!(ps.wait_for_and_update(98, Duration::from_millis(10)).await);
        assert_eq!(ps.current(), 98);
    }

    #[tokio::test]
    async fn gap_blocks_until_acks_arrive() {
        let ps = Arc::new(PeerSeq::new());
        ps.update(97);

        let waiter = {
            let ps = Arc::clone(&ps);
            tokio::spawn(async move { ps.wait_for_and_update(100, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ps.update(98);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ps.update(99);
        assert!(waiter.await.unwrap());
        assert_eq!(ps.current(), 100);
    }

    #[tokio::test]
    async fn gap_times_out() {
        let ps = PeerSeq::new();
        ps.update(50);
        assert!(!ps.wait_for_and_update(60, Duration::from_millis(30)).await);
    }
}
