//! Message-keyed transmission lock
//!
//! The bus is half-shared: only one command exchange may use the wire at a
//! time, but a retransmission belongs to the same exchange as the original
//! send and must re-enter freely. The lock is therefore keyed by `MessageId`
//! rather than by thread, and is recursive per key.
//!
//! A holder that exceeds the acquisition timeout has, by definition, leaked
//! the lock (normal exchanges finish in a fraction of it); the next waiter
//! forcibly reassigns ownership so one bug cannot freeze the whole bus.

use crate::protocol::MessageId;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct TransmissionLock {
    state: Mutex<LockState>,
    available: Condvar,
    acquisition_timeout: Duration,
}

#[derive(Debug)]
struct LockState {
    owner: Option<MessageId>,
    recursion: u32,
    acquired_at: Instant,
}

impl TransmissionLock {
    pub fn new(acquisition_timeout: Duration) -> Self {
        TransmissionLock {
            state: Mutex::new(LockState {
                owner: None,
                recursion: 0,
                acquired_at: Instant::now(),
            }),
            available: Condvar::new(),
            acquisition_timeout,
        }
    }

    /// Acquire the lock for `id`, blocking while another message holds it.
    /// Re-entrant for the same `id`.
    pub fn acquire(&self, id: MessageId) {
        // Wait in short slices so a stuck holder is noticed promptly.
        let slice = self.acquisition_timeout / 4;
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(id);
                    state.recursion = 1;
                    state.acquired_at = Instant::now();
                    return;
                }
                Some(owner) if owner == id => {
                    state.recursion += 1;
                    return;
                }
                Some(owner) => {
                    let holder_deadline = state.acquired_at + self.acquisition_timeout;
                    if Instant::now() >= holder_deadline {
                        log::error!(
                            "transmission lock held past {:?} by message {:?}; forcibly reassigning to {:?}",
                            self.acquisition_timeout,
                            owner,
                            id
                        );
                        state.owner = Some(id);
                        state.recursion = 1;
                        state.acquired_at = Instant::now();
                        return;
                    }
                    let wake_at = holder_deadline.min(Instant::now() + slice);
                    self.available.wait_until(&mut state, wake_at);
                }
            }
        }
    }

    /// Release one acquisition for `id`. A mismatched release is logged and
    /// ignored: it means the lock was forcibly reassigned out from under the
    /// caller, and the new owner must not be disturbed.
    pub fn release(&self, id: MessageId) {
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == id => {
                state.recursion -= 1;
                if state.recursion == 0 {
                    state.owner = None;
                    self.available.notify_one();
                }
            }
            other => {
                log::error!(
                    "message {:?} released transmission lock it does not hold (owner: {:?})",
                    id,
                    other
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(TransmissionLock::new(Duration::from_millis(500)));
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = lock.clone();
                let active = active.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for j in 0..20u64 {
                        let id = MessageId(i * 1000 + j);
                        lock.acquire(id);
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        active.fetch_sub(1, Ordering::SeqCst);
                        lock.release(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recursive_acquire_same_message() {
        let lock = TransmissionLock::new(Duration::from_millis(500));
        let id = MessageId(1);
        lock.acquire(id);
        lock.acquire(id);
        lock.release(id);

        // Still held after one release; a different message must not get in.
        let lock = Arc::new(lock);
        let contender = {
            let lock = lock.clone();
            thread::spawn(move || {
                let start = Instant::now();
                lock.acquire(MessageId(2));
                let waited = start.elapsed();
                lock.release(MessageId(2));
                waited
            })
        };
        thread::sleep(Duration::from_millis(50));
        lock.release(id);
        let waited = contender.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn test_forced_reassignment_after_timeout() {
        let lock = TransmissionLock::new(Duration::from_millis(50));
        lock.acquire(MessageId(1));
        // Holder never releases; the next acquirer takes over after the
        // acquisition timeout instead of hanging.
        let start = Instant::now();
        lock.acquire(MessageId(2));
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(start.elapsed() < Duration::from_millis(500));

        // The stale holder's release is a no-op for the new owner.
        lock.release(MessageId(1));
        lock.release(MessageId(2));
        lock.acquire(MessageId(3));
        lock.release(MessageId(3));
    }
}
