//! Pre-generated nonce pool
//!
//! Name obfuscation draws one fresh nonce per path segment, and large
//! directory trees obfuscate tens of thousands of segments in a burst. To
//! keep that hot path off the platform CSPRNG's reseed latency, a pool of
//! pre-generated random nonces is kept filled by a background thread and
//! drained lock-cheap from the callers' threads.

use crate::crypto::NONCE_SIZE;
use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

struct PoolShared {
    nonces: Mutex<VecDeque<[u8; NONCE_SIZE]>>,
    refill: Condvar,
    capacity: usize,
    low_water: usize,
    shutdown: AtomicBool,
}

/// Pool of pre-generated random nonces with background refill.
///
/// `draw()` never returns the same value twice and never blocks on the
/// refill thread: if the pool happens to be empty the nonce is generated
/// inline instead.
pub struct NoncePool {
    shared: Arc<PoolShared>,
    worker: Option<JoinHandle<()>>,
}

impl NoncePool {
    /// Create a pool with the given capacity and low-water refill mark
    pub fn new(capacity: usize, low_water: usize) -> Self {
        let capacity = capacity.max(1);
        let low_water = low_water.clamp(1, capacity);

        let shared = Arc::new(PoolShared {
            nonces: Mutex::new(VecDeque::with_capacity(capacity)),
            refill: Condvar::new(),
            capacity,
            low_water,
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("veilfs-nonce-refill".to_string())
            .spawn(move || refill_loop(&worker_shared))
            .expect("failed to spawn nonce refill thread");

        NoncePool {
            shared,
            worker: Some(worker),
        }
    }

    /// Draw one fresh nonce
    pub fn draw(&self) -> [u8; NONCE_SIZE] {
        let popped = {
            let mut nonces = self.shared.nonces.lock();
            let popped = nonces.pop_front();
            if nonces.len() < self.shared.low_water {
                self.shared.refill.notify_one();
            }
            popped
        };

        match popped {
            Some(nonce) => nonce,
            None => {
                // pool drained faster than the refill thread keeps up;
                // fall back to drawing inline
                trace!("nonce pool empty, drawing inline");
                let mut nonce = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce);
                nonce
            }
        }
    }

    /// Current number of pooled nonces
    pub fn len(&self) -> usize {
        self.shared.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for NoncePool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.refill.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn refill_loop(shared: &PoolShared) {
    let mut guard = shared.nonces.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if guard.len() >= shared.low_water {
            shared.refill.wait(&mut guard);
            continue;
        }

        let need = shared.capacity - guard.len();
        drop(guard);

        debug!(count = need, "refilling nonce pool");
        let mut batch = Vec::with_capacity(need);
        let mut rng = rand::thread_rng();
        for _ in 0..need {
            let mut nonce = [0u8; NONCE_SIZE];
            rng.fill_bytes(&mut nonce);
            batch.push(nonce);
        }

        guard = shared.nonces.lock();
        guard.extend(batch);
    }
}
