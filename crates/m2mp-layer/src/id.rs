use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Generators created so far in this process.
static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// Source of 32-bit pseudorandom message IDs.
///
/// IDs are not checked for collisions across senders.
#[derive(Debug)]
pub struct MessageIdGenerator {
    rng: Mutex<StdRng>,
}

impl MessageIdGenerator {
    /// Seed from the device identity, the process ID and the wall clock,
    /// mixed with fresh entropy so generators in one process never share a
    /// sequence.
    pub fn new(device_id: u64) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let instance = INSTANCES.fetch_add(1, Ordering::Relaxed);
        let seed = device_id.rotate_left(16)
            ^ (u64::from(std::process::id()) << 32)
            ^ nanos
            ^ instance.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ rand::thread_rng().next_u64();
        Self::from_seed(seed)
    }

    /// A generator that yields the same sequence for the same seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen()
    }
}
