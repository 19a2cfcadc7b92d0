//! Monotonically-roughly-sortable 64-bit id generation.
//!
//! Layout: 41 bits of milliseconds since a fixed epoch, 14 bits of
//! per-process machine id, 9 bits of sequence counter. Ids generated by one
//! process are strictly increasing within a millisecond window and roughly
//! time ordered across processes.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MS: u64 = 1_700_000_000_000;
const TIMESTAMP_BITS: u32 = 41;
const MACHINE_BITS: u32 = 14;
const COUNTER_BITS: u32 = 9;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static COUNTER: AtomicU64 = AtomicU64::new(0);
static MACHINE: OnceLock<u64> = OnceLock::new();

fn machine_id() -> u64 {
    *MACHINE.get_or_init(|| {
        // A per-process random value is enough to keep concurrent processes
        // from colliding within the same millisecond.
        RandomState::new().build_hasher().finish() & MACHINE_MASK
    })
}

/// Generates the next id.
pub fn next() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let timestamp = now.saturating_sub(EPOCH_MS) & TIMESTAMP_MASK;
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
    (timestamp << (MACHINE_BITS + COUNTER_BITS)) | (machine_id() << COUNTER_BITS) | counter
}

/// Formats an id in lowercase base32 for compact display.
pub fn to_base32(mut id: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuv";
    if id == 0 {
        return "0".to_string();
    }
    let mut out = [0u8; 13];
    let mut pos = out.len();
    while id > 0 {
        pos -= 1;
        out[pos] = ALPHABET[(id & 0x1f) as usize];
        id >>= 5;
    }
    String::from_utf8_lossy(&out[pos..]).into_owned()
}
