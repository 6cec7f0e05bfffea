//! Transfer ids: decimal nanoseconds since the Unix epoch, strictly increasing per process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// New id for a TALK or file transfer.
pub fn new_transfer_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut prev = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_ID.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => prev = actual,
        }
    }
}
