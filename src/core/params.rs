use std::sync::atomic::{AtomicI64, Ordering};

// Transactions alive for at least this many milliseconds are logged at debug
// level. The threshold may be configured to zero or below; close bookkeeping
// clamps it to 1ms.
static SLOW_OP_THRESHOLD_MS: AtomicI64 = AtomicI64::new(100);

pub fn set_slow_op_threshold_ms(threshold_ms: i64) {
    SLOW_OP_THRESHOLD_MS.store(threshold_ms, Ordering::Relaxed);
}

pub fn slow_op_threshold_ms() -> i64 {
    SLOW_OP_THRESHOLD_MS.load(Ordering::Relaxed)
}
