use std::sync::atomic::{AtomicI32, Ordering};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a monotonically increasing id to include in wire protocol messages.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}
