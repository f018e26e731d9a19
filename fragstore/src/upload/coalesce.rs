//! Batching of adjacent parts ahead of control-plane round trips.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Waits for one item, then gathers more until `max_items` are held or
/// `max_wait` has passed since the first arrived. `None` once the channel is
/// closed and drained. Items keep their channel order.
pub async fn next_batch<T>(
    rx: &mut mpsc::Receiver<T>,
    max_items: usize,
    max_wait: Duration,
) -> Option<Vec<T>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    let deadline = Instant::now() + max_wait;
    while batch.len() < max_items.max(1) {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}
