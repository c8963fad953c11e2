//! DeliveryLoop - メッセージ配送ループ
//!
//! Pops the bus highest-priority-first and delivers each message on its own
//! task, so a slow recipient does not hold up the rest of the bus.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::dispatcher::Inner;

pub(crate) async fn run(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let message = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            message = inner.bus.next() => message,
        };

        let worker = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            worker.bus.deliver(message).await;
        });
    }
    debug!("delivery loop stopped");
}
