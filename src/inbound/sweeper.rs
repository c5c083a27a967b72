//! Background sweeps for the inbound coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::coordinator::InboundCoordinator;

/// Spawn a ticker that skips its immediate first tick, then runs `f` forever.
fn spawn_ticker<F, Fut>(interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            f().await;
        }
    })
}

/// Spawn the three independent coordinator sweeps: idle queues, expired
/// duplicate records, expired processing leases.
pub fn spawn_sweep_tasks(coordinator: Arc<InboundCoordinator>) -> Vec<JoinHandle<()>> {
    let config = coordinator.config().clone();

    let queues = Arc::clone(&coordinator);
    let duplicates = Arc::clone(&coordinator);
    let leases = coordinator;

    vec![
        spawn_ticker(config.queue_sweep_interval, move || {
            let c = Arc::clone(&queues);
            async move {
                c.sweep_idle_queues().await;
            }
        }),
        spawn_ticker(config.duplicate_sweep_interval, move || {
            let c = Arc::clone(&duplicates);
            async move {
                c.purge_expired_duplicates().await;
            }
        }),
        spawn_ticker(config.lease_sweep_interval, move || {
            let c = Arc::clone(&leases);
            async move {
                c.reclaim_expired_leases().await;
            }
        }),
    ]
}
