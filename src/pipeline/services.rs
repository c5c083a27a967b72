//! Service container: builds the three core components once and owns
//! their background tasks.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::inbound::{InMemoryLockProvider, InboundCoordinator, LockProvider, spawn_sweep_tasks};
use crate::ledger::PersistenceLedger;
use crate::outbound::{OutboundDeliverer, Transport, spawn_cleanup_task};
use crate::pipeline::processor::ConversationPipeline;
use crate::pipeline::responder::ResponseGenerator;
use crate::store::ConversationStore;

/// Everything the process shares, built once and passed around by `Arc`.
pub struct Services {
    pub config: AppConfig,
    pub clock: SharedClock,
    pub coordinator: Arc<InboundCoordinator>,
    pub deliverer: Arc<OutboundDeliverer>,
    pub ledger: Arc<PersistenceLedger>,
    pub pipeline: Arc<ConversationPipeline>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Services {
    /// Wire the components with the in-memory lock provider.
    pub fn new(
        config: AppConfig,
        clock: SharedClock,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
        responder: Arc<dyn ResponseGenerator>,
    ) -> Arc<Self> {
        let locks = Arc::new(InMemoryLockProvider::new(clock.clone()));
        Self::with_locks(config, clock, locks, store, transport, responder)
    }

    pub fn with_locks(
        config: AppConfig,
        clock: SharedClock,
        locks: Arc<dyn LockProvider>,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
        responder: Arc<dyn ResponseGenerator>,
    ) -> Arc<Self> {
        let coordinator = InboundCoordinator::new(config.coordinator.clone(), clock.clone(), locks);
        let deliverer = OutboundDeliverer::new(config.deliverer.clone(), clock.clone(), transport);
        let ledger = PersistenceLedger::new(config.ledger.clone(), clock.clone(), store);
        let pipeline = ConversationPipeline::new(
            Arc::clone(&coordinator),
            Arc::clone(&deliverer),
            Arc::clone(&ledger),
            responder,
            config.fallback_message.clone(),
        );

        Arc::new(Self {
            config,
            clock,
            coordinator,
            deliverer,
            ledger,
            pipeline,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn sweeps, sent-record cleanup and the queue-event listener.
    /// Calling it again while running does nothing.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() {
            return;
        }

        tasks.extend(spawn_sweep_tasks(Arc::clone(&self.coordinator)));
        tasks.push(spawn_cleanup_task(Arc::clone(&self.deliverer)));
        tasks.push(self.pipeline.spawn_event_listener());
        info!(tasks = tasks.len(), "Background tasks started");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Stop background tasks and write out everything the ledger holds.
    /// Returns the number of bundles flushed.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in &handles {
            handle.abort();
        }

        let flushed = self.ledger.force_process().await;
        info!(stopped = handles.len(), flushed, "Services shut down");
        flushed
    }
}
