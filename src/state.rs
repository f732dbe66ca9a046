use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::engine::dispatch::DispatchEngine;
use crate::engine::queue::{WorkItem, WorkQueue};
use crate::gateway::SessionGateway;
use crate::geo::index::GeoIndex;
use crate::ledger::Ledger;
use crate::ledger::store::LedgerStore;
use crate::observability::events::{BroadcastSink, DispatchEvent, EventSink, FanoutSink, TracingSink};
use crate::observability::metrics::Metrics;
use crate::registry::ConnectionRegistry;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub index: Arc<GeoIndex>,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<DispatchEngine>,
    pub gateway: Arc<SessionGateway>,
    pub events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn LedgerStore>) -> (Self, mpsc::Receiver<WorkItem>) {
        Self::with_sink(config, store, None)
    }

    /// Like `new`, with `extra` receiving every dispatch event next to the
    /// log, metrics and `/events` sinks.
    pub fn with_sink(
        config: Config,
        store: Arc<dyn LedgerStore>,
        extra: Option<Arc<dyn EventSink>>,
    ) -> (Self, mpsc::Receiver<WorkItem>) {
        let metrics = Metrics::new();
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size.max(1));

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(TracingSink),
            Arc::new(metrics.clone()),
            Arc::new(BroadcastSink::new(events_tx.clone())),
        ];
        sinks.extend(extra);
        let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

        let registry = Arc::new(ConnectionRegistry::new(config.session.heartbeat_timeout));
        let index = Arc::new(GeoIndex::new(config.dispatch.grid_cell_deg));
        let ledger = Arc::new(Ledger::new(store, config.dispatch.max_offer_attempts));
        let (queue, order_rx) = WorkQueue::new(config.order_queue_size, metrics.clone());

        let engine = DispatchEngine::new(
            registry.clone(),
            index.clone(),
            ledger.clone(),
            queue,
            &config,
            sink,
            metrics.clone(),
        );
        let gateway = Arc::new(SessionGateway::new(engine.clone(), registry.clone()));

        (
            Self {
                config,
                registry,
                index,
                ledger,
                engine,
                gateway,
                events_tx,
                metrics,
            },
            order_rx,
        )
    }
}
