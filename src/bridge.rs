//! Process-lifetime wiring of the bridge core.
//!
//! Components initialise in the order Store, Buffer, Mapping Table,
//! Adapters, Dispatcher, Janitor; [`BridgeHandle::shutdown`] tears them
//! down in reverse. Leases abandoned by a previous process are
//! recovered before any worker starts.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::{AdapterRegistry, EgressAdapter, IngressRouter};
use crate::buffer::Buffer;
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::janitor::Janitor;
use crate::mapping::MappingTable;
use crate::message::Destination;
use crate::stats::{Counters, StatsRecorder};
use crate::store::Store;

/// The assembled bridge core, ready for adapter registration and
/// [`Bridge::start`].
pub struct Bridge {
    config: BridgeConfig,
    store: Arc<Store>,
    buffer: Arc<Buffer>,
    table: Arc<MappingTable>,
    adapters: AdapterRegistry,
    counters: Arc<Counters>,
}

impl Bridge {
    /// Open the store (exclusively, retrying a transiently unavailable
    /// file), build the buffer and mapping table, and recover leases
    /// left over from a crash.
    pub async fn init(config: BridgeConfig) -> Result<Self, BridgeError> {
        let store = Arc::new(Store::open_with_retry(&config.buffer.db_path).await?);

        let recovered = store.recover_abandoned().await?;
        if recovered > 0 {
            info!(recovered, "recovered in-flight messages from previous run");
        }

        let counters = Arc::new(Counters::default());
        let buffer = Arc::new(Buffer::new(
            Arc::clone(&store),
            config.buffer_options(),
            Arc::clone(&counters),
        ));
        let table = Arc::new(MappingTable::build(&config.mappings)?);
        if table.is_empty() {
            warn!("no mappings configured, ingress events will be dropped");
        }

        Ok(Self {
            config,
            store,
            buffer,
            table,
            adapters: AdapterRegistry::new(),
            counters,
        })
    }

    /// Register the egress adapter for a destination.
    pub fn register_egress(&mut self, destination: Destination, adapter: Arc<dyn EgressAdapter>) {
        self.adapters.register(destination, adapter);
    }

    /// The ingress entry point for transport shims.
    pub fn ingress_router(&self) -> IngressRouter {
        IngressRouter::new(Arc::clone(&self.table), Arc::clone(&self.buffer))
    }

    /// The shared buffer façade.
    pub fn buffer(&self) -> Arc<Buffer> {
        Arc::clone(&self.buffer)
    }

    /// The underlying store (operator queries, tests).
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Spawn dispatcher workers, the metric flusher and the janitor.
    pub fn start(self) -> BridgeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.buffer),
            Arc::new(self.adapters),
            self.config.dispatcher_options(),
        );
        let mut handles = dispatcher.start(shutdown_rx.clone());

        let recorder = Arc::new(StatsRecorder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.counters),
        ));
        handles.push(
            Arc::clone(&recorder).spawn(self.config.stats_flush_interval(), shutdown_rx.clone()),
        );

        let janitor = Janitor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.counters),
            recorder,
            self.config.janitor_options(),
        );
        handles.push(janitor.spawn(shutdown_rx));

        info!("bridge core started");
        BridgeHandle {
            shutdown: shutdown_tx,
            handles,
            store: self.store,
        }
    }
}

/// Handle to a running bridge core.
pub struct BridgeHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    store: Arc<Store>,
}

impl BridgeHandle {
    /// Signal shutdown, wait for every task to finish, then close the
    /// store. Messages still leased at exit are recovered on the next
    /// startup.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(%error, "bridge task panicked");
            }
        }
        self.store.close().await;
        info!("bridge core stopped");
    }
}
