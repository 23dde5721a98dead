use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::event::cmap::CmapEvent;
use mongodb::event::sdam::SdamEvent;
use mongodb::event::EventHandler;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::MongoConfig;
use crate::classification::DriverError;
use crate::connection::{DriverSignal, PoolUsage, StoreConnector};

/// Pool occupancy and server reachability, fed by driver event handlers.
#[derive(Debug)]
struct PoolGauges {
    active: AtomicU32,
    waiting: AtomicU32,
    server_down: AtomicBool,
    signals: broadcast::Sender<DriverSignal>,
}

impl PoolGauges {
    fn on_cmap(&self, event: CmapEvent) {
        match event {
            CmapEvent::ConnectionCheckoutStarted(_) => {
                self.waiting.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckoutFailed(_) => {
                saturating_dec(&self.waiting);
            }
            CmapEvent::ConnectionCheckedOut(_) => {
                saturating_dec(&self.waiting);
                self.active.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckedIn(_) => {
                saturating_dec(&self.active);
            }
            CmapEvent::PoolCleared(cleared) => {
                debug!(address = %cleared.address, "MongoDB connection pool cleared");
                let _ = self
                    .signals
                    .send(DriverSignal::Error(DriverError::network("connection pool cleared")));
            }
            _ => {}
        }
    }

    fn on_sdam(&self, event: SdamEvent) {
        match event {
            SdamEvent::ServerHeartbeatFailed(failed) => {
                if !self.server_down.swap(true, Ordering::SeqCst) {
                    warn!(address = %failed.server_address, error = %failed.failure, "MongoDB heartbeat failed");
                    let _ = self.signals.send(DriverSignal::Disconnected {
                        reason: failed.failure.to_string(),
                    });
                }
            }
            SdamEvent::ServerHeartbeatSucceeded(succeeded) => {
                if self.server_down.swap(false, Ordering::SeqCst) {
                    info!(address = %succeeded.server_address, "MongoDB heartbeat recovered");
                    let _ = self.signals.send(DriverSignal::Reconnected);
                }
            }
            _ => {}
        }
    }
}

fn saturating_dec(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}

/// [`StoreConnector`] backed by the official MongoDB driver.
///
/// The pool is sized from [`MongoConfig`]. CMAP events keep the pool gauges
/// current and SDAM heartbeats are turned into disconnect/reconnect signals.
pub struct MongoConnector {
    config: MongoConfig,
    gauges: Arc<PoolGauges>,
}

impl MongoConnector {
    pub fn new(config: MongoConfig) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            config,
            gauges: Arc::new(PoolGauges {
                active: AtomicU32::new(0),
                waiting: AtomicU32::new(0),
                server_down: AtomicBool::new(false),
                signals,
            }),
        }
    }

    pub fn config(&self) -> &MongoConfig {
        &self.config
    }

    /// The configured database on a connected client.
    pub fn database(&self, client: &Client) -> Database {
        client.database(&self.config.database)
    }

    async fn client_options(&self) -> Result<ClientOptions, DriverError> {
        let mut options = ClientOptions::parse(&self.config.url).await?;

        options.max_pool_size = Some(self.config.max_pool_size);
        options.min_pool_size = Some(self.config.min_pool_size);
        options.connect_timeout = Some(Duration::from_secs(self.config.connect_timeout_secs));
        options.server_selection_timeout =
            Some(Duration::from_secs(self.config.server_selection_timeout_secs));
        options.heartbeat_freq = Some(Duration::from_secs(self.config.heartbeat_freq_secs));

        if let Some(ref app_name) = self.config.app_name {
            options.app_name = Some(app_name.clone());
        }

        let cmap = Arc::clone(&self.gauges);
        options.cmap_event_handler = Some(EventHandler::callback(move |event: CmapEvent| cmap.on_cmap(event)));
        let sdam = Arc::clone(&self.gauges);
        options.sdam_event_handler = Some(EventHandler::callback(move |event: SdamEvent| sdam.on_sdam(event)));

        Ok(options)
    }
}

#[async_trait]
impl StoreConnector for MongoConnector {
    type Client = Client;

    #[instrument(skip(self), fields(database = %self.config.database))]
    async fn connect(&self) -> Result<Client, DriverError> {
        info!("Attempting to connect to MongoDB");

        let options = self.client_options().await?;
        let client = Client::with_options(options)?;
        self.ping(&client).await?;
        self.gauges.server_down.store(false, Ordering::SeqCst);

        info!("Successfully connected to MongoDB");
        Ok(client)
    }

    async fn ping(&self, client: &Client) -> Result<(), DriverError> {
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn shutdown(&self, client: Client) {
        // Open change stream cursors would hold a graceful shutdown forever
        client.shutdown().immediate(true).await;
        self.gauges.active.store(0, Ordering::Relaxed);
        self.gauges.waiting.store(0, Ordering::Relaxed);
    }

    fn pool_usage(&self) -> PoolUsage {
        PoolUsage {
            min: self.config.min_pool_size,
            max: self.config.max_pool_size,
            active: self.gauges.active.load(Ordering::Relaxed),
            wait_queue: self.gauges.waiting.load(Ordering::Relaxed),
        }
    }

    fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
        Some(self.gauges.signals.subscribe())
    }
}
