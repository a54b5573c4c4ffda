//! rptdata server library: config, routes and service wiring

#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod api;
pub mod config;
pub mod handlers;

use anyhow::{Context, Result};
use api::{ApiState, CacheControl};
use config::{CliConfig, CodecMode};
use rptdata_core::ProviderContext;
use rptdata_core::codec::{DecodeChannel, DecodeCorrelator, LoopbackChannel};
use rptdata_storage::StorageGateway;
use rptdata_storage::fixtures;
use rptdata_storage::hot::HotStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Deliveries buffered between the loopback codec and the listener
const DECODE_DELIVERY_BUFFER: usize = 256;

/// Services built from a [`CliConfig`], plus the background tasks they need
pub struct Runtime {
    pub state: ApiState,
    shutdown: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Wire storage, codec and caches.
    ///
    /// # Errors
    ///
    /// Fails if the configured fixture file cannot be loaded.
    pub fn build(config: &CliConfig) -> Result<Self> {
        let storage: Arc<dyn StorageGateway> = match config.storage.fixtures() {
            Some(path) => Arc::new(
                fixtures::load_file(path)
                    .with_context(|| format!("failed to seed storage from {}", path.display()))?,
            ),
            None => Arc::new(HotStore::new()),
        };
        Ok(Self::with_storage(config, storage))
    }

    /// Wire codec and caches over an existing store.
    #[must_use]
    pub fn with_storage(config: &CliConfig, storage: Arc<dyn StorageGateway>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let response_timeout = Duration::from_millis(config.timeouts.codec_response_timeout_ms);

        let (correlator, listener) = match config.codec.mode {
            CodecMode::Disabled => (Arc::new(DecodeCorrelator::disconnected()), None),
            CodecMode::LoopbackJson => {
                let (channel, deliveries) = LoopbackChannel::json(DECODE_DELIVERY_BUFFER);
                let channel: Arc<dyn DecodeChannel> = channel;
                let correlator = Arc::new(DecodeCorrelator::new(Some(channel), response_timeout));
                let listener = Arc::clone(&correlator).spawn_listener(deliveries, shutdown_rx);
                (correlator, Some(listener))
            }
        };
        info!(mode = ?config.codec.mode, "Decode bridge configured");

        let ctx = ProviderContext::new(
            storage,
            correlator,
            config.cache_sizes(),
            config.search_settings(),
        );
        let cache_control = CacheControl {
            not_modified_max_age_s: config.cache_control.not_modified_max_age_s,
            rarely_modified_max_age_s: config.cache_control.rarely_modified_max_age_s,
            frequently_modified_max_age_s: config.cache_control.frequently_modified_max_age_s,
        };

        Self {
            state: ApiState::new(
                Arc::new(ctx),
                cache_control,
                config.stream_settings(),
                config.search.max_queue_size,
            ),
            shutdown,
            listener,
        }
    }

    /// Router with every route bound to this runtime's state
    #[must_use]
    pub fn router(&self) -> axum::Router {
        api::create_api_routes().with_state(self.state.clone())
    }

    /// Stop the decode listener and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Some(listener) = self.listener {
            let _ = listener.await;
        }
        info!("Background tasks stopped");
    }
}
