pub mod connection;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::clock::Clock;
use crate::core::files::FileRouter;
use crate::core::notifier::OfflineNotifier;
use crate::core::publish::PublishPipeline;
use crate::core::retry::RetryEngine;
use crate::core::session::SessionRegistry;
use crate::core::subscribers::SubscriberIndex;
use crate::storage::Storage;

/// The assembled broker core: every component wired to its ports.
///
/// Construction is cheap and synchronous; [`Broker::bootstrap`] performs
/// storage init and redelivery recovery and must run before serving.
pub struct Broker {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub index: Arc<SubscriberIndex>,
    pub retry: RetryEngine,
    pub registry: SessionRegistry,
    pub pipeline: PublishPipeline,
    pub files: FileRouter,
}

impl Broker {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn OfflineNotifier>,
    ) -> Arc<Self> {
        let index = Arc::new(SubscriberIndex::new());
        let retry = RetryEngine::new(
            Arc::clone(&storage),
            Arc::clone(&index),
            Arc::clone(&clock),
        );
        let registry = SessionRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&index),
            retry.clone(),
            Arc::clone(&clock),
        );
        let pipeline = PublishPipeline::new(
            Arc::clone(&storage),
            Arc::clone(&index),
            retry.clone(),
            notifier,
            Arc::clone(&clock),
            Duration::from_millis(config.notifier.deadline_ms),
        );
        let files = FileRouter::new(Arc::clone(&storage), Arc::clone(&index));

        Arc::new(Self {
            config,
            storage,
            clock,
            index,
            retry,
            registry,
            pipeline,
            files,
        })
    }

    /// Storage init (fatal on failure) followed by redelivery recovery.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.storage.init().await?;
        self.retry.recover().await?;
        Ok(())
    }
}
