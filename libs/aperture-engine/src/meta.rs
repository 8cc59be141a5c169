use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use aperture_api::plugin::{MetaItem, MetaPublisher};
use aperture_common::channel::PublishChannel;

use crate::error::EngineError;

/// The processor-wide meta side channel.
///
/// Plugins hold cheap `MetaPublisher` handles; one drain task serializes
/// their items and broadcasts them on the bound publish endpoint. Until
/// an endpoint is configured, items are discarded.
pub struct MetaChannel {
    tx: mpsc::UnboundedSender<MetaItem>,
    publisher: Arc<Mutex<Option<PublishChannel>>>,
    drain_task: JoinHandle<()>,
}

impl Default for MetaChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaChannel {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MetaItem>();
        let publisher: Arc<Mutex<Option<PublishChannel>>> = Arc::new(Mutex::new(None));
        let drain_publisher = publisher.clone();

        let drain_task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let encoded = json!({
                    "timestamp": chrono::Utc::now()
                        .naive_utc()
                        .format("%Y-%m-%dT%H:%M:%S%.6f")
                        .to_string(),
                    "plugin": item.plugin,
                    "item": item.item,
                    "header": item.header,
                    "value": item.value,
                })
                .to_string();

                let guard = lock_publisher(&drain_publisher);
                if let Some(channel) = guard.as_ref() {
                    channel.send_bytes(encoded.into_bytes());
                }
            }
        });

        Self {
            tx,
            publisher,
            drain_task,
        }
    }

    /// Handle for a plugin context.
    pub fn publisher_handle(&self) -> MetaPublisher {
        MetaPublisher::new(self.tx.clone())
    }

    /// Bind (or re-bind) the external publish endpoint.
    pub async fn bind(&self, endpoint: &str) -> Result<(), EngineError> {
        let channel = PublishChannel::bind(endpoint).await?;
        tracing::info!(endpoint, "meta channel bound");
        *lock_publisher(&self.publisher) = Some(channel);
        Ok(())
    }
}

impl Drop for MetaChannel {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

fn lock_publisher(
    publisher: &Mutex<Option<PublishChannel>>,
) -> std::sync::MutexGuard<'_, Option<PublishChannel>> {
    publisher.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("meta publisher lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
