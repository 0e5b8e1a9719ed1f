//! Debounced change callbacks.
//!
//! Each document gets its own watcher task. The first update after a
//! quiet period opens a window; the callback fires once no update has
//! arrived for `wait`, or `max_wait` after the window opened, whichever
//! comes first. The body is
//!
//! ```json
//! {"room": "<name>", "data": {"<object>": {"type": "Map", "content": {...}}}}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arbor_core::SharedKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::doc::SharedDoc;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Quiet period before a callback fires.
    pub wait: Duration,
    /// Upper bound on how long a pending callback can be deferred.
    pub max_wait: Duration,
    /// Top-level shared objects included in the body.
    pub objects: HashMap<String, SharedKind>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_millis(5000),
            wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(10000),
            objects: HashMap::new(),
        }
    }

    /// Parse a `{"name": "Map", ...}` object list.
    pub fn parse_objects(json: &str) -> Result<HashMap<String, SharedKind>, WebhookError> {
        serde_json::from_str(json).map_err(|e| WebhookError::InvalidObjects(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Callback endpoint answered {0}")]
    Status(u16),

    #[error("Invalid callback object list: {0}")]
    InvalidObjects(String),

    #[error("Callback sink closed")]
    SinkClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackObject {
    #[serde(rename = "type")]
    pub kind: SharedKind,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackPayload {
    pub room: String,
    pub data: BTreeMap<String, CallbackObject>,
}

impl CallbackPayload {
    pub fn build(doc: &SharedDoc, objects: &HashMap<String, SharedKind>) -> Self {
        let data = objects
            .iter()
            .map(|(name, kind)| {
                let content = doc.tree().shared_json(name, *kind);
                (name.clone(), CallbackObject { kind: *kind, content })
            })
            .collect();
        Self {
            room: doc.name().to_string(),
            data,
        }
    }
}

/// Where callbacks are delivered.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, payload: &CallbackPayload) -> Result<(), WebhookError>;
}

/// POSTs callbacks as JSON.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CallbackSink for HttpSink {
    async fn deliver(&self, payload: &CallbackPayload) -> Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Webhook {
    config: Arc<WebhookConfig>,
    sink: Arc<dyn CallbackSink>,
}

impl Webhook {
    pub fn http(config: WebhookConfig) -> Result<Self, WebhookError> {
        let sink = HttpSink::new(config.url.clone(), config.timeout)?;
        Ok(Self::with_sink(config, Arc::new(sink)))
    }

    pub fn with_sink(config: WebhookConfig, sink: Arc<dyn CallbackSink>) -> Self {
        Self {
            config: Arc::new(config),
            sink,
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Start the debounce task for `doc`. The task ends when the document
    /// is dropped.
    pub fn watch(&self, doc: &Arc<SharedDoc>) -> JoinHandle<()> {
        let weak = Arc::downgrade(doc);
        let updates = doc.subscribe_updates();
        let config = Arc::clone(&self.config);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(debounce(weak, updates, config, sink))
    }
}

async fn debounce(
    doc: Weak<SharedDoc>,
    mut updates: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    config: Arc<WebhookConfig>,
    sink: Arc<dyn CallbackSink>,
) {
    loop {
        // Idle until something changes.
        match updates.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }

        let hard_deadline = Instant::now() + config.max_wait;
        loop {
            let deadline = (Instant::now() + config.wait).min(hard_deadline);
            tokio::select! {
                received = updates.recv() => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let Some(doc) = doc.upgrade() else {
            return;
        };
        let payload = CallbackPayload::build(&doc, &config.objects);
        drop(doc);

        match sink.deliver(&payload).await {
            Ok(()) => log::debug!("Room {}: change callback delivered", payload.room),
            Err(e) => log::warn!("Room {}: change callback failed: {}", payload.room, e),
        }
    }
}
