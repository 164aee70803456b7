//! Persistence sink for `store` and `storeOnly` clusters.
//!
//! [`Storage`] competes with the outbound senders on the mailbox and posts
//! each metric as a JSON document to one search-backend URL picked at random.
//! A failed write is logged and the metric dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::lifecycle::{Component, Lifecycle, TaskError};
use crate::mailbox::Mailbox;
use crate::metric::Metric;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("post to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("{url} rejected document with status {status}: {body}")]
    Rejected { url: String, status: u16, body: String },
    #[error("encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no store url configured")]
    NoTarget,
}

/// Where documents are written; swapped for an in-memory fake in tests
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn post(&self, url: &str, document: &Value) -> Result<(), StoreError>;
}

/// Default sink posting JSON over HTTP with reqwest
pub struct HttpSink {
    client: reqwest::Client,
}

impl Default for HttpSink {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DocumentSink for HttpSink {
    async fn post(&self, url: &str, document: &Value) -> Result<(), StoreError> {
        let response = self
            .client
            .post(url)
            .json(document)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| StoreError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// The metric as a search document with an RFC 3339 `@timestamp`
pub fn document(metric: &Metric) -> Result<Value, StoreError> {
    let mut doc = serde_json::to_value(metric)?;
    if let Value::Object(fields) = &mut doc {
        let stamp = chrono::DateTime::from_timestamp_nanos(metric.time).to_rfc3339();
        fields.insert("@timestamp".to_string(), Value::String(stamp));
    }
    Ok(doc)
}

fn pick(urls: &[String]) -> Option<&str> {
    urls.choose(&mut rand::thread_rng()).map(String::as_str)
}

pub struct Storage {
    urls: Vec<String>,
    mailbox: Mailbox,
    sink: Arc<dyn DocumentSink>,
    lifecycle: Lifecycle,
    started: AtomicBool,
}

impl Storage {
    pub fn new(config: &AgentConfig, mailbox: Mailbox) -> Self {
        Self {
            urls: config.elasticsearch.urls(),
            mailbox,
            sink: Arc::new(HttpSink::new()),
            lifecycle: Lifecycle::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the HTTP sink (for dependency injection / testing)
    pub fn with_sink(mut self, sink: Arc<dyn DocumentSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Write one metric to a random URL
    pub async fn store(&self, metric: &Metric) -> Result<(), StoreError> {
        store_one(&self.urls, self.sink.as_ref(), metric).await
    }
}

async fn store_one(urls: &[String], sink: &dyn DocumentSink, metric: &Metric) -> Result<(), StoreError> {
    let doc = document(metric)?;
    let url = pick(urls).ok_or(StoreError::NoTarget)?;
    sink.post(url, &doc).await
}

async fn drain(urls: Vec<String>, mailbox: Mailbox, sink: Arc<dyn DocumentSink>, token: CancellationToken) -> Result<(), TaskError> {
    loop {
        let metric = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            popped = mailbox.pop() => match popped {
                Ok(metric) => metric,
                Err(_) => return Ok(()),
            },
        };

        let stored = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            stored = store_one(&urls, sink.as_ref(), &metric) => stored,
        };
        match stored {
            Ok(()) => debug!(metric = %metric.name, "metric stored"),
            Err(e @ StoreError::Rejected { .. }) => {
                warn!(metric = %metric.name, error = %e, "store rejected metric, dropping")
            }
            Err(e) => warn!(metric = %metric.name, error = %e, "store failed, dropping metric"),
        }
    }
}

#[async_trait]
impl Component for Storage {
    fn name(&self) -> &str {
        "storage"
    }

    async fn start(&self) -> Result<(), TaskError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.lifecycle.spawn(
            "storage",
            drain(
                self.urls.clone(),
                self.mailbox.clone(),
                Arc::clone(&self.sink),
                self.lifecycle.token(),
            ),
        );
        info!(targets = self.urls.len(), "storage started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        self.lifecycle.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterMode;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        posts: Mutex<Vec<(String, Value)>>,
        reject: bool,
    }

    #[async_trait]
    impl DocumentSink for RecordingSink {
        async fn post(&self, url: &str, document: &Value) -> Result<(), StoreError> {
            self.posts
                .lock()
                .await
                .push((url.to_string(), document.clone()));
            if self.reject {
                return Err(StoreError::Rejected {
                    url: url.to_string(),
                    status: 400,
                    body: "mapper_parsing_exception".into(),
                });
            }
            Ok(())
        }
    }

    fn config(urls: &str) -> AgentConfig {
        let mut config = AgentConfig::for_cluster("prod", ClusterMode::StoreOnly);
        config.elasticsearch.url = urls.into();
        config
    }

    #[test]
    fn test_document_has_timestamp() {
        let metric = Metric::new("cpu", "host1", "db-1", Some(1_700_000_000_000_000_000), 0.5);
        let doc = document(&metric).unwrap();
        assert_eq!(doc["name"], "cpu");
        assert_eq!(doc["source"], "db-1");
        assert_eq!(doc["time"], 1_700_000_000_000_000_000i64);
        assert!(doc["@timestamp"]
            .as_str()
            .unwrap()
            .starts_with("2023-11-14T22:13:20"));
    }

    #[tokio::test]
    async fn test_store_spreads_over_urls() {
        let sink = Arc::new(RecordingSink::default());
        let storage = Storage::new(&config("http://a/_doc,http://b/_doc"), Mailbox::new(4))
            .with_sink(sink.clone());

        for i in 0..64 {
            storage
                .store(&Metric::new(format!("m{}", i), "g", "", Some(1), 1.0))
                .await
                .unwrap();
        }
        let used: HashSet<String> = sink.posts.lock().await.iter().map(|(u, _)| u.clone()).collect();
        assert_eq!(used.len(), 2);
    }

    #[tokio::test]
    async fn test_store_without_url() {
        let storage = Storage::new(&config(""), Mailbox::new(1)).with_sink(Arc::new(RecordingSink::default()));
        let result = storage.store(&Metric::new("m", "g", "", None, 1.0)).await;
        assert!(matches!(result, Err(StoreError::NoTarget)));
    }

    #[tokio::test]
    async fn test_rejection_is_distinct_and_not_retried() {
        let sink = Arc::new(RecordingSink {
            reject: true,
            ..RecordingSink::default()
        });
        let mailbox = Mailbox::new(4);
        let storage = Storage::new(&config("http://a/_doc"), mailbox.clone()).with_sink(sink.clone());

        let direct = storage.store(&Metric::new("m", "g", "", None, 1.0)).await;
        assert!(matches!(direct, Err(StoreError::Rejected { status: 400, .. })));

        storage.start().await.unwrap();
        mailbox.push(Metric::new("queued", "g", "", None, 1.0)).await.unwrap();
        for _ in 0..50 {
            if sink.posts.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.posts.lock().await.len(), 2);
        assert!(mailbox.is_empty());
        storage.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drains_mailbox_until_stopped() {
        let sink = Arc::new(RecordingSink::default());
        let mailbox = Mailbox::new(8);
        let storage = Storage::new(&config("http://a/_doc"), mailbox.clone()).with_sink(sink.clone());
        storage.start().await.unwrap();

        for i in 0..5 {
            mailbox
                .push(Metric::new(format!("m{}", i), "g", "", None, i as f64))
                .await
                .unwrap();
        }
        for _ in 0..100 {
            if sink.posts.lock().await.len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let names: Vec<String> = sink
            .posts
            .lock()
            .await
            .iter()
            .map(|(_, doc)| doc["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["m0", "m1", "m2", "m3", "m4"]);

        storage.stop().await.unwrap();
        storage.stop().await.unwrap();
    }
}
