//! Shipping of user-visible build output to a remote log endpoint
//!
//! Lines are queued on a bounded channel so synchronous code can report
//! progress without waiting, then batched by a background task and handed to
//! a [`LogPublisher`]. When the publisher falls behind and the queue is full,
//! new lines are dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{BuildLogConfig, LogLevel};
use crate::error::{ObservabilityError, Result};

/// One line of build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogLine {
    pub level: LogLevel,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

/// Request body sent by [`HttpLogPublisher`]
#[derive(Debug, Serialize)]
pub struct LogBatch<'a> {
    pub logs: &'a [BuildLogLine],
}

/// Destination for batches of build output
#[async_trait]
pub trait LogPublisher: Send + Sync {
    async fn publish(&self, lines: &[BuildLogLine]) -> Result<()>;
}

/// Posts batches as JSON with a bearer token
pub struct HttpLogPublisher {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl std::fmt::Debug for HttpLogPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLogPublisher")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpLogPublisher {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl LogPublisher for HttpLogPublisher {
    async fn publish(&self, lines: &[BuildLogLine]) -> Result<()> {
        self.client
            .patch(&self.url)
            .bearer_auth(&self.token)
            .json(&LogBatch { logs: lines })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ObservabilityError::Publish(e.to_string()))?;
        Ok(())
    }
}

/// Split `line` into pieces of at most `max_bytes`, cutting only on char boundaries
pub fn chunk_line(line: &str, max_bytes: usize) -> Vec<String> {
    if line.len() <= max_bytes {
        return vec![line.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        let mut end = max_bytes.min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single char wider than the limit goes out whole
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk.to_string());
        rest = tail;
    }
    chunks
}

/// Cheap handle for queueing lines onto a [`BuildLogSink`]
#[derive(Debug, Clone)]
pub struct BuildLogWriter {
    tx: mpsc::Sender<BuildLogLine>,
    max_line_bytes: usize,
    dropped: Arc<AtomicU64>,
}

impl BuildLogWriter {
    pub fn line(&self, level: LogLevel, output: &str) {
        let created_at = Utc::now();
        for chunk in chunk_line(output, self.max_line_bytes) {
            let line = BuildLogLine {
                level,
                output: chunk,
                created_at,
            };
            match self.tx.try_send(line) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        tracing::warn!(dropped, "build log queue full, dropping lines");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("build log sink closed, dropping line");
                    return;
                }
            }
        }
    }

    /// Lines dropped so far because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn info(&self, output: &str) {
        self.line(LogLevel::Info, output);
    }

    pub fn error(&self, output: &str) {
        self.line(LogLevel::Error, output);
    }
}

/// Batches build output in the background
pub struct BuildLogSink {
    writer: BuildLogWriter,
    task: JoinHandle<()>,
}

impl BuildLogSink {
    /// Start the batching task on the current runtime
    pub fn spawn(publisher: Arc<dyn LogPublisher>, config: BuildLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let writer = BuildLogWriter {
            tx,
            max_line_bytes: config.max_line_bytes.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let task = tokio::spawn(batch_lines(rx, publisher, config));
        Self { writer, task }
    }

    pub fn writer(&self) -> BuildLogWriter {
        self.writer.clone()
    }

    /// Flush what is queued and stop the task
    ///
    /// Lines sent through writers that outlive the sink after this point are dropped.
    pub async fn close(self) -> Result<()> {
        let Self { writer, task } = self;
        drop(writer);
        match tokio::time::timeout(std::time::Duration::from_secs(5), task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ObservabilityError::Publish(format!(
                "build log task failed: {e}"
            ))),
            Err(_) => Err(ObservabilityError::Publish(
                "timed out flushing build logs".to_string(),
            )),
        }
    }
}

async fn batch_lines(
    mut rx: mpsc::Receiver<BuildLogLine>,
    publisher: Arc<dyn LogPublisher>,
    config: BuildLogConfig,
) {
    let mut batch: Vec<BuildLogLine> = Vec::new();
    let mut bytes = 0usize;
    let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    bytes += line.output.len();
                    batch.push(line);
                    if batch.len() >= config.max_lines || bytes >= config.max_bytes {
                        flush(publisher.as_ref(), &mut batch, &mut bytes).await;
                    }
                }
                None => {
                    flush(publisher.as_ref(), &mut batch, &mut bytes).await;
                    return;
                }
            },
            _ = ticker.tick() => flush(publisher.as_ref(), &mut batch, &mut bytes).await,
        }
    }
}

async fn flush(publisher: &dyn LogPublisher, batch: &mut Vec<BuildLogLine>, bytes: &mut usize) {
    if batch.is_empty() {
        return;
    }
    let lines = std::mem::take(batch);
    *bytes = 0;
    if let Err(e) = publisher.publish(&lines).await {
        tracing::warn!(error = %e, lines = lines.len(), "dropping build log batch");
    }
}
