//! Replication stream reader.
//!
//! Pulls committed transactions from a slot, decodes them into
//! [`ChangeEvent`]s and hands them out one batch at a time. The slot only
//! moves when the consumer calls [`StreamReader::acknowledge`] after it has
//! durably written a batch, so a crash in between replays the batch instead
//! of losing it.
//!
//! ```text
//! Uninitialized -> SlotCreated -> Streaming <-> Reconnecting
//!                                     |
//!                                     v
//!                                   Closed
//! ```

use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{ChangeEvent, Lsn, Result, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::slot::ChangeFeed;
use crate::source::{ReplicationOptions, ReplicationSource};
use crate::wal2json::decode_messages;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    SlotCreated,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Wait between polls once the slot has nothing new.
    pub poll_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Changes of one or more committed transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
    /// Acknowledge this once `events` are durably written.
    pub commit_lsn: Lsn,
    /// Malformed rows dropped while decoding.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Changes(ChangeBatch),
    /// The slot has no committed changes beyond what was delivered.
    Idle,
    Closed,
}

pub struct StreamReader {
    source: Arc<dyn ReplicationSource>,
    options: ReplicationOptions,
    stream_options: StreamOptions,
    feed: Option<Box<dyn ChangeFeed>>,
    state: StreamState,
    delivered: Option<Lsn>,
    acknowledged: Option<Lsn>,
    idle: bool,
}

impl StreamReader {
    pub fn new(
        source: Arc<dyn ReplicationSource>,
        options: ReplicationOptions,
        stream_options: StreamOptions,
    ) -> Self {
        Self {
            source,
            options,
            stream_options,
            feed: None,
            state: StreamState::Uninitialized,
            delivered: None,
            acknowledged: None,
            idle: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Highest commit LSN handed out so far.
    pub fn delivered(&self) -> Option<Lsn> {
        self.delivered
    }

    /// Highest LSN the slot was advanced to by this reader.
    pub fn acknowledged(&self) -> Option<Lsn> {
        self.acknowledged
    }

    /// Attach to the slot. The slot must already exist: a missing slot
    /// means the position is lost and the caller has to re-snapshot.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state != StreamState::Uninitialized {
            return Ok(());
        }
        if !self.source.slot_exists(&self.options.slot_name).await? {
            return Err(SyncError::replication(format!(
                "Replication slot '{}' does not exist",
                self.options.slot_name
            )));
        }
        self.state = StreamState::SlotCreated;
        if self.connect(cancel).await? {
            info!("Streaming from replication slot {}", self.options.slot_name);
        }
        Ok(())
    }

    /// Wait for the next batch of committed changes.
    ///
    /// Returns [`StreamEvent::Idle`] when the slot is drained, and
    /// [`StreamEvent::Closed`] once `cancel` fires. Connection failures are
    /// retried with backoff and never surface here.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<StreamEvent> {
        loop {
            if self.state == StreamState::Uninitialized {
                self.start(cancel).await?;
            }
            if self.state == StreamState::Closed || cancel.is_cancelled() {
                self.close();
                return Ok(StreamEvent::Closed);
            }

            if self.idle {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.close();
                        return Ok(StreamEvent::Closed);
                    }
                    _ = tokio::time::sleep(self.stream_options.poll_interval) => {}
                }
            }

            let Some(feed) = self.feed.as_ref() else {
                self.connect(cancel).await?;
                continue;
            };

            let peeked = feed.peek(self.options.batch_size.max(1)).await;
            let messages = match peeked {
                Ok(messages) => messages,
                Err(e) if e.is_transient() => {
                    warn!("Lost replication connection on {}: {e}", self.options.slot_name);
                    self.feed = None;
                    self.state = StreamState::Reconnecting;
                    self.idle = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.state = StreamState::Streaming;

            let decoded = decode_messages(&messages)?;
            let commit_lsn = match decoded.commit_lsn {
                Some(lsn) if self.delivered.map_or(true, |d| lsn > d) => lsn,
                _ => {
                    self.idle = true;
                    return Ok(StreamEvent::Idle);
                }
            };

            // Peeking restarts at the acknowledged position, so transactions
            // delivered but not yet acknowledged come back again.
            let events = match self.delivered {
                Some(delivered) => decoded
                    .events
                    .into_iter()
                    .filter(|e| e.lsn > delivered)
                    .collect(),
                None => decoded.events,
            };

            debug!(
                "Delivering {} changes from {} up to {}",
                events.len(),
                self.options.slot_name,
                commit_lsn
            );
            self.delivered = Some(commit_lsn);
            self.idle = false;
            return Ok(StreamEvent::Changes(ChangeBatch {
                events,
                commit_lsn,
                dropped: decoded.dropped,
            }));
        }
    }

    /// Confirm that everything up to `lsn` is durably written downstream.
    ///
    /// Positions beyond what was delivered are refused; re-acknowledging an
    /// older position is a no-op.
    pub async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        match self.delivered {
            Some(delivered) if lsn <= delivered => {}
            delivered => {
                return Err(SyncError::replication(format!(
                    "Refusing to acknowledge {lsn} on slot '{}': only delivered up to {}",
                    self.options.slot_name,
                    delivered.map_or_else(|| "nothing".to_string(), |d| d.to_string())
                )));
            }
        }
        if self.acknowledged.is_some_and(|a| lsn <= a) {
            return Ok(());
        }

        // Already delivered work must be confirmed even while shutting down.
        let never = CancellationToken::new();
        loop {
            if self.feed.is_none() {
                self.connect(&never).await?;
            }
            let Some(feed) = self.feed.as_ref() else {
                continue;
            };
            match feed.advance(lsn).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    warn!("Lost replication connection while acknowledging {lsn}: {e}");
                    self.feed = None;
                }
                Err(e) => return Err(e),
            }
        }

        self.acknowledged = Some(lsn);
        Ok(())
    }

    /// Stop streaming. Delivered batches can still be acknowledged.
    pub fn close(&mut self) {
        if self.state != StreamState::Closed {
            info!("Closing replication stream on {}", self.options.slot_name);
            self.state = StreamState::Closed;
        }
    }

    /// Open the feed, retrying transient failures with exponential backoff.
    /// Returns `false` if cancelled first.
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.stream_options.min_backoff)
            .with_max_delay(self.stream_options.max_backoff)
            .with_jitter()
            .without_max_times();
        let source = self.source.clone();
        let options = self.options.clone();
        let open = (|| {
            let source = source.clone();
            let options = options.clone();
            async move { source.open_feed(&options).await }
        })
        .retry(backoff)
        .when(|e: &SyncError| e.is_transient())
        .notify(|err: &SyncError, dur: Duration| {
            warn!(
                "Replication slot {} unavailable, retrying in {:?}: {}",
                options.slot_name, dur, err
            );
        });

        let feed = tokio::select! {
            _ = cancel.cancelled() => {
                self.close();
                return Ok(false);
            }
            feed = async { open.await } => feed?,
        };

        if self.state == StreamState::Reconnecting {
            info!("Reconnected to replication slot {}", self.options.slot_name);
        }
        self.feed = Some(feed);
        Ok(true)
    }
}
