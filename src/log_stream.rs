//! Per-network log stream consumer.
//!
//! ```text
//! Unsubscribed ──subscribe──► Subscribing ──ack / first record──► Streaming
//!      ▲                          │                                │    ▲
//!      └──── nack, timeout, ──────┘                    gap detected│    │finish_resync
//!            disconnect                                            ▼    │
//!                                                           Resynchronizing
//! ```
//!
//! The consumer is a plain state machine: it never touches the cache or the
//! connection itself. It returns [`LogAction`]s telling the connection what to
//! apply, what to acknowledge, and when to rebuild a network from a bulk walk.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{LogAck, LogRecord, LogRequest};
use crate::error::{LookupError, Result};
use crate::types::{MappingRecord, VnetId};

/// Subscription state of one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Unsubscribed,
    Subscribing,
    Streaming,
    Resynchronizing,
}

/// Work produced by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAction {
    /// Write the record to the cache.
    Apply {
        vnet: VnetId,
        seq: u64,
        record: MappingRecord,
    },
    /// Acknowledge every record up to `seq`.
    Checkpoint(LogAck),
    /// Invalidate the network, reload it with a bulk walk, then call
    /// [`LogConsumer::finish_resync`].
    Resync { vnet: VnetId, resume_from: u64 },
}

/// Checkpoint cadence and resync limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Emit a checkpoint after this many applied records.
    pub checkpoint_every: u64,
    /// Emit a checkpoint for any unacknowledged progress this old.
    pub checkpoint_interval: Duration,
    /// Records buffered while a resync is running. Overflowing restarts the
    /// resync from the newest record.
    pub resync_buffer_limit: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: 64,
            checkpoint_interval: Duration::from_secs(1),
            resync_buffer_limit: 4096,
        }
    }
}

#[derive(Debug)]
struct Subscription {
    state: LogState,
    /// Next sequence number accepted in order.
    expected: u64,
    /// Last applied sequence number not yet acknowledged.
    unacked: Option<u64>,
    since_checkpoint: u64,
    last_checkpoint: Instant,
    /// Where a reconnect should resume.
    resume: u64,
    /// First sequence number streamed after the current resync.
    resume_from: u64,
    buffered: Vec<LogRecord>,
    restart_resync: bool,
}

impl Subscription {
    fn new(from_seq: u64, now: Instant) -> Self {
        Self {
            state: LogState::Subscribing,
            expected: from_seq,
            unacked: None,
            since_checkpoint: 0,
            last_checkpoint: now,
            resume: from_seq,
            resume_from: from_seq,
            buffered: Vec::new(),
            restart_resync: false,
        }
    }
}

/// Log stream state for every network on one connection.
#[derive(Debug, Default)]
pub struct LogConsumer {
    config: LogConfig,
    subscriptions: HashMap<VnetId, Subscription>,
}

impl LogConsumer {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            subscriptions: HashMap::new(),
        }
    }

    /// State of a network's subscription.
    pub fn state(&self, vnet: VnetId) -> LogState {
        self.subscriptions
            .get(&vnet)
            .map_or(LogState::Unsubscribed, |s| s.state)
    }

    /// Sequence number a new subscription should start from to continue
    /// after the last acknowledged record.
    pub fn resume_point(&self, vnet: VnetId) -> Option<u64> {
        self.subscriptions.get(&vnet).map(|s| s.resume)
    }

    /// Begin a subscription and return the request to send.
    pub fn subscribe(&mut self, vnet: VnetId, from_seq: u64, now: Instant) -> Result<LogRequest> {
        if self.state(vnet) != LogState::Unsubscribed {
            return Err(LookupError::AlreadySubscribed(vnet));
        }

        self.subscriptions
            .insert(vnet, Subscription::new(from_seq, now));
        debug!(%vnet, from_seq, "log subscription requested");
        Ok(LogRequest { vnet, from_seq })
    }

    /// The server accepted the subscription.
    pub fn confirm(&mut self, vnet: VnetId) {
        if let Some(sub) = self.subscriptions.get_mut(&vnet) {
            if sub.state == LogState::Subscribing {
                sub.state = LogState::Streaming;
                info!(%vnet, from_seq = sub.expected, "log streaming");
            }
        }
    }

    /// The subscription request failed.
    pub fn subscription_failed(&mut self, vnet: VnetId) {
        if let Some(sub) = self.subscriptions.get_mut(&vnet) {
            if sub.state == LogState::Subscribing {
                sub.state = LogState::Unsubscribed;
            }
        }
    }

    /// Feed one pushed record.
    pub fn on_record(&mut self, record: LogRecord, now: Instant) -> Vec<LogAction> {
        let config = self.config;
        let vnet = record.vnet;
        let sub = match self.subscriptions.get_mut(&vnet) {
            Some(sub) if sub.state != LogState::Unsubscribed => sub,
            _ => {
                warn!(%vnet, seq = record.seq, "log record for unsubscribed network, dropping");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        match sub.state {
            LogState::Subscribing | LogState::Streaming => {
                if sub.state == LogState::Subscribing {
                    sub.state = LogState::Streaming;
                }
                apply_in_order(sub, &config, record, now, &mut actions);
            }
            LogState::Resynchronizing => {
                if sub.buffered.len() >= config.resync_buffer_limit {
                    warn!(
                        %vnet,
                        buffered = sub.buffered.len(),
                        "resync buffer overflow, restarting resync"
                    );
                    sub.buffered.clear();
                    sub.resume_from = record.seq;
                    sub.restart_resync = true;
                }
                sub.buffered.push(record);
            }
            LogState::Unsubscribed => {}
        }
        actions
    }

    /// The bulk reload requested by [`LogAction::Resync`] is complete.
    ///
    /// Replays the records buffered meanwhile. If the buffer overflowed, the
    /// returned actions contain a fresh `Resync` instead.
    pub fn finish_resync(&mut self, vnet: VnetId, now: Instant) -> Vec<LogAction> {
        let config = self.config;
        let mut actions = Vec::new();
        let sub = match self.subscriptions.get_mut(&vnet) {
            Some(sub) if sub.state == LogState::Resynchronizing => sub,
            _ => return actions,
        };

        if sub.restart_resync {
            sub.restart_resync = false;
            actions.push(LogAction::Resync {
                vnet,
                resume_from: sub.resume_from,
            });
            return actions;
        }

        sub.state = LogState::Streaming;
        sub.expected = sub.resume_from;
        info!(%vnet, resume_from = sub.expected, buffered = sub.buffered.len(), "resync complete");

        let buffered = std::mem::take(&mut sub.buffered);
        let mut pending = buffered.into_iter();
        for record in pending.by_ref() {
            apply_in_order(sub, &config, record, now, &mut actions);
            if sub.state == LogState::Resynchronizing {
                break;
            }
        }
        // A gap inside the replay starts another resync with the rest buffered.
        sub.buffered.extend(pending);
        actions
    }

    /// The resync bulk walk failed; the network is left unsubscribed.
    pub fn abort_resync(&mut self, vnet: VnetId) {
        if let Some(sub) = self.subscriptions.get_mut(&vnet) {
            if sub.state == LogState::Resynchronizing {
                sub.state = LogState::Unsubscribed;
                sub.buffered.clear();
                sub.restart_resync = false;
            }
        }
    }

    /// Checkpoints whose interval elapsed.
    pub fn due_checkpoints(&mut self, now: Instant) -> Vec<LogAck> {
        let interval = self.config.checkpoint_interval;
        self.subscriptions
            .iter_mut()
            .filter(|(_, sub)| sub.state == LogState::Streaming)
            .filter(|(_, sub)| now.saturating_duration_since(sub.last_checkpoint) >= interval)
            .filter_map(|(&vnet, sub)| checkpoint(vnet, sub, now))
            .collect()
    }

    /// The connection dropped; every network returns to `Unsubscribed`.
    ///
    /// Resume points survive so the caller can resubscribe.
    pub fn disconnect_all(&mut self) {
        for (vnet, sub) in self.subscriptions.iter_mut() {
            if sub.state != LogState::Unsubscribed {
                debug!(%vnet, resume = sub.resume, "log subscription dropped");
            }
            sub.state = LogState::Unsubscribed;
            sub.buffered.clear();
            sub.restart_resync = false;
            sub.unacked = None;
            sub.since_checkpoint = 0;
        }
    }
}

fn apply_in_order(
    sub: &mut Subscription,
    config: &LogConfig,
    record: LogRecord,
    now: Instant,
    actions: &mut Vec<LogAction>,
) {
    let vnet = record.vnet;

    if record.seq != sub.expected {
        warn!(
            %vnet,
            expected = sub.expected,
            got = record.seq,
            "log sequence gap, resynchronizing"
        );
        sub.state = LogState::Resynchronizing;
        sub.resume_from = record.seq;
        sub.unacked = None;
        sub.since_checkpoint = 0;
        sub.buffered.push(record);
        actions.push(LogAction::Resync {
            vnet,
            resume_from: record.seq,
        });
        return;
    }

    sub.expected = record.seq.wrapping_add(1);
    sub.unacked = Some(record.seq);
    sub.since_checkpoint += 1;
    actions.push(LogAction::Apply {
        vnet,
        seq: record.seq,
        record: record.record,
    });

    if sub.since_checkpoint >= config.checkpoint_every {
        if let Some(ack) = checkpoint(vnet, sub, now) {
            actions.push(LogAction::Checkpoint(ack));
        }
    }
}

fn checkpoint(vnet: VnetId, sub: &mut Subscription, now: Instant) -> Option<LogAck> {
    let seq = sub.unacked.take()?;
    sub.since_checkpoint = 0;
    sub.last_checkpoint = now;
    sub.resume = seq.wrapping_add(1);
    Some(LogAck { vnet, seq })
}
