//! Client echo loop.
//!
//! Sends a sequence-numbered probe every interval and tracks each one in
//! an [`EchoLedger`] until it is either answered (one RTT sample) or its
//! own timer fires (one lost echo). A probe leaves the ledger on exactly
//! one of those paths.

use crate::measurements::MeasurementsCollector;
use crate::protocol::EchoProbe;
use crate::transport::EchoChannel;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// A probe that has been sent and is neither answered nor expired.
#[derive(Debug)]
pub struct PendingEcho {
    pub seq: u64,
    pub sent_at: Instant,
    key: Key,
}

/// Outstanding probes, each with an independent expiry timer.
#[derive(Debug)]
pub struct EchoLedger {
    pending: HashMap<u64, PendingEcho>,
    timers: DelayQueue<u64>,
    timeout: Duration,
    next_seq: u64,
}

impl EchoLedger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timers: DelayQueue::new(),
            timeout,
            next_seq: 0,
        }
    }

    /// Registers a new probe sent at `now` and returns its sequence number.
    pub fn send(&mut self, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.timers.insert_at(seq, now + self.timeout);
        self.pending.insert(
            seq,
            PendingEcho {
                seq,
                sent_at: now,
                key,
            },
        );
        seq
    }

    /// Matches a response. Returns the round-trip time, or `None` when the
    /// sequence is unknown (never sent, already answered or already expired).
    pub fn resolve(&mut self, seq: u64, now: Instant) -> Option<Duration> {
        let pending = self.pending.remove(&seq)?;
        self.timers.remove(&pending.key);
        Some(now.saturating_duration_since(pending.sent_at))
    }

    /// Waits for the next probe whose timer fires and removes it.
    ///
    /// Resolves to `None` immediately when nothing is pending.
    pub async fn next_expired(&mut self) -> Option<u64> {
        let expired = poll_fn(|cx| self.timers.poll_expired(cx)).await?;
        let seq = expired.into_inner();
        self.pending.remove(&seq);
        Some(seq)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every pending probe and its timer without counting it.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.timers.clear();
    }
}

/// Counters of one echo loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStats {
    pub sent: u64,
    pub answered: u64,
    pub lost: u64,
    /// Responses that matched no pending probe
    pub unmatched: u64,
    /// Probes still in flight when the loop stopped
    pub abandoned: u64,
    /// The loop ended because the channel failed, not on cancellation
    pub channel_lost: bool,
}

/// Timing parameters of the echo loop.
#[derive(Debug, Clone, Copy)]
pub struct EchoSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Reference point for sample timestamps
    pub run_start: Instant,
}

/// Runs the probe loop until `cancel` fires or the channel closes.
///
/// A channel that closes or fails first is reported through
/// [`EchoStats::channel_lost`].
pub async fn run_echo_loop(
    mut channel: EchoChannel,
    collector: MeasurementsCollector,
    settings: EchoSettings,
    cancel: CancellationToken,
) -> EchoStats {
    let mut ledger = EchoLedger::new(settings.timeout);
    let mut stats = EchoStats::default();
    let mut ticker = time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let since_start = |now: Instant| now.saturating_duration_since(settings.run_start).as_millis() as u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            response = channel.recv() => {
                let Some(response) = response else {
                    warn!("Echo channel closed by peer");
                    stats.channel_lost = true;
                    break;
                };
                let now = Instant::now();
                match ledger.resolve(response.seq, now) {
                    Some(rtt) => {
                        stats.answered += 1;
                        collector.record_rtt(rtt.as_secs_f64() * 1000.0, since_start(now));
                    }
                    None => {
                        stats.unmatched += 1;
                        debug!("Dropping unmatched echo seq={}", response.seq);
                    }
                }
            }
            Some(seq) = ledger.next_expired(), if !ledger.is_empty() => {
                stats.lost += 1;
                collector.record_echo_lost();
                debug!("Echo seq={} timed out", seq);
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let seq = ledger.send(now);
                let probe = EchoProbe { seq, t: since_start(now) };
                if let Err(e) = channel.send(probe).await {
                    ledger.resolve(seq, now);
                    warn!("Stopping echo loop: {}", e);
                    stats.channel_lost = true;
                    break;
                }
                stats.sent += 1;
                collector.record_echo_sent();
            }
        }
    }

    stats.abandoned = ledger.len() as u64;
    ledger.clear();
    channel.close().await;
    info!(
        "Echo loop stopped: {} sent, {} answered, {} lost",
        stats.sent, stats.answered, stats.lost
    );
    stats
}
