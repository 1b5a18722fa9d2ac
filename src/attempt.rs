//! A single run of one transport kind.
//!
//! `Opening -> Handshaking -> Streaming -> Closed(reason)`. The attempt
//! owns its link for the duration of the run and emits typed events onto a
//! channel consumed by the supervisor loop; exactly one `Closed` is sent
//! per attempt, whatever ends it.

use crate::codec::{self, WireEnvelope};
use crate::transport::TransportLink;
use crate::types::{FeedConfig, Signal};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    RemoteClosed,
    Timeout,
    FaultRateExceeded,
    Cancelled,
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote-closed"),
            Self::Timeout => write!(f, "timeout"),
            Self::FaultRateExceeded => write!(f, "fault-rate-exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Transport(message) => write!(f, "transport: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptEvent {
    /// Handshake done, frames are flowing. The supervisor maps this to
    /// `Connected` and resets backoff.
    Streaming,
    /// Validated records, in arrival order.
    Signals(Vec<Signal>),
    /// Non-fatal advisory (publisher fault frame or a discarded malformed
    /// frame).
    Advisory(String),
    Closed(CloseReason),
}

/// Sliding window over recent frame outcomes. A handful of bad frames is
/// tolerated; a sustained fault rate closes the attempt so a corrupt or
/// hostile stream cannot spin forever.
#[derive(Debug)]
pub struct FaultWindow {
    outcomes: VecDeque<bool>,
    window: usize,
    max_faults: usize,
    faults: usize,
}

impl FaultWindow {
    pub fn new(window: usize, max_faults: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(window),
            window: window.max(1),
            max_faults: max_faults.max(1),
            faults: 0,
        }
    }

    fn push(&mut self, is_fault: bool) {
        self.outcomes.push_back(is_fault);
        if is_fault {
            self.faults += 1;
        }
        while self.outcomes.len() > self.window {
            if self.outcomes.pop_front() == Some(true) {
                self.faults -= 1;
            }
        }
    }

    pub fn record_ok(&mut self) {
        self.push(false);
    }

    /// Returns whether the fault budget for the window is now exhausted.
    pub fn record_fault(&mut self) -> bool {
        self.push(true);
        self.faults >= self.max_faults
    }

    pub fn faults(&self) -> usize {
        self.faults
    }
}

#[derive(Debug, Clone)]
pub struct AttemptConfig {
    pub channel: String,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub fault_window: usize,
    pub max_faults_per_window: usize,
}

impl AttemptConfig {
    pub fn from_feed(config: &FeedConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            fault_window: config.fault_window,
            max_faults_per_window: config.max_faults_per_window,
        }
    }
}

pub struct ConnectionAttempt {
    link: TransportLink,
    config: AttemptConfig,
}

impl ConnectionAttempt {
    pub fn new(link: TransportLink, config: AttemptConfig) -> Self {
        Self { link, config }
    }

    /// Drives the attempt to completion. Consumes the attempt; nothing
    /// survives past the final `Closed` event.
    pub async fn run(mut self, events: mpsc::Sender<AttemptEvent>, cancel: CancellationToken) {
        let reason = self.stream(&events, &cancel).await;
        self.link.shutdown().await;
        tracing::debug!(reason = %reason, "connection attempt closed");
        let _ = events.send(AttemptEvent::Closed(reason)).await;
    }

    async fn stream(
        &mut self,
        events: &mpsc::Sender<AttemptEvent>,
        cancel: &CancellationToken,
    ) -> CloseReason {
        if self.link.is_duplex() {
            let handshake = match codec::encode_subscribe(&self.config.channel) {
                Ok(frame) => frame,
                Err(error) => return CloseReason::Transport(error.to_string()),
            };
            if let Err(error) = self.link.send(&handshake).await {
                return CloseReason::Transport(error.to_string());
            }
        }

        if events.send(AttemptEvent::Streaming).await.is_err() {
            return CloseReason::Cancelled;
        }

        let mut faults = FaultWindow::new(self.config.fault_window, self.config.max_faults_per_window);
        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_traffic = Instant::now();
        let mut pending_echo: Option<i64> = None;

        loop {
            let idle_deadline = last_traffic + self.config.idle_timeout;

            tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = tokio::time::sleep_until(idle_deadline) => return CloseReason::Timeout,
                _ = heartbeat.tick() => {
                    if !self.link.is_duplex() {
                        continue;
                    }
                    let probe_time = now_unix_ms();
                    let probe = match codec::encode_ping(probe_time) {
                        Ok(frame) => frame,
                        Err(error) => return CloseReason::Transport(error.to_string()),
                    };
                    if let Err(error) = self.link.send(&probe).await {
                        return CloseReason::Transport(error.to_string());
                    }
                    pending_echo = Some(probe_time);
                }
                inbound = self.link.recv() => {
                    let Some(frame_result) = inbound else {
                        return CloseReason::RemoteClosed;
                    };
                    let frame = match frame_result {
                        Ok(frame) => frame,
                        Err(error) => return CloseReason::Transport(error.to_string()),
                    };

                    last_traffic = Instant::now();
                    let mut payload = frame.into_bytes();
                    match codec::decode(&mut payload) {
                        WireEnvelope::Signal(signal) => {
                            faults.record_ok();
                            if events.send(AttemptEvent::Signals(vec![signal])).await.is_err() {
                                return CloseReason::Cancelled;
                            }
                        }
                        WireEnvelope::SignalBatch(signals) => {
                            faults.record_ok();
                            if !signals.is_empty()
                                && events.send(AttemptEvent::Signals(signals)).await.is_err()
                            {
                                return CloseReason::Cancelled;
                            }
                        }
                        WireEnvelope::Heartbeat { t } => {
                            faults.record_ok();
                            if pending_echo == Some(t) {
                                pending_echo = None;
                                tracing::trace!(t, "heartbeat echo matched");
                            }
                        }
                        WireEnvelope::Fault { message } => {
                            let exhausted = faults.record_fault();
                            tracing::debug!(
                                fault = %message,
                                window_faults = faults.faults(),
                                "frame discarded"
                            );
                            if events.send(AttemptEvent::Advisory(message)).await.is_err() {
                                return CloseReason::Cancelled;
                            }
                            if exhausted {
                                return CloseReason::FaultRateExceeded;
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
