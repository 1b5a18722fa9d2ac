//! Top-level orchestration: the reconnect loop.
//!
//! One supervisor owns at most one live subscription. The loop task is the
//! only place consumer callbacks fire and the only mutator of the buffer
//! and status store; attempts talk to it exclusively through their event
//! channel.

use crate::attempt::{AttemptConfig, AttemptEvent, ConnectionAttempt};
use crate::backoff::BackoffPolicy;
use crate::buffer::DedupBuffer;
use crate::cascade;
use crate::error::FeedError;
use crate::gate::VisibilityGate;
use crate::transport::{self, CapabilityProbe, RuntimeProbe, TransportKind};
use crate::types::{ConnectionState, FeedConfig, FeedStatusSnapshot, Signal, SubscribeArgs};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const ATTEMPT_EVENT_CAPACITY: usize = 64;
const STATUS_THROTTLE_MS: u64 = 500;

/// Receives status changes and accepted records, in the order they occur.
/// Callbacks are invoked from the subscription's loop task only; after
/// `cancel()` returns, no callback ever fires again.
pub trait FeedConsumer: Send + Sync + 'static {
    fn on_status(&self, status: &FeedStatusSnapshot);
    fn on_signal(&self, signal: &Signal);
}

struct SubscriptionShared {
    status: RwLock<FeedStatusSnapshot>,
    buffer: SyncMutex<DedupBuffer>,
}

/// Read handle for one subscription. Reads never contend with delivery
/// beyond a short lock on the buffer.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub async fn status(&self) -> FeedStatusSnapshot {
        self.shared.status.read().await.clone()
    }

    pub fn latest(&self) -> Option<Signal> {
        self.shared.buffer.lock().latest().cloned()
    }

    /// Ordered snapshot, newest first.
    pub fn snapshot(&self) -> Vec<Signal> {
        self.shared.buffer.lock().snapshot()
    }

    pub fn snapshot_where<F>(&self, predicate: F) -> Vec<Signal>
    where
        F: Fn(&Signal) -> bool,
    {
        self.shared.buffer.lock().snapshot_where(predicate)
    }
}

struct ActiveSubscription {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    shared: Arc<SubscriptionShared>,
}

/// Explicitly constructed, caller-owned supervisor. No process-wide state:
/// everything lives between `subscribe()` and `cancel()`. Run several
/// independent channels by constructing several supervisors.
pub struct ConnectionSupervisor {
    probe: Arc<dyn CapabilityProbe>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(RuntimeProbe))
    }

    pub fn with_probe(probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            active: Mutex::new(None),
        }
    }

    /// Starts (or replaces) the subscription. Configuration problems,
    /// including having no usable transport endpoint at all, are reported
    /// here before any connection work begins.
    pub async fn subscribe(
        &self,
        args: SubscribeArgs,
        consumer: Arc<dyn FeedConsumer>,
        gate: Option<VisibilityGate>,
    ) -> Result<Subscription, FeedError> {
        let config = args.normalize()?;
        if cascade::plan(&config.endpoints, self.probe.as_ref()).is_empty() {
            return Err(FeedError::NoUsableTransport(config.channel));
        }

        let previous = {
            let mut slot = self.active.lock().await;
            slot.take()
        };
        if let Some(active) = previous {
            finalize(active, "replaced by new subscription").await;
        }

        let shared = Arc::new(SubscriptionShared {
            status: RwLock::new(FeedStatusSnapshot::idle(config.channel.clone())),
            buffer: SyncMutex::new(DedupBuffer::new(config.buffer_capacity)),
        });

        let token = CancellationToken::new();
        let context = LoopContext {
            config,
            shared: Arc::clone(&shared),
            consumer,
            probe: Arc::clone(&self.probe),
            cancel: token.clone(),
            throttle: StatusThrottle::default(),
            current_transport: None,
        };
        let join = tokio::spawn(run_subscription(context, gate));

        {
            let mut slot = self.active.lock().await;
            *slot = Some(ActiveSubscription {
                token,
                join,
                shared: Arc::clone(&shared),
            });
        }

        Ok(Subscription { shared })
    }

    /// Ends the subscription for good: terminal `Failed`, all timers and
    /// in-flight attempts stopped. Returns whether anything was active.
    pub async fn cancel(&self) -> bool {
        let previous = {
            let mut slot = self.active.lock().await;
            slot.take()
        };
        match previous {
            Some(active) => {
                finalize(active, "cancelled by caller").await;
                true
            }
            None => false,
        }
    }
}

async fn finalize(active: ActiveSubscription, reason: &str) {
    active.token.cancel();
    let _ = active.join.await;

    let mut status = active.shared.status.write().await;
    status.state = ConnectionState::Failed;
    status.transport = None;
    status.reason = Some(reason.to_string());
}

#[derive(Debug, Default)]
struct StatusThrottle {
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusThrottle {
    fn allow(&mut self, state: ConnectionState, reason: &Option<String>) -> bool {
        let now = Instant::now();
        let should_throttle = matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) || (state == ConnectionState::Connected && reason.is_some());

        if should_throttle
            && self.last_state == Some(state)
            && self.last_reason == *reason
            && self
                .last_emit
                .map(|at| now.duration_since(at) < Duration::from_millis(STATUS_THROTTLE_MS))
                .unwrap_or(false)
        {
            return false;
        }

        self.last_state = Some(state);
        self.last_reason = reason.clone();
        self.last_emit = Some(now);
        true
    }
}

struct LoopContext {
    config: FeedConfig,
    shared: Arc<SubscriptionShared>,
    consumer: Arc<dyn FeedConsumer>,
    probe: Arc<dyn CapabilityProbe>,
    cancel: CancellationToken,
    throttle: StatusThrottle,
    current_transport: Option<TransportKind>,
}

impl LoopContext {
    async fn publish(&mut self, state: ConnectionState, reason: Option<String>) {
        let snapshot = FeedStatusSnapshot {
            state,
            channel: self.config.channel.clone(),
            transport: self.current_transport,
            reason,
        };

        {
            let mut writable = self.shared.status.write().await;
            *writable = snapshot.clone();
        }

        if !self.cancel.is_cancelled() {
            self.consumer.on_status(&snapshot);
        }
    }

    async fn publish_throttled(&mut self, state: ConnectionState, reason: Option<String>) {
        if !self.throttle.allow(state, &reason) {
            return;
        }
        self.publish(state, reason).await;
    }

    fn deliver(&self, signals: Vec<Signal>) {
        for signal in signals {
            let accepted = self.shared.buffer.lock().offer(signal.clone());
            if accepted && !self.cancel.is_cancelled() {
                self.consumer.on_signal(&signal);
            }
        }
    }
}

enum CycleEnd {
    Cancelled,
    GateClosed,
    Failed(String),
}

async fn gate_closed(gate: &mut Option<VisibilityGate>) {
    match gate {
        Some(gate) => gate.wait_closed().await,
        None => futures_util::future::pending().await,
    }
}

async fn run_subscription(mut ctx: LoopContext, mut gate: Option<VisibilityGate>) {
    let mut backoff = BackoffPolicy::from_config(&ctx.config);

    while !ctx.cancel.is_cancelled() {
        if let Some(visibility) = gate.as_mut() {
            if !visibility.is_open() {
                ctx.publish(
                    ConnectionState::Suspended,
                    Some("consumer not observing".to_string()),
                )
                .await;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = visibility.wait_open() => {}
                }
                if ctx.cancel.is_cancelled() {
                    break;
                }
                // Resume immediately once; later retries follow backoff.
                tracing::info!(channel = %ctx.config.channel, "visibility restored, resuming");
            }
        }

        match run_cycle(&mut ctx, &mut gate, &mut backoff).await {
            CycleEnd::Cancelled => break,
            CycleEnd::GateClosed => continue,
            CycleEnd::Failed(reason) => {
                let delay = backoff.next_delay();
                ctx.publish(ConnectionState::Reconnecting, Some(reason)).await;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = gate_closed(&mut gate) => continue,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One reconnect cycle: try each planned transport kind exactly once until
/// one streams. Returns how the cycle ended; `Failed` covers both cascade
/// exhaustion and a live connection dropping.
async fn run_cycle(
    ctx: &mut LoopContext,
    gate: &mut Option<VisibilityGate>,
    backoff: &mut BackoffPolicy,
) -> CycleEnd {
    let plan = cascade::plan(&ctx.config.endpoints, ctx.probe.as_ref());
    let connect_timeout = Duration::from_millis(ctx.config.connect_timeout_ms);

    for step in plan.steps() {
        if ctx.cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }

        let kind = step.kind.as_str();
        ctx.publish_throttled(
            ConnectionState::Connecting,
            Some(format!("trying {kind} transport")),
        )
        .await;

        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => return CycleEnd::Cancelled,
            _ = gate_closed(gate) => return CycleEnd::GateClosed,
            opened = tokio::time::timeout(
                connect_timeout,
                transport::open(step.kind, &step.endpoint, &ctx.config.channel),
            ) => opened,
        };

        let link = match opened {
            Err(_elapsed) => {
                tracing::warn!(kind, endpoint = %step.endpoint, "connect timed out");
                ctx.publish_throttled(
                    ConnectionState::Connecting,
                    Some(format!("{kind} connect timed out")),
                )
                .await;
                continue;
            }
            Ok(Err(error)) => {
                tracing::warn!(kind, endpoint = %step.endpoint, error = %error, "connect failed");
                ctx.publish_throttled(
                    ConnectionState::Connecting,
                    Some(format!("{kind} connect failed: {error}")),
                )
                .await;
                continue;
            }
            Ok(Ok(link)) => link,
        };

        ctx.current_transport = Some(step.kind);
        let (events_tx, mut events_rx) = mpsc::channel(ATTEMPT_EVENT_CAPACITY);
        let attempt_cancel = ctx.cancel.child_token();
        let attempt = ConnectionAttempt::new(link, AttemptConfig::from_feed(&ctx.config));
        let attempt_task = tokio::spawn(attempt.run(events_tx, attempt_cancel.clone()));

        let mut reached_streaming = false;
        let mut close_reason: Option<String> = None;
        let mut gate_interrupted = false;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    attempt_cancel.cancel();
                    drain_until_closed(&mut events_rx).await;
                    break;
                }
                _ = gate_closed(gate) => {
                    attempt_cancel.cancel();
                    drain_until_closed(&mut events_rx).await;
                    gate_interrupted = true;
                    break;
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        AttemptEvent::Streaming => {
                            reached_streaming = true;
                            backoff.reset();
                            tracing::info!(kind, channel = %ctx.config.channel, "transport streaming");
                            ctx.publish(
                                ConnectionState::Connected,
                                Some(format!("{kind} transport streaming")),
                            )
                            .await;
                        }
                        AttemptEvent::Signals(signals) => ctx.deliver(signals),
                        AttemptEvent::Advisory(message) => {
                            ctx.publish_throttled(ConnectionState::Connected, Some(message)).await;
                        }
                        AttemptEvent::Closed(reason) => {
                            close_reason = Some(reason.to_string());
                            break;
                        }
                    }
                }
            }
        }

        let _ = attempt_task.await;
        ctx.current_transport = None;

        if ctx.cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }
        if gate_interrupted {
            return CycleEnd::GateClosed;
        }
        if reached_streaming {
            let reason = close_reason.unwrap_or_else(|| "stream ended".to_string());
            return CycleEnd::Failed(format!("{kind} stream closed: {reason}"));
        }
        // Closed before streaming: fall through to the next kind.
    }

    CycleEnd::Failed("transport cascade exhausted".to_string())
}

async fn drain_until_closed(events: &mut mpsc::Receiver<AttemptEvent>) {
    loop {
        match events.recv().await {
            None | Some(AttemptEvent::Closed(_)) => return,
            Some(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::visibility_gate;
    use crate::transport::TransportEndpoints;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingConsumer {
        statuses: SyncMutex<Vec<FeedStatusSnapshot>>,
        signals: SyncMutex<Vec<Signal>>,
    }

    impl RecordingConsumer {
        fn states(&self) -> Vec<ConnectionState> {
            self.statuses.lock().iter().map(|s| s.state).collect()
        }

        fn signal_count(&self) -> usize {
            self.signals.lock().len()
        }

        fn status_count(&self) -> usize {
            self.statuses.lock().len()
        }
    }

    impl FeedConsumer for RecordingConsumer {
        fn on_status(&self, status: &FeedStatusSnapshot) {
            self.statuses.lock().push(status.clone());
        }

        fn on_signal(&self, signal: &Signal) {
            self.signals.lock().push(signal.clone());
        }
    }

    async fn wait_until<F>(condition: F)
    where
        F: Fn() -> bool,
    {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition within deadline");
    }

    fn datagram_args(channel: &str, endpoint: &str) -> SubscribeArgs {
        SubscribeArgs {
            channel: channel.to_string(),
            endpoints: TransportEndpoints {
                datagram: Some(endpoint.to_string()),
                ..TransportEndpoints::default()
            },
            base_backoff_ms: Some(50),
            max_backoff_ms: Some(200),
            jitter_ms: Some(0),
            ..SubscribeArgs::default()
        }
    }

    fn refused_socket_args(channel: &str, base_backoff_ms: u64) -> SubscribeArgs {
        SubscribeArgs {
            channel: channel.to_string(),
            endpoints: TransportEndpoints {
                socket: Some("ws://127.0.0.1:1/feed".to_string()),
                ..TransportEndpoints::default()
            },
            base_backoff_ms: Some(base_backoff_ms),
            max_backoff_ms: Some(base_backoff_ms.max(30_000)),
            jitter_ms: Some(0),
            ..SubscribeArgs::default()
        }
    }

    #[tokio::test]
    async fn subscribe_without_endpoints_is_a_config_fault() {
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());

        let result = supervisor
            .subscribe(
                SubscribeArgs {
                    channel: "signals:test".to_string(),
                    ..SubscribeArgs::default()
                },
                consumer.clone(),
                None,
            )
            .await;

        assert!(matches!(result, Err(FeedError::NoUsableTransport(_))));
        // Rejected synchronously: no callbacks ever fired.
        assert_eq!(consumer.status_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_channel() {
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());

        let result = supervisor
            .subscribe(
                SubscribeArgs {
                    channel: "bad channel".to_string(),
                    endpoints: TransportEndpoints {
                        datagram: Some("127.0.0.1:9100".to_string()),
                        ..TransportEndpoints::default()
                    },
                    ..SubscribeArgs::default()
                },
                consumer,
                None,
            )
            .await;

        assert!(matches!(result, Err(FeedError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn datagram_end_to_end_delivers_deduped_newest_first() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind server");
        let endpoint = server.local_addr().expect("addr").to_string();

        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        let subscription = supervisor
            .subscribe(
                datagram_args("signals:udp", &endpoint),
                consumer.clone(),
                None,
            )
            .await
            .expect("subscribe");

        // The handshake announces the channel and reveals the peer address.
        let mut buf = [0_u8; 2_048];
        let (len, peer) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .expect("handshake within deadline")
            .expect("handshake recv");
        let handshake = std::str::from_utf8(&buf[..len]).expect("utf8 handshake");
        assert!(handshake.contains("subscribe"));
        assert!(handshake.contains("signals:udp"));

        for payload in [
            r#"{"op":"signal","data":{"id":"x","ts":100,"symbol":"BTCUSDT"}}"#,
            r#"{"op":"signal","data":{"id":"y","ts":200,"symbol":"BTCUSDT"}}"#,
            // Exact repeat of the first record: must be suppressed.
            r#"{"op":"signal","data":{"id":"x","ts":100,"symbol":"BTCUSDT"}}"#,
        ] {
            server.send_to(payload.as_bytes(), peer).await.expect("send");
        }

        wait_until(|| consumer.signal_count() == 2).await;

        let snapshot = subscription.snapshot();
        let timestamps: Vec<i64> = snapshot.iter().map(|s| s.ts).collect();
        assert_eq!(timestamps, vec![200, 100]);
        assert_eq!(subscription.latest().map(|s| s.ts), Some(200));

        let states = consumer.states();
        assert!(states.contains(&ConnectionState::Connecting));
        assert!(states.contains(&ConnectionState::Connected));
        assert_eq!(
            subscription.status().await.state,
            ConnectionState::Connected
        );

        assert!(supervisor.cancel().await);
        assert_eq!(subscription.status().await.state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn failed_cycles_publish_reconnecting_and_retry() {
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        let subscription = supervisor
            .subscribe(
                refused_socket_args("signals:down", 50),
                consumer.clone(),
                None,
            )
            .await
            .expect("subscribe");

        wait_until(|| {
            consumer
                .states()
                .iter()
                .filter(|state| **state == ConnectionState::Reconnecting)
                .count()
                >= 2
        })
        .await;

        let states = consumer.states();
        assert!(!states.contains(&ConnectionState::Connected));
        assert_eq!(
            subscription.status().await.state,
            ConnectionState::Reconnecting
        );

        supervisor.cancel().await;
    }

    #[tokio::test]
    async fn reconnecting_is_published_once_per_cycle() {
        // Two dead transports in the cascade: one cycle still yields one
        // Reconnecting transition.
        let args = SubscribeArgs {
            channel: "signals:multi".to_string(),
            endpoints: TransportEndpoints {
                datagram: None,
                socket: Some("ws://127.0.0.1:1/feed".to_string()),
                push: Some("http://127.0.0.1:1/stream".to_string()),
            },
            base_backoff_ms: Some(2_000),
            max_backoff_ms: Some(30_000),
            jitter_ms: Some(0),
            ..SubscribeArgs::default()
        };

        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        supervisor
            .subscribe(args, consumer.clone(), None)
            .await
            .expect("subscribe");

        wait_until(|| {
            consumer
                .states()
                .contains(&ConnectionState::Reconnecting)
        })
        .await;

        // Well inside the first 2s backoff window: exactly one cycle ran.
        let reconnecting = consumer
            .states()
            .iter()
            .filter(|state| **state == ConnectionState::Reconnecting)
            .count();
        assert_eq!(reconnecting, 1);

        supervisor.cancel().await;
    }

    #[tokio::test]
    async fn cancel_mid_backoff_is_final_and_silent() {
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        let subscription = supervisor
            .subscribe(
                refused_socket_args("signals:cancel", 5_000),
                consumer.clone(),
                None,
            )
            .await
            .expect("subscribe");

        wait_until(|| {
            consumer
                .states()
                .contains(&ConnectionState::Reconnecting)
        })
        .await;

        assert!(supervisor.cancel().await);
        let observed = consumer.status_count();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(consumer.status_count(), observed);
        assert_eq!(consumer.signal_count(), 0);
        assert_eq!(subscription.status().await.state, ConnectionState::Failed);

        // Second cancel is a no-op.
        assert!(!supervisor.cancel().await);
    }

    #[tokio::test]
    async fn closed_gate_suspends_until_observed() {
        let (handle, gate) = visibility_gate(false);
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        let subscription = supervisor
            .subscribe(
                refused_socket_args("signals:hidden", 50),
                consumer.clone(),
                Some(gate),
            )
            .await
            .expect("subscribe");

        wait_until(|| consumer.states().contains(&ConnectionState::Suspended)).await;
        assert_eq!(
            subscription.status().await.state,
            ConnectionState::Suspended
        );
        // No connection work happened while unobserved.
        assert!(!consumer.states().contains(&ConnectionState::Connecting));

        handle.set_observed(true);
        wait_until(|| consumer.states().contains(&ConnectionState::Connecting)).await;

        supervisor.cancel().await;
    }

    #[tokio::test]
    async fn gate_reopen_bypasses_remaining_backoff_once() {
        let (handle, gate) = visibility_gate(true);
        let supervisor = ConnectionSupervisor::new();
        let consumer = Arc::new(RecordingConsumer::default());
        supervisor
            .subscribe(
                refused_socket_args("signals:nap", 10_000),
                consumer.clone(),
                Some(gate),
            )
            .await
            .expect("subscribe");

        wait_until(|| {
            consumer
                .states()
                .contains(&ConnectionState::Reconnecting)
        })
        .await;

        // Close the gate during the long backoff wait.
        handle.set_observed(false);
        wait_until(|| consumer.states().contains(&ConnectionState::Suspended)).await;
        let connecting_before = consumer
            .states()
            .iter()
            .filter(|state| **state == ConnectionState::Connecting)
            .count();

        // Reopening resumes well before the 10s backoff would elapse.
        handle.set_observed(true);
        wait_until(|| {
            consumer
                .states()
                .iter()
                .filter(|state| **state == ConnectionState::Connecting)
                .count()
                > connecting_before
        })
        .await;

        supervisor.cancel().await;
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscription() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind server");
        let endpoint = server.local_addr().expect("addr").to_string();

        let supervisor = ConnectionSupervisor::new();
        let first_consumer = Arc::new(RecordingConsumer::default());
        let first = supervisor
            .subscribe(
                datagram_args("signals:first", &endpoint),
                first_consumer.clone(),
                None,
            )
            .await
            .expect("first subscribe");

        let second_consumer = Arc::new(RecordingConsumer::default());
        let _second = supervisor
            .subscribe(
                datagram_args("signals:second", &endpoint),
                second_consumer.clone(),
                None,
            )
            .await
            .expect("second subscribe");

        // The replaced subscription is terminal and silent.
        assert_eq!(first.status().await.state, ConnectionState::Failed);
        let first_statuses = first_consumer.status_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first_consumer.status_count(), first_statuses);

        assert!(supervisor.cancel().await);
    }
}
