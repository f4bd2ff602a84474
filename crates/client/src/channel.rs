// crates/client/src/channel.rs
//! Reconnecting push connection with snapshot resync.
//!
//! Every connection attempt gets a new generation. Within a generation the
//! snapshot is always delivered before any live event, and the consumer
//! uses the generation to drop anything left over from an older connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobcast_types::{JobEvent, JobSnapshot};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::TransportError;
use crate::transport::{decode_event, JobTransport};

/// Lifecycle of an [`EventChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a reconnect is pending.
    Disconnected,
    /// Attempt `attempt` (1-based, counting consecutive failures) in flight.
    Connecting { attempt: u32 },
    /// Snapshot applied, live events flowing.
    Connected { generation: u64 },
    /// Retry budget spent. Stays here until [`EventChannel::retry`].
    Failed,
    /// Shut down by [`EventChannel::close`].
    Closed,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// What the channel hands to its consumer, tagged with the generation of
/// the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelUpdate {
    Snapshot { generation: u64, snapshot: JobSnapshot },
    Event { generation: u64, event: JobEvent },
}

impl ChannelUpdate {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Snapshot { generation, .. } | Self::Event { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub backoff: BackoffConfig,
    /// Updates buffered between the connection task and the consumer.
    pub update_buffer: usize,
    /// Limit on opening the push connection. A hung handshake counts as a
    /// failed attempt.
    pub connect_timeout: Duration,
    /// Limit on fetching the snapshot after connecting.
    pub snapshot_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            update_buffer: 1024,
            connect_timeout: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(15),
        }
    }
}

/// Handle to the background connection task.
///
/// Dropping the handle closes the channel.
pub struct EventChannel {
    state_rx: watch::Receiver<ConnectionState>,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
    retry: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl EventChannel {
    /// Start connecting. Updates arrive on the returned receiver in order.
    pub fn open(
        transport: Arc<dyn JobTransport>,
        config: ChannelConfig,
    ) -> (Self, mpsc::Receiver<ChannelUpdate>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (updates_tx, updates_rx) = mpsc::channel(config.update_buffer.max(1));
        let generation = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let retry = Arc::new(Notify::new());

        let driver = Driver {
            transport,
            backoff: Backoff::new(config.backoff),
            connect_timeout: config.connect_timeout,
            snapshot_timeout: config.snapshot_timeout,
            state_tx,
            updates_tx,
            generation: Arc::clone(&generation),
            cancel: cancel.clone(),
            retry: Arc::clone(&retry),
        };
        let task = tokio::spawn(driver.run());

        (
            Self {
                state_rx,
                generation,
                cancel,
                retry,
                task: Some(task),
            },
            updates_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Generation of the most recent connection attempt.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Restart a channel that gave up. Returns false unless it was `Failed`.
    pub fn retry(&self) -> bool {
        if self.state() != ConnectionState::Failed {
            return false;
        }
        self.retry.notify_one();
        true
    }

    /// Stop the connection task. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close and wait for the connection task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("event channel task failed: {e}");
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How one connected session ended.
enum SessionEnd {
    /// Server closed the stream.
    Closed,
    /// Server asked for a fresh snapshot.
    Resync,
    /// Nobody is reading updates any more.
    ConsumerGone,
}

struct Driver {
    transport: Arc<dyn JobTransport>,
    backoff: Backoff,
    connect_timeout: Duration,
    snapshot_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    updates_tx: mpsc::Sender<ChannelUpdate>,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
    retry: Arc<Notify>,
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.state_tx.send_replace(ConnectionState::Connecting {
                attempt: self.backoff.attempt() + 1,
            });

            let ended = tokio::select! {
                _ = cancel.cancelled() => break,
                ended = self.session(generation) => ended,
            };

            match ended {
                Ok(SessionEnd::ConsumerGone) => break,
                Ok(SessionEnd::Resync) => {
                    tracing::info!(generation, "server requested resync, reconnecting");
                    continue;
                }
                Ok(SessionEnd::Closed) => {
                    tracing::info!(generation, "job event stream closed by server");
                }
                Err(e) => {
                    tracing::warn!(generation, attempt = self.backoff.attempt() + 1, "job event connection failed: {e}");
                }
            }
            self.state_tx.send_replace(ConnectionState::Disconnected);

            match self.backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tracing::error!(
                        attempts = self.backoff.attempt(),
                        "live job updates unavailable, giving up until retried"
                    );
                    self.state_tx.send_replace(ConnectionState::Failed);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.retry.notified() => self.backoff.reset(),
                    }
                }
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    async fn session(&mut self, generation: u64) -> Result<SessionEnd, TransportError> {
        // Subscribe first so no event falls between snapshot and stream.
        let mut source = tokio::time::timeout(self.connect_timeout, self.transport.connect())
            .await
            .map_err(|_| TransportError::Timeout("connect", self.connect_timeout))??;
        let snapshot = tokio::time::timeout(self.snapshot_timeout, self.transport.snapshot())
            .await
            .map_err(|_| TransportError::Timeout("snapshot", self.snapshot_timeout))??;

        if self
            .updates_tx
            .send(ChannelUpdate::Snapshot {
                generation,
                snapshot,
            })
            .await
            .is_err()
        {
            return Ok(SessionEnd::ConsumerGone);
        }
        self.state_tx
            .send_replace(ConnectionState::Connected { generation });
        self.backoff.reset();
        tracing::info!(generation, "job event channel connected");

        loop {
            match source.next_frame().await {
                Ok(Some(frame)) => match decode_event(&frame) {
                    Ok(event) => {
                        if self
                            .updates_tx
                            .send(ChannelUpdate::Event { generation, event })
                            .await
                            .is_err()
                        {
                            return Ok(SessionEnd::ConsumerGone);
                        }
                    }
                    Err(e) => tracing::warn!(generation, "skipping frame: {e}"),
                },
                Ok(None) => return Ok(SessionEnd::Closed),
                Err(TransportError::Resync) => return Ok(SessionEnd::Resync),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use jobcast_types::Job;

    use crate::transport::EventSource;

    pub(crate) type Frame = Result<Option<String>, TransportError>;

    /// Transport whose connections are scripted by the test.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        connects: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<Frame>, TransportError>>>,
        snapshot: Mutex<JobSnapshot>,
        pub(crate) connect_calls: AtomicU64,
    }

    impl ScriptedTransport {
        /// Queue a successful connection; frames are pushed through the sender.
        pub(crate) fn accept(&self) -> mpsc::UnboundedSender<Frame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.connects.lock().unwrap().push_back(Ok(rx));
            tx
        }

        pub(crate) fn refuse(&self, times: usize) {
            let mut connects = self.connects.lock().unwrap();
            for _ in 0..times {
                connects.push_back(Err(TransportError::Connect("refused".into())));
            }
        }

        pub(crate) fn set_snapshot(&self, snapshot: JobSnapshot) {
            *self.snapshot.lock().unwrap() = snapshot;
        }
    }

    struct ScriptedSource {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
            match self.rx.recv().await {
                Some(frame) => frame,
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl JobTransport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn EventSource>, TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.connects.lock().unwrap().pop_front();
            match next {
                Some(Ok(rx)) => Ok(Box::new(ScriptedSource { rx })),
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Connect("no scripted connection".into())),
            }
        }

        async fn snapshot(&self) -> Result<JobSnapshot, TransportError> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    pub(crate) fn fast_config(max_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                jitter: 0.0,
                max_attempts,
            },
            update_buffer: 64,
            connect_timeout: Duration::from_millis(200),
            snapshot_timeout: Duration::from_millis(200),
        }
    }

    pub(crate) fn progress_frame(runner_id: &str, current_task: u64) -> Frame {
        Ok(Some(format!(
            r#"{{"kind":"JobProgress","runnerId":"{runner_id}","currentTask":{current_task}}}"#
        )))
    }

    async fn wait_for(
        state: &mut watch::Receiver<ConnectionState>,
        pred: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let state = tokio::time::timeout(Duration::from_secs(5), state.wait_for(pred))
            .await
            .expect("state reached in time")
            .expect("channel task alive");
        *state
    }

    #[tokio::test]
    async fn test_snapshot_precedes_events() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.set_snapshot(JobSnapshot {
            running: vec![Job::running("r1", "scan", 10)],
            ..JobSnapshot::default()
        });
        let frames = transport.accept();
        frames.send(progress_frame("r1", 4)).unwrap();

        let (channel, mut updates) = EventChannel::open(transport.clone(), fast_config(3));

        match updates.recv().await.unwrap() {
            ChannelUpdate::Snapshot {
                generation,
                snapshot,
            } => {
                assert_eq!(generation, 1);
                assert_eq!(snapshot.running[0].runner_id, "r1");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert_eq!(
            updates.recv().await.unwrap(),
            ChannelUpdate::Event {
                generation: 1,
                event: JobEvent::JobProgress {
                    runner_id: "r1".into(),
                    current_task: 4,
                },
            }
        );
        assert_eq!(channel.state(), ConnectionState::Connected { generation: 1 });
        channel.close();
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let transport = Arc::new(ScriptedTransport::default());
        let frames = transport.accept();
        frames.send(Ok(Some("{not json".into()))).unwrap();
        frames
            .send(Ok(Some(r#"{"kind":"Mystery","runnerId":"r1"}"#.into())))
            .unwrap();
        frames.send(progress_frame("r1", 1)).unwrap();

        let (channel, mut updates) = EventChannel::open(transport, fast_config(3));
        assert!(matches!(
            updates.recv().await.unwrap(),
            ChannelUpdate::Snapshot { .. }
        ));
        assert!(matches!(
            updates.recv().await.unwrap(),
            ChannelUpdate::Event {
                event: JobEvent::JobProgress { current_task: 1, .. },
                ..
            }
        ));
        channel.close();
    }

    #[tokio::test]
    async fn test_reconnect_bumps_generation_and_refetches_snapshot() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.accept();
        let second = transport.accept();

        let (channel, mut updates) = EventChannel::open(transport.clone(), fast_config(3));
        assert_eq!(updates.recv().await.unwrap().generation(), 1);

        first
            .send(Err(TransportError::Disconnected("reset".into())))
            .unwrap();

        let update = updates.recv().await.unwrap();
        assert!(matches!(update, ChannelUpdate::Snapshot { generation: 2, .. }));

        second.send(progress_frame("r1", 2)).unwrap();
        assert_eq!(updates.recv().await.unwrap().generation(), 2);
        assert_eq!(channel.generation(), 2);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
        channel.close();
    }

    #[tokio::test]
    async fn test_resync_reconnects_immediately() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.accept();
        let _second = transport.accept();

        let (channel, mut updates) = EventChannel::open(
            transport,
            ChannelConfig {
                backoff: BackoffConfig {
                    base: Duration::from_secs(3600),
                    cap: Duration::from_secs(3600),
                    jitter: 0.0,
                    max_attempts: 3,
                },
                update_buffer: 8,
                ..ChannelConfig::default()
            },
        );
        assert_eq!(updates.recv().await.unwrap().generation(), 1);

        first.send(Err(TransportError::Resync)).unwrap();
        // A backoff of an hour would time this out.
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("immediate resync")
            .unwrap();
        assert!(matches!(update, ChannelUpdate::Snapshot { generation: 2, .. }));
        channel.close();
    }

    #[tokio::test]
    async fn test_gives_up_after_budget_then_retry_recovers() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.refuse(3);

        let (channel, mut updates) = EventChannel::open(transport.clone(), fast_config(2));
        let mut state = channel.watch_state();
        wait_for(&mut state, |s| *s == ConnectionState::Failed).await;
        // Initial attempt plus two retries.
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 3);
        assert!(!channel.state().is_live());

        let _frames = transport.accept();
        assert!(channel.retry());
        let update = updates.recv().await.unwrap();
        assert!(matches!(update, ChannelUpdate::Snapshot { generation: 4, .. }));
        wait_for(&mut state, ConnectionState::is_live).await;
        assert!(!channel.retry());
        channel.close();
    }

    /// Accepts nothing and never answers.
    struct SilentTransport {
        connect_calls: AtomicU64,
    }

    #[async_trait]
    impl JobTransport for SilentTransport {
        async fn connect(&self) -> Result<Box<dyn EventSource>, TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn snapshot(&self) -> Result<JobSnapshot, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_connect_counts_as_failed_attempt() {
        let transport = Arc::new(SilentTransport {
            connect_calls: AtomicU64::new(0),
        });
        let mut config = fast_config(2);
        config.connect_timeout = Duration::from_millis(20);

        let (channel, _updates) = EventChannel::open(transport.clone(), config);
        let mut state = channel.watch_state();
        wait_for(&mut state, |s| *s == ConnectionState::Failed).await;
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 3);
        channel.close();
    }

    #[tokio::test]
    async fn test_hung_snapshot_counts_as_failed_attempt() {
        struct NoSnapshot(ScriptedTransport);

        #[async_trait]
        impl JobTransport for NoSnapshot {
            async fn connect(&self) -> Result<Box<dyn EventSource>, TransportError> {
                self.0.connect().await
            }

            async fn snapshot(&self) -> Result<JobSnapshot, TransportError> {
                std::future::pending().await
            }
        }

        let inner = ScriptedTransport::default();
        let _a = inner.accept();
        let _b = inner.accept();
        let mut config = fast_config(1);
        config.snapshot_timeout = Duration::from_millis(20);

        let (channel, mut updates) = EventChannel::open(Arc::new(NoSnapshot(inner)), config);
        let mut state = channel.watch_state();
        wait_for(&mut state, |s| *s == ConnectionState::Failed).await;
        channel.close();
        // Nothing reached the consumer without a snapshot.
        assert!(updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::default());
        let _frames = transport.accept();

        let (channel, mut updates) = EventChannel::open(transport, fast_config(3));
        assert!(matches!(
            updates.recv().await.unwrap(),
            ChannelUpdate::Snapshot { .. }
        ));

        let mut state = channel.watch_state();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        wait_for(&mut state, |s| *s == ConnectionState::Closed).await;
        assert!(updates.recv().await.is_none());
        channel.shutdown().await;
    }
}
