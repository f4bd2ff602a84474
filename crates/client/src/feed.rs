// crates/client/src/feed.rs
//! Ready-made consumer: channel, store and view wired together.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelConfig, ChannelUpdate, ConnectionState, EventChannel};
use crate::store::{ApplyOutcome, ClientJobStore, SideEffect};
use crate::transport::{JobTransport, WsTransport};
use crate::view::{JobView, DEFAULT_HISTORY_LIMIT};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub channel: ChannelConfig,
    pub history_limit: usize,
    /// Side effects buffered per receiver before older ones are skipped.
    pub side_effect_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            side_effect_buffer: 64,
        }
    }
}

/// Live, always-readable view of every job on a server.
///
/// The last derived view stays readable while the connection is down;
/// [`connection`](Self::connection) reports whether it is live.
pub struct JobFeed {
    channel: EventChannel,
    view_rx: watch::Receiver<Arc<JobView>>,
    effects_tx: broadcast::Sender<SideEffect>,
    task: JoinHandle<()>,
}

impl JobFeed {
    pub fn connect(transport: Arc<dyn JobTransport>, config: FeedConfig) -> Self {
        let (channel, updates) = EventChannel::open(transport, config.channel);
        let (view_tx, view_rx) = watch::channel(Arc::new(JobView::default()));
        let (effects_tx, _) = broadcast::channel(config.side_effect_buffer.max(1));

        let task = tokio::spawn(drive(
            updates,
            view_tx,
            effects_tx.clone(),
            config.history_limit,
        ));

        Self {
            channel,
            view_rx,
            effects_tx,
            task,
        }
    }

    /// Connect over WebSocket to the server at `base_url`.
    pub fn connect_ws(base_url: impl Into<String>, config: FeedConfig) -> Self {
        Self::connect(Arc::new(WsTransport::new(base_url)), config)
    }

    /// The most recent view.
    pub fn view(&self) -> Arc<JobView> {
        self.view_rx.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<Arc<JobView>> {
        self.view_rx.clone()
    }

    pub fn side_effects(&self) -> broadcast::Receiver<SideEffect> {
        self.effects_tx.subscribe()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    pub fn is_live(&self) -> bool {
        self.channel.state().is_live()
    }

    pub fn retry(&self) -> bool {
        self.channel.retry()
    }

    /// Stop receiving updates. The last view remains readable.
    pub fn close(&self) {
        self.channel.close();
    }
}

impl Drop for JobFeed {
    fn drop(&mut self) {
        self.channel.close();
        self.task.abort();
    }
}

async fn drive(
    mut updates: mpsc::Receiver<ChannelUpdate>,
    view_tx: watch::Sender<Arc<JobView>>,
    effects_tx: broadcast::Sender<SideEffect>,
    history_limit: usize,
) {
    let mut store = ClientJobStore::new();
    while let Some(update) = updates.recv().await {
        match store.apply(update) {
            ApplyOutcome::Changed => {
                view_tx.send_replace(Arc::new(store.view(history_limit)));
            }
            ApplyOutcome::SideEffect(effect) => {
                // No receivers is fine.
                let _ = effects_tx.send(effect);
            }
            ApplyOutcome::Ignored | ApplyOutcome::Stale => {}
        }
    }
    tracing::debug!("job feed stopped");
}
