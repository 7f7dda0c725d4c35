//! Top-level wiring: one supervised link unit (serial link + arbiter +
//! receiver) per configured radio network, one correlator task, and the
//! store's writer thread, all driven from a single `CancellationToken`
//! shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::control::Arbiter;
use crate::correlator::{Correlator, CorrelatorConfig, CorrelationEvent, LinkRoles};
use crate::model::LinkId;
use crate::publisher::{self, NullPublisher, Publisher};
use crate::receiver::{NetworkReceiver, ReceiverHandle};
use crate::ring_channel::{self, RingReceiver};
use crate::serial::SerialLink;
use crate::store::{Store, StoreWriter};

const OUT_CHANNEL_CAPACITY: usize = 1024;

pub struct Gateway {
    shutdown: CancellationToken,
    link_tasks: Vec<JoinHandle<()>>,
    correlator_task: JoinHandle<()>,
    receiver_handles: HashMap<LinkId, ReceiverHandle>,
    arbiters: HashMap<LinkId, watch::Receiver<Option<Arc<Arbiter>>>>,
    store: Store,
}

impl Gateway {
    /// Builds every task (one per link, plus the correlator) but does not
    /// start them; call `Gateway::spawn` to hand ownership to the caller's
    /// runtime.
    pub async fn build(
        config: Config,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, crate::error::GatewayError> {
        let shutdown = CancellationToken::new();

        let (store, store_writer) = Store::open(&config.store.db_path)?;

        let (out_tx, out_rx) = ring_channel::channel(OUT_CHANNEL_CAPACITY);

        let roles = LinkRoles::new(
            config
                .links
                .iter()
                .map(|l| (LinkId(l.id), l.role.into())),
        );

        let mut link_tasks = Vec::new();
        let mut receiver_handles = HashMap::new();
        let mut arbiters = HashMap::new();

        for link_cfg in &config.links {
            let link_id = LinkId(link_cfg.id);
            let path = link_cfg.path.clone();
            let baud = link_cfg.baud;
            let out = out_tx.clone();
            let shutdown = shutdown.clone();

            let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();
            let (arbiter_tx, arbiter_rx) = watch::channel(None);
            let task = tokio::spawn(run_link_unit(
                link_id,
                path,
                baud,
                out,
                shutdown,
                handle_tx,
                arbiter_tx,
            ));
            link_tasks.push(task);
            arbiters.insert(link_id, arbiter_rx);
            if let Ok(handle) = handle_rx.await {
                receiver_handles.insert(link_id, handle);
            }
        }

        let correlator_config = CorrelatorConfig {
            match_window: config.correlator.match_window(),
            pending_capacity: config.correlator.pending_capacity,
        };
        let topic_prefix = config.publisher.topic_prefix.clone();
        let correlator_task = tokio::spawn(run_correlator(
            out_rx,
            roles,
            correlator_config,
            store_writer,
            publisher,
            topic_prefix,
            shutdown.clone(),
        ));

        Ok(Self {
            shutdown,
            link_tasks,
            correlator_task,
            receiver_handles,
            arbiters,
            store,
        })
    }

    pub fn health_snapshot(&self, link: LinkId) -> Option<crate::receiver::HealthSnapshot> {
        self.receiver_handles.get(&link).map(|h| h.snapshot())
    }

    /// Read-side access to the local store's query surface, kept alive for
    /// the Gateway's whole lifetime rather than dropped after `build`
    /// returns.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The live `Arbiter` for `link`, if the link is currently connected.
    /// Used to run operator-initiated control-plane operations
    /// (`ControlOps::new(&gateway.control_arbiter(link)?)`); `None` across a
    /// reconnect gap, since a torn-down link has no arbiter to serialise
    /// sessions against.
    pub fn control_arbiter(&self, link: LinkId) -> Option<Arc<Arbiter>> {
        self.arbiters.get(&link)?.borrow().clone()
    }

    /// Sets the shared shutdown flag, then waits for every task to observe
    /// it and exit cleanly.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.link_tasks {
            let _ = task.await;
        }
        let _ = self.correlator_task.await;
    }
}

/// One link's supervised lifecycle: open the port, build a fresh `Arbiter`
/// over it, run the receiver until it errors or shutdown is requested, then
/// reconnect with backoff. Rebuilding the arbiter alongside the port on
/// every reconnect keeps "the port the arbiter controls" and "the port the
/// receiver reads" trivially in sync — there is never a stale `Arc` pointing
/// at a closed port.
async fn run_link_unit(
    link_id: LinkId,
    path: String,
    baud: u32,
    out: crate::ring_channel::RingSender<crate::model::Sample>,
    shutdown: CancellationToken,
    handle_tx: tokio::sync::oneshot::Sender<ReceiverHandle>,
    arbiter_tx: watch::Sender<Option<Arc<Arbiter>>>,
) {
    let mut backoff = Backoff::default();
    let mut handle_tx = Some(handle_tx);

    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let link = match SerialLink::open(&path, baud) {
            Ok(link) => link,
            Err(e) => {
                warn!(link = %path, error = %e, "failed to open link, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next_delay()) => continue,
                    _ = shutdown.cancelled() => return,
                }
            }
        };
        info!(link = %path, "link opened");
        let (arbiter, arbiter_handle) = Arbiter::new(link);
        let arbiter = Arc::new(arbiter);
        arbiter_tx.send_replace(Some(arbiter.clone()));

        let (receiver, receiver_handle) =
            NetworkReceiver::new(link_id, path.clone(), arbiter_handle, out.clone(), shutdown.clone());

        if let Some(tx) = handle_tx.take() {
            let _ = tx.send(receiver_handle);
        }

        let result = receiver.run().await;
        arbiter_tx.send_replace(None);
        drop(arbiter);

        match result {
            Ok(()) => return,
            Err(e) => {
                warn!(link = %path, error = %e, "link failed, reconnecting");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

/// The correlator task: owns `Correlator` exclusively, pulls
/// Samples off the shared ring channel, persists and publishes what comes
/// out, and ages `pending_direct` at 1 Hz.
async fn run_correlator(
    mut input: RingReceiver<crate::model::Sample>,
    roles: LinkRoles,
    config: CorrelatorConfig,
    store: StoreWriter,
    pub_sink: Arc<dyn Publisher>,
    topic_prefix: String,
    shutdown: CancellationToken,
) {
    let mut correlator = Correlator::new(config);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            sample = input.recv() => {
                let Some(sample) = sample else { return };
                let Some(role) = roles.role_of(sample.link_id) else {
                    warn!(link_id = sample.link_id.0, "sample from unconfigured link, dropping");
                    continue;
                };
                if sample.has_fault() {
                    if let Err(e) = store.record_fault(sample.link_id, sample.channel, sample.clone()) {
                        warn!(error = %e, "fault event write dropped");
                    }
                }
                publisher::publish_sample(pub_sink.as_ref(), &topic_prefix, &sample);
                if let Err(e) = store.record_sample(sample.link_id, sample.clone()) {
                    warn!(error = %e, "sample write dropped");
                }
                for event in correlator.ingest(role, sample) {
                    handle_event(event, &store);
                }
            }
            _ = ticker.tick() => {
                for event in correlator.tick(std::time::Instant::now()) {
                    handle_event(event, &store);
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

fn handle_event(event: CorrelationEvent, store: &StoreWriter) {
    match event {
        CorrelationEvent::Match(m) => {
            if let Err(e) = store.record_match(m) {
                warn!(error = %e, "match write dropped");
            }
        }
        CorrelationEvent::DirectLoss(s) => {
            debug_orphan_or_loss("direct sample lost without a match", &s);
        }
        CorrelationEvent::Orphan(s) => {
            debug_orphan_or_loss("primary sample arrived with no matching direct sample", &s);
        }
    }
}

fn debug_orphan_or_loss(msg: &str, sample: &crate::model::Sample) {
    tracing::debug!(channel = sample.channel, link_id = sample.link_id.0, msg);
}

/// Convenience for binaries that don't wire up a real publisher.
pub fn null_publisher() -> Arc<dyn Publisher> {
    Arc::new(NullPublisher)
}
