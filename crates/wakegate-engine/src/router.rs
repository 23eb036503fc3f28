//! Per-device ordered dispatch.
//!
//! Every device gets one worker task draining an mpsc queue, so messages for
//! one device are handled strictly in arrival order while different devices
//! run concurrently. Workers hold no protocol state of their own; a retired
//! or crashed worker is simply replaced on the next message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use wakegate_core::commands::OutboundCommand;
use wakegate_core::wire::InboundMessage;

use crate::error::{EngineError, Result};
use crate::protocol::ProtocolEngine;

type Reply = oneshot::Sender<Result<Option<OutboundCommand>>>;

struct Envelope {
    message: InboundMessage,
    received_at: DateTime<Utc>,
    reply: Reply,
}

struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    generation: u64,
}

pub struct DeviceRouter {
    engine: Arc<ProtocolEngine>,
    workers: Arc<DashMap<String, WorkerHandle>>,
    idle: Duration,
    depth: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
    next_generation: AtomicU64,
}

impl DeviceRouter {
    pub fn new(engine: Arc<ProtocolEngine>, cancel: CancellationToken) -> Self {
        let idle = engine.config().worker_idle;
        let depth = engine.config().worker_queue_depth.max(1);
        Self {
            engine,
            workers: Arc::new(DashMap::new()),
            idle,
            depth,
            cancel,
            tracker: TaskTracker::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Queue a message on its device's worker and wait for the command it
    /// produced.
    pub async fn dispatch(
        &self,
        message: InboundMessage,
        received_at: DateTime<Utc>,
    ) -> Result<Option<OutboundCommand>> {
        let mac = message.mac().to_string();
        if self.cancel.is_cancelled() {
            return Err(EngineError::WorkerUnavailable(mac));
        }
        let (reply, rx) = oneshot::channel();
        let mut envelope = Envelope {
            message,
            received_at,
            reply,
        };

        // A worker can retire between lookup and send; one respawn covers that.
        for _ in 0..2 {
            let tx = self.sender_for(&mac);
            match tx.send(envelope).await {
                Ok(()) => {
                    return rx
                        .await
                        .map_err(|_| EngineError::WorkerUnavailable(mac.clone()))?;
                }
                Err(mpsc::error::SendError(back)) => {
                    envelope = back;
                    self.workers.remove_if(&mac, |_, h| h.tx.same_channel(&tx));
                }
            }
        }
        Err(EngineError::WorkerUnavailable(mac))
    }

    fn sender_for(&self, mac: &str) -> mpsc::Sender<Envelope> {
        let mut entry = self
            .workers
            .entry(mac.to_string())
            .or_insert_with(|| self.spawn_worker(mac));
        if entry.tx.is_closed() {
            *entry = self.spawn_worker(mac);
        }
        entry.tx.clone()
    }

    fn spawn_worker(&self, mac: &str) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.depth);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(mac, generation, "starting device worker");
        self.tracker.spawn(run_worker(
            Arc::clone(&self.engine),
            Arc::clone(&self.workers),
            mac.to_string(),
            generation,
            rx,
            self.idle,
            self.cancel.clone(),
        ));
        WorkerHandle { tx, generation }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker after it finishes what is already queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.workers.clear();
    }
}

async fn run_worker(
    engine: Arc<ProtocolEngine>,
    workers: Arc<DashMap<String, WorkerHandle>>,
    mac: String,
    generation: u64,
    mut rx: mpsc::Receiver<Envelope>,
    idle: Duration,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            next = tokio::time::timeout(idle, rx.recv()) => match next {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(_) => {
                    debug!(%mac, "device worker idle, retiring");
                    break;
                }
            },
        };
        process(&engine, &mac, envelope).await;
    }

    // Refuse new sends, then finish whatever was already accepted.
    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        process(&engine, &mac, envelope).await;
    }
    workers.remove_if(&mac, |_, h| h.generation == generation);
}

async fn process(engine: &ProtocolEngine, mac: &str, envelope: Envelope) {
    let result = engine.handle(envelope.message, envelope.received_at).await;
    if let Err(e) = &result {
        warn!(mac, kind = e.kind(), error = %e, "message handling failed");
    }
    let _ = envelope.reply.send(result);
}
