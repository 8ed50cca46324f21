//! Fair-batching request scheduler.
//!
//! Requests queue per submission order; a single cooperative processor pass
//! drains them model by model, preferring models that are already resident
//! so a busy model never thrashes loads. Streaming native requests that have
//! to wait get heartbeat frames so clients hold the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{LoadedModel, ModelManager};
use crate::wire::{self, ResponseSink, Wire};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type Work = Box<dyn FnOnce(Arc<LoadedModel>) -> WorkFuture + Send>;

/// Resolves when the request's work closure finishes (or the request is
/// rejected or pruned). Await exactly once.
pub type Completion = oneshot::Receiver<anyhow::Result<()>>;

struct PendingRequest {
    model: String,
    work: Work,
    sink: ResponseSink,
    queued_at: DateTime<Utc>,
    done: oneshot::Sender<anyhow::Result<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    models: Arc<ModelManager>,
    queue: Mutex<Vec<PendingRequest>>,
    is_processing: AtomicBool,
}

impl Scheduler {
    pub fn new(models: Arc<ModelManager>) -> Arc<Self> {
        Arc::new(Scheduler {
            models,
            queue: Mutex::new(Vec::new()),
            is_processing: AtomicBool::new(false),
        })
    }

    /// Enqueue a request and trigger the processor.
    ///
    /// A streaming native request submitted while the processor is busy will
    /// wait, so it gets a heartbeat ticker immediately; the ticker stops
    /// before the work closure runs.
    pub async fn submit(
        self: &Arc<Self>,
        model: String,
        work: Work,
        sink: ResponseSink,
        streaming: bool,
        wire: Wire,
    ) -> Completion {
        let (done, completion) = oneshot::channel();
        let busy = self.is_processing.load(Ordering::SeqCst);
        let heartbeat = (streaming && wire == Wire::Native && busy)
            .then(|| spawn_heartbeat(sink.clone(), model.clone()));
        self.queue.lock().await.push(PendingRequest {
            model,
            work,
            sink,
            queued_at: Utc::now(),
            done,
            heartbeat,
        });
        self.kick();
        completion
    }

    /// Start a processor pass unless one is already running.
    fn kick(self: &Arc<Self>) {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.process().await });
        }
    }

    async fn process(self: Arc<Self>) {
        loop {
            self.prune_disconnected().await;
            let Some(model) = self.pick_next_model().await else {
                break;
            };
            debug!(model = %model, "scheduler picked model");

            let record = match self.models.ensure_loaded(&model).await {
                Ok(record) => record,
                Err(e) => {
                    self.reject_model(&model, &e.to_string()).await;
                    continue;
                }
            };

            // Re-drain until no more requests for this model are queued, so
            // arrivals during execution batch with their predecessors.
            loop {
                let batch = self.drain_model(&model).await;
                if batch.is_empty() {
                    break;
                }
                for mut request in batch {
                    if let Some(heartbeat) = request.heartbeat.take() {
                        heartbeat.abort();
                    }
                    self.models.acquire_context(&model);
                    let _context = ContextGuard {
                        models: &self.models,
                        name: &model,
                    };
                    let result = (request.work)(record.clone()).await;
                    if let Err(e) = &result {
                        warn!(model = %model, error = %e, "request failed");
                    }
                    let _ = request.done.send(result);
                }
            }
        }

        self.is_processing.store(false, Ordering::SeqCst);
        // Requests that arrived during the final batch trigger another pass.
        if !self.queue.lock().await.is_empty() {
            self.kick();
        }
    }

    /// Drop requests whose client has gone away before execution started.
    async fn prune_disconnected(&self) {
        let mut queue = self.queue.lock().await;
        let mut index = 0;
        while index < queue.len() {
            if queue[index].sink.is_closed() {
                let mut request = queue.remove(index);
                if let Some(heartbeat) = request.heartbeat.take() {
                    heartbeat.abort();
                }
                debug!(model = %request.model, "pruned disconnected request");
                let _ = request.done.send(Ok(()));
            } else {
                index += 1;
            }
        }
    }

    /// Fair-batching pick: among queued models, prefer ones already loaded;
    /// within a group take the highest pending count, FIFO on ties.
    async fn pick_next_model(&self) -> Option<String> {
        struct Candidate {
            count: usize,
            earliest: DateTime<Utc>,
        }

        let queue = self.queue.lock().await;
        let mut tally: Vec<(String, Candidate)> = Vec::new();
        for request in queue.iter() {
            if let Some(position) = tally.iter().position(|(name, _)| *name == request.model) {
                let candidate = &mut tally[position].1;
                candidate.count += 1;
                if request.queued_at < candidate.earliest {
                    candidate.earliest = request.queued_at;
                }
            } else {
                tally.push((
                    request.model.clone(),
                    Candidate {
                        count: 1,
                        earliest: request.queued_at,
                    },
                ));
            }
        }
        drop(queue);

        let best = |group: &[&(String, Candidate)]| -> Option<String> {
            group
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.count
                        .cmp(&b.count)
                        .then_with(|| b.earliest.cmp(&a.earliest))
                })
                .map(|(name, _)| name.clone())
        };

        let loaded: Vec<&(String, Candidate)> = tally
            .iter()
            .filter(|(name, _)| self.models.is_loaded(name))
            .collect();
        if let Some(name) = best(&loaded) {
            return Some(name);
        }
        let unloaded: Vec<&(String, Candidate)> = tally
            .iter()
            .filter(|(name, _)| !self.models.is_loaded(name))
            .collect();
        best(&unloaded)
    }

    async fn drain_model(&self, model: &str) -> Vec<PendingRequest> {
        let mut queue = self.queue.lock().await;
        let mut batch = Vec::new();
        let mut index = 0;
        while index < queue.len() {
            if queue[index].model == model {
                batch.push(queue.remove(index));
            } else {
                index += 1;
            }
        }
        batch
    }

    /// A failed load rejects everything queued for that model.
    async fn reject_model(&self, model: &str, message: &str) {
        let batch = self.drain_model(model).await;
        warn!(model = %model, error = %message, rejected = batch.len(), "model load failed");
        for mut request in batch {
            if let Some(heartbeat) = request.heartbeat.take() {
                heartbeat.abort();
            }
            let _ = request.done.send(Err(anyhow::anyhow!("{message}")));
        }
    }
}

/// Decrements the active-context counter on every exit path.
struct ContextGuard<'a> {
    models: &'a ModelManager,
    name: &'a str,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.models.release_context(self.name);
    }
}

fn spawn_heartbeat(sink: ResponseSink, model: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        // The first tick completes immediately; the cadence starts after it.
        interval.tick().await;
        loop {
            interval.tick().await;
            if sink.send_frame(&wire::native_heartbeat(&model)).is_err() {
                // Client is gone; the queue prune will clean the request up.
                break;
            }
        }
    })
}
