//! Process-scoped handle to a lazily loaded [`SubjectModel`].
//!
//! The model is loaded on first use, on a dedicated OS thread that then owns
//! it for the rest of the process. Loading happens at most once: a failed
//! load is remembered and every later call fails fast with
//! [`ModelError::Unavailable`]. Requests travel over a bounded channel, so
//! concurrent callers are served one at a time.

use crate::model::{ModelError, ModelOutput, SubjectModel};
use crate::types::Bitmap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

type ModelLoader = Box<dyn FnOnce() -> Result<Box<dyn SubjectModel>, ModelError> + Send>;

/// Load state published by the model thread: `None` while loading.
type LoadState = Option<Result<(), String>>;

/// Messages sent from callers to the model thread.
struct ModelRequest {
    bitmap: Bitmap,
    background: Option<Bitmap>,
    reply: oneshot::Sender<Result<ModelOutput, ModelError>>,
}

/// The model thread's inbox plus its load state. Owned by the handle, so a
/// caller that stops waiting mid-load does not lose the loaded model.
struct Worker {
    tx: mpsc::Sender<ModelRequest>,
    ready: watch::Receiver<LoadState>,
}

/// Shareable (`Send + Sync`) handle; wrap in `Arc` to inject into several pipelines.
pub struct ModelHandle {
    name: String,
    loader: Mutex<Option<ModelLoader>>,
    worker: OnceLock<Worker>,
}

impl ModelHandle {
    /// Create a handle; `loader` runs on the model thread on first use.
    pub fn new<F>(name: impl Into<String>, loader: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn SubjectModel>, ModelError> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Mutex::new(Some(Box::new(loader))),
            worker: OnceLock::new(),
        }
    }

    /// Handle around an already constructed model.
    pub fn from_model<M: SubjectModel>(model: M) -> Self {
        let name = model.name().to_string();
        Self::new(name, move || Ok(Box::new(model) as Box<dyn SubjectModel>))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a load has been attempted and succeeded.
    pub fn is_ready(&self) -> bool {
        self.worker
            .get()
            .is_some_and(|w| matches!(*w.ready.borrow(), Some(Ok(()))))
    }

    /// Load the model if that has not been attempted yet, and wait for it.
    ///
    /// Dropping this future does not cancel the load.
    pub async fn warm_up(&self) -> Result<(), ModelError> {
        self.worker().await.map(|_| ())
    }

    /// Run one inference. Waiting for the answer is bounded by `deadline`;
    /// loading is not.
    pub async fn run(
        &self,
        bitmap: Bitmap,
        background: Option<Bitmap>,
        deadline: Duration,
    ) -> Result<ModelOutput, ModelError> {
        let tx = self.worker().await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let exchange = async {
            tx.send(ModelRequest {
                bitmap,
                background,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ModelError::InferenceFailed(format!("{} thread exited", self.name)))?;
            reply_rx.await.map_err(|_| {
                ModelError::InferenceFailed(format!("{} dropped the request", self.name))
            })?
        };

        // On timeout the request stays queued; its reply is simply discarded.
        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| ModelError::TimedOut(deadline))?
    }

    /// Start the model thread on first use, then wait until its load settles.
    async fn worker(&self) -> Result<&mpsc::Sender<ModelRequest>, ModelError> {
        let worker = self.worker.get_or_init(|| self.spawn());
        let mut ready = worker.ready.clone();
        let state = ready
            .wait_for(Option::is_some)
            .await
            .map(|state| state.clone())
            .unwrap_or_else(|_| Some(Err("model thread exited during load".to_string())));

        match state {
            Some(Ok(())) => Ok(&worker.tx),
            Some(Err(reason)) => Err(ModelError::Unavailable(format!("{}: {reason}", self.name))),
            None => Err(ModelError::Unavailable(format!("{}: not loaded", self.name))),
        }
    }

    /// Spawn the model thread. Runs without awaiting, exactly once per handle.
    fn spawn(&self) -> Worker {
        let (ready_tx, ready_rx) = watch::channel::<LoadState>(None);
        let (tx, mut rx) = mpsc::channel::<ModelRequest>(4);
        let name = self.name.clone();

        let loader = match self.loader.lock().map(|mut slot| slot.take()) {
            Ok(Some(loader)) => loader,
            Ok(None) => return failed_worker(tx, ready_tx, ready_rx, "loader already consumed"),
            Err(_) => return failed_worker(tx, ready_tx, ready_rx, "loader lock poisoned"),
        };

        tracing::info!(model = %name, "loading model");

        let spawned = std::thread::Builder::new()
            .name(format!("portrait-{name}"))
            .spawn(move || {
                let loaded = panic::catch_unwind(AssertUnwindSafe(loader))
                    .unwrap_or_else(|_| Err(ModelError::Unavailable("loader panicked".into())));
                let mut model = match loaded {
                    Ok(model) => {
                        tracing::info!(model = %name, "model loaded");
                        ready_tx.send_replace(Some(Ok(())));
                        model
                    }
                    Err(e) => {
                        tracing::warn!(
                            model = %name,
                            reason = %e,
                            "model load failed; capability disabled"
                        );
                        ready_tx.send_replace(Some(Err(e.to_string())));
                        return;
                    }
                };

                while let Some(req) = rx.blocking_recv() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        model.run(&req.bitmap, req.background.as_ref())
                    }))
                    .unwrap_or_else(|_| Err(ModelError::InferenceFailed("model panicked".into())));
                    let _ = req.reply.send(result);
                }
                tracing::info!(model = %name, "model thread exiting");
            });

        if let Err(e) = spawned {
            tracing::warn!(model = %self.name, error = %e, "failed to spawn model thread");
            return Worker {
                tx,
                ready: watch::channel(Some(Err(format!("failed to spawn model thread: {e}")))).1,
            };
        }

        Worker { tx, ready: ready_rx }
    }
}

/// A worker that never loaded; every call reports `reason`.
fn failed_worker(
    tx: mpsc::Sender<ModelRequest>,
    ready_tx: watch::Sender<LoadState>,
    ready_rx: watch::Receiver<LoadState>,
    reason: &str,
) -> Worker {
    ready_tx.send_replace(Some(Err(reason.to_string())));
    Worker { tx, ready: ready_rx }
}
