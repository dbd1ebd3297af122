//! Batched, worker-pooled front end over an [`Embedder`].
//!
//! Callers submit texts on a bounded queue. A single batcher task groups queued
//! requests (up to `max_batch`, or whatever arrived within `batch_window` of the
//! first one) and hands each group to a blocking worker; at most `workers` groups
//! run at once. Every request gets its own reply, so output order always follows
//! input order.

use std::sync::Arc;
use std::time::Duration;

use guidedb_core::config::EmbeddingSettings;
use guidedb_core::error::{Error, Result};
use guidedb_core::traits::{Embedder, ModelLoader};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Request {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

#[derive(Debug, Clone, Copy)]
struct BatchOptions {
    dim: usize,
    max_batch: usize,
    batch_window: Duration,
    workers: usize,
}

pub struct EmbeddingGenerator {
    tx: mpsc::Sender<Request>,
    dim: usize,
    model_version: String,
}

impl std::fmt::Debug for EmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator").field("dim", &self.dim).field("model_version", &self.model_version).finish()
    }
}

impl EmbeddingGenerator {
    /// Start the batcher for an already loaded model. Must be called inside a tokio runtime.
    pub fn new(embedder: Arc<dyn Embedder>, model_version: impl Into<String>, settings: &EmbeddingSettings) -> Self {
        let opts = BatchOptions {
            dim: embedder.dim(),
            max_batch: settings.max_batch.max(1),
            batch_window: settings.batch_window(),
            workers: settings.workers.max(1),
        };
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        tokio::spawn(run_batcher(rx, embedder, opts));
        Self { tx, dim: opts.dim, model_version: model_version.into() }
    }

    /// Load the model off the async runtime and start the batcher.
    pub async fn load(loader: Arc<dyn ModelLoader>, settings: &EmbeddingSettings) -> Result<Self> {
        let version = loader.model_version();
        let expected_dim = loader.dim();
        let embedder = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| Error::ModelUnavailable(format!("model loader panicked: {e}")))?
            .map_err(|e| Error::ModelUnavailable(format!("{e:#}")))?;
        if embedder.dim() != expected_dim {
            return Err(Error::ModelUnavailable(format!(
                "model {version} reports dimension {} but {expected_dim} was configured",
                embedder.dim()
            )));
        }
        info!(model_version = %version, dim = expected_dim, "embedding model ready");
        Ok(Self::new(embedder, version, settings))
    }

    pub fn dim(&self) -> usize { self.dim }

    pub fn model_version(&self) -> &str { &self.model_version }

    /// Embed `texts`, returning one L2-normalized vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut pending = Vec::with_capacity(texts.len());
        for text in texts {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(Request { text: text.clone(), reply })
                .await
                .map_err(|_| Error::ModelUnavailable("embedding generator has stopped".into()))?;
            pending.push(rx);
        }
        let mut out = Vec::with_capacity(pending.len());
        for rx in pending {
            let vector = rx.await.map_err(|_| Error::Embedding("embedding worker dropped the request".into()))??;
            out.push(vector);
        }
        Ok(out)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| Error::Embedding("no vector returned".into()))
    }
}

async fn run_batcher(mut rx: mpsc::Receiver<Request>, embedder: Arc<dyn Embedder>, opts: BatchOptions) {
    let permits = Arc::new(Semaphore::new(opts.workers));
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + opts.batch_window;
        while batch.len() < opts.max_batch {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(req)) => batch.push(req),
                Ok(None) | Err(_) => break,
            }
        }
        let Ok(permit) = permits.clone().acquire_owned().await else { break };
        let embedder = embedder.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_batch(embedder.as_ref(), opts.dim, batch);
        });
    }
    debug!("embedding batcher stopped");
}

fn run_batch(embedder: &dyn Embedder, dim: usize, batch: Vec<Request>) {
    let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
    let started = std::time::Instant::now();
    let result = embedder.embed_batch(&texts);
    match result {
        Ok(vectors) if vectors.len() == batch.len() => {
            debug!(batch = batch.len(), elapsed_ms = started.elapsed().as_millis() as u64, "embedded batch");
            for (req, mut vector) in batch.into_iter().zip(vectors) {
                let reply = if vector.len() == dim {
                    l2_normalize(&mut vector);
                    Ok(vector)
                } else {
                    Err(Error::Embedding(format!("expected dimension {dim}, model returned {}", vector.len())))
                };
                let _ = req.reply.send(reply);
            }
        }
        Ok(vectors) => {
            let err = Error::Embedding(format!("model returned {} vectors for {} texts", vectors.len(), batch.len()));
            warn!(error = %err, "embedding batch rejected");
            fail_all(batch, &err);
        }
        Err(e) => {
            let err = Error::Embedding(format!("{e:#}"));
            warn!(error = %err, batch = batch.len(), "embedding batch failed");
            fail_all(batch, &err);
        }
    }
}

fn fail_all(batch: Vec<Request>, err: &Error) {
    for req in batch {
        let _ = req.reply.send(Err(err.clone()));
    }
}

/// Scale `v` to unit length in place; zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
