//! Background execution of job bodies.
//!
//! Every job body runs as a tracked task with its own cancellation token so
//! `CancelRestore`/`CancelJob` can interrupt in-flight provisioning commands
//! and shutdown can wait for bodies to settle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Default)]
pub struct JobRunner {
    tracker: TaskTracker,
    tokens: Arc<Mutex<Tokens>>,
    shutdown: CancellationToken,
}

/// Removes the job's token once its body finishes, however it finishes.
struct TokenGuard {
    job_id: String,
    tokens: Arc<Mutex<Tokens>>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        lock(&self.tokens).remove(&self.job_id);
    }
}

type Tokens = HashMap<String, CancellationToken>;

fn lock(tokens: &Mutex<Tokens>) -> MutexGuard<'_, Tokens> {
    tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a job body. The body receives a token that fires on cancel or shutdown.
    pub fn dispatch<F, Fut>(&self, job_id: &str, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        lock(&self.tokens).insert(job_id.to_string(), token.clone());

        let guard = TokenGuard {
            job_id: job_id.to_string(),
            tokens: self.tokens.clone(),
        };
        let fut = body(token);

        self.tracker.spawn(async move {
            let _guard = guard;
            fut.await;
        });
        debug!(job_id = %job_id, "Dispatched job body");
    }

    /// Fire the job's cancellation token. Returns false when no body is running.
    pub fn signal_cancel(&self, job_id: &str) -> bool {
        match lock(&self.tokens).get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.tokens).len()
    }

    /// Wait until every dispatched body has finished. New work may be dispatched afterwards.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel every body and wait for them to settle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
