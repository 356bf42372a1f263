//! Bounded pool for best-effort background work

use crate::metrics::METRICS;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = BoxFuture<'static, ()>;

/// Fixed set of workers draining a bounded queue.
///
/// Submissions never wait: a full queue drops the job and counts it. Jobs
/// report their own failures.
pub struct TaskPool {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(name: &'static str, workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue `job`; returns false when it was dropped
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = sender.as_ref() else {
            debug!("Task pool {} is closed, dropping job", self.name);
            return false;
        };

        match sender.try_send(job.boxed()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Task pool {} is full, dropping job", self.name);
                METRICS.record_task_dropped(self.name);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting work and wait up to `grace` for queued jobs to finish
    pub async fn shutdown(&self, grace: Duration) {
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Task pool {} did not drain within {:?}", self.name, grace);
        }
    }
}
