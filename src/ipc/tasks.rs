// src/ipc/tasks.rs

//! Supervised background task set shared by every role process.
//!
//! Each task is named and tagged with `allow_cancel`/`allow_wait` flags,
//! per original `task_manager.py`, so a shutdown sequence can abort some
//! tasks immediately while draining others to completion.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, warn};

struct SupervisedTask {
    name: String,
    allow_cancel: bool,
    allow_wait: bool,
    handle: JoinHandle<()>,
}

/// Tracks every background task a role process has spawned so it can be
/// cancelled or drained cleanly on shutdown.
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Vec<SupervisedTask>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task. `allow_cancel` controls whether
    /// [`Self::cancel_all`] aborts it; `allow_wait` controls whether
    /// [`Self::wait_for_all`] waits on it.
    pub fn spawn<F>(&mut self, name: impl Into<String>, allow_cancel: bool, allow_wait: bool, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(async move {
            fut.await;
        });
        self.tasks.push(SupervisedTask {
            name,
            allow_cancel,
            allow_wait,
            handle,
        });
    }

    /// Abort every task spawned with `allow_cancel = true`.
    pub fn cancel_all(&mut self) {
        for task in &self.tasks {
            if task.allow_cancel {
                task.handle.abort();
            }
        }
    }

    /// Wait for every task spawned with `allow_wait = true` to finish,
    /// logging any that panicked.
    pub async fn wait_for_all(&mut self, timeout: std::time::Duration) {
        let mut waitable = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            if self.tasks[i].allow_wait {
                waitable.push(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }

        let joined = tokio::time::timeout(timeout, async move {
            for task in waitable {
                match task.handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!(task = %task.name, error = ?e, "supervised task panicked"),
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!("timed out waiting for supervised tasks to finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_all_waits_only_for_allowed_tasks() {
        let mut sup = TaskSupervisor::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        sup.spawn("waitable", true, true, async move {
            ran_clone.store(true, Ordering::SeqCst);
        });
        sup.wait_for_all(Duration::from_secs(1)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_all_aborts_cancellable_tasks() {
        let mut sup = TaskSupervisor::new();
        sup.spawn("long-runner", true, false, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        sup.cancel_all();
        // The handle is aborted; wait_for_all (allow_wait=false) should
        // return immediately since nothing is waitable.
        sup.wait_for_all(Duration::from_millis(100)).await;
    }
}
