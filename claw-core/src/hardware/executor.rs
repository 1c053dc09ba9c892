//! Single-threaded hardware call executor with bounded timeouts and
//! auto-recovery.
//!
//! Real pin I/O (gpiozero's Rust analogue here, `rppal`) happens on one
//! dedicated OS thread so calls are strictly serialized — exactly as the
//! original implementation's single-worker `ThreadPoolExecutor` did. The
//! difference: if a call doesn't return within `call_timeout`, the worker
//! thread is abandoned (never killed — Rust has no safe thread-kill) and a
//! fresh one takes its place, so the next dispatch isn't wedged behind a
//! hung syscall forever.

use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::{CoreError, CoreResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    tx: std::sync::mpsc::SyncSender<Job>,
}

fn spawn_worker() -> Worker {
    let (tx, rx) = std::sync::mpsc::sync_channel::<Job>(1);
    std::thread::Builder::new()
        .name("hw-executor".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        })
        .expect("failed to spawn hardware executor thread");
    Worker { tx }
}

pub struct HardwareExecutor {
    worker: Mutex<Worker>,
    call_timeout: Duration,
    replacements_this_window: std::sync::atomic::AtomicU32,
}

impl HardwareExecutor {
    pub fn new(call_timeout: Duration) -> HardwareExecutor {
        HardwareExecutor {
            worker: Mutex::new(spawn_worker()),
            call_timeout,
            replacements_this_window: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Run `f` on the executor thread and wait up to `call_timeout` for it
    /// to finish. On timeout the worker is replaced and
    /// [`CoreError::HardwareTimeout`] is returned — the call itself is
    /// abandoned, not retried, matching the "rejected but process
    /// continues" policy for transient hardware faults.
    pub async fn dispatch<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(f());
        });

        {
            let guard = self.worker.lock().await;
            if guard.tx.send(job).is_err() {
                tracing::error!("hardware executor channel closed unexpectedly");
                return Err(CoreError::HardwareTimeout);
            }
        }

        match tokio::time::timeout(self.call_timeout, result_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoreError::HardwareTimeout),
            Err(_) => {
                tracing::error!("hardware call timed out, replacing executor worker");
                let mut guard = self.worker.lock().await;
                *guard = spawn_worker();
                let count = self.replacements_this_window.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if count >= 5 {
                    tracing::error!("hardware executor replaced {count} times — bus likely wedged");
                }
                Err(CoreError::HardwareTimeout)
            }
        }
    }

    /// Number of times the worker has been replaced since startup. Exposed
    /// for the supervisor's fatal-condition check (a replacement storm
    /// means the bus itself is wedged, not a one-off hiccup).
    pub fn replacement_count(&self) -> u32 {
        self.replacements_this_window.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn dispatch_returns_value() {
        let exec = HardwareExecutor::new(StdDuration::from_millis(500));
        let out = exec.dispatch(|| 1 + 1).await.unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn timeout_replaces_worker_and_next_call_succeeds() {
        let exec = HardwareExecutor::new(StdDuration::from_millis(50));
        let err = exec
            .dispatch(|| {
                std::thread::sleep(StdDuration::from_millis(500));
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HardwareTimeout));
        assert_eq!(exec.replacement_count(), 1);

        // The replaced worker is fresh — the next dispatch proceeds normally.
        let out = exec.dispatch(|| 41 + 1).await.unwrap();
        assert_eq!(out, 42);
    }
}
