//! [`PowerManager`] – asynchronous wake-lock request queue.
//!
//! Requests are pushed onto an unbounded crossbeam channel and executed in
//! FIFO order by a single named worker thread.  Each queued task owns an
//! `Arc` of its token, so a token stays alive until its last task ran.

use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, unbounded};
use hdf_types::{HdfError, HdfResult};
use tracing::{debug, info, warn};

use crate::token::PowerStateToken;

const WORKER_NAME: &str = "hdf-power-manager";

/// Operation a queued task performs on its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Acquire,
    Release,
}

struct PowerTask {
    token: Arc<PowerStateToken>,
    request: PowerRequest,
}

impl PowerTask {
    fn run(self) {
        match self.request {
            PowerRequest::Acquire => self.token.acquire_wake_lock(),
            PowerRequest::Release => self.token.release_wake_lock(),
        }
    }
}

/// Single-worker FIFO executor for power requests.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use hdf_power::{PowerManager, PowerRequest, PowerStateToken};
/// use hdf_types::{DevId, PowerMode};
///
/// let manager = PowerManager::start().unwrap();
/// let token = Arc::new(PowerStateToken::detached(DevId::new(0, 1, 1)));
/// token.set_mode(PowerMode::DynamicControlled);
///
/// manager.request(&token, PowerRequest::Acquire).unwrap();
/// manager.shutdown();
/// assert_eq!(token.wake_ref_count(), 1);
/// ```
pub struct PowerManager {
    sender: Mutex<Option<Sender<PowerTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PowerManager {
    /// Spawn the worker thread.
    ///
    /// # Errors
    ///
    /// [`HdfError::Failure`] when the thread cannot be spawned.
    pub fn start() -> HdfResult<Self> {
        let (sender, receiver) = unbounded::<PowerTask>();
        let worker = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || drain(receiver))
            .map_err(|e| HdfError::Failure(format!("cannot spawn {WORKER_NAME}: {e}")))?;
        info!(worker = WORKER_NAME, "power manager started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Process-wide instance, started on first use.
    pub fn shared() -> HdfResult<Arc<Self>> {
        static SHARED: OnceLock<Arc<PowerManager>> = OnceLock::new();
        if let Some(manager) = SHARED.get() {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(Self::start()?);
        // A racing initialiser may have won; its instance is kept and ours
        // shuts down on drop.
        Ok(Arc::clone(SHARED.get_or_init(|| manager)))
    }

    /// Queue `request` against `token`.  Returns before the request runs.
    ///
    /// # Errors
    ///
    /// [`HdfError::Failure`] after [`PowerManager::shutdown`].
    pub fn request(&self, token: &Arc<PowerStateToken>, request: PowerRequest) -> HdfResult<()> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(HdfError::Failure("power manager is shut down".into()));
        };
        sender
            .send(PowerTask {
                token: Arc::clone(token),
                request,
            })
            .map_err(|_| HdfError::Failure("power manager worker has exited".into()))?;
        debug!(dev_id = %token.dev_id(), ?request, "power request queued");
        Ok(())
    }

    /// Number of tasks waiting for the worker.
    pub fn pending(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, Sender::len)
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Close the queue, let the worker drain what is already queued and
    /// join it.  Calling this twice is harmless.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(worker = WORKER_NAME, "power manager worker panicked");
            } else {
                info!(worker = WORKER_NAME, "power manager stopped");
            }
        }
    }
}

impl Drop for PowerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(receiver: Receiver<PowerTask>) {
    for task in receiver.iter() {
        task.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::PowerStateListener;
    use hdf_types::{DevId, PowerMode, PowerTokenState};

    /// Records the order of callbacks across several tokens.
    struct JournalListener {
        journal: Arc<Mutex<Vec<(DevId, &'static str)>>>,
    }

    impl PowerStateListener for JournalListener {
        fn suspend(&self, dev_id: DevId) -> HdfResult<()> {
            self.journal.lock().unwrap().push((dev_id, "suspend"));
            Ok(())
        }
        fn resume(&self, dev_id: DevId) -> HdfResult<()> {
            self.journal.lock().unwrap().push((dev_id, "resume"));
            Ok(())
        }
    }

    fn dynamic_token(
        dev_id: DevId,
        journal: &Arc<Mutex<Vec<(DevId, &'static str)>>>,
    ) -> Arc<PowerStateToken> {
        let token = Arc::new(PowerStateToken::new(
            dev_id,
            Arc::new(JournalListener {
                journal: Arc::clone(journal),
            }),
        ));
        token.set_mode(PowerMode::DynamicControlled);
        token
    }

    #[test]
    fn requests_run_in_fifo_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let a = dynamic_token(DevId::new(0, 1, 1), &journal);
        let b = dynamic_token(DevId::new(0, 2, 1), &journal);

        let manager = PowerManager::start().unwrap();
        manager.request(&a, PowerRequest::Acquire).unwrap();
        manager.request(&b, PowerRequest::Acquire).unwrap();
        manager.request(&a, PowerRequest::Release).unwrap();
        manager.request(&b, PowerRequest::Release).unwrap();
        manager.shutdown();

        let journal = journal.lock().unwrap().clone();
        assert_eq!(
            journal,
            vec![
                (DevId::new(0, 1, 1), "resume"),
                (DevId::new(0, 2, 1), "resume"),
                (DevId::new(0, 1, 1), "suspend"),
                (DevId::new(0, 2, 1), "suspend"),
            ]
        );
    }

    #[test]
    fn request_after_shutdown_fails() {
        let manager = PowerManager::start().unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(!manager.is_running());
        assert_eq!(manager.pending(), 0);

        let token = Arc::new(PowerStateToken::detached(DevId::new(0, 1, 1)));
        let err = manager.request(&token, PowerRequest::Acquire).unwrap_err();
        assert!(matches!(err, HdfError::Failure(_)));
    }

    #[test]
    fn queued_task_keeps_token_alive() {
        let manager = PowerManager::start().unwrap();
        let token = Arc::new(PowerStateToken::detached(DevId::new(0, 4, 1)));
        token.set_mode(PowerMode::DynamicControlled);
        let observer = Arc::downgrade(&token);

        manager.request(&token, PowerRequest::Acquire).unwrap();
        drop(token);
        manager.shutdown();

        // The worker held the last strong reference and dropped it after
        // running the task.
        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn unbalanced_releases_yield_exactly_one_suspend() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let token = dynamic_token(DevId::new(0, 9, 1), &journal);
        let manager = PowerManager::start().unwrap();

        manager.request(&token, PowerRequest::Acquire).unwrap();
        for _ in 0..3 {
            manager.request(&token, PowerRequest::Release).unwrap();
        }
        manager.shutdown();

        assert_eq!(token.wake_ref_count(), 0);
        assert_eq!(token.state(), PowerTokenState::Inactive);
        let suspends = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, what)| *what == "suspend")
            .count();
        assert_eq!(suspends, 1);
    }

    #[test]
    fn shared_instance_is_reused() {
        let first = PowerManager::shared().unwrap();
        let second = PowerManager::shared().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_running());
    }
}
