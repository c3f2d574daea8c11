//! Deferred optimization trigger
//!
//! Removals are counted by the engine; once the configured threshold is
//! reached it asks this worker to run an optimization. Requests arriving
//! while one is already queued are coalesced. The worker is the only thread
//! an engine starts.

use crossbeam_channel::{Sender, TrySendError, bounded};
use diskcache_common::{Error, Result};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Background optimization worker
pub struct Optimizer {
    sender: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Optimizer {
    /// Start a worker that runs `task` for every request
    pub fn spawn<F>(cache_name: &str, task: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (sender, receiver) = bounded::<()>(1);
        let name = cache_name.to_string();
        let thread_name = format!("{}-optimizer", cache_name);

        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                info!("{}: optimizer thread started", worker_name);
                for () in receiver.iter() {
                    debug!("{}: running requested optimization", worker_name);
                    task();
                }
                info!("{}: optimizer thread stopped", worker_name);
            })
            .map_err(|e| Error::Storage(format!("failed to spawn optimizer: {}", e)))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            name,
        })
    }

    /// Ask for an optimization
    ///
    /// Returns `false` if one is already pending or the worker has stopped.
    pub fn request(&self) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("{}: optimization already pending", self.name);
                false
            }
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Stop the worker, waiting for a running optimization to finish
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Optimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
