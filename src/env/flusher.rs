//! Background flusher: a dedicated worker that writes dirty pages back to
//! disk off the critical path of a committing operation.
//!
//! No teacher counterpart (the teacher flushes synchronously inside
//! `Db::put`). Grounded on SPEC_FULL.md §5's scheduling model: a
//! single-threaded cooperative core plus one worker waiting on a condition
//! variable, signaled after every commit.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cache::Cache;
use crate::error::{Result, StorageError};

struct FlusherState {
    pending: bool,
    shutdown: bool,
}

/// Handle to the background flusher thread. Dropping it asks the worker to
/// stop and joins it, so an `Environment` going out of scope never leaves a
/// detached thread behind.
pub struct FlusherHandle {
    shared: Arc<(Mutex<FlusherState>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl FlusherHandle {
    /// Spawns the worker. It wakes either when [`FlusherHandle::notify`] is
    /// called or `interval` elapses, whichever comes first, and flushes every
    /// dirty page resident in `cache`.
    pub fn spawn(cache: Arc<dyn Cache>, interval: Duration) -> Result<Self> {
        let shared = Arc::new((
            Mutex::new(FlusherState {
                pending: false,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let worker_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("hamstore-flusher".into())
            .spawn(move || {
                let (lock, cvar) = &*worker_shared;
                loop {
                    let mut state = lock.lock();
                    if !state.pending && !state.shutdown {
                        cvar.wait_for(&mut state, interval);
                    }
                    if state.shutdown {
                        return;
                    }
                    let should_flush = state.pending;
                    state.pending = false;
                    drop(state);
                    if should_flush {
                        if let Err(err) = cache.flush_all() {
                            log::error!("background flush failed: {err}");
                        }
                    }
                }
            })
            .map_err(|err| StorageError::invalid_parameter(format!("failed to spawn flusher thread: {err}")))?;
        Ok(Self {
            shared,
            join: Some(join),
        })
    }

    /// Wakes the worker to flush soon. Never blocks.
    pub fn notify(&self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().pending = true;
        cvar.notify_one();
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.shared;
            lock.lock().shutdown = true;
            cvar.notify_one();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
