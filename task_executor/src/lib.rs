// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

///
/// An owned tokio Runtime hosting a manager's worker pool. The blocking threads run node task
/// bodies, which are allowed to be long-running and to park while they poll for cancellation.
///
/// When all clones of an Executor are dropped its Runtime is shut down; the explicit
/// `shutdown` method shuts it down for all clones.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor with an owned tokio::Runtime. Blocking threads are sized to
    /// accommodate tasks that park while polling for cancellation.
    ///
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let mut runtime_builder = Builder::new_multi_thread();

        runtime_builder
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all();

        let runtime = runtime_builder
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Spawn a closure on threads reserved for blocking work and return a JoinHandle.
    ///
    /// If the returned JoinHandle is dropped, the computation will still continue to completion.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    ///
    /// A blocking call to shut down this Executor's Runtime. If tasks do not shut down within
    /// the given timeout, they are leaked. Has no effect if shutdown has already run.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            // Leaked tasks can hold node handles alive, so warn for them.
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called for this Executor.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

/// Tracks the worker tasks currently in flight for a manager. Shutdown blocks until all of them
/// have completed (subject to a timeout): a task which ignores its stop token can otherwise
/// outlive the graph it reports back into.
#[derive(Clone)]
pub struct InflightTasks {
    inner: Arc<Mutex<Option<InflightTasksInner>>>,
}

struct InflightTasksInner {
    next_id: u64,
    running: HashMap<u64, String>,
}

impl InflightTasks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(InflightTasksInner {
                next_id: 0,
                running: HashMap::new(),
            }))),
        }
    }

    /// Spawn a blocking task with the given name, tracking it until it completes.
    pub fn spawn_blocking_on<F>(&self, name: &str, executor: &Executor, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = {
            let mut guard = self.inner.lock();
            let inner = match &mut *guard {
                Some(inner) => inner,
                None => {
                    log::warn!("Task `{name}` submitted after the manager began shutting down.");
                    return;
                }
            };
            let id = inner.next_id;
            inner.next_id += 1;
            inner.running.insert(id, name.to_string());
            id
        };

        let tracker = self.inner.clone();
        let _join = executor.native_spawn_blocking(move || {
            f();
            if let Some(inner) = tracker.lock().as_mut() {
                inner.running.remove(&id);
            }
        });
    }

    /// Wait for all in-flight tasks to complete, subject to the given timeout. If tasks do not
    /// complete, log that fact: their results will be discarded.
    pub fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = {
                let mut guard = self.inner.lock();
                match &mut *guard {
                    Some(inner) if inner.running.is_empty() => {
                        *guard = None;
                        return;
                    }
                    Some(inner) => inner.running.values().join(", "),
                    None => return,
                }
            };

            if Instant::now() >= deadline {
                log::debug!("In-flight task(s) failed to complete within timeout: {remaining}");
                self.inner.lock().take();
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
