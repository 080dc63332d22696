// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use task_executor::{Executor, InflightTasks};

use crate::handle::Handle;
use crate::node::{Node, PropagateMode};

pub(crate) type PostedAct = Box<dyn FnOnce() + Send>;

///
/// The owner of a graph's runtime machinery: the worker pool, the queue of actions posted from
/// foreign threads, the registry of added nodes (the manager holds one strong handle per added
/// node until it is erased), and the queue of completed async results awaiting publication.
///
/// All graph mutation and all synchronous propagation run on the manager thread, the thread
/// that constructed the manager and calls [`Manager::update`]. The only foreign-thread entry
/// points are [`Manager::push_posted_act`], handle clone/drop, and the per-node atomics
/// (`set_trigger_type`, `async_cancel`).
///
pub struct Manager {
    shared: Arc<ManagerShared>,
    posted_rx: Receiver<PostedAct>,
    completions_rx: Receiver<PostedAct>,
}

pub(crate) struct ManagerShared {
    posted_tx: Sender<PostedAct>,
    completions_tx: Sender<PostedAct>,
    executor: Executor,
    inflight: InflightTasks,
    thread: ThreadId,
    nodes: Mutex<Vec<Handle<dyn Node>>>,
    progress_sources: Mutex<Vec<Weak<dyn Node>>>,
}

impl ManagerShared {
    fn debug_assert_manager_thread(&self, what: &str) {
        debug_assert!(
            thread::current().id() == self.thread,
            "{what} must run on the manager thread; foreign threads use push_posted_act."
        );
    }
}

///
/// A cloneable, `Send` binding to a manager, installed into nodes by [`Manager::add_node`].
///
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<ManagerShared>,
}

impl ManagerHandle {
    pub(crate) fn executor(&self) -> &Executor {
        &self.shared.executor
    }

    pub(crate) fn inflight(&self) -> &InflightTasks {
        &self.shared.inflight
    }

    /// Enqueue a completed async result for publication on the next tick. Any thread.
    pub(crate) fn post_completion(&self, completion: PostedAct) {
        let _ = self.shared.completions_tx.send(completion);
    }

    pub(crate) fn register_progress_source(&self, node: Handle<dyn Node>) {
        self.shared
            .progress_sources
            .lock()
            .push(Arc::downgrade(node.as_arc()));
    }

    pub(crate) fn debug_assert_manager_thread(&self, what: &str) {
        self.shared.debug_assert_manager_thread(what);
    }
}

impl Manager {
    ///
    /// Create a manager whose worker pool is sized to the machine.
    ///
    /// Panics if the worker pool cannot be started; use [`Manager::with_worker_threads`] to
    /// handle that case.
    ///
    pub fn new() -> Manager {
        Self::with_worker_threads(num_cpus::get().max(1))
            .expect("Failed to start the manager worker pool.")
    }

    pub fn with_worker_threads(num_worker_threads: usize) -> Result<Manager, String> {
        let executor = Executor::new_owned(num_worker_threads, num_worker_threads * 2 + 2)?;
        let (posted_tx, posted_rx) = unbounded();
        let (completions_tx, completions_rx) = unbounded();
        Ok(Manager {
            shared: Arc::new(ManagerShared {
                posted_tx,
                completions_tx,
                executor,
                inflight: InflightTasks::new(),
                thread: thread::current().id(),
                nodes: Mutex::new(Vec::new()),
                progress_sources: Mutex::new(Vec::new()),
            }),
            posted_rx,
            completions_rx,
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: self.shared.clone(),
        }
    }

    ///
    /// Adopt a node: bind it to this manager and retain a strong handle until it is erased.
    /// Pulse-mode nodes must be added to a manager for their coalesced delivery to run.
    ///
    pub fn add_node<N: Node>(&self, handle: Handle<N>) -> Handle<N> {
        self.shared.debug_assert_manager_thread("Manager::add_node");
        handle.bind(&self.handle());
        self.shared.nodes.lock().push(handle.as_dyn());
        handle
    }

    ///
    /// Schedule the release of this manager's handle on the node. Erasure always runs on the
    /// manager thread (as a posted action); reference counting does the rest.
    ///
    pub fn erase_node<N: Node + ?Sized>(&self, node: &Handle<N>) {
        let target = node.core().self_handle();
        let shared = self.shared.clone();
        self.push_posted_act(move || {
            shared.nodes.lock().retain(|n| *n != target);
        });
    }

    /// The foreign-thread entry point: enqueue a closure to run on the manager thread during
    /// the next tick. Non-blocking.
    pub fn push_posted_act<A: FnOnce() + Send + 'static>(&self, act: A) {
        let _ = self.shared.posted_tx.send(Box::new(act));
    }

    ///
    /// Perform one tick:
    ///
    /// 1. Drain the posted-action queue, FIFO.
    /// 2. Apply completed async results; each runs its induced wave to completion.
    /// 3. Fire each registered pulse node with pending work, in registration order, at most
    ///    once. Pending marks set during the tick are observed on the next one, because all
    ///    pending flags are collected before any node fires.
    /// 4. Flush task progress to progress receivers.
    ///
    pub fn update(&self) {
        self.shared.debug_assert_manager_thread("Manager::update");

        while let Ok(act) = self.posted_rx.try_recv() {
            act();
        }

        while let Ok(completion) = self.completions_rx.try_recv() {
            completion();
        }

        let pending: Vec<Handle<dyn Node>> = self
            .shared
            .nodes
            .lock()
            .iter()
            .filter(|n| {
                n.core().mode() == PropagateMode::Pulse && n.core().take_pulse_pending()
            })
            .cloned()
            .collect();
        for node in pending {
            node.on_pulse();
        }

        let sources: Vec<Weak<dyn Node>> = {
            let mut sources = self.shared.progress_sources.lock();
            sources.retain(|w| w.strong_count() > 0);
            sources.clone()
        };
        for source in sources {
            if let Some(node) = source.upgrade() {
                node.flush_progress();
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // Cancel owned tasks and release the node registry, then drain the pool before joining
        // it. Nodes hold ManagerHandles, so the registry must be cleared explicitly to break
        // the reference cycle through ManagerShared.
        let nodes = std::mem::take(&mut *self.shared.nodes.lock());
        log::debug!("Shutting down manager owning {} node(s).", nodes.len());
        for node in &nodes {
            node.teardown();
        }
        drop(nodes);
        self.shared.progress_sources.lock().clear();

        self.shared.inflight.wait(Duration::from_secs(2));
        // Apply completions that raced shutdown, releasing the node handles their tasks held.
        while let Ok(completion) = self.completions_rx.try_recv() {
            completion();
        }
        self.shared.executor.shutdown(Duration::from_secs(1));
    }
}
