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

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

///
/// A value computed by one worker task and broadcast to any number of waiters.
///
/// The value resolves exactly once, to whichever of these happens first:
///   1. the worker sends its outcome via the `AsyncValueSender`
///   2. the owner preempts it via `AsyncValue::try_abort` (used to wake waiters as soon as a
///      task has been cancelled or superseded, rather than when its body eventually exits)
///
/// Waiters which arrive after resolution observe the resolved value immediately. If both ends
/// are dropped without resolving, waiters observe `None`.
///
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    item_receiver: Weak<watch::Receiver<Option<T>>>,
}

#[derive(Debug)]
struct Shared<T> {
    item_sender: watch::Sender<Option<T>>,
    resolved: Mutex<bool>,
}

impl<T> Shared<T> {
    ///
    /// Resolves the value if it has not already been resolved. The first caller wins: a send
    /// racing an abort resolves to whichever acquired the lock first.
    ///
    fn resolve(&self, t: T) -> bool {
        let mut resolved = self.resolved.lock();
        if *resolved {
            return false;
        }
        *resolved = true;
        let _ = self.item_sender.send(Some(t));
        true
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncValue<T> {
    pub fn new() -> (AsyncValue<T>, AsyncValueSender<T>, AsyncValueReceiver<T>) {
        let (item_sender, item_receiver) = watch::channel(None);
        let shared = Arc::new(Shared {
            item_sender,
            resolved: Mutex::new(false),
        });
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                shared: shared.clone(),
                item_receiver: Arc::downgrade(&item_receiver),
            },
            AsyncValueSender { shared },
            AsyncValueReceiver { item_receiver },
        )
    }

    ///
    /// Returns an AsyncValueReceiver for this value if any receiver is still alive.
    ///
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }

    ///
    /// Attempt to resolve the value from the owning side, waking all waiters. Returns false if
    /// the worker got there first.
    ///
    pub fn try_abort(&self, t: T) -> bool {
        self.shared.resolve(t)
    }
}

pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    ///
    /// Returns a Future that will wait for the resolution of this value, or None if both ends
    /// were dropped without resolving it.
    ///
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(ref value) = *item_receiver.borrow() {
                return Some(value.clone());
            }

            if item_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueSender<T> {
    ///
    /// Send the worker's outcome. Returns false if the value had already been aborted: the
    /// caller's outcome is discarded in that case.
    ///
    pub fn send(self, item: T) -> bool {
        self.shared.resolve(item)
    }
}
