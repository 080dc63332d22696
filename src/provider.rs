// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::carrier::{Carrier, ErasedValue};
use crate::handle::Handle;
use crate::manager::ManagerHandle;
use crate::node::{DataState, Node, NodeCore, PropagateMode};
use crate::{Error, TypeTag};

///
/// A source node: no data predecessors, output set externally via [`Provider::update_value`].
///
/// The general flavor hands the latest value downstream without retaining it once an eager wave
/// has consumed it; the cached flavor keeps a copy for subsequent pulls even under lazy or
/// pulse modes.
///
/// `update_value` must run on the manager thread: foreign threads schedule it through
/// `Manager::push_posted_act`. A debug assertion catches violations on bound providers.
///
pub struct Provider<T> {
    core: NodeCore,
    cache: Mutex<Carrier<T>>,
    retain: bool,
    manager: OnceCell<ManagerHandle>,
}

impl<T: Clone + Send + Sync + 'static> Provider<T> {
    pub fn cached(mode: PropagateMode) -> Handle<Provider<T>> {
        Handle::new(Provider {
            core: NodeCore::new(mode, Vec::new()),
            cache: Mutex::new(Carrier::Empty),
            retain: true,
            manager: OnceCell::new(),
        })
    }

    pub fn general(mode: PropagateMode) -> Handle<Provider<T>> {
        Handle::new(Provider {
            core: NodeCore::new(mode, Vec::new()),
            cache: Mutex::new(Carrier::Empty),
            retain: false,
            manager: OnceCell::new(),
        })
    }

    ///
    /// Publish a new value according to this provider's mode: eagerly push it downstream, or
    /// record it and mark downstream expired (lazy), or record it and defer delivery to the
    /// next manager tick (pulse, which coalesces runs of updates into one delivery).
    ///
    pub fn update_value(&self, value: T) {
        if let Some(manager) = self.manager.get() {
            manager.debug_assert_manager_thread("Provider::update_value");
        }

        match self.core.mode() {
            PropagateMode::Eager => {
                *self.cache.lock() = Carrier::Owned(value);
                self.core.set_data_state(DataState::Fresh);
                self.publish_cache();
            }
            PropagateMode::Lazy => {
                *self.cache.lock() = Carrier::Owned(value);
                self.core.set_data_state(DataState::Fresh);
                self.core.invalidate_successors();
            }
            PropagateMode::Pulse => {
                *self.cache.lock() = Carrier::Owned(value);
                self.core.set_data_state(DataState::Fresh);
                self.core.set_pulse_pending();
                self.core.invalidate_successors();
            }
        }
    }

    ///
    /// Pull the provider's current value. `NoData` until the first `update_value`.
    ///
    pub fn request_raw(&self, _wait: bool) -> Result<T, Error> {
        self.cache.lock().peek()
    }

    /// Push the cached value downstream: a retained cache is cloned once into the wave, while a
    /// general provider moves its value out (zero copies for a single consumer).
    fn publish_cache(&self) {
        if !self.core.has_successors() {
            return;
        }
        let value = {
            let mut cache = self.cache.lock();
            if self.retain {
                cache.peek()
            } else {
                cache.take()
            }
        };
        if let Ok(value) = value {
            self.core.publish_value(value);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Node for Provider<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn output_tag(&self) -> Option<TypeTag> {
        Some(TypeTag::of::<T>())
    }

    fn on_pulse(&self) {
        self.publish_cache();
    }

    fn request_erased(&self, wait: bool) -> Result<ErasedValue, Error> {
        self.request_raw(wait).map(|v| Box::new(v) as ErasedValue)
    }

    fn bind(&self, manager: &ManagerHandle) {
        let _ = self.manager.set(manager.clone());
    }
}
