// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::marker::PhantomData;

use parking_lot::Mutex;

use crate::carrier::{Carrier, Update};
use crate::handle::Handle;
use crate::node::{DataState, InputSlot, Node, NodeCore, PropagateMode};
use crate::{Error, TypeTag};

///
/// A sink node delivering values to user code. Listeners are typically eager; a failed upstream
/// compute skips the callback rather than delivering a sentinel value.
///
pub struct Listener<T, F> {
    core: NodeCore,
    func: Mutex<F>,
    _value: PhantomData<fn(T)>,
}

///
/// Build an eager terminal around a delivery callback.
///
pub fn make_listener<T, F>(func: F) -> Handle<Listener<T, F>>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&T) + Send + 'static,
{
    Handle::new(Listener {
        core: NodeCore::new(
            PropagateMode::Eager,
            vec![InputSlot::new(TypeTag::of::<T>())],
        ),
        func: Mutex::new(func),
        _value: PhantomData,
    })
}

impl<T, F> Node for Listener<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&T) + Send + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_push(&self, slot: usize, update: Update<'_>) {
        match update {
            Update::Value(payload) => {
                let Some(value) = payload.peek::<T>() else {
                    return;
                };
                self.core.clear_slot_dirty(slot);
                self.core.set_data_state(DataState::Fresh);
                let mut func = self.func.lock();
                (*func)(value);
            }
            Update::Failed => {
                self.core.set_data_state(DataState::Failed);
            }
        }
    }
}

///
/// A lazy sink that performs the pull itself: `request_cache` recursively pulls from the
/// predecessor when expired, and otherwise returns its retained copy without recomputing
/// anything upstream.
///
pub struct CachedTerminal<T> {
    core: NodeCore,
    cache: Mutex<Carrier<T>>,
}

impl<T: Clone + Send + Sync + 'static> CachedTerminal<T> {
    pub fn new(mode: PropagateMode) -> Handle<CachedTerminal<T>> {
        Handle::new(CachedTerminal {
            core: NodeCore::new(mode, vec![InputSlot::new(TypeTag::of::<T>())]),
            cache: Mutex::new(Carrier::Empty),
        })
    }

    pub fn data_state(&self) -> DataState {
        self.core.data_state()
    }

    ///
    /// Return the cached value, pulling from the predecessor first if it has expired.
    ///
    pub fn request_cache(&self) -> Result<T, Error> {
        if self.core.data_state() == DataState::Fresh {
            if let Ok(value) = self.cache.lock().peek() {
                return Ok(value);
            }
        }

        let upstream = self.core.upstream(0).ok_or(Error::NoData)?;
        match upstream.request_erased(false) {
            Ok(erased) => {
                let value = *erased.downcast::<T>().map_err(|_| Error::NoData)?;
                *self.cache.lock() = Carrier::Owned(value.clone());
                self.core.clear_slot_dirty(0);
                self.core.set_data_state(DataState::Fresh);
                Ok(value)
            }
            Err(e) => {
                if e == Error::Failed {
                    self.core.set_data_state(DataState::Failed);
                }
                Err(e)
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Node for CachedTerminal<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_push(&self, slot: usize, update: Update<'_>) {
        match update {
            Update::Value(payload) => {
                if let Ok(value) = payload.extract::<T>() {
                    *self.cache.lock() = Carrier::Owned(value);
                    self.core.clear_slot_dirty(slot);
                    self.core.set_data_state(DataState::Fresh);
                }
            }
            Update::Failed => {
                self.core.set_data_state(DataState::Failed);
            }
        }
    }
}
