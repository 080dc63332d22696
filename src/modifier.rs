// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Synchronous transformers.
//!
//! A transformer has K typed inputs and one typed output, with per-slot argument retention and
//! an optional output cache selected by descriptor tags. Execution is gated by a trigger which
//! may be set externally or flow in as data through a `Trigger`-typed input slot.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::carrier::{Carrier, ErasedValue, Payload, Update};
use crate::handle::Handle;
use crate::node::{DataState, InputSlot, Node, NodeCore, PropagateMode, Trigger};
use crate::test_trace_log;
use crate::{Error, TypeTag};

///
/// Per-slot behavior tags. `cache` retains the value across executions (for an output slot:
/// the fully-cached discipline); `quiet` suppresses publication for changes arriving on that
/// input. Both default to false.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Descriptor {
    pub cache: bool,
    pub quiet: bool,
}

///
/// The input tuple of a transformer: one implementation per arity, over tuples of value types.
///
pub trait TransformInputs: Sized + Send + Sync + 'static {
    /// One carrier per input slot.
    type Carriers: Default + Send;

    const ARITY: usize;

    fn tags() -> Vec<TypeTag>;

    /// Store an erased payload into the given slot.
    fn store(carriers: &mut Self::Carriers, slot: usize, payload: Payload<'_>)
        -> Result<(), Error>;

    fn is_missing(carriers: &Self::Carriers, slot: usize) -> bool;

    fn clear_slot(carriers: &mut Self::Carriers, slot: usize);

    /// Clone the argument tuple out of the carriers, leaving them retained.
    fn peek_args(carriers: &Self::Carriers) -> Result<Self, Error>;

    /// Consume the argument tuple: owned carriers move out and are left empty.
    fn take_args(carriers: &mut Self::Carriers) -> Result<Self, Error>;

    /// The first slot carrying the trigger gate type, if any.
    fn trigger_slot() -> Option<usize>;
}

///
/// A user callable of K arguments. Implemented for plain `Fn`s of matching arity.
///
pub trait TransformFn<I: TransformInputs, O>: Send + Sync + 'static {
    fn call(&self, inputs: I) -> O;
}

macro_rules! impl_transform_inputs {
    ($(($idx:tt, $T:ident, $var:ident)),+) => {
        impl<$($T),+> TransformInputs for ($($T,)+)
        where
            $($T: Clone + Send + Sync + 'static),+
        {
            type Carriers = ($(Carrier<$T>,)+);

            const ARITY: usize = [$($idx),+].len();

            fn tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$T>()),+]
            }

            fn store(
                carriers: &mut Self::Carriers,
                slot: usize,
                payload: Payload<'_>,
            ) -> Result<(), Error> {
                match slot {
                    $($idx => {
                        carriers.$idx = Carrier::Owned(payload.extract::<$T>()?);
                        Ok(())
                    })+
                    _ => Err(Error::NoData),
                }
            }

            fn is_missing(carriers: &Self::Carriers, slot: usize) -> bool {
                match slot {
                    $($idx => carriers.$idx.is_empty(),)+
                    _ => true,
                }
            }

            fn clear_slot(carriers: &mut Self::Carriers, slot: usize) {
                match slot {
                    $($idx => carriers.$idx = Carrier::Empty,)+
                    _ => {}
                }
            }

            fn peek_args(carriers: &Self::Carriers) -> Result<Self, Error> {
                Ok(($(carriers.$idx.peek()?,)+))
            }

            fn take_args(carriers: &mut Self::Carriers) -> Result<Self, Error> {
                Ok(($(carriers.$idx.take()?,)+))
            }

            fn trigger_slot() -> Option<usize> {
                Self::tags()
                    .iter()
                    .position(|tag| *tag == TypeTag::of::<Trigger>())
            }
        }

        impl<Func, $($T),+, Out> TransformFn<($($T,)+), Out> for Func
        where
            Func: Fn($($T),+) -> Out + Send + Sync + 'static,
            $($T: Clone + Send + Sync + 'static),+
        {
            fn call(&self, ($($var,)+): ($($T,)+)) -> Out {
                (self)($($var),+)
            }
        }
    };
}

impl_transform_inputs!((0, I0, v0));
impl_transform_inputs!((0, I0, v0), (1, I1, v1));
impl_transform_inputs!((0, I0, v0), (1, I1, v1), (2, I2, v2));
impl_transform_inputs!((0, I0, v0), (1, I1, v1), (2, I2, v2), (3, I3, v3));

///
/// Consume one permission to execute: `OnPulse` transitions to `Disabled` atomically on its
/// single firing.
///
pub(crate) fn gate_allows(trigger: &AtomicU8) -> bool {
    loop {
        match Trigger::from_u8(trigger.load(Ordering::SeqCst)) {
            Trigger::Active => return true,
            Trigger::Disabled => return false,
            Trigger::OnPulse => {
                if trigger
                    .compare_exchange(
                        Trigger::OnPulse.as_u8(),
                        Trigger::Disabled.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return true;
                }
            }
        }
    }
}

pub(crate) fn gate_peek(trigger: &AtomicU8) -> Trigger {
    Trigger::from_u8(trigger.load(Ordering::SeqCst))
}

///
/// An N-input, one-output synchronous compute node.
///
pub struct Transformer<F, I: TransformInputs, O> {
    core: NodeCore,
    func: F,
    carriers: Mutex<I::Carriers>,
    output: Mutex<Carrier<O>>,
    cache_output: bool,
    slot_cached: Vec<bool>,
    trigger: AtomicU8,
    /// A change arrived while the gate was disabled; a later activation fires one recompute.
    blocked_change: AtomicBool,
    trigger_slot: Option<usize>,
    _output: PhantomData<fn() -> O>,
}

///
/// Build a transient transformer: it retains neither inputs nor output, re-pulling and
/// recomputing on every execution.
///
pub fn make_transformer<F, I, O>(mode: PropagateMode, func: F) -> Handle<Transformer<F, I, O>>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    make_transformer_with(
        mode,
        &vec![Descriptor::default(); I::ARITY],
        Descriptor::default(),
        func,
    )
}

///
/// Build an argument-cached transformer: each input value is retained, and recomputes re-pull
/// only the slots that have been invalidated since. The output is not cached.
///
pub fn make_cached_transformer<F, I, O>(
    mode: PropagateMode,
    func: F,
) -> Handle<Transformer<F, I, O>>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    make_transformer_with(
        mode,
        &vec![
            Descriptor {
                cache: true,
                quiet: false
            };
            I::ARITY
        ],
        Descriptor::default(),
        func,
    )
}

///
/// Build a transformer with explicit per-input descriptors and an output descriptor
/// (`output.cache` selects the fully-cached discipline).
///
pub fn make_transformer_with<F, I, O>(
    mode: PropagateMode,
    inputs: &[Descriptor],
    output: Descriptor,
    func: F,
) -> Handle<Transformer<F, I, O>>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    assert_eq!(
        inputs.len(),
        I::ARITY,
        "One descriptor is required per input slot."
    );
    let slots = I::tags()
        .into_iter()
        .zip(inputs)
        .map(|(tag, d)| InputSlot::new(tag).quiet(d.quiet))
        .collect();
    Handle::new(Transformer {
        core: NodeCore::new(mode, slots),
        func,
        carriers: Mutex::new(I::Carriers::default()),
        output: Mutex::new(Carrier::Empty),
        cache_output: output.cache,
        slot_cached: inputs.iter().map(|d| d.cache).collect(),
        trigger: AtomicU8::new(Trigger::Active.as_u8()),
        blocked_change: AtomicBool::new(false),
        trigger_slot: I::trigger_slot(),
        _output: PhantomData,
    })
}

impl<F, I, O> Transformer<F, I, O>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    ///
    /// Resolve arguments (re-pulling missing or invalidated slots), run the user function, and
    /// update caches and data state.
    ///
    /// A `Pending` pull leaves the node expired without failing it: the value will arrive as an
    /// ordinary push on a later tick. Any other pull error, and a panicking user function,
    /// transition the node to `Failed`.
    ///
    fn compute(&self) -> Result<O, Error> {
        if let Err(e) = self.resolve_args() {
            if e == Error::Pending {
                return Err(e);
            }
            self.core.set_data_state(DataState::Failed);
            return Err(Error::Failed);
        }

        let args = {
            let mut carriers = self.carriers.lock();
            let transient = self.slot_cached.iter().all(|cached| !cached);
            if transient {
                I::take_args(&mut carriers)
            } else {
                I::peek_args(&carriers)
            }
        };
        let args = match args {
            Ok(args) => args,
            Err(_) => {
                self.core.set_data_state(DataState::Failed);
                return Err(Error::Failed);
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| self.func.call(args)));

        {
            let mut carriers = self.carriers.lock();
            for (slot, cached) in self.slot_cached.iter().enumerate() {
                if !cached {
                    I::clear_slot(&mut carriers, slot);
                }
            }
        }

        match result {
            Ok(output) => {
                self.core.clear_all_dirty();
                self.blocked_change.store(false, Ordering::SeqCst);
                self.core.set_data_state(DataState::Fresh);
                if self.cache_output {
                    *self.output.lock() = Carrier::Owned(output.clone());
                }
                Ok(output)
            }
            Err(_) => {
                test_trace_log!("User callable panicked; node transitions to Failed.");
                self.core.set_data_state(DataState::Failed);
                Err(Error::Failed)
            }
        }
    }

    fn resolve_args(&self) -> Result<(), Error> {
        let dirty = self.core.dirty_slots();
        let mut carriers = self.carriers.lock();
        for slot in 0..I::ARITY {
            if I::is_missing(&carriers, slot) || dirty.contains(&slot) {
                let upstream = self.core.upstream(slot).ok_or(Error::NoData)?;
                let erased = upstream.request_erased(false)?;
                I::store(&mut carriers, slot, Payload::Owned(erased))?;
                self.core.clear_slot_dirty(slot);
            }
        }
        Ok(())
    }

    ///
    /// React to a change on a non-quiet slot per this node's propagate mode.
    ///
    fn handle_change(&self) {
        match self.core.mode() {
            PropagateMode::Eager => {
                if gate_peek(&self.trigger) == Trigger::Disabled {
                    self.blocked_change.store(true, Ordering::SeqCst);
                    return;
                }
                if !gate_allows(&self.trigger) {
                    return;
                }
                match self.compute() {
                    Ok(output) => self.core.publish_value(output),
                    Err(Error::Pending) => {}
                    Err(_) => self.core.publish_failed(),
                }
            }
            PropagateMode::Lazy => {
                self.core.set_data_state(DataState::Expired);
                self.core.invalidate_successors();
            }
            PropagateMode::Pulse => {
                self.core.set_data_state(DataState::Expired);
                self.core.set_pulse_pending();
                self.core.invalidate_successors();
            }
        }
    }

    fn handle_failure(&self, slot: usize) {
        self.core.mark_slot_dirty(slot);
        if self.core.slot_is_quiet(slot) {
            return;
        }
        if gate_peek(&self.trigger) == Trigger::Disabled {
            self.blocked_change.store(true, Ordering::SeqCst);
            return;
        }
        self.core.set_data_state(DataState::Failed);
        match self.core.mode() {
            PropagateMode::Eager => self.core.publish_failed(),
            PropagateMode::Lazy => self.core.invalidate_successors(),
            PropagateMode::Pulse => {
                self.core.set_pulse_pending();
                self.core.invalidate_successors();
            }
        }
    }
}

impl<F, I, O> Node for Transformer<F, I, O>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn output_tag(&self) -> Option<TypeTag> {
        Some(TypeTag::of::<O>())
    }

    fn on_push(&self, slot: usize, update: Update<'_>) {
        let payload = match update {
            Update::Value(payload) => payload,
            Update::Failed => {
                self.handle_failure(slot);
                return;
            }
        };

        // A Trigger-typed slot is both data and control: store the argument, move the gate, and
        // on a transition to active fire one recompute if any change is pending.
        if Some(slot) == self.trigger_slot {
            let trigger = payload.peek::<Trigger>().copied();
            let stored = I::store(&mut self.carriers.lock(), slot, payload).is_ok();
            if stored {
                self.core.clear_slot_dirty(slot);
            }
            if let Some(trigger) = trigger {
                self.trigger.store(trigger.as_u8(), Ordering::SeqCst);
                let fire = trigger != Trigger::Disabled
                    && (self.blocked_change.swap(false, Ordering::SeqCst)
                        || self.core.any_slot_dirty());
                if fire {
                    self.handle_change();
                }
            }
            return;
        }

        if I::store(&mut self.carriers.lock(), slot, payload).is_err() {
            self.handle_failure(slot);
            return;
        }
        self.core.clear_slot_dirty(slot);

        if self.core.slot_is_quiet(slot) {
            return;
        }
        self.handle_change();
    }

    fn on_invalidate(&self, slot: usize) {
        if self.core.slot_is_quiet(slot) {
            self.core.mark_slot_dirty(slot);
            return;
        }
        if gate_peek(&self.trigger) == Trigger::Disabled {
            self.core.mark_slot_dirty(slot);
            self.blocked_change.store(true, Ordering::SeqCst);
            return;
        }
        self.core.invalidate_slot_default(slot);
    }

    fn on_pulse(&self) {
        if !gate_allows(&self.trigger) {
            self.blocked_change.store(true, Ordering::SeqCst);
            return;
        }
        match self.compute() {
            // A pulse fire drives eager successors synchronously within the tick.
            Ok(output) => self.core.publish_value(output),
            Err(Error::Pending) => {}
            Err(_) => self.core.publish_failed(),
        }
    }

    fn request_erased(&self, _wait: bool) -> Result<ErasedValue, Error> {
        if self.cache_output && self.core.data_state() == DataState::Fresh {
            if let Ok(value) = self.output.lock().peek() {
                return Ok(Box::new(value));
            }
        }
        if self.core.data_state() == DataState::Failed && !self.core.any_slot_dirty() {
            return Err(Error::Failed);
        }
        if !gate_allows(&self.trigger) {
            return Err(Error::Expired);
        }
        self.compute().map(|v| Box::new(v) as ErasedValue)
    }

    fn set_trigger_type(&self, trigger: Trigger) {
        self.trigger.store(trigger.as_u8(), Ordering::SeqCst);
    }

    fn get_trigger_type(&self) -> Trigger {
        gate_peek(&self.trigger)
    }
}

impl<F, I, O> Transformer<F, I, O>
where
    F: TransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    ///
    /// Pull this transformer's output. See the request protocol: returns the cached output when
    /// fully cached and fresh, recomputes when expired, and surfaces `Expired` when the gate is
    /// disabled.
    ///
    pub fn request_raw(&self, wait: bool) -> Result<O, Error> {
        self.request_erased(wait)
            .map(|erased| *erased.downcast::<O>().expect("Output type is fixed by O."))
    }
}
