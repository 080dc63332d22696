// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Off-thread transformers.
//!
//! An async transformer hands its user computation to the manager's worker pool. Each task
//! carries a cooperative stop token, a progress state, and a strong handle back to its node (an
//! in-flight task keeps the node alive until its completion is applied). Results re-enter the
//! graph through the manager's completion queue and publish as ordinary updates on the next
//! tick; cancelled and superseded results are discarded without publishing.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_value::{AsyncValue, AsyncValueReceiver};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::carrier::{Carrier, ErasedValue, Payload, Update};
use crate::handle::Handle;
use crate::manager::ManagerHandle;
use crate::modifier::{gate_allows, gate_peek, TransformInputs};
use crate::node::{DataState, InputSlot, Node, NodeCore, PropagateMode, Trigger};
use crate::test_trace_log;
use crate::{Error, TypeTag};

///
/// How an async node reacts to new input arriving while a task is already running.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncMode {
    /// Drop the new input; the current task continues. The default.
    Single,
    /// Request cancellation of the current task and launch a replacement when it exits.
    Latest,
    /// Enqueue the new input; tasks run one at a time in submission order.
    Queued,
    /// Degrade to synchronous execution in the caller's thread.
    Inline,
}

///
/// A progress event delivered to progress receivers on manager ticks while a task runs.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgressCheck {
    pub current: u64,
    pub total: u64,
    /// Whether the task reported progress since the previous tick.
    pub changed: bool,
}

impl ProgressCheck {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.current as f32 / self.total as f32
        }
    }
}

pub(crate) struct ProgressState {
    current: AtomicU64,
    total: AtomicU64,
    changed: AtomicBool,
}

impl ProgressState {
    fn new() -> ProgressState {
        ProgressState {
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            changed: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.changed.store(false, Ordering::SeqCst);
    }
}

///
/// The context visible to a task body: cancellation and progress reporting. Both sides are
/// atomics, usable from the worker thread at any point in the computation.
///
#[derive(Clone)]
pub struct AsyncContext {
    stop: Arc<AtomicBool>,
    progress: Arc<ProgressState>,
}

impl AsyncContext {
    ///
    /// True once cancellation has been requested. Cancellation is cooperative: a body that
    /// never polls this runs to completion (its result is still discarded).
    ///
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn set_progress(&self, current: u64, total: u64) {
        self.progress.current.store(current, Ordering::SeqCst);
        self.progress.total.store(total, Ordering::SeqCst);
        self.progress.changed.store(true, Ordering::SeqCst);
    }

    pub fn set_progress_done(&self) {
        let total = self.progress.total.load(Ordering::SeqCst).max(1);
        self.progress.total.store(total, Ordering::SeqCst);
        self.progress.current.store(total, Ordering::SeqCst);
        self.progress.changed.store(true, Ordering::SeqCst);
    }
}

///
/// A user callable of K arguments executed off-thread with an [`AsyncContext`].
///
pub trait AsyncTransformFn<I: TransformInputs, O>: Send + Sync + 'static {
    fn call(&self, context: &AsyncContext, inputs: I) -> O;
}

macro_rules! impl_async_transform_fn {
    ($($T:ident $var:ident),+) => {
        impl<Func, $($T),+, Out> AsyncTransformFn<($($T,)+), Out> for Func
        where
            Func: Fn(&AsyncContext, $($T),+) -> Out + Send + Sync + 'static,
            $($T: Clone + Send + Sync + 'static),+
        {
            fn call(&self, context: &AsyncContext, ($($var,)+): ($($T,)+)) -> Out {
                (self)(context, $($var),+)
            }
        }
    };
}

impl_async_transform_fn!(I0 v0);
impl_async_transform_fn!(I0 v0, I1 v1);
impl_async_transform_fn!(I0 v0, I1 v1, I2 v2);
impl_async_transform_fn!(I0 v0, I1 v1, I2 v2, I3 v3);

#[derive(Clone)]
enum TaskOutcome<O> {
    Completed(O),
    Cancelled,
    Panicked,
}

struct RunningTask<O: Clone + Send + Sync + 'static> {
    token: u64,
    stop: Arc<AtomicBool>,
    value: AsyncValue<TaskOutcome<O>>,
    // Held so that `value.receiver()` stays available for blocking requests.
    _receiver: AsyncValueReceiver<TaskOutcome<O>>,
}

struct TaskState<I, O: Clone + Send + Sync + 'static> {
    running: Option<RunningTask<O>>,
    queued: VecDeque<I>,
    replacement: Option<I>,
    next_token: u64,
}

///
/// An N-input, one-output compute node whose user function runs on the manager's worker pool.
///
pub struct AsyncTransformer<F, I: TransformInputs, O: Clone + Send + Sync + 'static> {
    core: NodeCore,
    func: Arc<F>,
    exec_mode: AsyncMode,
    carriers: Mutex<I::Carriers>,
    output: Mutex<Carrier<O>>,
    cache_output: bool,
    trigger: AtomicU8,
    blocked_change: AtomicBool,
    trigger_slot: Option<usize>,
    /// A completed result awaits publication on the next pulse (pulse-mode nodes only).
    publish_pending: AtomicBool,
    tasks: Mutex<TaskState<I, O>>,
    progress: Arc<ProgressState>,
    manager: OnceCell<ManagerHandle>,
    self_typed: OnceCell<Weak<AsyncTransformer<F, I, O>>>,
}

///
/// Build an async transformer with the given propagate and execution modes.
///
pub fn make_async_transformer<F, I, O>(
    mode: PropagateMode,
    exec_mode: AsyncMode,
    func: F,
) -> Handle<AsyncTransformer<F, I, O>>
where
    F: AsyncTransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    let slots = I::tags().into_iter().map(InputSlot::new).collect();
    let handle = Handle::new(AsyncTransformer {
        core: NodeCore::new(mode, slots),
        func: Arc::new(func),
        exec_mode,
        carriers: Mutex::new(I::Carriers::default()),
        output: Mutex::new(Carrier::Empty),
        cache_output: true,
        trigger: AtomicU8::new(Trigger::Active.as_u8()),
        blocked_change: AtomicBool::new(false),
        trigger_slot: I::trigger_slot(),
        publish_pending: AtomicBool::new(false),
        tasks: Mutex::new(TaskState {
            running: None,
            queued: VecDeque::new(),
            replacement: None,
            next_token: 0,
        }),
        progress: Arc::new(ProgressState::new()),
        manager: OnceCell::new(),
        self_typed: OnceCell::new(),
    });
    let _ = handle.self_typed.set(Arc::downgrade(handle.as_arc()));
    handle
}

impl<F, I, O> AsyncTransformer<F, I, O>
where
    F: AsyncTransformFn<I, O>,
    I: TransformInputs,
    O: Clone + Send + Sync + 'static,
{
    ///
    /// Request cancellation of the running task, if any. Safe from any thread; the effect is
    /// observed at the task's next `stop_requested` checkpoint, and any blocked requesters are
    /// woken immediately.
    ///
    pub fn async_cancel(&self) {
        let tasks = self.tasks.lock();
        if let Some(running) = &tasks.running {
            running.stop.store(true, Ordering::SeqCst);
            running.value.try_abort(TaskOutcome::Cancelled);
        }
    }

    ///
    /// Register a terminal to receive [`ProgressCheck`] events for this node's tasks. Progress
    /// edges are independent of data edges.
    ///
    pub fn add_progress_receiver<M: Node + ?Sized>(&self, receiver: &Handle<M>) {
        self.core
            .add_progress_receiver(receiver.core().self_handle());
    }

    /// Pull this node's output; `Pending` while a task is in flight unless `wait` is set.
    pub fn request_raw(&self, wait: bool) -> Result<O, Error> {
        self.request_erased(wait)
            .map(|erased| *erased.downcast::<O>().expect("Output type is fixed by O."))
    }

    ///
    /// Re-pull invalidated or missing argument slots, then snapshot the argument tuple.
    ///
    fn resolve_and_snapshot(&self) -> Result<I, Error> {
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
        I::peek_args(&carriers)
    }

    fn forward_failure(&self) {
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

    ///
    /// Dispatch one execution for the current arguments. The caller has already consulted the
    /// trigger gate.
    ///
    fn submit(&self) {
        let args = match self.resolve_and_snapshot() {
            Ok(args) => args,
            Err(Error::Pending) => return,
            Err(_) => {
                self.forward_failure();
                return;
            }
        };

        let bound = self
            .manager
            .get()
            .cloned()
            .zip(self.self_typed.get().and_then(Weak::upgrade));
        let Some((manager, node)) = bound else {
            // Without a worker pool to hand off to, degrade to synchronous execution.
            self.run_inline(args);
            return;
        };
        if self.exec_mode == AsyncMode::Inline {
            self.run_inline(args);
            return;
        }

        let mut tasks = self.tasks.lock();
        if tasks.running.is_some() {
            match self.exec_mode {
                AsyncMode::Single => {
                    test_trace_log!("Dropping input: a task is already running.");
                }
                AsyncMode::Latest => {
                    let running = tasks.running.as_ref().expect("checked above");
                    running.stop.store(true, Ordering::SeqCst);
                    running.value.try_abort(TaskOutcome::Cancelled);
                    tasks.replacement = Some(args);
                }
                AsyncMode::Queued => tasks.queued.push_back(args),
                AsyncMode::Inline => unreachable!("handled above"),
            }
            return;
        }
        self.launch_locked(&mut tasks, args, &manager, node);
    }

    fn run_inline(&self, args: I) {
        let context = AsyncContext {
            stop: Arc::new(AtomicBool::new(false)),
            progress: self.progress.clone(),
        };
        let func = self.func.clone();
        match catch_unwind(AssertUnwindSafe(|| func.call(&context, args))) {
            Ok(output) => self.complete_with(output),
            Err(_) => self.forward_failure(),
        }
    }

    fn launch_locked(
        &self,
        tasks: &mut TaskState<I, O>,
        args: I,
        manager: &ManagerHandle,
        node: Arc<AsyncTransformer<F, I, O>>,
    ) {
        let token = tasks.next_token;
        tasks.next_token += 1;

        let stop = Arc::new(AtomicBool::new(false));
        self.progress.reset();
        let (value, sender, receiver) = AsyncValue::new();
        let context = AsyncContext {
            stop: stop.clone(),
            progress: self.progress.clone(),
        };
        let func = self.func.clone();
        let manager2 = manager.clone();

        manager.inflight().spawn_blocking_on(
            &format!("async transform #{token}"),
            manager.executor(),
            move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| func.call(&context, args))) {
                    Ok(_) if context.stop_requested() => TaskOutcome::Cancelled,
                    Ok(output) => TaskOutcome::Completed(output),
                    Err(_) => TaskOutcome::Panicked,
                };
                sender.send(outcome.clone());
                // The strong node handle rides in this closure until the manager applies the
                // completion: an in-flight task keeps its node alive.
                manager2.post_completion(Box::new(move || node.finish_task(token, outcome)));
            },
        );

        tasks.running = Some(RunningTask {
            token,
            stop,
            value,
            _receiver: receiver,
        });
    }

    ///
    /// Apply a task completion on the manager thread. Stale tokens (a cleared or restarted
    /// node) and cancelled outcomes are discarded without publishing; a follow-up task is
    /// launched for `Latest`/`Queued` modes.
    ///
    fn finish_task(&self, token: u64, outcome: TaskOutcome<O>) {
        let (cancelled, next) = {
            let mut tasks = self.tasks.lock();
            match &tasks.running {
                Some(running) if running.token == token => {}
                _ => {
                    test_trace_log!("Discarding completion for superseded task #{token}.");
                    return;
                }
            }
            let running = tasks.running.take().expect("checked above");
            let cancelled = running.stop.load(Ordering::SeqCst);
            let next = match self.exec_mode {
                AsyncMode::Latest => tasks.replacement.take(),
                AsyncMode::Queued => tasks.queued.pop_front(),
                _ => None,
            };
            (cancelled, next)
        };

        match outcome {
            TaskOutcome::Completed(output) if !cancelled => self.complete_with(output),
            TaskOutcome::Completed(_) | TaskOutcome::Cancelled => {
                test_trace_log!("Discarding result of cancelled task #{token}.");
            }
            TaskOutcome::Panicked => self.forward_failure(),
        }

        if let Some(args) = next {
            let bound = self
                .manager
                .get()
                .cloned()
                .zip(self.self_typed.get().and_then(Weak::upgrade));
            if let Some((manager, node)) = bound {
                let mut tasks = self.tasks.lock();
                self.launch_locked(&mut tasks, args, &manager, node);
            }
        }
    }

    /// Marshal a completed output into the output slot and start the induced wave.
    fn complete_with(&self, output: O) {
        self.core.clear_all_dirty();
        self.blocked_change.store(false, Ordering::SeqCst);
        self.core.set_data_state(DataState::Fresh);
        if self.cache_output {
            *self.output.lock() = Carrier::Owned(output.clone());
        }
        match self.core.mode() {
            PropagateMode::Eager => self.core.publish_value(output),
            PropagateMode::Lazy => self.core.invalidate_successors(),
            PropagateMode::Pulse => {
                self.publish_pending.store(true, Ordering::SeqCst);
                self.core.set_pulse_pending();
            }
        }
    }

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
                self.submit();
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
        self.forward_failure();
    }
}

impl<F, I, O> Node for AsyncTransformer<F, I, O>
where
    F: AsyncTransformFn<I, O>,
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

        if Some(slot) == self.trigger_slot {
            let trigger = payload.peek::<Trigger>().copied();
            if I::store(&mut self.carriers.lock(), slot, payload).is_ok() {
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
        if self.publish_pending.swap(false, Ordering::SeqCst) {
            if let Ok(output) = self.output.lock().peek() {
                self.core.publish_value(output);
            }
            return;
        }
        if !gate_allows(&self.trigger) {
            self.blocked_change.store(true, Ordering::SeqCst);
            return;
        }
        self.submit();
    }

    fn request_erased(&self, wait: bool) -> Result<ErasedValue, Error> {
        let receiver = {
            let tasks = self.tasks.lock();
            match &tasks.running {
                Some(running) if wait => running.value.receiver(),
                Some(_) => return Err(Error::Pending),
                None => None,
            }
        };

        if let Some(receiver) = receiver {
            // Block the calling thread (never a worker) until the task resolves. Publication to
            // successors still happens through the completion queue on the next tick.
            return match futures::executor::block_on(receiver.recv()) {
                Some(TaskOutcome::Completed(output)) => Ok(Box::new(output)),
                Some(TaskOutcome::Cancelled) => Err(Error::Expired),
                Some(TaskOutcome::Panicked) => Err(Error::Failed),
                None => Err(Error::Pending),
            };
        }

        match self.core.data_state() {
            DataState::Fresh => self
                .output
                .lock()
                .peek()
                .map(|v| Box::new(v) as ErasedValue),
            DataState::Failed => Err(Error::Failed),
            DataState::Expired => {
                if self.output.lock().is_empty() {
                    Err(Error::NoData)
                } else {
                    Err(Error::Expired)
                }
            }
        }
    }

    fn set_trigger_type(&self, trigger: Trigger) {
        self.trigger.store(trigger.as_u8(), Ordering::SeqCst);
    }

    fn get_trigger_type(&self) -> Trigger {
        gate_peek(&self.trigger)
    }

    fn bind(&self, manager: &ManagerHandle) {
        if self.manager.set(manager.clone()).is_ok() {
            manager.register_progress_source(self.core.self_handle());
        }
    }

    fn flush_progress(&self) {
        let running = self.tasks.lock().running.is_some();
        let changed = self.progress.changed.swap(false, Ordering::SeqCst);
        if !running && !changed {
            return;
        }
        let check = ProgressCheck {
            current: self.progress.current.load(Ordering::SeqCst),
            total: self.progress.total.load(Ordering::SeqCst),
            changed,
        };
        self.core.publish_progress(check);
    }

    fn teardown(&self) {
        self.async_cancel();
    }
}
