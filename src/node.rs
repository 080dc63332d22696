// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Weak;

use fnv::FnvHashSet;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::carrier::{ErasedValue, Payload, Update};
use crate::handle::Handle;
use crate::manager::ManagerHandle;
use crate::test_trace_log;
use crate::{Error, TypeTag};

///
/// How a node reacts when an upstream value changes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropagateMode {
    /// Compute and push downstream immediately, in the publishing thread.
    Eager,
    /// Only mark downstream expired; recompute when pulled.
    Lazy,
    /// Mark expired and defer both push and compute to the next manager tick.
    Pulse,
}

///
/// The usability of a node's current value.
///
/// Transitions are monotone within a single propagation wave: `Fresh` becomes `Expired` on an
/// upstream change, `Expired` becomes `Fresh` on a successful recompute, and either may become
/// `Failed`. `Failed` is sticky until the next successful recompute.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataState {
    Fresh,
    Expired,
    Failed,
}

impl DataState {
    pub(crate) fn from_u8(v: u8) -> DataState {
        match v {
            0 => DataState::Fresh,
            1 => DataState::Expired,
            _ => DataState::Failed,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DataState::Fresh => 0,
            DataState::Expired => 1,
            DataState::Failed => 2,
        }
    }
}

///
/// The execution gate carried by every modifier, independent of its propagate mode.
///
/// `Active` allows normal execution. `Disabled` suppresses recompute and forwarding entirely,
/// though upstream invalidations are still recorded so that a later switch to `Active` fires.
/// `OnPulse` permits exactly one execution, after which the gate becomes `Disabled` atomically.
///
/// The gate may also flow in as data: a predecessor slot of this type both sets the gate and,
/// on a transition to `Active` with dirty inputs, causes one recompute.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    Active,
    Disabled,
    OnPulse,
}

impl Trigger {
    pub(crate) fn from_u8(v: u8) -> Trigger {
        match v {
            0 => Trigger::Active,
            1 => Trigger::Disabled,
            _ => Trigger::OnPulse,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Trigger::Active => 0,
            Trigger::Disabled => 1,
            Trigger::OnPulse => 2,
        }
    }
}

///
/// The declaration of one predecessor slot: the tag it accepts, and whether it is quiet.
///
/// Changes arriving on a quiet slot update the recorded argument but never cause the node to
/// publish; execution occurs only when a non-quiet slot changes (or via pulse or pull).
///
#[derive(Clone, Copy, Debug)]
pub struct InputSlot {
    pub(crate) tag: TypeTag,
    pub(crate) quiet: bool,
}

impl InputSlot {
    pub fn new(tag: TypeTag) -> InputSlot {
        InputSlot { tag, quiet: false }
    }

    pub fn quiet(mut self, quiet: bool) -> InputSlot {
        self.quiet = quiet;
        self
    }
}

pub(crate) struct PredecessorSlot {
    pub tag: TypeTag,
    pub quiet: bool,
    /// A relation, not ownership: upstream nodes do not stay alive for our sake.
    pub upstream: Option<Weak<dyn Node>>,
    pub dirty: bool,
}

#[derive(Clone)]
pub(crate) struct SuccessorEntry {
    pub node: Handle<dyn Node>,
    pub slot: usize,
}

pub(crate) struct Links {
    pub successors: Vec<SuccessorEntry>,
    pub predecessors: Vec<PredecessorSlot>,
    pub progress_receivers: Vec<Handle<dyn Node>>,
}

///
/// The capability set shared by every node kind.
///
/// All methods except `set_trigger_type`/`get_trigger_type` must only be called on the manager
/// thread; the trigger accessors are atomic and safe from any thread.
///
pub trait Node: Send + Sync + 'static {
    /// The shared connection and propagation state.
    fn core(&self) -> &NodeCore;

    /// The tag of the value this node publishes, if it has an output.
    fn output_tag(&self) -> Option<TypeTag> {
        None
    }

    /// Deliver a value (or an upstream failure) into the given predecessor slot.
    fn on_push(&self, slot: usize, update: Update<'_>) {
        let _ = (slot, update);
    }

    /// Record an upstream invalidation for the given slot.
    fn on_invalidate(&self, slot: usize) {
        self.core().invalidate_slot_default(slot);
    }

    /// Run this node's coalesced work for a manager tick.
    fn on_pulse(&self) {}

    /// Pull this node's current output value.
    fn request_erased(&self, wait: bool) -> Result<ErasedValue, Error> {
        let _ = wait;
        Err(Error::NoData)
    }

    fn set_trigger_type(&self, trigger: Trigger) {
        let _ = trigger;
    }

    fn get_trigger_type(&self) -> Trigger {
        Trigger::Active
    }

    /// The usability of this node's current value.
    fn get_data_state(&self) -> DataState {
        self.core().data_state()
    }

    /// Install the manager binding. Called exactly once, by `Manager::add_node`.
    fn bind(&self, manager: &ManagerHandle) {
        let _ = manager;
    }

    /// Deliver pending progress to registered progress receivers.
    fn flush_progress(&self) {}

    /// Release resources ahead of destruction: cancel any owned task. Remaining edges are
    /// severed when the node drops.
    fn teardown(&self) {}
}

///
/// The state embedded in every node: its mode, its data state, and both sides of its edges.
///
/// Successor entries hold strong handles (parents own children); predecessor slots hold weak
/// back-references. Edge mutation keeps both sides consistent under the links lock.
///
pub struct NodeCore {
    mode: PropagateMode,
    state: AtomicU8,
    pulse_pending: AtomicBool,
    self_weak: OnceCell<Weak<dyn Node>>,
    pub(crate) links: Mutex<Links>,
}

impl NodeCore {
    pub fn new(mode: PropagateMode, slots: Vec<InputSlot>) -> NodeCore {
        NodeCore {
            mode,
            state: AtomicU8::new(DataState::Expired.as_u8()),
            pulse_pending: AtomicBool::new(false),
            self_weak: OnceCell::new(),
            links: Mutex::new(Links {
                successors: Vec::new(),
                predecessors: slots
                    .into_iter()
                    .map(|s| PredecessorSlot {
                        tag: s.tag,
                        quiet: s.quiet,
                        upstream: None,
                        dirty: false,
                    })
                    .collect(),
                progress_receivers: Vec::new(),
            }),
        }
    }

    pub fn mode(&self) -> PropagateMode {
        self.mode
    }

    pub fn data_state(&self) -> DataState {
        DataState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_data_state(&self, state: DataState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Transition `from` to `to`, returning whether the transition happened.
    pub(crate) fn compare_set_state(&self, from: DataState, to: DataState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn bind_self(&self, weak: Weak<dyn Node>) {
        self.self_weak
            .set(weak)
            .unwrap_or_else(|_| panic!("A node may only be adopted by one Handle."));
    }

    pub(crate) fn self_handle(&self) -> Handle<dyn Node> {
        let weak = self
            .self_weak
            .get()
            .expect("Node was not constructed via Handle::new.");
        Handle::from_arc(
            weak.upgrade()
                .expect("self_handle called on a node being destroyed."),
        )
    }

    pub(crate) fn set_pulse_pending(&self) {
        self.pulse_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_pulse_pending(&self) -> bool {
        self.pulse_pending.swap(false, Ordering::SeqCst)
    }

    ///
    /// Mark the given slot dirty and expire the node's value. Returns true if anything newly
    /// changed: repeated invalidations of an already-dirty slot are debounced so that a wave
    /// visits each edge at most once.
    ///
    pub(crate) fn mark_slot_dirty(&self, slot: usize) -> bool {
        let newly_dirtied = {
            let mut links = self.links.lock();
            match links.predecessors.get_mut(slot) {
                Some(s) if !s.dirty => {
                    s.dirty = true;
                    true
                }
                _ => false,
            }
        };
        let newly_expired = self.compare_set_state(DataState::Fresh, DataState::Expired);
        newly_dirtied || newly_expired
    }

    pub(crate) fn clear_slot_dirty(&self, slot: usize) {
        let mut links = self.links.lock();
        if let Some(s) = links.predecessors.get_mut(slot) {
            s.dirty = false;
        }
    }

    pub(crate) fn clear_all_dirty(&self) {
        let mut links = self.links.lock();
        for s in links.predecessors.iter_mut() {
            s.dirty = false;
        }
    }

    pub(crate) fn any_slot_dirty(&self) -> bool {
        self.links.lock().predecessors.iter().any(|s| s.dirty)
    }

    pub(crate) fn dirty_slots(&self) -> Vec<usize> {
        self.links
            .lock()
            .predecessors
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.dirty.then_some(i))
            .collect()
    }

    pub(crate) fn slot_is_quiet(&self, slot: usize) -> bool {
        self.links
            .lock()
            .predecessors
            .get(slot)
            .map(|s| s.quiet)
            .unwrap_or(false)
    }

    pub(crate) fn upstream(&self, slot: usize) -> Option<Handle<dyn Node>> {
        self.links
            .lock()
            .predecessors
            .get(slot)
            .and_then(|s| s.upstream.as_ref())
            .and_then(Weak::upgrade)
            .map(Handle::from_arc)
    }

    pub(crate) fn upstream_nodes(&self) -> Vec<Handle<dyn Node>> {
        self.links
            .lock()
            .predecessors
            .iter()
            .filter_map(|s| s.upstream.as_ref())
            .filter_map(Weak::upgrade)
            .map(Handle::from_arc)
            .collect()
    }

    ///
    /// The default invalidation behavior: record the dirty slot, expire, and forward the
    /// invalidation downstream (deferring to the next tick for pulse nodes).
    ///
    pub(crate) fn invalidate_slot_default(&self, slot: usize) {
        if self.mark_slot_dirty(slot) {
            if self.mode == PropagateMode::Pulse {
                self.set_pulse_pending();
            }
            self.invalidate_successors();
        }
    }

    fn find_free_slot(&self, tag: TypeTag) -> Option<usize> {
        self.links.lock().predecessors.iter().position(|s| {
            s.tag == tag
                && s.upstream
                    .as_ref()
                    .map_or(true, |w| w.upgrade().is_none())
        })
    }

    fn bind_slot_at(&self, slot: usize, parent: &Handle<dyn Node>) {
        let parent_weak = parent
            .core()
            .self_weak
            .get()
            .expect("Node was not constructed via Handle::new.")
            .clone();
        let mut links = self.links.lock();
        let s = &mut links.predecessors[slot];
        s.upstream = Some(parent_weak);
        s.dirty = false;
    }

    /// Clear the slot's back-reference iff it still points at the given parent.
    pub(crate) fn unbind_slot(&self, slot: usize, parent_ptr: *const ()) {
        let mut links = self.links.lock();
        if let Some(s) = links.predecessors.get_mut(slot) {
            let matches = s
                .upstream
                .as_ref()
                .map(|w| w.as_ptr() as *const () == parent_ptr)
                .unwrap_or(false);
            if matches {
                s.upstream = None;
            }
        }
    }

    fn successors_snapshot(&self) -> Vec<SuccessorEntry> {
        self.links.lock().successors.clone()
    }

    pub(crate) fn has_successors(&self) -> bool {
        !self.links.lock().successors.is_empty()
    }

    ///
    /// Push a freshly computed value to all successors. Deliveries happen depth-first in
    /// registration order; every successor but the last receives a shared borrow of the value,
    /// and the final one receives it by move.
    ///
    pub(crate) fn publish_value<T: Send + 'static>(&self, value: T) {
        let successors = self.successors_snapshot();
        let Some((last, rest)) = successors.split_last() else {
            return;
        };
        for entry in rest {
            entry
                .node
                .on_push(entry.slot, Update::Value(Payload::Shared(&value)));
        }
        last.node
            .on_push(last.slot, Update::Value(Payload::Owned(Box::new(value))));
    }

    /// Push a failure to all successors, using the same delivery order as a value update.
    pub(crate) fn publish_failed(&self) {
        for entry in self.successors_snapshot() {
            entry.node.on_push(entry.slot, Update::Failed);
        }
    }

    /// Mark all successors expired without delivering a value.
    pub(crate) fn invalidate_successors(&self) {
        for entry in self.successors_snapshot() {
            entry.node.on_invalidate(entry.slot);
        }
    }

    pub(crate) fn add_progress_receiver(&self, receiver: Handle<dyn Node>) {
        self.links.lock().progress_receivers.push(receiver);
    }

    /// Deliver a progress event to every progress receiver. Independent of data edges.
    pub(crate) fn publish_progress<T: Clone + Send + 'static>(&self, value: T) {
        let receivers = self.links.lock().progress_receivers.clone();
        for receiver in receivers {
            receiver.on_push(0, Update::Value(Payload::Owned(Box::new(value.clone()))));
        }
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        // Sever remaining edges: clear each child's back-reference before releasing our strong
        // handle to it, so a cascading destruction never observes a half-connected slot.
        let self_ptr = self
            .self_weak
            .get()
            .map(|w| w.as_ptr() as *const ())
            .unwrap_or(std::ptr::null());
        let links = self.links.get_mut();
        for entry in links.successors.drain(..) {
            entry.node.core().unbind_slot(entry.slot, self_ptr);
        }
    }
}

///
/// Establish the edge `parent -> child`.
///
/// Preconditions: the child has a free predecessor slot whose tag equals the parent's output
/// tag (else `InvalidType`), and the edge does not close a cycle (else `RingDetected`). Either
/// failure leaves both nodes untouched. Slot resolution when several slots share a tag is
/// first-free-of-that-tag in declaration order.
///
pub(crate) fn connect_successor_dyn(
    parent: &Handle<dyn Node>,
    child: &Handle<dyn Node>,
) -> Result<(), Error> {
    let tag = parent.output_tag().ok_or(Error::InvalidType)?;
    let slot = child.core().find_free_slot(tag).ok_or(Error::InvalidType)?;
    if parent == child || has_ancestor(parent, child) {
        return Err(Error::RingDetected);
    }

    child.core().bind_slot_at(slot, parent);
    parent.core().links.lock().successors.push(SuccessorEntry {
        node: child.clone(),
        slot,
    });
    test_trace_log!("Connected {:?} -> {:?} at slot {}", parent, child, slot);
    Ok(())
}

///
/// Remove the edge(s) `parent -> child`. Idempotent.
///
pub(crate) fn disconnect_successor_dyn(parent: &Handle<dyn Node>, child: &Handle<dyn Node>) {
    let removed: Vec<SuccessorEntry> = {
        let mut links = parent.core().links.lock();
        let mut removed = Vec::new();
        links.successors.retain(|entry| {
            if entry.node == *child {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        removed
    };
    for entry in removed {
        child.core().unbind_slot(entry.slot, parent.data_ptr());
    }
}

///
/// True if `needle` is an ancestor of `start`: a bounded reverse traversal over predecessor
/// back-references, with a visited set so shared ancestors are walked once.
///
fn has_ancestor(start: &Handle<dyn Node>, needle: &Handle<dyn Node>) -> bool {
    let needle_ptr = needle.data_ptr();
    let mut visited: FnvHashSet<*const ()> = FnvHashSet::default();
    let mut stack = start.core().upstream_nodes();
    while let Some(node) = stack.pop() {
        let ptr = node.data_ptr();
        if ptr == needle_ptr {
            return true;
        }
        if visited.insert(ptr) {
            stack.extend(node.core().upstream_nodes());
        }
    }
    false
}

impl<N: Node + ?Sized> Handle<N> {
    ///
    /// Connect this node's output to a free predecessor slot on `child`. See the module-level
    /// rules: fails with `InvalidType` on a tag mismatch and `RingDetected` on a cycle, leaving
    /// the graph unchanged in both cases.
    ///
    pub fn connect_successor<M: Node + ?Sized>(&self, child: &Handle<M>) -> Result<(), Error> {
        connect_successor_dyn(&self.core().self_handle(), &child.core().self_handle())
    }

    /// Remove the edge(s) to `child`. Idempotent.
    pub fn disconnect_successor<M: Node + ?Sized>(&self, child: &Handle<M>) {
        disconnect_successor_dyn(&self.core().self_handle(), &child.core().self_handle())
    }
}

///
/// Connect a linear chain in producer-to-consumer order.
///
pub fn connect_chain(nodes: &[&Handle<dyn Node>]) -> Result<(), Error> {
    for pair in nodes.windows(2) {
        pair[0].connect_successor(pair[1])?;
    }
    Ok(())
}
