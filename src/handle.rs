// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::node::Node;

///
/// A strong, reference-counted handle to a node.
///
/// Cloning a handle bumps the count and dropping decrements it; when the count reaches zero the
/// node's teardown severs its remaining edges and releases its successors. A node is therefore
/// owned jointly by user handles, by the parent side of each incoming edge, by the manager (for
/// nodes added to one), and by any in-flight task bound to it.
///
/// Equality compares identity, not value.
///
pub struct Handle<N: ?Sized>(Arc<N>);

impl<N: Node> Handle<N> {
    ///
    /// Adopt a node, installing the self-reference its connection machinery relies on. All node
    /// constructors in this crate funnel through here.
    ///
    pub fn new(node: N) -> Handle<N> {
        let arc = Arc::new_cyclic(move |weak: &Weak<N>| {
            let dyn_weak: Weak<dyn Node> = weak.clone();
            node.core().bind_self(dyn_weak);
            node
        });
        Handle(arc)
    }

    /// Re-share this handle as a heterogeneous node handle.
    pub fn as_dyn(&self) -> Handle<dyn Node> {
        Handle(self.0.clone() as Arc<dyn Node>)
    }
}

impl<N: ?Sized> Handle<N> {
    ///
    /// The number of strong references currently keeping the node alive.
    ///
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Borrow the underlying node. Equivalent to the `Deref` impl.
    pub fn get(&self) -> &N {
        &self.0
    }

    ///
    /// Release the currently held node and adopt `other` in its place, in one operation. If
    /// this was the last strong reference to the released node, its teardown severs the edges
    /// it still held before `other` is observed through this handle.
    ///
    pub fn reset(&mut self, other: Handle<N>) {
        self.0 = other.0;
    }

    pub(crate) fn from_arc(arc: Arc<N>) -> Handle<N> {
        Handle(arc)
    }

    pub(crate) fn as_arc(&self) -> &Arc<N> {
        &self.0
    }

    pub(crate) fn data_ptr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<N: ?Sized> Clone for Handle<N> {
    fn clone(&self) -> Self {
        Handle(self.0.clone())
    }
}

impl<N: ?Sized> Deref for Handle<N> {
    type Target = N;

    fn deref(&self) -> &N {
        &self.0
    }
}

impl<N: ?Sized, M: ?Sized> PartialEq<Handle<M>> for Handle<N> {
    fn eq(&self, other: &Handle<M>) -> bool {
        self.data_ptr() == other.data_ptr()
    }
}

impl<N: ?Sized> Eq for Handle<N> {}

impl<N: ?Sized> fmt::Debug for Handle<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({:p})", self.data_ptr())
    }
}
