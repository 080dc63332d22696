// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Value carriers.
//!
//! A [`Carrier`] holds one payload for a node: owned, shared, or absent. The distinction exists
//! so that a fan-out of `k` successors can be served with at most `k - 1` clones: every delivery
//! but the last borrows the in-flight value, and the final consumer in delivery order receives
//! it by move.
//!
//! [`Payload`] and [`Update`] are the type-erased forms that cross `dyn Node` edges. Connection
//! checking guarantees the downcasts succeed for well-formed graphs.

use std::any::Any;
use std::sync::Arc;

use crate::Error;

///
/// A container holding exactly one of: nothing, an owned value, or a shared value.
///
#[derive(Clone, Debug, Default)]
pub enum Carrier<T> {
    #[default]
    Empty,
    Owned(T),
    Shared(Arc<T>),
}

impl<T: Clone> Carrier<T> {
    pub fn owned(value: T) -> Carrier<T> {
        Carrier::Owned(value)
    }

    pub fn shared(value: Arc<T>) -> Carrier<T> {
        Carrier::Shared(value)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Carrier::Empty)
    }

    ///
    /// Consume the payload. An owned value moves out and leaves the carrier empty; a shared
    /// value is cloned and the carrier remains valid. Taking from an empty carrier fails with
    /// `NoData`.
    ///
    pub fn take(&mut self) -> Result<T, Error> {
        match std::mem::replace(self, Carrier::Empty) {
            Carrier::Empty => Err(Error::NoData),
            Carrier::Owned(value) => Ok(value),
            Carrier::Shared(value) => {
                let item = (*value).clone();
                *self = Carrier::Shared(value);
                Ok(item)
            }
        }
    }

    ///
    /// Copy the payload without consuming it.
    ///
    pub fn peek(&self) -> Result<T, Error> {
        match self {
            Carrier::Empty => Err(Error::NoData),
            Carrier::Owned(value) => Ok(value.clone()),
            Carrier::Shared(value) => Ok((**value).clone()),
        }
    }

    pub fn peek_ref(&self) -> Option<&T> {
        match self {
            Carrier::Empty => None,
            Carrier::Owned(value) => Some(value),
            Carrier::Shared(value) => Some(value),
        }
    }
}

///
/// A type-erased value crossing one edge of a push wave.
///
pub enum Payload<'a> {
    /// Shared with later deliveries in the same wave; the receiver clones if it retains.
    Shared(&'a (dyn Any + Send)),
    /// The final delivery of a wave; the receiver may take ownership.
    Owned(Box<dyn Any + Send>),
}

impl Payload<'_> {
    ///
    /// Recover the concrete value: a shared payload is cloned, an owned payload is moved.
    ///
    /// Fails with `NoData` on a tag mismatch, which only well-formed graphs rule out: custom
    /// `Node` implementations delivering to unchecked slots surface it here rather than panic.
    ///
    pub fn extract<T: Clone + 'static>(self) -> Result<T, Error> {
        match self {
            Payload::Shared(value) => value.downcast_ref::<T>().cloned().ok_or(Error::NoData),
            Payload::Owned(value) => value.downcast::<T>().map(|v| *v).map_err(|_| Error::NoData),
        }
    }

    ///
    /// Borrow the concrete value without consuming the payload.
    ///
    pub fn peek<T: 'static>(&self) -> Option<&T> {
        match self {
            Payload::Shared(value) => value.downcast_ref::<T>(),
            Payload::Owned(value) => value.downcast_ref::<T>(),
        }
    }
}

///
/// One delivery into a predecessor slot: either a value, or notice that the upstream compute
/// failed. Failure flows along edges exactly like a value update.
///
pub enum Update<'a> {
    Value(Payload<'a>),
    Failed,
}

///
/// A type-erased pull result, produced by `Node::request_erased`.
///
pub type ErasedValue = Box<dyn Any + Send>;
