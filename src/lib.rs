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

//! A reactive dataflow engine: computations are composed as a DAG of typed nodes, and values
//! flow from providers to terminals under three propagation disciplines (eager push, lazy pull,
//! and pulse delivery coalesced onto manager ticks), with optional off-thread execution,
//! cancellation and progress reporting.
//!
//! Parents own their children: every successor edge holds a strong handle to the downstream
//! node, while predecessor back-references are weak. This is the sole retention rule that keeps
//! a connected sub-graph alive once user handles drop, and it is why the edge relation must stay
//! acyclic.

mod async_node;
pub mod carrier;
mod handle;
mod manager;
mod modifier;
mod node;
mod provider;
mod terminal;

use std::any::{type_name, TypeId};
use std::fmt;

pub use crate::async_node::{
    make_async_transformer, AsyncContext, AsyncMode, AsyncTransformFn, AsyncTransformer,
    ProgressCheck,
};
pub use crate::carrier::Carrier;
pub use crate::handle::Handle;
pub use crate::manager::{Manager, ManagerHandle};
pub use crate::modifier::{
    make_cached_transformer, make_transformer, make_transformer_with, Descriptor, TransformFn,
    TransformInputs, Transformer,
};
pub use crate::node::{
    connect_chain, DataState, InputSlot, Node, NodeCore, PropagateMode, Trigger,
};
pub use crate::provider::Provider;
pub use crate::terminal::{make_listener, CachedTerminal, Listener};

///
/// A process-unique identifier for a concrete value type. Two tags compare equal iff the types
/// are identical: there is no subtyping and no conversion (an `i32` edge will not accept `i64`).
///
/// Connection checking happens entirely in terms of tags, so the erased downcasts performed at
/// delivery time cannot fail for well-formed graphs.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> TypeTag {
        TypeTag {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The static name of the tagged type, for diagnostics only.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

///
/// The error and status kinds of the engine.
///
/// `InvalidType` and `RingDetected` are connection-time errors and leave the graph unchanged.
/// The remainder are data statuses returned from `request`-family calls and flowing along edges:
/// no panic crosses a node boundary during propagation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The upstream output tag does not match any free predecessor slot on the downstream node.
    InvalidType,
    /// The requested edge would close a cycle.
    RingDetected,
    /// No upstream value has ever been produced, or a carrier was taken while empty.
    NoData,
    /// An upstream change invalidated the value; a recompute is needed.
    Expired,
    /// The last compute failed. Sticky until the next successful recompute.
    Failed,
    /// An async task is in flight; the value will surface on a later tick.
    Pending,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Error::InvalidType => "invalid type",
            Error::RingDetected => "ring detected",
            Error::NoData => "no data",
            Error::Expired => "expired",
            Error::Failed => "failed",
            Error::Pending => "pending",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for Error {}

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

#[cfg(test)]
mod tests;
