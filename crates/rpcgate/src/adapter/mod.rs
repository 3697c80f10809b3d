//! Object adapters
//!
//! The server side of the invocation layer: a state-gated admission point in
//! front of a dispatch queue, bound to TCP and collocated listeners.

mod dispatch_queue;
mod incoming;
mod object_adapter;
mod servant;

pub use dispatch_queue::{Dispatch, DispatchMode, DispatchQueue};
pub use incoming::{AdapterStats, AdapterStatsSnapshot, ConnectionControl};
pub use object_adapter::{AdapterState, ObjectAdapter};
pub use servant::{Current, OperationHandler, Servant, ServantBuilder};
