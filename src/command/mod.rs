//! Operation execution infrastructure for a session
//!
//! This module handles:
//! - Building batches of operations
//! - Dispatching operations to the transport one at a time
//! - Correlating transport completions with the awaited operation
//! - Deciding how far a failure reaches

mod batch;
mod correlator;
mod executor;
mod operation;
pub mod policy;

pub use batch::{descriptor_value, Batch, BatchBuilder, BatchFailure, BatchId};
pub use correlator::{Completion, Correlator, PendingCompletion, Signal};
pub use executor::{BatchOutcome, InFlight, OperationExecutor};
pub use operation::{Operation, OperationKind, ResultCallback};
