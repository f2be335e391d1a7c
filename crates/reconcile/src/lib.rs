//! kmerge reconcile: the aggregation/merge/patch pipeline, the change-event router and the
//! controller tying them to the registry and worker pool.

#![forbid(unsafe_code)]

pub mod controller;
pub mod pipeline;
pub mod router;

pub use controller::{Controller, ControllerConfig};
pub use pipeline::{select_secondaries, Outcome, ReconcileError, Reconciler, RetryPolicy};
pub use router::EventRouter;
