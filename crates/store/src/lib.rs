//! kmerge store: the in-RAM target registry, per-target debounce triggers and the bounded
//! dispatch queue with its worker pool.

#![forbid(unsafe_code)]

pub mod queue;
pub mod registry;
pub mod trigger;

pub use queue::{dispatch_queue, spawn_workers, DispatchReceiver, Dispatcher, QueueClosed, MIN_WORKERS};
pub use registry::{Registry, TargetSpec, TriggerFactory, Upserted};
pub use trigger::{Phase, Trigger, TriggerFn, TriggerParams};
