//! Ember core vocabulary
//!
//! Types shared by every layer of the Ember runtime's instrumentation
//! and deferred-execution machinery:
//!
//! - [`Value`] and [`Symbol`]: the small dynamically-typed values that cross
//!   the boundary between the runtime and callbacks.
//! - [`EmberError`] / [`EmberResult`]: the error taxonomy (configuration,
//!   state, access, raised).
//! - [`EventFlags`]: the event kinds hooks subscribe to.
//! - [`InterruptFlags`]: the per-context pending/mask interrupt words polled
//!   at safe points.
//! - [`gc`]: the narrow collaborator traits toward the memory manager.
//!
//! Everything here is passive; the dispatcher lives in `ember_vm` and the
//! job queues in `ember_jobs`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod gc;
pub mod ids;
pub mod interrupt;
pub mod value;

pub use error::{EmberError, EmberResult, ErrorKind, Exception};
pub use events::EventFlags;
pub use gc::{CountingTracer, NoBarrier, NullTracer, Tracer, WriteBarrier};
pub use ids::{DomainId, ThreadId};
pub use interrupt::{InterruptBits, InterruptFlags};
pub use value::{ObjectRef, Symbol, Value};
