//! Durable host adapters.
//!
//! - `registry` -- named async handlers for activities and child workflows
//! - `local` -- in-process host on the tokio runtime

pub mod local;
pub mod registry;

pub use local::LocalHost;
pub use registry::{Handler, HandlerFuture, HandlerRegistry};
