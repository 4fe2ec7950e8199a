//! Tower middleware for the dispatch pipeline.
//!
//! - [`timeout`]: per-delivery dispatch timeout
//! - [`metrics`]: tracing span, counters and latency per dispatch
//! - [`pipeline`]: composes the layers around `DispatchService`

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
pub use timeout::TimeoutLayer;
