//! Workflow dispatch: registry, default workflows, scheduling binding and the
//! per-delivery service stack.

pub mod binding;
pub mod classify;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod workflows;

pub use binding::{BindError, DispatchError, Dispatched, DocumentRouter, SchedulingRequirement};
pub use classify::{classify, Disposition};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use registry::{
    DispatchTable, OrchestratorRegistry, RegistryError, WorkflowBuilder, WorkflowDefinition,
    WorkflowStep,
};
pub use service::{ActiveRequirement, DispatchRequest, DispatchService};
pub use workflows::default_registry;
