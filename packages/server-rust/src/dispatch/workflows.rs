//! Builders for the primary orchestrator and the document sub-workflows.

use b2b_router_core::{sub_workflows, WorkflowName};

use super::registry::{OrchestratorRegistry, RegistryError, WorkflowDefinition};
use crate::catalog::activity_names::{CALL_PARTNER_API, RECORD_OUTCOME, VALIDATE_DOCUMENT};
use crate::catalog::ActivityCatalog;

/// Sub-workflows that forward the document to the partner API.
const FORWARDING: [&str; 8] = [
    sub_workflows::SN,
    sub_workflows::OBASN,
    sub_workflows::WO_STATUS,
    sub_workflows::IBASN_RECEIPT,
    sub_workflows::NF,
    sub_workflows::REVERSE_MANIFEST,
    sub_workflows::CROSS_DOCK_WO_ACK,
    sub_workflows::WO_CHANGE_ACK,
];

/// Acknowledgement sub-workflows: validated and recorded, never forwarded.
const ACKNOWLEDGING: [&str; 2] = [sub_workflows::WO_ACK, sub_workflows::IBASN_ACK];

fn forwarding(name: &'static str) -> impl Fn(&ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> {
    move |catalog: &ActivityCatalog| {
        WorkflowDefinition::builder(name)
            .activity(VALIDATE_DOCUMENT)
            .activity(CALL_PARTNER_API)
            .activity(RECORD_OUTCOME)
            .resolve(catalog)
    }
}

fn acknowledging(name: &'static str) -> impl Fn(&ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> {
    move |catalog: &ActivityCatalog| {
        WorkflowDefinition::builder(name)
            .activity(VALIDATE_DOCUMENT)
            .activity(RECORD_OUTCOME)
            .resolve(catalog)
    }
}

/// Registers the primary orchestrator and every document sub-workflow.
///
/// The primary handles documents that do not select a sub-workflow. Cross-dock
/// instructions run the cross-dock work-order acknowledgement inline after
/// forwarding.
///
/// # Errors
///
/// Returns `RegistryError::DuplicateWorkflowName` if `primary` collides with
/// a sub-workflow name.
pub fn default_registry(primary: impl Into<WorkflowName>) -> Result<OrchestratorRegistry, RegistryError> {
    let primary = primary.into();
    let mut registry = OrchestratorRegistry::new(primary.clone());

    let primary_name = primary.clone();
    registry.register(primary, move |catalog: &ActivityCatalog| {
        WorkflowDefinition::builder(primary_name.clone())
            .activity(VALIDATE_DOCUMENT)
            .activity(CALL_PARTNER_API)
            .activity(RECORD_OUTCOME)
            .resolve(catalog)
    })?;

    for name in FORWARDING {
        registry.register(name, forwarding(name))?;
    }
    for name in ACKNOWLEDGING {
        registry.register(name, acknowledging(name))?;
    }
    registry.register(sub_workflows::CROSS_DOCK, |catalog: &ActivityCatalog| {
        WorkflowDefinition::builder(sub_workflows::CROSS_DOCK)
            .activity(VALIDATE_DOCUMENT)
            .activity(CALL_PARTNER_API)
            .sub_workflow(sub_workflows::CROSS_DOCK_WO_ACK)
            .activity(RECORD_OUTCOME)
            .resolve(catalog)
    })?;

    Ok(registry)
}
