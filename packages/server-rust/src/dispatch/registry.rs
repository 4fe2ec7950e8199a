//! Orchestrator registry: composes named workflows into one dispatch table.
//!
//! Builders are registered by name and run against an [`ActivityCatalog`] at
//! [`build`](OrchestratorRegistry::build) time. A build either yields a
//! complete [`DispatchTable`] or fails; it never returns a partial table.
//! Builders receive the catalog by reference and definitions store activity
//! names only, so no definition can outlive the catalog it was checked
//! against.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use b2b_router_core::{ActivityName, WorkflowName};

use crate::catalog::ActivityCatalog;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStep {
    /// Run the named activity.
    Activity(ActivityName),
    /// Run the named workflow inline as a child of this one.
    SubWorkflow(WorkflowName),
}

/// Executable description of a workflow: an ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    name: WorkflowName,
    steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn builder(name: impl Into<WorkflowName>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &WorkflowName {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    /// Activity names referenced directly by this workflow.
    pub fn activities(&self) -> impl Iterator<Item = &ActivityName> {
        self.steps.iter().filter_map(|step| match step {
            WorkflowStep::Activity(name) => Some(name),
            WorkflowStep::SubWorkflow(_) => None,
        })
    }

    /// Sub-workflow names referenced directly by this workflow.
    pub fn sub_workflows(&self) -> impl Iterator<Item = &WorkflowName> {
        self.steps.iter().filter_map(|step| match step {
            WorkflowStep::SubWorkflow(name) => Some(name),
            WorkflowStep::Activity(_) => None,
        })
    }
}

/// Fluent builder for [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowDefinitionBuilder {
    name: WorkflowName,
    steps: Vec<WorkflowStep>,
}

impl WorkflowDefinitionBuilder {
    #[must_use]
    pub fn activity(mut self, name: impl Into<ActivityName>) -> Self {
        self.steps.push(WorkflowStep::Activity(name.into()));
        self
    }

    #[must_use]
    pub fn sub_workflow(mut self, name: impl Into<WorkflowName>) -> Self {
        self.steps.push(WorkflowStep::SubWorkflow(name.into()));
        self
    }

    /// Checks every activity step against `catalog` and finishes the definition.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnresolvedActivity` for the first activity
    /// name absent from the catalog.
    pub fn resolve(self, catalog: &ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> {
        let definition = WorkflowDefinition {
            name: self.name,
            steps: self.steps,
        };
        check_activities(&definition, catalog)?;
        Ok(definition)
    }
}

fn check_activities(
    definition: &WorkflowDefinition,
    catalog: &ActivityCatalog,
) -> Result<(), RegistryError> {
    match definition.activities().find(|a| !catalog.contains(a.as_str())) {
        Some(missing) => Err(RegistryError::UnresolvedActivity {
            workflow: definition.name.clone(),
            activity: missing.clone(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Startup-fatal errors composing the dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow registered twice: {0}")]
    DuplicateWorkflowName(WorkflowName),
    #[error("workflow {workflow} references unknown activity {activity}")]
    UnresolvedActivity {
        workflow: WorkflowName,
        activity: ActivityName,
    },
    #[error("workflow {workflow} references unregistered sub-workflow {sub_workflow}")]
    UnresolvedSubWorkflow {
        workflow: WorkflowName,
        sub_workflow: WorkflowName,
    },
    #[error("sub-workflow cycle through {0}")]
    CyclicSubWorkflow(WorkflowName),
    #[error("primary workflow {0} is not registered")]
    MissingPrimary(WorkflowName),
    #[error("builder registered as {registered} produced a definition named {built}")]
    NameMismatch {
        registered: WorkflowName,
        built: WorkflowName,
    },
}

// ---------------------------------------------------------------------------
// OrchestratorRegistry
// ---------------------------------------------------------------------------

/// Produces a workflow definition from the catalog.
pub type WorkflowBuilder =
    Arc<dyn Fn(&ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> + Send + Sync>;

/// Static set of named workflow builders plus the designated primary.
pub struct OrchestratorRegistry {
    primary: WorkflowName,
    builders: Vec<(WorkflowName, WorkflowBuilder)>,
    duplicate: Option<WorkflowName>,
}

impl OrchestratorRegistry {
    /// Creates an empty registry whose primary workflow is `primary`.
    ///
    /// The primary still has to be registered like any other workflow.
    #[must_use]
    pub fn new(primary: impl Into<WorkflowName>) -> Self {
        Self {
            primary: primary.into(),
            builders: Vec::new(),
            duplicate: None,
        }
    }

    #[must_use]
    pub fn primary(&self) -> &WorkflowName {
        &self.primary
    }

    /// Registers a builder under `name`.
    ///
    /// A duplicate is reported here and remembered, so [`build`](Self::build)
    /// fails even if the caller ignores this result.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateWorkflowName` if `name` is taken.
    pub fn register<F>(&mut self, name: impl Into<WorkflowName>, builder: F) -> Result<(), RegistryError>
    where
        F: Fn(&ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.builders.iter().any(|(existing, _)| *existing == name) {
            self.duplicate.get_or_insert_with(|| name.clone());
            return Err(RegistryError::DuplicateWorkflowName(name));
        }
        self.builders.push((name, Arc::new(builder)));
        Ok(())
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&WorkflowName> {
        self.builders.iter().map(|(name, _)| name).collect()
    }

    /// Runs every builder against `catalog` and assembles the dispatch table.
    ///
    /// # Errors
    ///
    /// Fails without producing a table on a duplicate registration, an
    /// activity missing from the catalog, a sub-workflow step naming an
    /// unregistered workflow, a sub-workflow cycle, an unregistered primary,
    /// or a builder that returns a definition under another name.
    pub fn build(&self, catalog: &ActivityCatalog) -> Result<DispatchTable, RegistryError> {
        if let Some(name) = &self.duplicate {
            return Err(RegistryError::DuplicateWorkflowName(name.clone()));
        }

        let mut workflows = HashMap::with_capacity(self.builders.len());
        for (name, builder) in &self.builders {
            let definition = builder(catalog)?;
            if definition.name() != name {
                return Err(RegistryError::NameMismatch {
                    registered: name.clone(),
                    built: definition.name().clone(),
                });
            }
            check_activities(&definition, catalog)?;
            workflows.insert(name.clone(), Arc::new(definition));
        }

        if !workflows.contains_key(&self.primary) {
            return Err(RegistryError::MissingPrimary(self.primary.clone()));
        }

        for definition in workflows.values() {
            if let Some(missing) = definition
                .sub_workflows()
                .find(|sub| !workflows.contains_key(*sub))
            {
                return Err(RegistryError::UnresolvedSubWorkflow {
                    workflow: definition.name().clone(),
                    sub_workflow: missing.clone(),
                });
            }
        }
        detect_cycles(&workflows)?;

        Ok(DispatchTable {
            workflows,
            primary: self.primary.clone(),
        })
    }
}

impl fmt::Debug for OrchestratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRegistry")
            .field("primary", &self.primary)
            .field("workflows", &self.names())
            .finish_non_exhaustive()
    }
}

/// Depth-first search over sub-workflow edges.
fn detect_cycles(
    workflows: &HashMap<WorkflowName, Arc<WorkflowDefinition>>,
) -> Result<(), RegistryError> {
    fn visit<'a>(
        name: &'a WorkflowName,
        workflows: &'a HashMap<WorkflowName, Arc<WorkflowDefinition>>,
        on_path: &mut HashSet<&'a WorkflowName>,
        done: &mut HashSet<&'a WorkflowName>,
    ) -> Result<(), RegistryError> {
        if done.contains(name) {
            return Ok(());
        }
        if !on_path.insert(name) {
            return Err(RegistryError::CyclicSubWorkflow(name.clone()));
        }
        if let Some(definition) = workflows.get(name) {
            for sub in definition.sub_workflows() {
                visit(sub, workflows, on_path, done)?;
            }
        }
        on_path.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut done = HashSet::new();
    for name in workflows.keys() {
        visit(name, workflows, &mut HashSet::new(), &mut done)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DispatchTable
// ---------------------------------------------------------------------------

/// Immutable mapping from workflow name to definition, plus the primary name.
///
/// Rebuilt and swapped as a whole on reload; never mutated in place.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    workflows: HashMap<WorkflowName, Arc<WorkflowDefinition>>,
    primary: WorkflowName,
}

impl DispatchTable {
    /// Workflow used when a message does not select one.
    #[must_use]
    pub fn primary(&self) -> &WorkflowName {
        &self.primary
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&WorkflowName> {
        let mut names: Vec<_> = self.workflows.keys().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkflowName, &Arc<WorkflowDefinition>)> {
        self.workflows.iter()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::catalog::activity_names::{RECORD_OUTCOME, VALIDATE_DOCUMENT};
    use crate::catalog::test_support::echo_catalog;

    fn simple(name: &'static str) -> impl Fn(&ActivityCatalog) -> Result<WorkflowDefinition, RegistryError> {
        move |catalog: &ActivityCatalog| {
            WorkflowDefinition::builder(name)
                .activity(VALIDATE_DOCUMENT)
                .activity(RECORD_OUTCOME)
                .resolve(catalog)
        }
    }

    #[test]
    fn build_produces_table_with_primary() {
        let mut registry = OrchestratorRegistry::new("main");
        registry.register("main", simple("main")).unwrap();
        registry.register("sub", simple("sub")).unwrap();

        let table = registry.build(&echo_catalog()).unwrap();
        assert_eq!(table.primary().as_str(), "main");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("sub").unwrap().steps().len(), 2);
    }

    #[test]
    fn duplicate_registration_is_reported_and_blocks_build() {
        let mut registry = OrchestratorRegistry::new("main");
        registry.register("main", simple("main")).unwrap();
        let err = registry.register("main", simple("main")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateWorkflowName("main".into()));

        let err = registry.build(&echo_catalog()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateWorkflowName("main".into()));
    }

    #[test]
    fn unresolved_activity_fails_build() {
        let mut registry = OrchestratorRegistry::new("main");
        registry
            .register("main", |catalog: &ActivityCatalog| {
                WorkflowDefinition::builder("main")
                    .activity("no-such-activity")
                    .resolve(catalog)
            })
            .unwrap();
        let err = registry.build(&echo_catalog()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnresolvedActivity {
                workflow: "main".into(),
                activity: "no-such-activity".into(),
            }
        );
    }

    #[test]
    fn unresolved_activity_is_caught_even_without_resolve() {
        let mut registry = OrchestratorRegistry::new("main");
        registry
            .register("main", |_: &ActivityCatalog| {
                Ok(WorkflowDefinition {
                    name: "main".into(),
                    steps: vec![WorkflowStep::Activity("ghost".into())],
                })
            })
            .unwrap();
        assert!(matches!(
            registry.build(&echo_catalog()),
            Err(RegistryError::UnresolvedActivity { .. })
        ));
    }

    #[test]
    fn missing_primary_fails_build() {
        let mut registry = OrchestratorRegistry::new("main");
        registry.register("sub", simple("sub")).unwrap();
        let err = registry.build(&echo_catalog()).unwrap_err();
        assert_eq!(err, RegistryError::MissingPrimary("main".into()));
    }

    #[test]
    fn unknown_sub_workflow_fails_build() {
        let mut registry = OrchestratorRegistry::new("main");
        registry
            .register("main", |catalog: &ActivityCatalog| {
                WorkflowDefinition::builder("main")
                    .sub_workflow("missing-sub")
                    .resolve(catalog)
            })
            .unwrap();
        let err = registry.build(&echo_catalog()).unwrap_err();
        assert!(matches!(err, RegistryError::UnresolvedSubWorkflow { .. }));
    }

    #[test]
    fn sub_workflow_cycle_fails_build() {
        let mut registry = OrchestratorRegistry::new("a");
        registry
            .register("a", |c: &ActivityCatalog| WorkflowDefinition::builder("a").sub_workflow("b").resolve(c))
            .unwrap();
        registry
            .register("b", |c: &ActivityCatalog| WorkflowDefinition::builder("b").sub_workflow("a").resolve(c))
            .unwrap();
        let err = registry.build(&echo_catalog()).unwrap_err();
        assert!(matches!(err, RegistryError::CyclicSubWorkflow(_)));
    }

    #[test]
    fn builder_name_mismatch_fails_build() {
        let mut registry = OrchestratorRegistry::new("main");
        registry.register("main", simple("other")).unwrap();
        let err = registry.build(&echo_catalog()).unwrap_err();
        assert!(matches!(err, RegistryError::NameMismatch { .. }));
    }

    #[test]
    fn registry_can_build_repeatedly_against_new_catalogs() {
        let mut registry = OrchestratorRegistry::new("main");
        registry.register("main", simple("main")).unwrap();
        let first = registry.build(&echo_catalog()).unwrap();
        let second = registry.build(&echo_catalog()).unwrap();
        assert_eq!(first.names(), second.names());
    }

    proptest! {
        #[test]
        fn unique_names_build_exactly_those_names(
            names in proptest::collection::hash_set("[a-z]{1,12}", 1..20)
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let mut registry = OrchestratorRegistry::new(names[0].as_str());
            for name in &names {
                let owned = name.clone();
                registry
                    .register(name.as_str(), move |c: &ActivityCatalog| {
                        WorkflowDefinition::builder(owned.as_str()).activity(VALIDATE_DOCUMENT).resolve(c)
                    })
                    .unwrap();
            }
            let table = registry.build(&echo_catalog()).unwrap();
            let mut expected: Vec<&str> = names.iter().map(String::as_str).collect();
            expected.sort_unstable();
            let built: Vec<&str> = table.names().into_iter().map(WorkflowName::as_str).collect();
            prop_assert_eq!(built, expected);
        }

        #[test]
        fn any_repeated_name_never_builds(
            names in proptest::collection::vec("[a-z]{1,4}", 1..10),
            dup_index in 0usize..10
        ) {
            let dup = names[dup_index % names.len()].clone();
            let mut registry = OrchestratorRegistry::new(names[0].as_str());
            for name in names.iter().chain(std::iter::once(&dup)) {
                let owned = name.clone();
                let _ = registry.register(name.as_str(), move |c: &ActivityCatalog| {
                    WorkflowDefinition::builder(owned.as_str()).activity(VALIDATE_DOCUMENT).resolve(c)
                });
            }
            let result = registry.build(&echo_catalog());
            prop_assert!(matches!(result, Err(RegistryError::DuplicateWorkflowName(_))));
        }
    }
}
