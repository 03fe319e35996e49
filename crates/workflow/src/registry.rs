//! Name-keyed workflow registry.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};

/// A workflow body: a sequential code path over steps.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Runs the workflow. Steps go through `ctx` so they are recorded and
    /// compensated.
    async fn run(&self, input: Self::Input, ctx: &WorkflowContext) -> Result<Self::Output>;
}

/// Type-erased view of a workflow, driven with JSON values.
#[async_trait]
pub(crate) trait ErasedWorkflow: Send + Sync {
    fn validate_input(&self, input: &serde_json::Value) -> std::result::Result<(), String>;

    async fn run_json(
        &self,
        input: serde_json::Value,
        ctx: &WorkflowContext,
    ) -> Result<serde_json::Value>;
}

struct WorkflowAdapter<W>(W);

#[async_trait]
impl<W: Workflow> ErasedWorkflow for WorkflowAdapter<W> {
    fn validate_input(&self, input: &serde_json::Value) -> std::result::Result<(), String> {
        W::Input::deserialize(input)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn run_json(
        &self,
        input: serde_json::Value,
        ctx: &WorkflowContext,
    ) -> Result<serde_json::Value> {
        let input: W::Input = serde_json::from_value(input)?;
        let output = self.0.run(input, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// A registered workflow: name, input and output types, and body.
pub struct WorkflowDefinition {
    name: String,
    input_type: TypeId,
    input_type_name: &'static str,
    output_type: TypeId,
    output_type_name: &'static str,
    body: Box<dyn ErasedWorkflow>,
}

impl WorkflowDefinition {
    pub fn new<W: Workflow>(name: impl Into<String>, workflow: W) -> Self {
        Self {
            name: name.into(),
            input_type: TypeId::of::<W::Input>(),
            input_type_name: type_name::<W::Input>(),
            output_type: TypeId::of::<W::Output>(),
            output_type_name: type_name::<W::Output>(),
            body: Box::new(WorkflowAdapter(workflow)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            name: self.name.clone(),
            input_type: self.input_type_name.to_string(),
            output_type: self.output_type_name.to_string(),
        }
    }

    /// Checks that `I` is the registered input type.
    pub fn check_input_type<I: 'static>(&self) -> Result<()> {
        if TypeId::of::<I>() == self.input_type {
            return Ok(());
        }
        Err(WorkflowError::InputTypeMismatch {
            workflow: self.name.clone(),
            expected: self.input_type_name.to_string(),
            actual: type_name::<I>().to_string(),
        })
    }

    /// Checks that `O` is the registered output type.
    pub fn check_output_type<O: 'static>(&self) -> Result<()> {
        if TypeId::of::<O>() == self.output_type {
            return Ok(());
        }
        Err(WorkflowError::OutputTypeMismatch {
            workflow: self.name.clone(),
            expected: self.output_type_name.to_string(),
            actual: type_name::<O>().to_string(),
        })
    }

    /// Checks that a JSON value has the registered input shape.
    pub fn check_input_json(&self, input: &serde_json::Value) -> Result<()> {
        self.body
            .validate_input(input)
            .map_err(|reason| WorkflowError::InputTypeMismatch {
                workflow: self.name.clone(),
                expected: self.input_type_name.to_string(),
                actual: reason,
            })
    }

    pub(crate) async fn run(
        &self,
        input: serde_json::Value,
        ctx: &WorkflowContext,
    ) -> Result<serde_json::Value> {
        self.body.run_json(input, ctx).await
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("input_type", &self.input_type_name)
            .field("output_type", &self.output_type_name)
            .finish_non_exhaustive()
    }
}

/// Immutable description of a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
}

/// Registered workflows, keyed by unique name.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `workflow` under `name`.
    pub fn register<W: Workflow>(&self, name: impl Into<String>, workflow: W) -> Result<()> {
        let definition = WorkflowDefinition::new(name, workflow);
        let mut workflows = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if workflows.contains_key(definition.name()) {
            return Err(WorkflowError::DuplicateWorkflowName(
                definition.name().to_string(),
            ));
        }

        tracing::info!(
            workflow = definition.name(),
            input_type = definition.input_type_name,
            "workflow registered"
        );
        workflows.insert(definition.name().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Looks up a workflow by name.
    pub fn get(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(name.to_string()))
    }

    /// Snapshots of every registered workflow, sorted by name.
    pub fn list(&self) -> Vec<WorkflowInfo> {
        let mut infos: Vec<WorkflowInfo> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|definition| definition.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    struct Greet;

    #[async_trait]
    impl Workflow for Greet {
        type Input = Greeting;
        type Output = String;

        async fn run(&self, input: Greeting, _ctx: &WorkflowContext) -> Result<String> {
            Ok(format!("hello {}", input.name))
        }
    }

    #[test]
    fn register_and_list() {
        let registry = WorkflowRegistry::new();
        assert!(registry.is_empty());

        registry.register("greet", Greet).unwrap();
        registry.register("another-greet", Greet).unwrap();

        let names: Vec<String> = registry.list().into_iter().map(|info| info.name).collect();
        assert_eq!(names, vec!["another-greet", "greet"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = WorkflowRegistry::new();
        registry.register("greet", Greet).unwrap();

        let result = registry.register("greet", Greet);
        assert!(matches!(result, Err(WorkflowError::DuplicateWorkflowName(name)) if name == "greet"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_workflow_is_not_found() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn type_checks() {
        let definition = WorkflowDefinition::new("greet", Greet);

        assert!(definition.check_input_type::<Greeting>().is_ok());
        assert!(matches!(
            definition.check_input_type::<u32>(),
            Err(WorkflowError::InputTypeMismatch { .. })
        ));
        assert!(definition.check_output_type::<String>().is_ok());
        assert!(matches!(
            definition.check_output_type::<Vec<u8>>(),
            Err(WorkflowError::OutputTypeMismatch { .. })
        ));

        assert!(
            definition
                .check_input_json(&serde_json::json!({"name": "ada"}))
                .is_ok()
        );
        assert!(matches!(
            definition.check_input_json(&serde_json::json!({"nom": 1})),
            Err(WorkflowError::InputTypeMismatch { .. })
        ));
    }

    #[test]
    fn info_reports_type_names() {
        let info = WorkflowDefinition::new("greet", Greet).info();
        assert!(info.input_type.ends_with("Greeting"));
        assert!(info.output_type.ends_with("String"));
    }
}
