//! Write-once registries mapping workflow and activity names to erased
//! invocation wrappers.
//!
//! Only names and payloads cross the durable boundary; implementations are
//! looked up here at runtime. The registry is code, not data: every worker
//! must be constructed with the same registrations. The converter is
//! captured into each wrapper at registration time, so nothing downstream
//! needs to name it.

use crate::activity::ActivityContext;
use crate::workflow::context::WorkflowContext;
use futures::future::{BoxFuture, LocalBoxFuture};
use heddle_core::converter::{Converter, FromPayloads, JsonConverter};
use heddle_core::error::WorkflowError;
use heddle_core::payload::Payload;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Erased workflow invocation: decodes inputs, runs the function, encodes
/// the result. The returned future is not `Send`; it only ever runs on the
/// executor's cooperative scheduler.
pub type WorkflowFunction<C> = dyn Fn(WorkflowContext<C>, Vec<Payload>) -> LocalBoxFuture<'static, Result<Payload, WorkflowError>>
    + Send
    + Sync;

/// Erased activity invocation. Activities run on the host runtime and must
/// be `Send`.
pub type ActivityFunction =
    dyn Fn(ActivityContext, Vec<Payload>) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a {kind} named '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },
}

pub struct Registry<C: Converter = JsonConverter> {
    converter: C,
    workflows: HashMap<String, Arc<WorkflowFunction<C>>>,
    activities: HashMap<String, Arc<ActivityFunction>>,
}

impl<C: Converter> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Self {
            converter: self.converter.clone(),
            workflows: self.workflows.clone(),
            activities: self.activities.clone(),
        }
    }
}

impl Registry<JsonConverter> {
    /// Builder over the default JSON converter.
    pub fn builder() -> RegistryBuilder<JsonConverter> {
        RegistryBuilder { registry: Registry::new(JsonConverter) }
    }
}

impl<C: Converter> Registry<C> {
    pub fn new(converter: C) -> Self {
        Self { converter, workflows: HashMap::new(), activities: HashMap::new() }
    }

    /// Builder with an explicit converter.
    pub fn builder_with_converter(converter: C) -> RegistryBuilder<C> {
        RegistryBuilder { registry: Registry::new(converter) }
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    /// Registers a workflow function under a name.
    ///
    /// The function takes the workflow context plus one argument tuple
    /// implementing [`FromPayloads`] and returns `anyhow::Result<R>`.
    pub fn register_workflow<A, R, F, Fut>(&mut self, name: &str, func: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkflowContext<C>, A) -> Fut + Send + Sync + 'static,
        A: FromPayloads + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = anyhow::Result<R>> + 'static,
    {
        if self.workflows.contains_key(name) {
            return Err(RegistryError::DuplicateName { kind: "workflow", name: name.to_string() });
        }

        let converter = self.converter.clone();
        let func = Arc::new(func);
        let wrapper = move |ctx: WorkflowContext<C>, inputs: Vec<Payload>| -> LocalBoxFuture<'static, Result<Payload, WorkflowError>> {
            let converter = converter.clone();
            let func = Arc::clone(&func);
            Box::pin(async move {
                let args = A::from_payloads(&converter, &inputs)
                    .map_err(|e| WorkflowError::failure(format!("invalid workflow inputs: {e}")))?;
                let output = func(ctx, args).await.map_err(into_workflow_error)?;
                converter
                    .to_payload(&output)
                    .map_err(|e| WorkflowError::failure(format!("failed to encode workflow result: {e}")))
            })
        };
        self.workflows.insert(name.to_string(), Arc::new(wrapper));
        Ok(())
    }

    /// Registers an activity function under a name.
    pub fn register_activity<A, R, F, Fut>(&mut self, name: &str, func: F) -> Result<(), RegistryError>
    where
        F: Fn(ActivityContext, A) -> Fut + Send + Sync + 'static,
        A: FromPayloads + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if self.activities.contains_key(name) {
            return Err(RegistryError::DuplicateName { kind: "activity", name: name.to_string() });
        }

        let converter = self.converter.clone();
        let func = Arc::new(func);
        let wrapper = move |ctx: ActivityContext, inputs: Vec<Payload>| -> BoxFuture<'static, anyhow::Result<Payload>> {
            let converter = converter.clone();
            let func = Arc::clone(&func);
            Box::pin(async move {
                let args = A::from_payloads(&converter, &inputs)?;
                let output = func(ctx, args).await?;
                Ok(converter.to_payload(&output)?)
            })
        };
        self.activities.insert(name.to_string(), Arc::new(wrapper));
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowFunction<C>>> {
        self.workflows.get(name).cloned()
    }

    pub fn activity(&self, name: &str) -> Option<Arc<ActivityFunction>> {
        self.activities.get(name).cloned()
    }

    pub fn has_activity(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }
}

fn into_workflow_error(error: anyhow::Error) -> WorkflowError {
    match error.downcast::<WorkflowError>() {
        Ok(workflow_error) => workflow_error,
        Err(other) => WorkflowError::failure(other.to_string()),
    }
}

/// Fluent registration, consumed once at worker startup.
///
/// # Panics
///
/// Panics on duplicate names; registration runs once during process startup
/// where misconfiguration should be fatal.
pub struct RegistryBuilder<C: Converter> {
    registry: Registry<C>,
}

impl<C: Converter> RegistryBuilder<C> {
    pub fn workflow<A, R, F, Fut>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(WorkflowContext<C>, A) -> Fut + Send + Sync + 'static,
        A: FromPayloads + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = anyhow::Result<R>> + 'static,
    {
        if let Err(e) = self.registry.register_workflow(name, func) {
            panic!("{e}");
        }
        self
    }

    pub fn activity<A, R, F, Fut>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(ActivityContext, A) -> Fut + Send + Sync + 'static,
        A: FromPayloads + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if let Err(e) = self.registry.register_activity(name, func) {
            panic!("{e}");
        }
        self
    }

    pub fn build(self) -> Registry<C> {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_looks_up_by_name() {
        let registry = Registry::builder()
            .workflow("wf", |_ctx, (): ()| async move { anyhow::Ok(0i32) })
            .activity("act", |_ctx, (a,): (i32,)| async move { anyhow::Ok(a * 2) })
            .build();

        assert!(registry.workflow("wf").is_some());
        assert!(registry.workflow("missing").is_none());
        assert!(registry.has_activity("act"));
        assert!(!registry.has_activity("missing"));
    }

    #[test]
    fn duplicate_workflow_name_is_rejected() {
        let mut registry = Registry::new(JsonConverter);
        registry
            .register_workflow("wf", |_ctx, (): ()| async move { anyhow::Ok(0i32) })
            .unwrap();
        let result = registry.register_workflow("wf", |_ctx, (): ()| async move { anyhow::Ok(1i32) });
        assert!(matches!(result, Err(RegistryError::DuplicateName { .. })));
    }

    #[tokio::test]
    async fn activity_wrapper_decodes_and_encodes() {
        let registry = Registry::builder()
            .activity("double", |_ctx, (a,): (i32,)| async move { anyhow::Ok(a * 2) })
            .build();

        let converter = *registry.converter();
        let inputs = vec![converter.to_payload(&21i32).unwrap()];
        let activity = registry.activity("double").unwrap();
        let ctx = ActivityContext {
            instance: heddle_core::instance::WorkflowInstance::new("i", "e"),
            task_id: "t".to_string(),
            schedule_event_id: 1,
        };

        let payload = activity(ctx, inputs).await.unwrap();
        let result: i32 = converter.from_payload(&payload).unwrap();
        assert_eq!(result, 42);
    }
}
