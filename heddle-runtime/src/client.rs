//! Client surface: create, signal, cancel and terminate workflow instances
//! through a backend.

use heddle_backend::{Backend, BackendError};
use heddle_core::clock::{Clock, WallClock};
use heddle_core::converter::{ConversionError, Converter, IntoPayloads, JsonConverter};
use heddle_core::history::{Event, EventAttributes};
use heddle_core::instance::WorkflowInstance;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowInstanceOptions {
    /// Instance ID to use; a fresh UUID when absent.
    pub instance_id: Option<String>,
    pub version: String,
}

pub struct Client<B, C: Converter = JsonConverter> {
    backend: Arc<B>,
    converter: C,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> Client<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_converter(backend, JsonConverter)
    }
}

impl<B: Backend, C: Converter> Client<B, C> {
    pub fn with_converter(backend: Arc<B>, converter: C) -> Self {
        Self { backend, converter, clock: Arc::new(WallClock) }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates a new workflow instance running the named workflow.
    pub async fn create_workflow_instance(
        &self,
        options: WorkflowInstanceOptions,
        name: &str,
        args: impl IntoPayloads,
    ) -> Result<WorkflowInstance, ClientError> {
        let inputs = args.into_payloads(&self.converter)?;
        let instance = WorkflowInstance::new(
            options.instance_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            Uuid::new_v4().to_string(),
        );
        let event = Event::new(
            self.clock.now(),
            0,
            EventAttributes::ExecutionStarted {
                name: name.to_string(),
                version: options.version,
                inputs,
            },
        );

        tracing::debug!(instance_id = %instance.instance_id, workflow = %name, "creating workflow instance");
        self.backend.create_workflow_instance(instance.clone(), event).await?;
        Ok(instance)
    }

    /// Delivers a signal to a running instance.
    pub async fn signal_workflow(
        &self,
        instance_id: &str,
        name: &str,
        value: &impl Serialize,
    ) -> Result<(), ClientError> {
        let payload = self.converter.to_payload(value)?;
        let event = Event::new(
            self.clock.now(),
            0,
            EventAttributes::SignalReceived { name: name.to_string(), arg: Some(payload) },
        );
        self.backend.signal_workflow(instance_id, event).await?;
        Ok(())
    }

    /// Requests cancellation; the workflow observes it as canceled futures
    /// and winds down on its own.
    pub async fn cancel_workflow_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.backend.cancel_workflow_instance(instance_id).await?;
        Ok(())
    }

    /// Forcibly ends an instance without running any more workflow code.
    pub async fn terminate_workflow_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.backend.terminate_workflow_instance(instance_id).await?;
        Ok(())
    }
}
