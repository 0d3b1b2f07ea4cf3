// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow registry.
//!
//! Maps the identifier stored on a process back to the workflow that drives
//! it. Workflows are registered explicitly at startup; the stage table of each
//! one is validated at registration so a bad definition fails the worker on
//! boot instead of on the first job that hits it.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::workflow::{Registered, ResolvedWorkflow, Workflow};

/// Registry of known workflows.
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, ResolvedWorkflow>,
    types: HashMap<TypeId, &'static str>,
}

impl WorkflowRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow constructed with `Default`.
    pub fn register<W: Workflow + Default>(&mut self) -> Result<&mut Self> {
        self.register_instance(W::default())
    }

    /// Register a workflow instance, for workflows that carry configuration
    /// such as API clients.
    pub fn register_instance<W: Workflow>(&mut self, workflow: W) -> Result<&mut Self> {
        let identifier = W::IDENTIFIER;

        if self.workflows.contains_key(identifier) {
            return Err(EngineError::InvalidWorkflowType {
                identifier: identifier.to_string(),
                reason: "identifier is already registered".to_string(),
            });
        }

        let (meta, handlers) = W::stages().validate(identifier)?;
        let registered = Registered {
            workflow: Arc::new(workflow),
            meta: Arc::new(meta),
            handlers,
        };

        debug!(
            workflow = identifier,
            stages = ?registered.meta.stages(),
            "Registered workflow"
        );

        self.workflows.insert(
            identifier.to_string(),
            ResolvedWorkflow::new(Arc::new(registered)),
        );
        self.types.insert(TypeId::of::<W>(), identifier);

        Ok(self)
    }

    /// Look up the workflow for a stored identifier.
    pub fn resolve(&self, identifier: &str) -> Result<ResolvedWorkflow> {
        self.workflows
            .get(identifier)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(identifier.to_string()))
    }

    /// The identifier persisted for processes of `W`.
    pub fn identifier_for<W: Workflow>(&self) -> Result<&'static str> {
        self.types
            .get(&TypeId::of::<W>())
            .copied()
            .ok_or_else(|| EngineError::WorkflowNotFound(W::IDENTIFIER.to_string()))
    }

    /// All registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut identifiers: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        identifiers.sort_unstable();
        identifiers
    }

    /// Number of registered workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.identifiers())
            .finish()
    }
}
