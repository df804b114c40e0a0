pub mod address;

use crate::domain::types::ToolDefinition;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("unknown tool requested: {0}")]
    UnknownTool(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool execution exceeded {0:?}")]
    Timeout(Duration),
}

/// A named capability the model may invoke. Implementations must be
/// re-entrant: the registry is shared across concurrent runs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError>;
}

/// String-keyed tool lookup. Adding a capability means adding an entry here;
/// the conversation loop never changes.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
    timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations in registration order, identical on every provider call.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Resolves and invokes a tool by name. Every failure mode is converted
    /// into an encoded `{"error": …}` value so the model can self-correct;
    /// a single tool failure never aborts the conversation.
    pub async fn dispatch(&self, name: &str, raw_arguments: &str) -> Value {
        match self.try_dispatch(name, raw_arguments).await {
            Ok(value) => value,
            Err(err) => {
                warn!(tool = name, %err, "Tool dispatch failed");
                json!({ "error": err.to_string() })
            }
        }
    }

    async fn try_dispatch(&self, name: &str, raw_arguments: &str) -> Result<Value, ToolInvokeError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolInvokeError::UnknownTool(name.to_string()))?;

        let arguments = parse_arguments(raw_arguments)?;
        debug!(tool = name, "Dispatching tool call");

        let invocation = tool.invoke(arguments);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, invocation)
                .await
                .map_err(|_| ToolInvokeError::Timeout(limit))?,
            None => invocation.await,
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Value, ToolInvokeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(trimmed).map_err(|err| ToolInvokeError::InvalidArguments(err.to_string()))
}
