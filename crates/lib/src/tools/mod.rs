//! Tools the agent may call mid-turn, behind the [`Tool`] capability and an explicit [`ToolRegistry`].
//!
//! Built-ins: `web_search`, `web_fetch`, `read_skill` (read-on-demand skills). Skills add command tools
//! through their tools.json descriptors.

mod command;
mod schema;
mod search;
mod skill;
mod web;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::config::{Config, SkillContextMode};
use crate::llm::{ToolDefinition, ToolFunctionDefinition};
use crate::skills::SkillEntry;

pub use command::CommandTool;
pub use schema::validate_arguments;
pub use search::{SearchBackend, SearchHit, SearchProviderSpec, SEARCH_PROVIDERS};
pub use skill::ReadSkillTool;
pub use web::{WebFetchTool, WebSearchTool};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool failed: {0}")]
    Execution(String),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value) -> Result<String, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            typ: "function".to_string(),
            function: ToolFunctionDefinition {
                name: self.name().to_string(),
                description: Some(self.description().to_string()),
                parameters: self.parameters(),
            },
        }
    }
}

/// One tool call inside a single agent turn. Never persisted.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    /// 1-based count of calls to this tool so far in the turn.
    pub attempt_count: u32,
}

/// Tools by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in web tools, `read_skill` when skills are read on demand, and skill command tools.
    pub fn from_config(config: &Config, skills: &[SkillEntry]) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSearchTool::from_config(config)));
        registry.register(Arc::new(WebFetchTool::new(config.tools.web.fetch.max_chars)));
        if config.skills.context_mode == SkillContextMode::ReadOnDemand && !skills.is_empty() {
            registry.register(Arc::new(ReadSkillTool::new(skills)));
        }
        for tool in command::tools_from_skills(skills) {
            if registry.get(tool.name()).is_some() {
                log::warn!("tools: skill tool {} shadows an existing tool; skipped", tool.name());
                continue;
            }
            registry.register(Arc::new(tool));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up, validate, and run one invocation. The tool runs on its own task so a panic
    /// comes back as `ToolError::Execution` instead of unwinding through the agent. The task
    /// is aborted if this future is dropped (turn timeout), so the tool stops with the turn.
    pub async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let tool = self
            .get(&invocation.tool_name)
            .ok_or_else(|| ToolError::UnknownTool(invocation.tool_name.clone()))?;
        let args = validate_arguments(&tool.parameters(), &invocation.arguments)?;
        let mut task = JoinSet::new();
        task.spawn(async move { tool.execute(args).await });
        match task.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) if e.is_panic() => Err(ToolError::Execution(format!(
                "{} panicked",
                invocation.tool_name
            ))),
            Some(Err(e)) => Err(ToolError::Execution(e.to_string())),
            None => Err(ToolError::Execution(format!(
                "{} did not run",
                invocation.tool_name
            ))),
        }
    }
}
