//! Tool descriptor (tools.json) for declarative skill tools.
//!
//! Each tool maps JSON parameters to the argv of an allowlisted binary/subcommand pair.

use serde::Deserialize;
use std::collections::HashMap;

use crate::exec::Allowlist;
use crate::llm::{ToolDefinition, ToolFunctionDefinition};

/// Root structure of a skill's tools.json file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolDescriptor {
    /// Tool definitions for the model (name, description, parameters schema).
    #[serde(default)]
    pub tools: Vec<ToolSpec>,

    /// Binary name -> allowed subcommands. Only these pairs may be run.
    #[serde(default)]
    pub allowlist: HashMap<String, Vec<String>>,

    /// How to run each tool.
    #[serde(default)]
    pub execution: Vec<ExecutionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema for parameters (type, properties, required).
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionSpec {
    /// Tool name (must match a name in `tools`).
    pub tool: String,
    pub binary: String,
    /// Must be in the allowlist for this binary.
    pub subcommand: String,
    #[serde(default)]
    pub args: Vec<ArgMapping>,
}

/// How one JSON parameter is passed to the command.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArgMapping {
    pub param: String,
    #[serde(default)]
    pub kind: ArgKind,
    /// For kind "flag": flag name without dashes. Defaults to `param`.
    #[serde(default)]
    pub flag: Option<String>,
    /// For kind "flagIfBoolean": emitted when the value is true.
    #[serde(default)]
    pub flag_if_true: Option<String>,
    /// For kind "flagIfBoolean": emitted when the value is false or absent.
    #[serde(default)]
    pub flag_if_false: Option<String>,
    /// Convert literal `\n` and `\t` in string values to newlines and tabs.
    #[serde(default)]
    pub normalize_newlines: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgKind {
    #[default]
    Positional,
    /// `--flag value`.
    Flag,
    FlagIfBoolean,
}

impl ToolDescriptor {
    pub fn to_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                typ: "function".to_string(),
                function: ToolFunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    pub fn spec_for(&self, tool: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == tool)
    }

    pub fn to_allowlist(&self) -> Allowlist {
        let mut a = Allowlist::new();
        for (binary, subcommands) in &self.allowlist {
            a.allow(binary.clone(), subcommands.clone());
        }
        a
    }
}
