//! Command tools declared by a skill's tools.json: JSON parameters mapped to argv,
//! run through the descriptor's allowlist.

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolError};
use crate::exec::Allowlist;
use crate::skills::{ArgKind, ArgMapping, ExecutionSpec, SkillEntry};

/// One tools.json tool bound to its execution spec.
#[derive(Debug, Clone)]
pub struct CommandTool {
    name: String,
    description: String,
    parameters: Value,
    spec: ExecutionSpec,
    allowlist: Allowlist,
}

impl CommandTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        spec: ExecutionSpec,
        allowlist: Allowlist,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            spec,
            allowlist,
        }
    }
}

/// Every execution entry with a matching tool definition, across all skills.
pub(super) fn tools_from_skills(skills: &[SkillEntry]) -> Vec<CommandTool> {
    let mut out = Vec::new();
    for skill in skills {
        let Some(desc) = &skill.tool_descriptor else {
            continue;
        };
        let allowlist = desc.to_allowlist();
        for spec in &desc.execution {
            let Some(def) = desc.spec_for(&spec.tool) else {
                log::warn!(
                    "skill {}: execution entry {} has no tool definition; skipped",
                    skill.name,
                    spec.tool
                );
                continue;
            };
            if !allowlist.permits(&spec.binary, &spec.subcommand) {
                log::warn!(
                    "skill {}: {} {} is not in the allowlist; tool {} skipped",
                    skill.name,
                    spec.binary,
                    spec.subcommand,
                    spec.tool
                );
                continue;
            }
            out.push(CommandTool::new(
                def.name.clone(),
                def.description.clone().unwrap_or_default(),
                def.parameters.clone(),
                spec.clone(),
                allowlist.clone(),
            ));
        }
    }
    out
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let argv = build_argv(&self.spec, &args).map_err(ToolError::InvalidArguments)?;
        self.allowlist
            .run(&self.spec.binary, &self.spec.subcommand, &argv)
            .await
            .map_err(ToolError::Execution)
    }
}

/// Build argv from the execution spec's arg mapping and the JSON args object.
fn build_argv(spec: &ExecutionSpec, args: &Value) -> Result<Vec<String>, String> {
    let obj = args
        .as_object()
        .ok_or_else(|| "arguments must be an object".to_string())?;
    let mut argv = Vec::new();
    for arg in &spec.args {
        match arg.kind {
            ArgKind::Positional => {
                let value = obj
                    .get(&arg.param)
                    .ok_or_else(|| format!("missing parameter: {}", arg.param))?;
                argv.push(param_string(arg, value)?);
            }
            ArgKind::Flag => {
                let value = match obj.get(&arg.param) {
                    Some(v) if !v.is_null() => v,
                    _ => continue,
                };
                let flag = arg.flag.as_deref().unwrap_or(&arg.param);
                argv.push(format!("--{}", flag));
                argv.push(param_string(arg, value)?);
            }
            ArgKind::FlagIfBoolean => {
                let flag = match parse_bool(obj.get(&arg.param)) {
                    Some(true) => arg.flag_if_true.as_deref(),
                    _ => arg.flag_if_false.as_deref(),
                };
                if let Some(f) = flag {
                    argv.push(f.to_string());
                }
            }
        }
    }
    Ok(argv)
}

fn param_string(arg: &ArgMapping, value: &Value) -> Result<String, String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            return Err(format!(
                "parameter {} must be a string, number, or boolean",
                arg.param
            ))
        }
    };
    if arg.normalize_newlines == Some(true) {
        Ok(s.replace("\\n", "\n").replace("\\t", "\t"))
    } else {
        Ok(s)
    }
}

fn parse_bool(v: Option<&Value>) -> Option<bool> {
    match v {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => Some(s.eq_ignore_ascii_case("true")),
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}
