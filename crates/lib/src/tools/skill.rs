use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolError};
use crate::skills::SkillEntry;

/// `read_skill`: full SKILL.md body for one skill, for read-on-demand context mode.
pub struct ReadSkillTool {
    bodies: HashMap<String, String>,
}

impl ReadSkillTool {
    pub fn new(skills: &[SkillEntry]) -> Self {
        Self {
            bodies: skills
                .iter()
                .map(|s| (s.name.clone(), s.body().to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl Tool for ReadSkillTool {
    fn name(&self) -> &str {
        "read_skill"
    }

    fn description(&self) -> &str {
        "Load the full instructions (SKILL.md) for a skill by name before using it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {"type": "string", "description": "Skill name from the available skills list"}
            },
            "required": ["skill_name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let name = args["skill_name"].as_str().unwrap_or_default().trim();
        self.bodies.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.bodies.keys().map(String::as_str).collect();
            known.sort();
            ToolError::InvalidArguments(format!(
                "unknown skill '{}'; available: {}",
                name,
                known.join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::SkillSource;
    use std::path::PathBuf;

    fn skill(name: &str, content: &str) -> SkillEntry {
        SkillEntry {
            name: name.to_string(),
            description: String::new(),
            source: SkillSource::Skills,
            path: PathBuf::from(name),
            content: content.to_string(),
            tool_descriptor: None,
        }
    }

    #[tokio::test]
    async fn returns_body_or_lists_known_skills() {
        let tool = ReadSkillTool::new(&[skill("web-research", "---\nname: web-research\n---\nSearch first.")]);
        let body = tool.execute(json!({"skill_name": "web-research"})).await.unwrap();
        assert_eq!(body, "Search first.");
        let err = tool.execute(json!({"skill_name": "nope"})).await.unwrap_err();
        assert!(err.to_string().contains("available: web-research"));
    }
}
