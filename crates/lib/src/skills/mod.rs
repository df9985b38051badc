//! Skills: AgentSkills-compatible SKILL.md directories.
//!
//! Skills load from the config directory's skills (~/.banobot/skills) and any config.skills.extraDirs.
//! Precedence: extra overwrites config dir by name. A `tools.json` next to SKILL.md declares command tools.

mod descriptor;
mod loader;

pub use descriptor::{ArgKind, ArgMapping, ExecutionSpec, ToolDescriptor, ToolSpec};
pub use loader::{load_skills, strip_frontmatter, SkillEntry, SkillSource};
