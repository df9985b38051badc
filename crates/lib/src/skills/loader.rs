//! Load skills from dirs: each skill is a directory with SKILL.md (YAML frontmatter + markdown).
//! Skills with `metadata.requires.bins` are only loaded when all listed binaries are on PATH.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::descriptor::ToolDescriptor;

/// A loaded skill.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub source: SkillSource,
    pub path: PathBuf,
    /// Raw SKILL.md content.
    pub content: String,
    /// Parsed tools.json, when present and valid.
    pub tool_descriptor: Option<ToolDescriptor>,
}

impl SkillEntry {
    /// SKILL.md without its frontmatter.
    pub fn body(&self) -> &str {
        strip_frontmatter(&self.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    /// From the config directory's skills subdirectory.
    Skills,
    /// From config.skills.extraDirs.
    Extra,
}

#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    metadata: Option<SkillMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct SkillMetadata {
    #[serde(default)]
    requires: Option<Requires>,
}

#[derive(Debug, Default, Deserialize)]
struct Requires {
    #[serde(default)]
    bins: Option<Vec<String>>,
}

/// Load skills from the primary dir and extra dirs, skipping `disabled` names. Sorted by name.
pub fn load_skills(
    skills_dir: Option<&Path>,
    extra_dirs: &[PathBuf],
    disabled: &[String],
) -> Result<Vec<SkillEntry>> {
    let mut merged: HashMap<String, SkillEntry> = HashMap::new();

    if let Some(d) = skills_dir {
        for e in load_skills_from_dir(d, SkillSource::Skills)? {
            merged.insert(e.name.clone(), e);
        }
    }
    for dir in extra_dirs {
        for e in load_skills_from_dir(dir, SkillSource::Extra)? {
            merged.insert(e.name.clone(), e);
        }
    }

    let mut skills: Vec<SkillEntry> = merged
        .into_values()
        .filter(|s| !disabled.iter().any(|d| d == &s.name))
        .collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills)
}

fn load_skills_from_dir(dir: &Path, source: SkillSource) -> Result<Vec<SkillEntry>> {
    let mut out = Vec::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(_) => return Ok(out),
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let content = match std::fs::read_to_string(path.join("SKILL.md")) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let (name, description, required_bins) = parse_skill_frontmatter(&content, &path);
        if let Some(bins) = &required_bins {
            if !bins.is_empty() && !bins.iter().all(|b| bin_on_path(b)) {
                log::debug!(
                    "skipping skill {}: required bins {:?} not all on PATH",
                    name,
                    bins
                );
                continue;
            }
        }
        let tool_descriptor = load_tool_descriptor(&path);
        out.push(SkillEntry {
            name,
            description,
            source,
            path,
            content,
            tool_descriptor,
        });
    }
    Ok(out)
}

fn load_tool_descriptor(skill_dir: &Path) -> Option<ToolDescriptor> {
    let path = skill_dir.join("tools.json");
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<ToolDescriptor>(&content) {
        Ok(d) => Some(d),
        Err(e) => {
            log::warn!("failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// True if `bin` is on PATH (or is a path to an existing file).
fn bin_on_path(bin: &str) -> bool {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(bin).is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(bin);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

/// Content after a leading `---` ... `---` block; the whole input when there is none.
pub fn strip_frontmatter(content: &str) -> &str {
    frontmatter_bounds(content)
        .map(|(_, body_start)| content[body_start..].trim_start())
        .unwrap_or(content)
}

/// (yaml, offset of the body) when `content` opens with a frontmatter block.
fn frontmatter_bounds(content: &str) -> Option<(&str, usize)> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let after = 3 + end + "\n---".len();
    let body_start = content[after..]
        .find('\n')
        .map(|i| after + i + 1)
        .unwrap_or(content.len());
    Some((yaml, body_start))
}

fn parse_skill_frontmatter(
    content: &str,
    fallback_path: &Path,
) -> (String, String, Option<Vec<String>>) {
    let mut name = fallback_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let mut description = String::new();
    let mut required_bins = None;

    if let Some((yaml, _)) = frontmatter_bounds(content) {
        match serde_yaml::from_str::<SkillFrontmatter>(yaml) {
            Ok(fm) => {
                if let Some(n) = fm.name {
                    name = n;
                }
                if let Some(d) = fm.description {
                    description = d;
                }
                required_bins = fm.metadata.and_then(|m| m.requires).and_then(|r| r.bins);
            }
            Err(e) => log::debug!("skill {}: bad frontmatter: {}", name, e),
        }
    }

    (name, description, required_bins)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("banobot-skills-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_skill(root: &Path, dir: &str, content: &str) {
        let d = root.join(dir);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn strips_frontmatter() {
        let s = "---\nname: x\n---\n# Title\nbody";
        assert_eq!(strip_frontmatter(s), "# Title\nbody");
        assert_eq!(strip_frontmatter("no frontmatter"), "no frontmatter");
    }

    #[test]
    fn loads_frontmatter_and_honours_disabled_and_precedence() {
        let main = temp_dir();
        let extra = temp_dir();
        write_skill(&main, "web", "---\nname: web-research\ndescription: Search first\n---\nUse web_search.");
        write_skill(&main, "weather", "---\nname: weather\ndescription: old\n---\n");
        write_skill(&extra, "weather2", "---\nname: weather\ndescription: new\n---\n");
        write_skill(&main, "off", "---\nname: off\n---\n");
        write_skill(
            &main,
            "needs-bin",
            "---\nname: needs-bin\nmetadata:\n  requires:\n    bins: [\"definitely-not-a-real-binary-xyz\"]\n---\n",
        );

        let skills = load_skills(Some(&main), &[extra.clone()], &["off".to_string()]).unwrap();
        let names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["weather", "web-research"]);
        let weather = &skills[0];
        assert_eq!(weather.description, "new");
        assert_eq!(weather.source, SkillSource::Extra);
        assert_eq!(skills[1].body(), "Use web_search.");

        let _ = std::fs::remove_dir_all(&main);
        let _ = std::fs::remove_dir_all(&extra);
    }

    #[test]
    fn missing_dir_yields_no_skills() {
        let missing = std::env::temp_dir().join(format!("banobot-none-{}", uuid::Uuid::new_v4()));
        assert!(load_skills(Some(&missing), &[], &[]).unwrap().is_empty());
    }
}
