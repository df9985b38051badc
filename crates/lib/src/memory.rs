//! Long-term memory files in the workspace: `memory/MEMORY.md` plus today's `memory/YYYY-MM-DD.md` notes.

use std::path::{Path, PathBuf};

pub struct MemoryStore {
    dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("memory"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_non_empty(path: &Path) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    pub fn long_term(&self) -> Option<String> {
        Self::read_non_empty(&self.dir.join("MEMORY.md"))
    }

    pub fn today(&self) -> Option<String> {
        let name = format!("{}.md", chrono::Local::now().format("%Y-%m-%d"));
        Self::read_non_empty(&self.dir.join(name))
    }

    /// Memory section for the system prompt, or None when there is nothing stored.
    pub fn context(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(long) = self.long_term() {
            parts.push(format!("## Long-term Memory\n{}", long));
        }
        if let Some(today) = self.today() {
            parts.push(format!("## Today's Notes\n{}", today));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}
