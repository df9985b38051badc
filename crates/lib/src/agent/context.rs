//! System prompt and message assembly for a turn.

use std::path::{Path, PathBuf};

use crate::bus::InboundMessage;
use crate::config::SkillContextMode;
use crate::llm::ChatMessage;
use crate::memory::MemoryStore;
use crate::skills::SkillEntry;

/// Builds the system prompt from the workspace (AGENTS.md, memory), skills, and the current chat.
pub struct ContextBuilder {
    workspace: Option<PathBuf>,
    memory: Option<MemoryStore>,
    skills: Vec<SkillEntry>,
    mode: SkillContextMode,
}

impl ContextBuilder {
    pub fn new(workspace: Option<PathBuf>, skills: Vec<SkillEntry>, mode: SkillContextMode) -> Self {
        let memory = workspace.as_deref().map(MemoryStore::new);
        Self {
            workspace,
            memory,
            skills,
            mode,
        }
    }

    /// No workspace and no skills: date, runtime, and session info only.
    pub fn bare() -> Self {
        Self::new(None, Vec::new(), SkillContextMode::Full)
    }

    /// AGENTS.md from the workspace, when present and non-empty.
    fn agents_md(&self) -> Option<String> {
        let path = self.workspace.as_deref().map(|d| d.join("AGENTS.md"))?;
        read_non_empty(&path)
    }

    pub fn system_prompt(&self, msg: &InboundMessage) -> String {
        let mut sections = Vec::new();
        sections.push(format!(
            "Current time: {}\nRuntime: {} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M (%A)"),
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
        if let Some(agents) = self.agents_md() {
            sections.push(agents);
        }
        if let Some(memory) = self.memory.as_ref().and_then(MemoryStore::context) {
            sections.push(format!("# Memory\n\n{}", memory));
        }
        let skills = match self.mode {
            SkillContextMode::Full => skill_context_full(&self.skills),
            SkillContextMode::ReadOnDemand => skill_context_compact(&self.skills),
        };
        if !skills.trim().is_empty() {
            sections.push(skills.trim_end().to_string());
        }
        let origin = if msg.is_cron() {
            "\nThis turn was triggered by a scheduled job, not typed by a user."
        } else {
            ""
        };
        sections.push(format!(
            "## Current Session\nChannel: {}\nChat ID: {}{}",
            msg.channel_id, msg.chat_id, origin
        ));
        sections.join("\n\n---\n\n")
    }

    /// System prompt, then history, then the new user turn.
    pub fn build_messages(&self, history: Vec<ChatMessage>, msg: &InboundMessage) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(msg)));
        messages.extend(history);
        messages.push(user_turn(msg));
        messages
    }
}

/// The inbound text plus one line per attachment.
pub(crate) fn user_turn(msg: &InboundMessage) -> ChatMessage {
    let mut content = msg.text.clone();
    for a in &msg.attachments {
        let location = a.url.as_deref().unwrap_or("(inline)");
        content.push_str(&format!("\n[{}: {}]", a.kind, location));
    }
    ChatMessage::user(content)
}

fn read_non_empty(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn skill_context_full(skills: &[SkillEntry]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from("# Skills\n\nYou have access to the following skills:\n\n");
    for s in skills {
        out.push_str(&format!("## {}\n", s.name));
        if !s.description.is_empty() {
            out.push_str(s.description.trim());
            out.push_str("\n\n");
        }
        out.push_str(s.body().trim());
        out.push_str("\n\n");
    }
    out
}

fn skill_context_compact(skills: &[SkillEntry]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "# Skills\n\nUse the read_skill tool to load a skill's full instructions when it clearly applies to the request.\n\n",
    );
    for s in skills {
        let desc = if s.description.is_empty() {
            "(no description)"
        } else {
            s.description.trim()
        };
        out.push_str(&format!("- **{}**: {}\n", s.name, desc));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Attachment;
    use crate::skills::SkillSource;

    fn skill() -> SkillEntry {
        SkillEntry {
            name: "web-research".into(),
            description: "Look things up".into(),
            source: SkillSource::Skills,
            path: PathBuf::from("web-research"),
            content: "---\nname: web-research\n---\nCall web_search first.".into(),
            tool_descriptor: None,
        }
    }

    #[test]
    fn full_mode_inlines_skill_bodies() {
        let ctx = ContextBuilder::new(None, vec![skill()], SkillContextMode::Full);
        let prompt = ctx.system_prompt(&InboundMessage::new("telegram", "42", "u", "hi"));
        assert!(prompt.contains("## web-research\nLook things up\n\nCall web_search first."));
        assert!(prompt.contains("Channel: telegram\nChat ID: 42"));
    }

    #[test]
    fn compact_mode_lists_names_only() {
        let ctx = ContextBuilder::new(None, vec![skill()], SkillContextMode::ReadOnDemand);
        let prompt = ctx.system_prompt(&InboundMessage::new("slack", "C1", "u", "hi"));
        assert!(prompt.contains("- **web-research**: Look things up"));
        assert!(!prompt.contains("Call web_search first."));
    }

    #[test]
    fn reads_agents_md_and_orders_messages() {
        let ws = std::env::temp_dir().join(format!("banobot-ctx-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("AGENTS.md"), "Be concise.").unwrap();
        let ctx = ContextBuilder::new(Some(ws.clone()), Vec::new(), SkillContextMode::Full);
        let msg = InboundMessage::new("telegram", "1", "u", "look").with_attachments(vec![Attachment {
            kind: "image".into(),
            url: Some("telegram:file/abc".into()),
            mime_type: None,
        }]);
        let messages = ctx.build_messages(vec![ChatMessage::user("earlier")], &msg);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].content.contains("Be concise."));
        assert_eq!(messages[1].content, "earlier");
        assert_eq!(messages[2].content, "look\n[image: telegram:file/abc]");
        let _ = std::fs::remove_dir_all(&ws);
    }
}
