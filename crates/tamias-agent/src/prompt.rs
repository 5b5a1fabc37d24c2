//! System prompt composition.
//!
//! Assembled fresh for every turn, in a fixed order: identity, user
//! profile, agent persona files, enabled skills, project context, recent
//! daily digests, the rolling session summary, the exposed tool names, and
//! tool-usage guidance. The prompt is attached out-of-band to the LLM
//! request — it is never part of `messages`.

use std::path::Path;

use tracing::debug;

use tamias_core::paths::DataRoot;
use tamias_core::types::Agent;
use tamias_sessions::Session;

/// Per-file size cap (characters).
const MAX_FILE_CHARS: usize = 20_000;
/// Number of trailing daily digests to include.
const DAILY_DIGEST_COUNT: usize = 3;

const IDENTITY_FALLBACK: &str =
    "You are Tamias, a helpful assistant reachable across chat platforms.";

const TOOL_GUIDANCE: &str = "\
When a task needs external information or side effects, call the matching \
tool instead of guessing. Tool names are fully qualified as \
category__function or server__function. Report tool failures honestly and \
move on; never invent results.";

/// Compose the full system prompt for one turn.
pub fn compose(
    root: &DataRoot,
    session: &Session,
    agent: Option<&Agent>,
    tool_names: &[String],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    // Identity: IDENTITY.md + SOUL.md, or the built-in fallback.
    let memory = root.memory_dir();
    let identity = [
        read_capped(&memory.join("IDENTITY.md")),
        read_capped(&memory.join("SOUL.md")),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join("\n\n");
    sections.push(if identity.is_empty() {
        IDENTITY_FALLBACK.to_string()
    } else {
        identity
    });

    if let Some(user) = read_capped(&memory.join("USER.md")) {
        sections.push(format!("## About the user\n{user}"));
    }

    // Agent persona: instructions plus every markdown file in its dir.
    if let Some(agent) = agent {
        let mut persona = format!("## Persona: {}\n{}", agent.name, agent.instructions);
        let dir = root.agent_dir(&agent.slug);
        for body in read_dir_markdown(&dir) {
            persona.push_str("\n\n");
            persona.push_str(&body);
        }
        sections.push(persona);

        for skill in &agent.extra_skills {
            if let Some(body) = read_capped(&root.skills_dir().join(skill).join("SKILL.md")) {
                sections.push(format!("## Skill: {skill}\n{body}"));
            }
        }
    }

    // Project context.
    if let Some(slug) = &session.project_slug {
        let project = root.project_dir(Some(slug));
        for file in ["PROJECT.md", "ACTIVITY.md", "WORKSPACE.md", "NOTES.md"] {
            if let Some(body) = read_capped(&project.join(file)) {
                sections.push(format!("## Project {slug}: {file}\n{body}"));
            }
        }
    }

    // Recent daily digests, oldest first.
    let digests = recent_daily_digests(&memory.join("daily"));
    if !digests.is_empty() {
        sections.push(format!("## Recent daily notes\n{}", digests.join("\n\n")));
    }

    if let Some(summary) = session.summary.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("## Conversation so far\n{summary}"));
    }

    if !tool_names.is_empty() {
        sections.push(format!("## Available tools\n{}", tool_names.join(", ")));
        sections.push(TOOL_GUIDANCE.to_string());
    }

    debug!(sections = sections.len(), "system prompt composed");
    sections.join("\n\n")
}

fn read_capped(path: &Path) -> Option<String> {
    let body = std::fs::read_to_string(path).ok()?;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() > MAX_FILE_CHARS {
        let mut cut = MAX_FILE_CHARS;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        Some(format!("{}\n[truncated]", &trimmed[..cut]))
    } else {
        Some(trimmed.to_string())
    }
}

fn read_dir_markdown(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();
    paths.iter().filter_map(|p| read_capped(p)).collect()
}

/// The last few `YYYY-MM-DD.md` files, ordered oldest first.
fn recent_daily_digests(daily_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(daily_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();
    let start = paths.len().saturating_sub(DAILY_DIGEST_COUNT);
    paths[start..].iter().filter_map(|p| read_capped(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamias_sessions::ChatMessage;

    fn sample_session() -> Session {
        Session {
            id: "sess_prompt0001".into(),
            name: None,
            summary: Some("We discussed chipmunks.".into()),
            model: "openai/gpt-4o".into(),
            created_at: String::new(),
            updated_at: String::new(),
            messages: vec![ChatMessage::user("hi")],
            channel_id: "terminal".into(),
            channel_user_id: "local".into(),
            channel_name: None,
            parent_session_id: None,
            is_subagent: false,
            task: None,
            task_slug: None,
            subagent_status: None,
            spawned_at: None,
            completed_at: None,
            progress: None,
            subagent_callback_called: false,
            agent_id: None,
            agent_slug: None,
            agent_dir: None,
            project_slug: None,
            tenant_id: None,
            active: true,
        }
    }

    #[test]
    fn fallback_identity_when_memory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        let prompt = compose(&root, &sample_session(), None, &[]);
        assert!(prompt.contains("Tamias"));
        assert!(prompt.contains("We discussed chipmunks."));
    }

    #[test]
    fn persona_and_tools_are_included() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        std::fs::create_dir_all(root.agent_dir("alice")).unwrap();
        std::fs::write(root.agent_dir("alice").join("STYLE.md"), "Be curt.").unwrap();

        let agent = Agent {
            id: "ag_1".into(),
            slug: "alice".into(),
            name: "Alice".into(),
            instructions: "You handle billing questions.".into(),
            model: None,
            model_fallbacks: vec![],
            enabled: true,
            channels: vec![],
            extra_skills: vec![],
            allowed_tools: vec![],
            allowed_mcp_servers: vec![],
        };
        let tools = vec!["session__status".to_string()];
        let prompt = compose(&root, &sample_session(), Some(&agent), &tools);
        assert!(prompt.contains("billing questions"));
        assert!(prompt.contains("Be curt."));
        assert!(prompt.contains("session__status"));
    }
}
