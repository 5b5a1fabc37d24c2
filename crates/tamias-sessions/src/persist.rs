//! Session snapshots on disk.
//!
//! One JSON file per session under `projects/<slug or default>/<YYYY-MM>/`,
//! bucketed by creation month so a session's path never moves. Writes are
//! atomic (tmp + rename). Loading skips malformed files — a corrupt archive
//! must never prevent the daemon from starting.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tamias_core::error::{Result, TamiasError};
use tamias_core::paths::DataRoot;

use crate::types::Session;

/// Path a session persists to, derived from its project slug and creation
/// month.
pub fn session_path(root: &DataRoot, session: &Session) -> PathBuf {
    let created = session
        .created_at
        .parse::<DateTime<Utc>>()
        .unwrap_or_else(|_| Utc::now());
    root.session_archive_dir(session.project_slug.as_deref(), created)
        .join(format!("{}.json", session.id))
}

/// Atomically write a session snapshot.
pub fn save(root: &DataRoot, session: &Session) -> Result<()> {
    let path = session_path(root, session);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TamiasError::Persistence(format!("mkdir {}: {e}", parent.display())))?;
    }
    let body = serde_json::to_vec_pretty(session)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)
        .map_err(|e| TamiasError::Persistence(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| TamiasError::Persistence(format!("rename {}: {e}", path.display())))?;
    debug!(session = %session.id, path = %path.display(), "session persisted");
    Ok(())
}

/// Load every persisted session under `projects/`.
///
/// Missing directories yield an empty list; unreadable or malformed files
/// are logged and skipped.
pub fn load_all(root: &DataRoot) -> Vec<Session> {
    let mut sessions = Vec::new();
    let projects = root.projects_dir();
    let project_dirs = match std::fs::read_dir(&projects) {
        Ok(rd) => rd,
        Err(_) => return sessions,
    };
    for project in project_dirs.flatten() {
        let months = match std::fs::read_dir(project.path()) {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        for month in months.flatten() {
            let files = match std::fs::read_dir(month.path()) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|body| {
                        serde_json::from_str::<Session>(&body).map_err(|e| e.to_string())
                    }) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping malformed session file");
                    }
                }
            }
        }
    }
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn sample(id: &str) -> Session {
        Session {
            id: id.into(),
            name: Some("test".into()),
            summary: None,
            model: "openai/gpt-4o".into(),
            created_at: "2026-07-15T12:00:00Z".into(),
            updated_at: "2026-07-15T12:00:00Z".into(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
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
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        let session = sample("sess_roundtrip01");
        save(&root, &session).unwrap();

        let loaded = load_all(&root);
        assert_eq!(loaded.len(), 1);
        let back = &loaded[0];
        assert_eq!(back.id, session.id);
        assert_eq!(back.model, session.model);
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.channel_user_id, "local");
    }

    #[test]
    fn path_is_bucketed_by_creation_month() {
        let root = DataRoot::at("/data");
        let path = session_path(&root, &sample("sess_bucket00001"));
        assert!(path
            .to_string_lossy()
            .ends_with("projects/default/2026-07/sess_bucket00001.json"));
    }

    #[test]
    fn malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        save(&root, &sample("sess_good000001")).unwrap();

        let bad_dir = root.projects_dir().join("default").join("2026-07");
        std::fs::write(bad_dir.join("sess_bad.json"), "{broken").unwrap();

        let loaded = load_all(&root);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "sess_good000001");
    }
}
