//! The on-disk layout under `~/.tamias/`.
//!
//! Tenant-aware: `DataRoot::tenant("acme")` mirrors the whole layout under
//! `~/.tamias/tenants/acme/`. Every component takes a `DataRoot` instead of
//! touching `dirs::home_dir()` itself.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TamiasError};

/// Root of one tenant's data directory.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    /// The default root: `~/.tamias`.
    pub fn default_root() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: home.join(".tamias"),
        }
    }

    /// A tenant root: `~/.tamias/tenants/<id>`, mirroring the default layout.
    pub fn tenant(id: &str) -> Self {
        let base = Self::default_root();
        Self {
            root: base.root.join("tenants").join(id),
        }
    }

    /// An explicit root — used by tests and the `TAMIAS_HOME` override.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn agents_file(&self) -> PathBuf {
        self.root.join("agents.json")
    }

    pub fn agent_dir(&self, slug: &str) -> PathBuf {
        self.root.join("agents").join(slug)
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, slug: Option<&str>) -> PathBuf {
        self.projects_dir().join(slug.unwrap_or("default"))
    }

    /// Month-bucketed session archive dir:
    /// `projects/<slug or default>/<YYYY-MM>/`.
    pub fn session_archive_dir(&self, project_slug: Option<&str>, when: DateTime<Utc>) -> PathBuf {
        self.project_dir(project_slug)
            .join(when.format("%Y-%m").to_string())
    }

    pub fn database_file(&self) -> PathBuf {
        self.root.join("data.sqlite")
    }

    pub fn daemon_file(&self) -> PathBuf {
        self.root.join("daemon.json")
    }

    /// Directory the rolling `daemon.log` files live in (the root itself).
    pub fn log_dir(&self) -> PathBuf {
        self.root.clone()
    }

    pub fn workspace_dir(&self, configured: Option<&str>) -> PathBuf {
        match configured {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => self.root.join(p),
            None => self.root.join("workspace"),
        }
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }

    /// Create the directories a running daemon expects.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.projects_dir(),
            self.memory_dir(),
            self.workspace_dir(None),
            self.skills_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// `daemon.json` — how a CLI client discovers the running daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_port: Option<u16>,
}

impl DaemonInfo {
    pub fn write(&self, root: &DataRoot) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(root.daemon_file(), body)?;
        Ok(())
    }

    pub fn read(root: &DataRoot) -> Result<Self> {
        let body = std::fs::read_to_string(root.daemon_file())?;
        serde_json::from_str(&body).map_err(|e| TamiasError::Persistence(e.to_string()))
    }

    pub fn remove(root: &DataRoot) {
        let _ = std::fs::remove_file(root.daemon_file());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_dir_is_month_bucketed() {
        let root = DataRoot::at("/tmp/tamias-test");
        let when = "2026-08-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let dir = root.session_archive_dir(None, when);
        assert!(dir.ends_with("projects/default/2026-08"));
        let dir = root.session_archive_dir(Some("acme"), when);
        assert!(dir.ends_with("projects/acme/2026-08"));
    }

    #[test]
    fn daemon_info_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        let info = DaemonInfo {
            pid: 4242,
            port: 9001,
            started_at: "2026-08-01T10:00:00Z".into(),
            dashboard_port: None,
        };
        info.write(&root).unwrap();
        let back = DaemonInfo::read(&root).unwrap();
        assert_eq!(back.pid, 4242);
        assert_eq!(back.port, 9001);
        DaemonInfo::remove(&root);
        assert!(DaemonInfo::read(&root).is_err());
    }

    #[test]
    fn workspace_dir_honours_absolute_override() {
        let root = DataRoot::at("/tmp/tamias-test");
        assert_eq!(
            root.workspace_dir(Some("/srv/sandbox")),
            PathBuf::from("/srv/sandbox")
        );
        assert!(root
            .workspace_dir(Some("sub/space"))
            .ends_with("tamias-test/sub/space"));
    }
}
