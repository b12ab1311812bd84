//! Flat-directory project store: one JSON document per project.

use crate::error::{ConsoleError, ConsoleResult};
use mediator_core::Project;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    /// Open (and create if needed) the project root directory.
    pub fn new(root: impl Into<PathBuf>) -> ConsoleResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project names double as file names, so the character set is kept
    /// narrow.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn path_for(&self, name: &str) -> ConsoleResult<PathBuf> {
        if !Self::is_valid_name(name) {
            return Err(ConsoleError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(format!("{}.json", name)))
    }

    pub async fn list(&self) -> ConsoleResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn create(&self, name: &str) -> ConsoleResult<Project> {
        let path = self.path_for(name)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ConsoleError::AlreadyExists(name.to_string()));
        }
        let project = Project::new(name);
        self.write(&path, &project).await?;
        info!("Created project '{}'", name);
        Ok(project)
    }

    pub async fn load(&self, name: &str) -> ConsoleResult<Project> {
        let path = self.path_for(name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConsoleError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Open an existing project or create it, the startup path.
    pub async fn load_or_create(&self, name: &str) -> ConsoleResult<Project> {
        if self.exists(name).await {
            info!("Loading project '{}'", name);
            self.load(name).await
        } else {
            self.create(name).await
        }
    }

    /// Persist a project. The write goes through a temp file and a rename
    /// so a crashed save never truncates the document.
    pub async fn save(&self, project: &Project) -> ConsoleResult<()> {
        let path = self.path_for(&project.name)?;
        self.write(&path, project).await
    }

    async fn write(&self, path: &Path, project: &Project) -> ConsoleResult<()> {
        let raw = serde_json::to_vec_pretty(project)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!("Atomic rename failed for {:?}: {}", path, e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
