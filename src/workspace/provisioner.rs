//! Allocation of uniquely named workspaces.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info};
use uuid::Uuid;

use super::Workspace;
use crate::error::WorkspaceError;

pub const WORKSPACE_PREFIX: &str = "project";

/// How many names are tried before giving up.
pub const DEFAULT_NAME_ATTEMPTS: u32 = 8;

/// Creates fresh workspace trees under a common root directory.
///
/// Names combine a second-resolution timestamp with a random suffix, and
/// the leaf directory is created with `create_dir` (not `create_dir_all`)
/// so a name that already exists is detected and another one is drawn.
/// Two concurrent runs therefore never end up sharing a directory.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
}

impl WorkspaceProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a new workspace with the full subdirectory layout.
    ///
    /// The returned root path is absolute.
    pub fn provision(&self) -> Result<Workspace, WorkspaceError> {
        fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::CreateFailed {
            path: self.root.clone(),
            source,
        })?;
        let root = absolute(&self.root);

        for attempt in 1..=DEFAULT_NAME_ATTEMPTS {
            let candidate = root.join(candidate_name());
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    let workspace = Workspace::at(candidate);
                    workspace.ensure_layout()?;
                    info!(workspace = %workspace.root().display(), "Provisioned workspace");
                    return Ok(workspace);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(attempt, path = %candidate.display(), "Workspace name taken, retrying");
                }
                Err(source) => {
                    return Err(WorkspaceError::CreateFailed {
                        path: candidate,
                        source,
                    });
                }
            }
        }

        Err(WorkspaceError::NameExhausted {
            root,
            attempts: DEFAULT_NAME_ATTEMPTS,
        })
    }
}

fn candidate_name() -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", WORKSPACE_PREFIX, stamp, &suffix[..8])
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
