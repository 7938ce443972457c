//! Per-run workspaces.
//!
//! Every pipeline run owns exactly one workspace directory for its whole
//! lifetime. The layout is fixed:
//!
//! ```text
//! project_<timestamp>_<suffix>/
//! ├── dataset/     data fetched or written by the generated program
//! ├── models/      trained model files
//! ├── artifacts/   output whose presence marks a successful execution
//! └── code/        the current candidate program (overwritten per attempt)
//! ```
//!
//! The [`WorkspaceProvisioner`] allocates and creates these trees;
//! [`Workspace`] is the handle stages use to write the program and inspect
//! the artifacts directory.

mod provisioner;

pub use provisioner::{WorkspaceProvisioner, DEFAULT_NAME_ATTEMPTS, WORKSPACE_PREFIX};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::WorkspaceError;

pub const DATASET_DIR: &str = "dataset";
pub const MODELS_DIR: &str = "models";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const CODE_DIR: &str = "code";

/// The four subdirectories created for every workspace, in creation order.
pub const WORKSPACE_SUBDIRS: [&str; 4] = [DATASET_DIR, MODELS_DIR, ARTIFACTS_DIR, CODE_DIR];

/// Handle to a provisioned workspace directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Wraps an existing directory. Does not touch the filesystem; use
    /// [`WorkspaceProvisioner::provision`] to create a fresh one.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join(DATASET_DIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn code_dir(&self) -> PathBuf {
        self.root.join(CODE_DIR)
    }

    /// Location of the program file inside `code/`.
    pub fn program_path(&self, file_name: &str) -> PathBuf {
        self.code_dir().join(file_name)
    }

    /// Creates any missing subdirectory of the fixed layout.
    pub fn ensure_layout(&self) -> Result<(), WorkspaceError> {
        for sub in WORKSPACE_SUBDIRS {
            let path = self.root.join(sub);
            fs::create_dir_all(&path)
                .map_err(|source| WorkspaceError::CreateFailed { path, source })?;
        }
        Ok(())
    }

    /// Writes `program` to `code/<file_name>`, replacing any previous attempt.
    pub fn write_program(&self, file_name: &str, program: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.program_path(file_name);
        fs::write(&path, program).map_err(|source| WorkspaceError::WriteFailed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Writes an auxiliary file at the workspace root (e.g. a run report).
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.root.join(name);
        fs::write(&path, contents).map_err(|source| WorkspaceError::WriteFailed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Lists every entry below `artifacts/`, relative to it, sorted.
    ///
    /// A missing artifacts directory lists as empty.
    pub fn list_artifacts(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        let dir = self.artifacts_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry.map_err(|e| WorkspaceError::ListFailed {
                path: dir.clone(),
                source: e.into(),
            })?;
            if let Ok(relative) = entry.path().strip_prefix(&dir) {
                entries.push(relative.to_path_buf());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// True when `artifacts/` holds at least one entry.
    pub fn has_artifacts(&self) -> Result<bool, WorkspaceError> {
        let dir = self.artifacts_dir();
        match fs::read_dir(&dir) {
            Ok(mut iter) => Ok(iter.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(WorkspaceError::ListFailed { path: dir, source }),
        }
    }

    /// Removes everything inside `artifacts/`, leaving the directory itself.
    pub fn clear_artifacts(&self) -> Result<usize, WorkspaceError> {
        let dir = self.artifacts_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir)
                    .map_err(|source| WorkspaceError::CreateFailed { path: dir, source })?;
                return Ok(0);
            }
            Err(source) => return Err(WorkspaceError::ListFailed { path: dir, source }),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| WorkspaceError::ListFailed {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| WorkspaceError::ClearFailed {
                path: path.clone(),
                source,
            })?;
            removed += 1;
        }
        Ok(removed)
    }
}
