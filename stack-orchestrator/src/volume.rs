//! Named volumes: durable directories that outlive the processes using them.
//!
//! A volume is created the first time a deployment needs it and is reused by
//! every later launch, restart and redeploy. Nothing in the orchestrator
//! deletes a volume except [`VolumeStore::remove`], which only the
//! `volume rm` operator command calls.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("invalid volume name {0:?}")]
    InvalidName(String),
    #[error("volume {0} does not exist")]
    NotFound(String),
    #[error("volume {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct VolumeStore {
    root: PathBuf,
}

impl VolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the data directory of the volume, creating it if needed.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let path = self.path(name)?;
        let created = match tokio::fs::metadata(&path).await {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|source| io_error(name, source))?;
                true
            }
            Err(source) => return Err(io_error(name, source)),
        };
        if created {
            info!(volume = name, path = %path.display(), "created volume");
        }
        canonical(name, &path).await
    }

    /// Returns the data directory of a volume the operator manages. It is
    /// never created here.
    pub async fn existing(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let path = self.path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => canonical(name, &path).await,
            Ok(_) => Err(VolumeError::NotFound(name.to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VolumeError::NotFound(name.to_owned()))
            }
            Err(source) => Err(io_error(name, source)),
        }
    }

    /// Names of every volume in the store, sorted.
    pub async fn list(&self) -> Result<Vec<String>, VolumeError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error("<root>", source)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error("<root>", source))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes a volume and everything in it.
    pub async fn remove(&self, name: &str) -> Result<(), VolumeError> {
        let path = self.path(name)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(volume = name, "removed volume");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VolumeError::NotFound(name.to_owned()))
            }
            Err(source) => Err(io_error(name, source)),
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf, VolumeError> {
        match is_valid_name(name) {
            true => Ok(self.root.join(name)),
            false => Err(VolumeError::InvalidName(name.to_owned())),
        }
    }
}

/// Volume names become directory names, so they are restricted to
/// `[A-Za-z0-9][A-Za-z0-9_.-]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

async fn canonical(name: &str, path: &Path) -> Result<PathBuf, VolumeError> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|source| io_error(name, source))
}

fn io_error(name: &str, source: std::io::Error) -> VolumeError {
    VolumeError::Io {
        name: name.to_owned(),
        source,
    }
}
