//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DirectorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the director
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Default seed file of the in-memory store
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Control sockets and key material of SSH sessions
    pub fn ssh_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("ssh"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DirectorError> {
        self.logs_dir().create_private().await?;
        self.ssh_dir().create_private().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/supercompose");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".supercompose");

        Self::new(base_dir)
    }
}
