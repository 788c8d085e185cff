//! Working-directory resolution for spawn requests.
//!
//! A missing directory is only created with the caller's explicit approval.
//! Creation failures are classified by cause so the caller gets one message
//! that says what went wrong.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryResolution {
    /// Directory exists (or was just created) and can be used as cwd.
    Ready { created: bool },
    /// Directory is missing and the caller has not approved creating it.
    NeedsApproval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    PermissionDenied { path: PathBuf },
    /// The path, or one of its parents, is an existing non-directory.
    NotADirectory { path: PathBuf },
    DiskFull { path: PathBuf },
    ReadOnlyFilesystem { path: PathBuf },
    Other { path: PathBuf, message: String },
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied { path } => write!(
                f,
                "Unable to create directory '{}': permission denied. Check the permissions of the parent directory.",
                path.display()
            ),
            Self::NotADirectory { path } => write!(
                f,
                "Unable to create directory '{}': a file already exists at this path or one of its parents.",
                path.display()
            ),
            Self::DiskFull { path } => write!(
                f,
                "Unable to create directory '{}': no space left on device.",
                path.display()
            ),
            Self::ReadOnlyFilesystem { path } => write!(
                f,
                "Unable to create directory '{}': the file system is read-only.",
                path.display()
            ),
            Self::Other { path, message } => write!(
                f,
                "Unable to create directory '{}': {}",
                path.display(),
                message
            ),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl DirectoryError {
    pub fn classify(path: &Path, err: &io::Error) -> Self {
        let path = path.to_path_buf();
        #[cfg(unix)]
        if let Some(code) = err.raw_os_error() {
            use nix::libc;
            match code {
                libc::EACCES | libc::EPERM => return Self::PermissionDenied { path },
                libc::EEXIST | libc::ENOTDIR => return Self::NotADirectory { path },
                libc::ENOSPC | libc::EDQUOT => return Self::DiskFull { path },
                libc::EROFS => return Self::ReadOnlyFilesystem { path },
                _ => {}
            }
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            io::ErrorKind::AlreadyExists => Self::NotADirectory { path },
            _ => Self::Other {
                path,
                message: err.to_string(),
            },
        }
    }
}

/// Checks `directory` and creates it when missing and `approved`.
pub fn resolve_directory(
    directory: &Path,
    approved: bool,
) -> Result<DirectoryResolution, DirectoryError> {
    match std::fs::metadata(directory) {
        Ok(meta) if meta.is_dir() => return Ok(DirectoryResolution::Ready { created: false }),
        Ok(_) => {
            return Err(DirectoryError::NotADirectory {
                path: directory.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(DirectoryError::classify(directory, &e)),
    }

    if !approved {
        return Ok(DirectoryResolution::NeedsApproval);
    }

    std::fs::create_dir_all(directory)
        .map_err(|e| DirectoryError::classify(directory, &e))?;
    Ok(DirectoryResolution::Ready { created: true })
}
