//! Error types for registration operations.
//!
//! Every failure before the toolkit starts has its own variant so callers can
//! tell a bad invocation from a failed registration.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for registration operations.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// The anatomical image does not exist.
    #[error("Input image not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// The atlas folder does not exist or is not a directory.
    #[error("Atlas folder not found: {}", .0.display())]
    AtlasFolderNotFound(PathBuf),

    /// The atlas folder lacks the reference template.
    #[error("Template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),

    /// An input could not be read as a 3D image.
    #[error("Invalid image {}: {reason}", .path.display())]
    InvalidImage { path: PathBuf, reason: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The registration executable could not be located.
    #[error("Registration toolkit not found: {0}")]
    ToolkitNotFound(String),

    /// The registration executable ran but exited unsuccessfully.
    #[error("Registration toolkit failed ({status}): {stderr}")]
    ToolkitFailed { status: String, stderr: String },

    /// The toolkit finished without producing an expected file.
    #[error("Expected toolkit output missing: {}", .0.display())]
    MissingOutput(PathBuf),

    /// Filesystem or process error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Result manifest could not be serialized.
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Create an invalid image error.
    pub fn invalid_image(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a toolkit-not-found error.
    pub fn toolkit_not_found(msg: impl Into<String>) -> Self {
        Self::ToolkitNotFound(msg.into())
    }

    /// Create a toolkit failure error.
    pub fn toolkit_failed(status: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ToolkitFailed {
            status: status.into(),
            stderr: stderr.into(),
        }
    }
}
