//! Final names of registration artifacts.
//!
//! Every artifact name derives from the caller's prefix alone:
//! `{prefix}_to_MNI.nii.gz`, `{prefix}_fwd_{i}{ext}` and `{prefix}_inv_{i}{ext}`,
//! where `ext` is the extension of the file the toolkit wrote.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{RegistrationError, Result};
use crate::toolkit::ToolkitOutput;

/// Output naming scheme for one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    prefix: String,
}

impl OutputLayout {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(RegistrationError::invalid_configuration("output prefix is empty"));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn warped_image(&self) -> PathBuf {
        PathBuf::from(format!("{}_to_MNI.nii.gz", self.prefix))
    }

    pub fn forward(&self, index: usize, ext: &str) -> PathBuf {
        PathBuf::from(format!("{}_fwd_{}{}", self.prefix, index, ext))
    }

    pub fn inverse(&self, index: usize, ext: &str) -> PathBuf {
        PathBuf::from(format!("{}_inv_{}{}", self.prefix, index, ext))
    }

    /// Directory the artifacts land in, if the prefix names one.
    pub fn directory(&self) -> Option<PathBuf> {
        self.warped_image()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}

/// Where the results of a registration were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOutputs {
    /// Moving image resampled into template space.
    pub warped_image: PathBuf,
    /// Forward transforms, in application order.
    pub transform: Vec<PathBuf>,
    /// Inverse transforms, in application order.
    pub inverse_transform: Vec<PathBuf>,
}

impl RegistrationOutputs {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the mapping as pretty-printed JSON.
    pub fn write_manifest<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        debug!("Wrote manifest {}", path.display());
        Ok(())
    }
}

/// Extension of a toolkit artifact, keeping the double `.nii.gz` suffix intact.
pub fn artifact_extension(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.ends_with(".nii.gz") {
        return ".nii.gz".to_string();
    }
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Move the toolkit's files to their final names.
///
/// A source listed more than once (a linear transform is its own inverse
/// file) is copied until its last use and moved then.
pub fn persist(output: &ToolkitOutput, layout: &OutputLayout) -> Result<RegistrationOutputs> {
    if let Some(dir) = layout.directory() {
        fs::create_dir_all(&dir)?;
    }

    let warped_image = layout.warped_image();
    let transform: Vec<PathBuf> = output
        .forward
        .iter()
        .enumerate()
        .map(|(i, src)| layout.forward(i, &artifact_extension(src)))
        .collect();
    let inverse_transform: Vec<PathBuf> = output
        .inverse
        .iter()
        .enumerate()
        .map(|(i, src)| layout.inverse(i, &artifact_extension(src)))
        .collect();

    let sources = std::iter::once(&output.warped_image)
        .chain(&output.forward)
        .chain(&output.inverse);
    let destinations = std::iter::once(&warped_image)
        .chain(&transform)
        .chain(&inverse_transform);
    let plan: Vec<(&PathBuf, &PathBuf)> = sources.zip(destinations).collect();

    let mut remaining: HashMap<&Path, usize> = HashMap::new();
    for &(src, _) in &plan {
        *remaining.entry(src.as_path()).or_default() += 1;
    }

    for (src, dst) in plan {
        if dst.exists() {
            warn!("Overwriting {}", dst.display());
        }
        let uses = remaining.entry(src.as_path()).or_default();
        *uses -= 1;
        if *uses > 0 {
            fs::copy(src, dst)?;
        } else {
            move_file(src, dst)?;
        }
        debug!("{} -> {}", src.display(), dst.display());
    }

    Ok(RegistrationOutputs {
        warped_image,
        transform,
        inverse_transform,
    })
}

/// Rename, falling back to copy and delete when source and destination are on
/// different filesystems.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    fs::remove_file(src)?;
    Ok(())
}
