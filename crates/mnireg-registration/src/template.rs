//! Reference template lookup.

use std::path::{Path, PathBuf};

use crate::error::{RegistrationError, Result};

/// File name of the brain-extracted 1 mm MNI152 T1 template.
pub const MNI152_TEMPLATE: &str = "MNI152_T1_1mm_brain.nii.gz";

/// Resolve `file_name` inside `atlas_folder`.
pub fn locate_template(atlas_folder: &Path, file_name: &str) -> Result<PathBuf> {
    if !atlas_folder.is_dir() {
        return Err(RegistrationError::AtlasFolderNotFound(atlas_folder.to_path_buf()));
    }

    let template = atlas_folder.join(file_name);
    if !template.is_file() {
        return Err(RegistrationError::TemplateNotFound(template));
    }

    tracing::debug!("Using template {}", template.display());
    Ok(template)
}
