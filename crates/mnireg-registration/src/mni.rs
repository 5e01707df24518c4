//! Registration of an anatomical image to the MNI152 template.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RegistrationError, Result};
use crate::outputs::{persist, OutputLayout, RegistrationOutputs};
use crate::params::SynParams;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::template::{locate_template, MNI152_TEMPLATE};
use crate::toolkit::{AntsRegistration, RegistrationToolkit, ToolkitJob, TransformFormat};

/// Register `anat_img_path` to the MNI152 template found in `atlas_masks_folder`.
///
/// Uses the default SyN parameters and the `antsRegistration` found through
/// `$ANTSPATH` or `$PATH`. Outputs are named from `output_prefix`.
pub fn register_to_mni<P, Q>(
    anat_img_path: P,
    atlas_masks_folder: Q,
    output_prefix: &str,
) -> Result<RegistrationOutputs>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let request = RegistrationRequest::new(
        anat_img_path.as_ref(),
        atlas_masks_folder.as_ref(),
        output_prefix,
    );
    MniRegistration::from_env()?.run(&request)
}

/// Inputs of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    /// Anatomical (moving) image, e.g. a T1w scan.
    pub anatomical: PathBuf,
    /// Folder holding the template file.
    pub atlas_folder: PathBuf,
    pub output_prefix: String,
    /// Mask restricting the metric in template space.
    pub fixed_mask: Option<PathBuf>,
    /// Mask restricting the metric in subject space.
    pub moving_mask: Option<PathBuf>,
}

impl RegistrationRequest {
    pub fn new(
        anatomical: impl Into<PathBuf>,
        atlas_folder: impl Into<PathBuf>,
        output_prefix: impl Into<String>,
    ) -> Self {
        Self {
            anatomical: anatomical.into(),
            atlas_folder: atlas_folder.into(),
            output_prefix: output_prefix.into(),
            fixed_mask: None,
            moving_mask: None,
        }
    }

    pub fn with_fixed_mask(mut self, mask: impl Into<PathBuf>) -> Self {
        self.fixed_mask = Some(mask.into());
        self
    }

    pub fn with_moving_mask(mut self, mask: impl Into<PathBuf>) -> Self {
        self.moving_mask = Some(mask.into());
        self
    }
}

/// Configured template registration.
pub struct MniRegistration<T = AntsRegistration> {
    toolkit: T,
    params: SynParams,
    template_name: String,
    format: TransformFormat,
    scratch_root: Option<PathBuf>,
    keep_scratch: bool,
    callbacks: Vec<Arc<dyn ProgressCallback>>,
}

impl MniRegistration<AntsRegistration> {
    /// Registration through the `antsRegistration` found in the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AntsRegistration::from_env()?))
    }
}

impl<T: RegistrationToolkit> MniRegistration<T> {
    pub fn new(toolkit: T) -> Self {
        Self {
            toolkit,
            params: SynParams::default(),
            template_name: MNI152_TEMPLATE.to_string(),
            format: TransformFormat::default(),
            scratch_root: None,
            keep_scratch: false,
            callbacks: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: SynParams) -> Self {
        self.params = params;
        self
    }

    /// Look for a different file in the atlas folder.
    pub fn with_template_name(mut self, name: impl Into<String>) -> Self {
        self.template_name = name.into();
        self
    }

    pub fn with_transform_format(mut self, format: TransformFormat) -> Self {
        self.format = format;
        self
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Leave the toolkit's scratch directory on disk after the run.
    pub fn keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn toolkit(&self) -> &T {
        &self.toolkit
    }

    pub fn params(&self) -> &SynParams {
        &self.params
    }

    /// Check the request and build the toolkit job writing into `scratch_dir`.
    ///
    /// Nothing is executed; every input problem surfaces here. The toolkit runs
    /// inside the scratch directory, so every path in the job is made absolute
    /// against the current working directory.
    pub fn prepare(&self, request: &RegistrationRequest, scratch_dir: &Path) -> Result<ToolkitJob> {
        if !request.anatomical.is_file() {
            return Err(RegistrationError::InputNotFound(request.anatomical.clone()));
        }
        for mask in [&request.fixed_mask, &request.moving_mask].into_iter().flatten() {
            if !mask.is_file() {
                return Err(RegistrationError::InputNotFound(mask.clone()));
            }
        }

        let template = locate_template(&request.atlas_folder, &self.template_name)?;
        inspect(&template)?;
        inspect(&request.anatomical)?;

        self.params.validate()?;

        let fixed = absolute(&template)?;
        let moving = absolute(&request.anatomical)?;
        let fixed_mask = request.fixed_mask.as_deref().map(absolute).transpose()?;
        let moving_mask = request.moving_mask.as_deref().map(absolute).transpose()?;
        let scratch_dir = absolute(scratch_dir)?;

        let paths = [
            Some(&fixed),
            Some(&moving),
            fixed_mask.as_ref(),
            moving_mask.as_ref(),
            Some(&scratch_dir),
        ];
        for path in paths.into_iter().flatten() {
            check_toolkit_safe(path)?;
        }

        Ok(ToolkitJob {
            fixed,
            moving,
            fixed_mask,
            moving_mask,
            params: self.params.clone(),
            format: self.format,
            scratch_dir,
        })
    }

    /// Register, then move the results to their final names.
    pub fn run(&self, request: &RegistrationRequest) -> Result<RegistrationOutputs> {
        let layout = OutputLayout::new(request.output_prefix.clone())?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("mnireg-");
        let scratch = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let job = self.prepare(request, scratch.path())?;
        info!(
            "Registering {} to {} ({}, {})",
            job.moving.display(),
            job.fixed.display(),
            self.params.transform_type,
            self.toolkit.name()
        );

        let mut tracker = ProgressTracker::with_schedule(self.params.iteration_schedule());
        for callback in &self.callbacks {
            tracker.add_callback(callback.clone());
        }

        let result = self
            .toolkit
            .register(&job, &tracker)
            .and_then(|output| persist(&output, &layout));

        if self.keep_scratch {
            let kept = scratch.keep();
            info!("Kept scratch directory {}", kept.display());
        }

        let outputs = result?;
        info!("Wrote {}", outputs.warped_image.display());
        Ok(outputs)
    }
}

fn inspect(path: &Path) -> Result<()> {
    let geometry = mnireg_io::read_geometry(path)
        .map_err(|e| RegistrationError::invalid_image(path, format!("{:#}", e)))?;
    debug!(
        "{}: {:?} voxels at {:?} mm",
        path.display(),
        geometry.shape,
        geometry.spacing
    );
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

/// The toolkit splits bracketed arguments on commas, so paths may not contain them.
fn check_toolkit_safe(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.contains(&[',', '[', ']'][..]) {
        return Err(RegistrationError::invalid_configuration(format!(
            "path {} contains ',', '[' or ']', which antsRegistration cannot parse",
            text
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = RegistrationRequest::new("t1.nii.gz", "atlas", "out/sub-01")
            .with_fixed_mask("atlas/mask.nii.gz");
        assert_eq!(request.fixed_mask, Some(PathBuf::from("atlas/mask.nii.gz")));
        assert_eq!(request.moving_mask, None);
        assert_eq!(request.output_prefix, "out/sub-01");
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        let path = std::env::temp_dir().join("t1.nii.gz");
        assert_eq!(absolute(&path).unwrap(), path);

        let resolved = absolute(Path::new("atlas/t1.nii.gz")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("atlas/t1.nii.gz"));
    }

    #[test]
    fn test_toolkit_safe_paths() {
        assert!(check_toolkit_safe(Path::new("/data/sub-01/anat/T1w.nii.gz")).is_ok());
        assert!(check_toolkit_safe(Path::new("/data/a,b/T1w.nii.gz")).is_err());
        assert!(check_toolkit_safe(Path::new("/data/[x]/T1w.nii.gz")).is_err());
    }
}
