//! Registration parameters and their rendering into `antsRegistration` arguments.
//!
//! The defaults reproduce the standard SyN setup: a center-of-mass
//! initialization, one affine stage driven by Mattes mutual information and a
//! SyN stage on top of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{RegistrationError, Result};

/// Family of transforms estimated by the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransformType {
    /// Rigid only.
    Rigid,
    /// Affine only.
    Affine,
    /// Affine followed by SyN.
    #[default]
    #[serde(rename = "SyN")]
    Syn,
    /// Rigid, then affine, then SyN.
    #[serde(rename = "SyNRA")]
    SynRa,
    /// SyN without a linear stage.
    #[serde(rename = "SyNOnly")]
    SynOnly,
}

impl TransformType {
    /// Whether a deformation field is part of the result.
    pub fn is_deformable(self) -> bool {
        matches!(self, Self::Syn | Self::SynRa | Self::SynOnly)
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rigid => "Rigid",
            Self::Affine => "Affine",
            Self::Syn => "SyN",
            Self::SynRa => "SyNRA",
            Self::SynOnly => "SyNOnly",
        };
        f.write_str(name)
    }
}

impl FromStr for TransformType {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rigid" => Ok(Self::Rigid),
            "affine" => Ok(Self::Affine),
            "syn" => Ok(Self::Syn),
            "synra" => Ok(Self::SynRa),
            "synonly" => Ok(Self::SynOnly),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown transform type '{}' (expected Rigid, Affine, SyN, SyNRA or SyNOnly)",
                other
            ))),
        }
    }
}

/// How the initial moving transform is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initialization {
    GeometricCenter,
    #[default]
    CenterOfMass,
    Origin,
}

impl Initialization {
    fn code(self) -> u8 {
        match self {
            Self::GeometricCenter => 0,
            Self::CenterOfMass => 1,
            Self::Origin => 2,
        }
    }
}

/// Interpolator used to produce the warped image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    NearestNeighbor,
    BSpline,
    LanczosWindowedSinc,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linear => "Linear",
            Self::NearestNeighbor => "NearestNeighbor",
            Self::BSpline => "BSpline",
            Self::LanczosWindowedSinc => "LanczosWindowedSinc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    Regular,
    Random,
}

/// Point sampling of the metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub strategy: SamplingStrategy,
    /// Fraction of voxels sampled, in `(0, 1]`.
    pub percentage: f64,
}

/// Similarity metric of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    /// Mattes mutual information.
    Mattes {
        bins: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sampling: Option<Sampling>,
    },
    /// Neighborhood cross-correlation.
    Cc { radius: u32 },
    MeanSquares,
}

impl Metric {
    fn render(&self, fixed: &Path, moving: &Path) -> String {
        let (f, m) = (fixed.display(), moving.display());
        match self {
            Self::Mattes { bins, sampling: None } => format!("Mattes[{f},{m},1,{bins}]"),
            Self::Mattes { bins, sampling: Some(s) } => {
                let strategy = match s.strategy {
                    SamplingStrategy::Regular => "regular",
                    SamplingStrategy::Random => "random",
                };
                format!("Mattes[{f},{m},1,{bins},{strategy},{}]", s.percentage)
            }
            Self::Cc { radius } => format!("CC[{f},{m},1,{radius}]"),
            Self::MeanSquares => format!("MeanSquares[{f},{m},1]"),
        }
    }
}

/// Per-level iteration counts plus optional stopping criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    pub iterations: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
}

impl Convergence {
    fn render(&self) -> String {
        let iterations = join_x(&self.iterations);
        match (self.threshold, self.window) {
            (None, None) => iterations,
            (Some(t), None) => format!("[{},{:e}]", iterations, t),
            (Some(t), Some(w)) => format!("[{},{:e},{}]", iterations, t, w),
            (None, Some(w)) => format!("[{},1e-6,{}]", iterations, w),
        }
    }
}

/// Transform estimated by one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageTransform {
    Rigid { gradient_step: f64 },
    Affine { gradient_step: f64 },
    Syn {
        gradient_step: f64,
        flow_sigma: f64,
        total_sigma: f64,
    },
}

impl StageTransform {
    pub fn gradient_step(&self) -> f64 {
        match *self {
            Self::Rigid { gradient_step }
            | Self::Affine { gradient_step }
            | Self::Syn { gradient_step, .. } => gradient_step,
        }
    }
}

impl fmt::Display for StageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rigid { gradient_step } => write!(f, "Rigid[{}]", gradient_step),
            Self::Affine { gradient_step } => write!(f, "Affine[{}]", gradient_step),
            Self::Syn {
                gradient_step,
                flow_sigma,
                total_sigma,
            } => write!(f, "SyN[{},{},{}]", gradient_step, flow_sigma, total_sigma),
        }
    }
}

/// One toolkit stage, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub transform: StageTransform,
    pub metric: Metric,
    pub convergence: Convergence,
    pub shrink_factors: Vec<u32>,
    pub smoothing_sigmas: Vec<f64>,
}

impl Stage {
    fn validate(&self, name: &str) -> Result<()> {
        let levels = self.convergence.iterations.len();
        if levels == 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} stage has no resolution levels",
                name
            )));
        }
        if self.shrink_factors.len() != levels || self.smoothing_sigmas.len() != levels {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} stage schedules differ in length: {} iteration levels, {} shrink factors, {} smoothing sigmas",
                name,
                levels,
                self.shrink_factors.len(),
                self.smoothing_sigmas.len()
            )));
        }
        if self.shrink_factors.contains(&0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} stage shrink factors must be at least 1",
                name
            )));
        }
        if self.smoothing_sigmas.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} stage smoothing sigmas must be non-negative",
                name
            )));
        }
        let step = self.transform.gradient_step();
        if !(step.is_finite() && step > 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} stage gradient step must be positive, got {}",
                name, step
            )));
        }
        match self.metric {
            Metric::Mattes { bins: 0, .. } => {
                return Err(RegistrationError::invalid_configuration(format!(
                    "{} stage metric needs at least one histogram bin",
                    name
                )));
            }
            Metric::Mattes {
                sampling: Some(s), ..
            } if !(s.percentage > 0.0 && s.percentage <= 1.0) => {
                return Err(RegistrationError::invalid_configuration(format!(
                    "{} stage sampling percentage must be in (0, 1], got {}",
                    name, s.percentage
                )));
            }
            _ => {}
        }
        Ok(())
    }

    fn push_args(&self, args: &mut Vec<String>, fixed: &Path, moving: &Path, masks: &str) {
        args.push("--transform".into());
        args.push(self.transform.to_string());
        args.push("--metric".into());
        args.push(self.metric.render(fixed, moving));
        args.push("--convergence".into());
        args.push(self.convergence.render());
        args.push("--shrink-factors".into());
        args.push(join_x(&self.shrink_factors));
        args.push("--smoothing-sigmas".into());
        args.push(join_x(&self.smoothing_sigmas));
        args.push("--masks".into());
        args.push(masks.to_string());
    }
}

/// Settings shared by the rigid and affine stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    pub gradient_step: f64,
    pub metric: Metric,
    pub convergence: Convergence,
    pub shrink_factors: Vec<u32>,
    pub smoothing_sigmas: Vec<f64>,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            gradient_step: 0.25,
            metric: Metric::Mattes {
                bins: 32,
                sampling: Some(Sampling {
                    strategy: SamplingStrategy::Regular,
                    percentage: 0.2,
                }),
            },
            convergence: Convergence {
                iterations: vec![2100, 1200, 1200, 10],
                threshold: None,
                window: None,
            },
            shrink_factors: vec![6, 4, 2, 1],
            smoothing_sigmas: vec![3.0, 2.0, 1.0, 0.0],
        }
    }
}

impl LinearParams {
    fn stage(&self, transform: StageTransform) -> Stage {
        Stage {
            transform,
            metric: self.metric,
            convergence: self.convergence.clone(),
            shrink_factors: self.shrink_factors.clone(),
            smoothing_sigmas: self.smoothing_sigmas.clone(),
        }
    }
}

/// Settings of the SyN stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynStageParams {
    pub gradient_step: f64,
    pub flow_sigma: f64,
    pub total_sigma: f64,
    pub metric: Metric,
    pub convergence: Convergence,
    pub shrink_factors: Vec<u32>,
    pub smoothing_sigmas: Vec<f64>,
}

impl Default for SynStageParams {
    fn default() -> Self {
        Self {
            gradient_step: 0.2,
            flow_sigma: 3.0,
            total_sigma: 0.0,
            metric: Metric::Mattes {
                bins: 32,
                sampling: None,
            },
            convergence: Convergence {
                iterations: vec![40, 20, 0],
                threshold: Some(1e-7),
                window: Some(8),
            },
            shrink_factors: vec![4, 2, 1],
            smoothing_sigmas: vec![2.0, 1.0, 0.0],
        }
    }
}

impl SynStageParams {
    fn stage(&self) -> Stage {
        Stage {
            transform: StageTransform::Syn {
                gradient_step: self.gradient_step,
                flow_sigma: self.flow_sigma,
                total_sigma: self.total_sigma,
            },
            metric: self.metric,
            convergence: self.convergence.clone(),
            shrink_factors: self.shrink_factors.clone(),
            smoothing_sigmas: self.smoothing_sigmas.clone(),
        }
    }
}

/// File locations a single toolkit invocation reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct CommandPaths<'a> {
    pub fixed: &'a Path,
    pub moving: &'a Path,
    pub output_prefix: &'a Path,
    pub warped: &'a Path,
    pub inverse_warped: &'a Path,
    pub fixed_mask: Option<&'a Path>,
    pub moving_mask: Option<&'a Path>,
}

/// Complete parameter set of one registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynParams {
    pub transform_type: TransformType,
    pub initialization: Initialization,
    pub linear: LinearParams,
    pub syn: SynStageParams,
    pub interpolation: Interpolation,
    pub histogram_matching: bool,
    /// Lower and upper quantiles for intensity winsorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winsorize: Option<[f64; 2]>,
    pub collapse_output_transforms: bool,
    pub single_precision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    /// Worker threads of the toolkit; its own default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

impl Default for SynParams {
    fn default() -> Self {
        Self {
            transform_type: TransformType::default(),
            initialization: Initialization::default(),
            linear: LinearParams::default(),
            syn: SynStageParams::default(),
            interpolation: Interpolation::default(),
            histogram_matching: false,
            winsorize: None,
            collapse_output_transforms: true,
            single_precision: true,
            random_seed: None,
            threads: None,
        }
    }
}

impl SynParams {
    /// Load parameters from a TOML file; absent keys keep their defaults.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            RegistrationError::InvalidConfiguration(msg) => {
                RegistrationError::invalid_configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let params: Self = toml::from_str(content)
            .map_err(|e| RegistrationError::invalid_configuration(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RegistrationError::invalid_configuration(e.to_string()))
    }

    /// Ordered stages implied by the transform type.
    pub fn stages(&self) -> Vec<Stage> {
        let rigid = || {
            self.linear.stage(StageTransform::Rigid {
                gradient_step: self.linear.gradient_step,
            })
        };
        let affine = || {
            self.linear.stage(StageTransform::Affine {
                gradient_step: self.linear.gradient_step,
            })
        };

        match self.transform_type {
            TransformType::Rigid => vec![rigid()],
            TransformType::Affine => vec![affine()],
            TransformType::Syn => vec![affine(), self.syn.stage()],
            TransformType::SynRa => vec![rigid(), affine(), self.syn.stage()],
            TransformType::SynOnly => vec![self.syn.stage()],
        }
    }

    /// Iteration counts per level, per stage.
    pub fn iteration_schedule(&self) -> Vec<Vec<u32>> {
        self.stages()
            .into_iter()
            .map(|s| s.convergence.iterations)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for stage in self.stages() {
            let name = match stage.transform {
                StageTransform::Rigid { .. } => "rigid",
                StageTransform::Affine { .. } => "affine",
                StageTransform::Syn { .. } => "SyN",
            };
            stage.validate(name)?;
        }
        if let Some([lower, upper]) = self.winsorize {
            if !(0.0 <= lower && lower < upper && upper <= 1.0) {
                return Err(RegistrationError::invalid_configuration(format!(
                    "winsorize quantiles must satisfy 0 <= lower < upper <= 1, got [{}, {}]",
                    lower, upper
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(RegistrationError::invalid_configuration(
                "thread count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Render the full `antsRegistration` argument vector.
    ///
    /// `write_composite` selects one HDF5 composite transform per direction
    /// instead of separate component files.
    pub fn to_args(&self, paths: &CommandPaths<'_>, write_composite: bool) -> Vec<String> {
        let mut args: Vec<String> = vec!["--dimensionality".into(), "3".into()];

        if self.single_precision {
            args.push("--float".into());
            args.push("1".into());
        }

        args.push("--output".into());
        args.push(format!(
            "[{},{},{}]",
            paths.output_prefix.display(),
            paths.warped.display(),
            paths.inverse_warped.display()
        ));
        args.push("--interpolation".into());
        args.push(self.interpolation.to_string());
        args.push("--use-histogram-matching".into());
        args.push(flag(self.histogram_matching).into());

        if let Some([lower, upper]) = self.winsorize {
            args.push("--winsorize-image-intensities".into());
            args.push(format!("[{},{}]", lower, upper));
        }

        args.push("--initial-moving-transform".into());
        args.push(format!(
            "[{},{},{}]",
            paths.fixed.display(),
            paths.moving.display(),
            self.initialization.code()
        ));

        if write_composite {
            args.push("--write-composite-transform".into());
            args.push("1".into());
        }

        args.push("--collapse-output-transforms".into());
        args.push(flag(self.collapse_output_transforms).into());

        if let Some(seed) = self.random_seed {
            args.push("--random-seed".into());
            args.push(seed.to_string());
        }

        // Iteration diagnostics feed progress reporting.
        args.push("--verbose".into());
        args.push("1".into());

        let masks = format!(
            "[{},{}]",
            paths.fixed_mask.map_or("NA".to_string(), |p| p.display().to_string()),
            paths.moving_mask.map_or("NA".to_string(), |p| p.display().to_string())
        );
        for stage in self.stages() {
            stage.push_args(&mut args, paths.fixed, paths.moving, &masks);
        }

        args
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn join_x<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("x")
}
