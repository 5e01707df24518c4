//! The external registration toolkit.
//!
//! [`RegistrationToolkit`] is the seam between orchestration and the program
//! that actually registers images. [`AntsRegistration`] drives the ANTs
//! `antsRegistration` executable.

use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use tracing::{debug, info, trace};

use crate::error::{RegistrationError, Result};
use crate::params::{CommandPaths, SynParams};
use crate::progress::{parse_line, ProgressTracker};

/// Environment variable naming the ANTs binary directory.
pub const ANTSPATH_ENV: &str = "ANTSPATH";

/// Environment variable ITK reads its worker thread count from.
pub const THREADS_ENV: &str = "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS";

/// Lines of stderr kept in a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// On-disk representation of the estimated transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformFormat {
    /// One HDF5 composite transform per direction.
    #[default]
    Composite,
    /// Each component transform in its native format (`.mat`, `.nii.gz`).
    Components,
}

impl fmt::Display for TransformFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Composite => f.write_str("composite"),
            Self::Components => f.write_str("components"),
        }
    }
}

impl FromStr for TransformFormat {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "composite" => Ok(Self::Composite),
            "components" => Ok(Self::Components),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown transform format '{}' (expected composite or components)",
                other
            ))),
        }
    }
}

/// One registration to perform.
#[derive(Debug, Clone)]
pub struct ToolkitJob {
    /// Reference image the moving image is aligned to.
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub fixed_mask: Option<PathBuf>,
    pub moving_mask: Option<PathBuf>,
    pub params: SynParams,
    pub format: TransformFormat,
    /// Directory the toolkit writes into.
    pub scratch_dir: PathBuf,
}

/// Files produced by the toolkit, still inside the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitOutput {
    pub warped_image: PathBuf,
    /// Transforms mapping the moving image onto the fixed image, in application order.
    pub forward: Vec<PathBuf>,
    /// Transforms mapping the fixed image onto the moving image, in application order.
    pub inverse: Vec<PathBuf>,
}

impl ToolkitOutput {
    /// Fail with [`RegistrationError::MissingOutput`] on the first absent file.
    pub fn ensure_exists(&self) -> Result<()> {
        let all = std::iter::once(&self.warped_image)
            .chain(&self.forward)
            .chain(&self.inverse);
        for path in all {
            if !path.is_file() {
                return Err(RegistrationError::MissingOutput(path.clone()));
            }
        }
        Ok(())
    }
}

/// Something that can register a moving image to a fixed image.
pub trait RegistrationToolkit {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Run the registration and report where the results were written.
    fn register(&self, job: &ToolkitJob, progress: &ProgressTracker) -> Result<ToolkitOutput>;
}

impl<T: RegistrationToolkit + ?Sized> RegistrationToolkit for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn register(&self, job: &ToolkitJob, progress: &ProgressTracker) -> Result<ToolkitOutput> {
        (**self).register(job, progress)
    }
}

/// Driver for the `antsRegistration` executable.
#[derive(Debug, Clone)]
pub struct AntsRegistration {
    executable: PathBuf,
}

impl AntsRegistration {
    pub const PROGRAM: &'static str = "antsRegistration";

    /// Locate the executable through `$ANTSPATH`, then `$PATH`.
    pub fn from_env() -> Result<Self> {
        let antspath = std::env::var_os(ANTSPATH_ENV);
        let path = std::env::var_os("PATH");
        locate_executable(antspath.as_deref(), path.as_deref())
            .map(|executable| Self { executable })
            .ok_or_else(|| {
                RegistrationError::toolkit_not_found(format!(
                    "{} is not in ${} or on $PATH",
                    Self::PROGRAM,
                    ANTSPATH_ENV
                ))
            })
    }

    /// Use an explicit executable.
    pub fn with_executable(path: impl Into<PathBuf>) -> Result<Self> {
        let executable = path.into();
        if !executable.is_file() {
            return Err(RegistrationError::toolkit_not_found(format!(
                "{} does not exist",
                executable.display()
            )));
        }
        Ok(Self { executable })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Prefix the toolkit prepends to every output file name.
    pub fn output_prefix(scratch_dir: &Path) -> PathBuf {
        scratch_dir.join("reg_")
    }

    /// Arguments for `job`, without running anything.
    pub fn arguments(&self, job: &ToolkitJob) -> Result<Vec<String>> {
        if job.format == TransformFormat::Components && !job.params.collapse_output_transforms {
            return Err(RegistrationError::invalid_configuration(
                "component transforms require collapse_output_transforms",
            ));
        }

        let prefix = Self::output_prefix(&job.scratch_dir);
        let warped = with_suffix(&prefix, "Warped.nii.gz");
        let inverse_warped = with_suffix(&prefix, "InverseWarped.nii.gz");
        let paths = CommandPaths {
            fixed: &job.fixed,
            moving: &job.moving,
            output_prefix: &prefix,
            warped: &warped,
            inverse_warped: &inverse_warped,
            fixed_mask: job.fixed_mask.as_deref(),
            moving_mask: job.moving_mask.as_deref(),
        };

        Ok(job
            .params
            .to_args(&paths, job.format == TransformFormat::Composite))
    }

    /// The full invocation, quoted for a POSIX shell.
    pub fn command_line(&self, job: &ToolkitJob) -> Result<String> {
        let mut parts = vec![shell_quote(&self.executable.display().to_string())];
        parts.extend(self.arguments(job)?.iter().map(|arg| shell_quote(arg)));
        Ok(parts.join(" "))
    }
}

impl RegistrationToolkit for AntsRegistration {
    fn name(&self) -> &str {
        Self::PROGRAM
    }

    fn register(&self, job: &ToolkitJob, progress: &ProgressTracker) -> Result<ToolkitOutput> {
        let args = self.arguments(job)?;

        let mut command = Command::new(&self.executable);
        command
            .args(&args)
            .current_dir(&job.scratch_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(threads) = job.params.threads {
            command.env(THREADS_ENV, threads.to_string());
        }

        debug!("Running {} {}", self.executable.display(), args.join(" "));
        progress.start();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                progress.error(&format!("failed to launch {}: {}", self.executable.display(), e));
                return Err(e.into());
            }
        };

        // Drain stderr concurrently so a chatty toolkit cannot block on a full pipe.
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf);
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let forwarded = match child.stdout.take() {
            Some(stdout) => forward_output(stdout, progress),
            None => Ok(()),
        };

        if let Err(e) = forwarded {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stderr_reader.join();
            progress.error(&format!("failed to read toolkit output: {}", e));
            return Err(e.into());
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                let _ = stderr_reader.join();
                progress.error(&format!("failed to wait for the toolkit: {}", e));
                return Err(e.into());
            }
        };
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let tail = tail_lines(&stderr, STDERR_TAIL_LINES);
            progress.error(&tail);
            return Err(RegistrationError::toolkit_failed(status.to_string(), tail));
        }
        progress.complete();

        let outputs = expected_outputs(
            &Self::output_prefix(&job.scratch_dir),
            job.params.transform_type.is_deformable(),
            job.format,
        );
        outputs.ensure_exists()?;
        info!(
            "{} produced {} forward and {} inverse transforms",
            Self::PROGRAM,
            outputs.forward.len(),
            outputs.inverse.len()
        );
        Ok(outputs)
    }
}

/// Feed every stdout line of the toolkit to `progress`, stopping at the first read error.
fn forward_output<R: Read>(stdout: R, progress: &ProgressTracker) -> std::io::Result<()> {
    for chunk in BufReader::new(stdout).split(b'\n') {
        let chunk = chunk?;
        let line = String::from_utf8_lossy(&chunk);
        trace!(target: "antsRegistration", "{}", line.trim_end());
        if let Some(event) = parse_line(&line) {
            progress.handle(event);
        }
    }
    Ok(())
}

/// Files `antsRegistration` writes for a given output prefix.
pub fn expected_outputs(prefix: &Path, deformable: bool, format: TransformFormat) -> ToolkitOutput {
    let file = |suffix: &str| with_suffix(prefix, suffix);
    let warped_image = file("Warped.nii.gz");

    match (format, deformable) {
        (TransformFormat::Composite, _) => ToolkitOutput {
            warped_image,
            forward: vec![file("Composite.h5")],
            inverse: vec![file("InverseComposite.h5")],
        },
        (TransformFormat::Components, true) => ToolkitOutput {
            warped_image,
            forward: vec![file("1Warp.nii.gz"), file("0GenericAffine.mat")],
            inverse: vec![file("0GenericAffine.mat"), file("1InverseWarp.nii.gz")],
        },
        (TransformFormat::Components, false) => ToolkitOutput {
            warped_image,
            forward: vec![file("0GenericAffine.mat")],
            inverse: vec![file("0GenericAffine.mat")],
        },
    }
}

fn locate_executable(antspath: Option<&OsStr>, path: Option<&OsStr>) -> Option<PathBuf> {
    let program = format!("{}{}", AntsRegistration::PROGRAM, std::env::consts::EXE_SUFFIX);

    if let Some(dir) = antspath.filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(&program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    std::env::split_paths(path?)
        .map(|dir| dir.join(&program))
        .find(|candidate| candidate.is_file())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Single-quote `arg` unless it consists of characters a shell leaves alone.
fn shell_quote(arg: &str) -> String {
    let plain = |c: char| c.is_ascii_alphanumeric() || "-_./=:+@%,".contains(c);
    if !arg.is_empty() && arg.chars().all(plain) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
