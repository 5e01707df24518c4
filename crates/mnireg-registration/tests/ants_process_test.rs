//! Drives `AntsRegistration` against a shell script standing in for the real
//! executable. Unix only.
//!
//! `test_real_ants_registration` needs an ANTs installation and data:
//!   MNIREG_ANAT=/path/T1w.nii.gz MNIREG_ATLAS=/path/atlas \
//!   cargo test --test ants_process_test -- --ignored
#![cfg(unix)]

use mnireg_registration::{
    AntsRegistration, HistoryCallback, MniRegistration, ProgressCallback, ProgressInfo,
    RegistrationError, RegistrationRequest, SynParams, TransformFormat, MNI152_TEMPLATE,
};
use ndarray::Array3;
use nifti::writer::WriterOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

// Writing an executable while another test thread forks can fail with ETXTBSY.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

const FAKE_ANTS: &str = r#"#!/bin/sh
here=$(dirname "$0")
echo "$@" > "$here/args.txt"
echo "${ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS:-unset}" > "$here/threads.txt"
composite=0
while [ $# -gt 0 ]; do
  case "$1" in
    --output) output="$2"; shift ;;
    --initial-moving-transform) initial="$2"; shift ;;
    --write-composite-transform) composite="$2"; shift ;;
  esac
  shift
done
initial="${initial#?}"
initial="${initial%?}"
fixed="${initial%%,*}"
rest="${initial#*,}"
moving="${rest%%,*}"
for image in "$fixed" "$moving"; do
  if [ ! -f "$image" ]; then
    echo "cannot read $image (cwd $(pwd))" >&2
    exit 1
  fi
done
output="${output#?}"
output="${output%?}"
prefix="${output%%,*}"
rest="${output#*,}"
warped="${rest%%,*}"
echo "All_Command_lines_OK"
echo "Stage 0"
echo "  Current level = 1 of 4"
echo "XDIAGNOSTIC,Iteration,metricValue,convergenceValue,ITERATION_TIME_INDEX,SINCE_LAST"
echo " 2DIAGNOSTIC,     1, -4.000000000000e-01, inf, 1.0e-01, 1.0e-01, "
echo " 2DIAGNOSTIC,     2, -4.500000000000e-01, 1.000000000000e-02, 2.0e-01, 1.0e-01, "
echo "Stage 1"
echo "  Current level = 1 of 3"
echo " 2DIAGNOSTIC,     1, -5.000000000000e-01, inf, 3.0e-01, 1.0e-01, "
: > "$warped"
if [ "$composite" = "1" ]; then
  : > "${prefix}Composite.h5"
  : > "${prefix}InverseComposite.h5"
else
  : > "${prefix}0GenericAffine.mat"
  : > "${prefix}1Warp.nii.gz"
  : > "${prefix}1InverseWarp.nii.gz"
fi
"#;

const FAILING_ANTS: &str = r#"#!/bin/sh
echo "Stage 0"
echo "Exception caught: metric value is NaN" >&2
echo "itk::ExceptionObject (0x1)" >&2
exit 1
"#;

const SILENT_ANTS: &str = "#!/bin/sh\nexit 0\n";

/// Counts reported failures.
#[derive(Default)]
struct ErrorCounter {
    errors: AtomicUsize,
}

impl ProgressCallback for ErrorCounter {
    fn on_progress(&self, _info: &ProgressInfo) {}

    fn on_error(&self, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Switches the process working directory until dropped.
struct WorkingDir {
    previous: PathBuf,
}

impl WorkingDir {
    fn enter(dir: &Path) -> Self {
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        Self { previous }
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

struct Fixture {
    dir: TempDir,
    anatomical: PathBuf,
    atlas: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let atlas = dir.path().join("atlas");
        std::fs::create_dir_all(&atlas).unwrap();
        let anatomical = dir.path().join("T1w.nii.gz");

        let volume = Array3::<f32>::zeros((5, 5, 5));
        WriterOptions::new(&anatomical).write_nifti(&volume).unwrap();
        WriterOptions::new(atlas.join(MNI152_TEMPLATE))
            .write_nifti(&volume)
            .unwrap();

        Self {
            dir,
            anatomical,
            atlas,
        }
    }

    fn install(&self, script: &str) -> AntsRegistration {
        let bin = self.dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join("antsRegistration");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        AntsRegistration::with_executable(path).unwrap()
    }

    fn recorded(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join("bin").join(name)).unwrap()
    }

    fn request(&self, name: &str) -> RegistrationRequest {
        let prefix = self.dir.path().join("out").join(name);
        RegistrationRequest::new(&self.anatomical, &self.atlas, prefix.display().to_string())
    }
}

#[test]
fn test_script_registration_composite() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(FAKE_ANTS);
    let history = Arc::new(HistoryCallback::new());

    let params = SynParams {
        threads: Some(2),
        random_seed: Some(13),
        ..SynParams::default()
    };
    let outputs = MniRegistration::new(ants)
        .with_params(params)
        .with_progress(history.clone())
        .run(&fixture.request("sub-01"))
        .unwrap();

    assert!(outputs.warped_image.is_file());
    assert!(outputs.transform[0].ends_with("sub-01_fwd_0.h5"));
    assert!(outputs.inverse_transform[0].ends_with("sub-01_inv_0.h5"));

    let args = fixture.recorded("args.txt");
    assert!(args.contains("--transform SyN[0.2,3,0]"));
    assert!(args.contains("--random-seed 13"));
    assert!(args.contains(&format!(
        "{},{},1]",
        fixture.atlas.join(MNI152_TEMPLATE).display(),
        fixture.anatomical.display()
    )));
    assert_eq!(fixture.recorded("threads.txt").trim(), "2");

    let recorded = history.get_history();
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded[1].metric, -0.45);
    assert_eq!(recorded[1].convergence, Some(0.01));
    assert_eq!(recorded[2].stage, 1);
    assert_eq!(recorded[2].total_iterations, Some(40));
    assert_eq!(history.get_stages(), vec![(0, 1), (1, 1)]);
}

#[test]
fn test_script_registration_components() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(FAKE_ANTS);

    let outputs = MniRegistration::new(ants)
        .with_transform_format(TransformFormat::Components)
        .run(&fixture.request("sub-02"))
        .unwrap();

    assert_eq!(outputs.transform.len(), 2);
    assert!(outputs.transform[0].ends_with("sub-02_fwd_0.nii.gz"));
    assert!(outputs.transform[1].ends_with("sub-02_fwd_1.mat"));
    assert!(outputs.inverse_transform[1].ends_with("sub-02_inv_1.nii.gz"));
    assert!(!fixture.recorded("args.txt").contains("--write-composite-transform"));
    assert_eq!(fixture.recorded("threads.txt").trim(), "unset");
}

#[test]
fn test_script_failure_reports_stderr() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(FAILING_ANTS);

    let err = MniRegistration::new(ants)
        .run(&fixture.request("sub-03"))
        .unwrap_err();
    match err {
        RegistrationError::ToolkitFailed { status, stderr } => {
            assert!(status.contains('1'), "{}", status);
            assert!(stderr.contains("metric value is NaN"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_script_without_outputs() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(SILENT_ANTS);

    let err = MniRegistration::new(ants)
        .run(&fixture.request("sub-04"))
        .unwrap_err();
    assert!(matches!(err, RegistrationError::MissingOutput(p) if p.ends_with("reg_Warped.nii.gz")));
}

#[test]
fn test_script_registration_relative_paths() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(FAKE_ANTS);
    let root = fixture.dir.path().canonicalize().unwrap();
    let _cwd = WorkingDir::enter(&root);

    let outputs = MniRegistration::new(ants)
        .with_scratch_root("scratch")
        .run(&RegistrationRequest::new("T1w.nii.gz", "atlas", "out/sub-05"))
        .unwrap();

    assert_eq!(outputs.warped_image, PathBuf::from("out/sub-05_to_MNI.nii.gz"));
    assert!(root.join("out/sub-05_to_MNI.nii.gz").is_file());
    assert!(root.join("out/sub-05_fwd_0.h5").is_file());
    assert!(root.join("out/sub-05_inv_0.h5").is_file());

    let args = fixture.recorded("args.txt");
    assert!(args.contains(&format!(
        "[{},{},1]",
        root.join("atlas").join(MNI152_TEMPLATE).display(),
        root.join("T1w.nii.gz").display()
    )));
    assert!(args.contains(&format!("--output [{}/mnireg-", root.join("scratch").display())));
}

#[test]
fn test_unlaunchable_executable_reports_error() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fixture = Fixture::new();
    let ants = fixture.install(SILENT_ANTS);
    std::fs::set_permissions(ants.executable(), std::fs::Permissions::from_mode(0o644)).unwrap();
    let counter = Arc::new(ErrorCounter::default());

    let err = MniRegistration::new(ants)
        .with_progress(counter.clone())
        .run(&fixture.request("sub-06"))
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Io(_)));
    assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
}

#[test]
#[ignore = "requires ANTs and MNIREG_ANAT / MNIREG_ATLAS"]
fn test_real_ants_registration() {
    let anat = std::env::var("MNIREG_ANAT").expect("MNIREG_ANAT not set");
    let atlas = std::env::var("MNIREG_ATLAS").expect("MNIREG_ATLAS not set");
    let out = tempdir().unwrap();
    let prefix = out.path().join("sub");

    let outputs = mnireg_registration::register_to_mni(
        Path::new(&anat),
        Path::new(&atlas),
        &prefix.display().to_string(),
    )
    .expect("registration failed");

    let geometry = mnireg_io::read_geometry(&outputs.warped_image).unwrap();
    let template = mnireg_io::read_geometry(Path::new(&atlas).join(MNI152_TEMPLATE)).unwrap();
    assert_eq!(geometry.shape, template.shape);
    assert_eq!(outputs.transform.len(), 1);
    assert_eq!(outputs.inverse_transform.len(), 1);
}
