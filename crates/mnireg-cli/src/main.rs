use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mnireg_registration::{
    AntsRegistration, ConsoleProgressCallback, MniRegistration, RegistrationRequest, SynParams,
    TransformFormat, TransformType, MNI152_TEMPLATE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod spinner;

use spinner::SpinnerProgress;

#[derive(Parser)]
#[command(name = "mnireg")]
#[command(about = "Nonlinear registration of anatomical images to MNI152 with ANTs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an anatomical image to the MNI152 template
    Register(RegisterArgs),

    /// Print the geometry stored in a NIfTI header
    Inspect {
        /// Image to inspect
        image: PathBuf,
    },

    /// Print the resolved registration parameters as TOML
    Params {
        /// Parameter file to start from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the transform type
        #[arg(short, long)]
        transform_type: Option<TransformType>,
    },
}

#[derive(Args)]
struct RegisterArgs {
    /// Anatomical image, e.g. a T1w scan
    anat: PathBuf,

    /// Folder holding the template image
    atlas_folder: PathBuf,

    /// Prefix of every output file
    output_prefix: String,

    /// Template file name inside the atlas folder
    #[arg(long, default_value = MNI152_TEMPLATE)]
    template_name: String,

    /// Transform type (Rigid, Affine, SyN, SyNRA, SyNOnly)
    #[arg(short, long)]
    transform_type: Option<TransformType>,

    /// Write one composite file per direction, or the individual components
    #[arg(long, default_value_t = TransformFormat::Composite)]
    transform_format: TransformFormat,

    /// TOML parameter file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for the toolkit's random sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Number of toolkit threads
    #[arg(long)]
    threads: Option<usize>,

    /// Path to antsRegistration
    #[arg(long)]
    ants: Option<PathBuf>,

    /// Mask in template space
    #[arg(long)]
    fixed_mask: Option<PathBuf>,

    /// Mask in subject space
    #[arg(long)]
    moving_mask: Option<PathBuf>,

    /// Directory to create the scratch directory in
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Leave the scratch directory on disk
    #[arg(long)]
    keep_scratch: bool,

    /// Also write the result mapping to this JSON file
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Print the toolkit command line and exit
    #[arg(long)]
    dry_run: bool,

    /// Log progress instead of drawing a spinner
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register(args) => {
            register(args)?;
        }
        Commands::Inspect { image } => {
            inspect(&image)?;
        }
        Commands::Params {
            config,
            transform_type,
        } => {
            let params = resolve_params(config.as_deref(), transform_type, None, None)?;
            print!("{}", params.to_toml_string()?);
        }
    }

    Ok(())
}

/// Load the parameter file, if any, and apply command line overrides.
fn resolve_params(
    config: Option<&Path>,
    transform_type: Option<TransformType>,
    seed: Option<u64>,
    threads: Option<usize>,
) -> Result<SynParams> {
    let mut params = match config {
        Some(path) => SynParams::from_toml_file(path)
            .with_context(|| format!("Failed to load parameters from {}", path.display()))?,
        None => SynParams::default(),
    };

    if let Some(transform_type) = transform_type {
        params.transform_type = transform_type;
    }
    if seed.is_some() {
        params.random_seed = seed;
    }
    if threads.is_some() {
        params.threads = threads;
    }

    params.validate()?;
    Ok(params)
}

fn register(args: RegisterArgs) -> Result<()> {
    let params = resolve_params(
        args.config.as_deref(),
        args.transform_type,
        args.seed,
        args.threads,
    )?;

    let ants = match &args.ants {
        Some(path) => AntsRegistration::with_executable(path)?,
        None => AntsRegistration::from_env()?,
    };
    info!("Using {}", ants.executable().display());

    let mut registration = MniRegistration::new(ants)
        .with_params(params)
        .with_template_name(args.template_name)
        .with_transform_format(args.transform_format)
        .keep_scratch(args.keep_scratch);
    if let Some(root) = args.scratch {
        registration = registration.with_scratch_root(root);
    }

    let mut request = RegistrationRequest::new(args.anat, args.atlas_folder, args.output_prefix);
    if let Some(mask) = args.fixed_mask {
        request = request.with_fixed_mask(mask);
    }
    if let Some(mask) = args.moving_mask {
        request = request.with_moving_mask(mask);
    }

    if args.dry_run {
        let scratch = std::env::temp_dir().join("mnireg-dry-run");
        let job = registration.prepare(&request, &scratch)?;
        println!("{}", registration.toolkit().command_line(&job)?);
        return Ok(());
    }

    let spinner = if args.quiet {
        None
    } else {
        Some(Arc::new(SpinnerProgress::new()?))
    };
    registration = match &spinner {
        Some(spinner) => registration.with_progress(spinner.clone()),
        None => registration.with_progress(Arc::new(ConsoleProgressCallback::default())),
    };

    let result = registration.run(&request);
    if let Some(spinner) = &spinner {
        spinner.finish();
    }
    let outputs = result?;

    if let Some(manifest) = &args.manifest {
        outputs.write_manifest(manifest)?;
        info!("Wrote manifest {}", manifest.display());
    }
    println!("{}", outputs.to_json()?);

    Ok(())
}

fn inspect(image: &Path) -> Result<()> {
    let geometry = mnireg_io::read_geometry(image)?;
    println!("{}", image.display());
    println!("{}", geometry);
    if !geometry.is_orthogonal() {
        println!("  direction cosines are not orthogonal");
    }
    Ok(())
}
