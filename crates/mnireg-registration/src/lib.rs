//! Nonlinear registration of anatomical brain images to the MNI152 template.
//!
//! The registration itself is delegated to ANTs `antsRegistration`; this crate
//! locates inputs, drives the toolkit with a fixed SyN setup and writes the
//! results under deterministic names.

pub mod error;
pub mod mni;
pub mod outputs;
pub mod params;
pub mod progress;
pub mod template;
pub mod toolkit;

pub use error::{RegistrationError, Result};
pub use mni::{register_to_mni, MniRegistration, RegistrationRequest};
pub use outputs::{OutputLayout, RegistrationOutputs};
pub use params::{SynParams, TransformType};
pub use progress::{
    ConsoleProgressCallback, HistoryCallback, ProgressCallback, ProgressInfo, ProgressTracker,
    ToolkitEvent,
};
pub use template::{locate_template, MNI152_TEMPLATE};
pub use toolkit::{
    AntsRegistration, RegistrationToolkit, ToolkitJob, ToolkitOutput, TransformFormat,
};
