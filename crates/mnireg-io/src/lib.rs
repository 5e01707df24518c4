pub mod geometry;
pub mod nifti_io;

pub use geometry::VolumeGeometry;
pub use nifti_io::read_geometry;
