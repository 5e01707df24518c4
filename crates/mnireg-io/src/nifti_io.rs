use anyhow::{Context, Result};
use nifti::NiftiHeader;
use std::path::Path;

use crate::geometry::VolumeGeometry;

/// Read the geometry of a 3D NIfTI image (`.nii` or `.nii.gz`).
///
/// Only the header is decoded. Images with more than three dimensions are
/// accepted as long as every extra dimension is a singleton.
pub fn read_geometry<P: AsRef<Path>>(path: P) -> Result<VolumeGeometry> {
    let path = path.as_ref();
    let header = NiftiHeader::from_file(path)
        .with_context(|| format!("Failed to read NIfTI header from {}", path.display()))?;

    let shape = spatial_shape(&header)?;
    let affine = voxel_to_world(&header);

    Ok(VolumeGeometry::from_affine(shape, affine, header.datatype))
}

fn spatial_shape(header: &NiftiHeader) -> Result<[usize; 3]> {
    let ndim = header.dim[0] as usize;
    if !(3..=7).contains(&ndim) {
        anyhow::bail!("Expected a 3D NIfTI image, found {} dimensions", ndim);
    }
    if let Some(extra) = header.dim[4..=ndim].iter().find(|&&d| d > 1) {
        anyhow::bail!(
            "Expected a 3D NIfTI image, found a non-singleton extra dimension of size {}",
            extra
        );
    }

    let shape = [
        header.dim[1] as usize,
        header.dim[2] as usize,
        header.dim[3] as usize,
    ];
    if shape.contains(&0) {
        anyhow::bail!("NIfTI image has an empty spatial dimension: {:?}", shape);
    }
    Ok(shape)
}

/// Voxel-to-world affine as three rows, preferring sform over qform.
fn voxel_to_world(header: &NiftiHeader) -> [[f64; 4]; 3] {
    if header.sform_code > 0 {
        let row = |r: [f32; 4]| r.map(f64::from);
        return [row(header.srow_x), row(header.srow_y), row(header.srow_z)];
    }

    let dx = header.pixdim[1] as f64;
    let dy = header.pixdim[2] as f64;
    let dz = header.pixdim[3] as f64;

    if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();

        // pixdim[0] holds qfac; anything but -1 means a right-handed frame.
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dz = dz * qfac;

        let r11 = a * a + b * b - c * c - d * d;
        let r12 = 2.0 * b * c - 2.0 * a * d;
        let r13 = 2.0 * b * d + 2.0 * a * c;

        let r21 = 2.0 * b * c + 2.0 * a * d;
        let r22 = a * a + c * c - b * b - d * d;
        let r23 = 2.0 * c * d - 2.0 * a * b;

        let r31 = 2.0 * b * d - 2.0 * a * c;
        let r32 = 2.0 * c * d + 2.0 * a * b;
        let r33 = a * a + d * d - c * c - b * b;

        return [
            [r11 * dx, r12 * dy, r13 * dz, header.quatern_x as f64],
            [r21 * dx, r22 * dy, r23 * dz, header.quatern_y as f64],
            [r31 * dx, r32 * dy, r33 * dz, header.quatern_z as f64],
        ];
    }

    // Neither form set: pixdim scaling only.
    [
        [dx, 0.0, 0.0, 0.0],
        [0.0, dy, 0.0, 0.0],
        [0.0, 0.0, dz, 0.0],
    ]
}
