//! Physical-space description of a 3D volume.
//!
//! Only what can be read from an image header lives here; voxel data is never
//! loaded.

use nalgebra::{Matrix3, Vector3};
use std::fmt;

/// Geometry of a 3D volume as stored in its header.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    /// Voxel counts along X, Y, Z (NIfTI order).
    pub shape: [usize; 3],
    /// Physical distance between voxel centres along each axis.
    pub spacing: [f64; 3],
    /// Physical coordinate of voxel (0, 0, 0).
    pub origin: [f64; 3],
    /// Direction cosines; column i is the direction of image axis i.
    pub direction: Matrix3<f64>,
    /// NIfTI datatype code of the stored voxels.
    pub datatype: i16,
}

impl VolumeGeometry {
    /// Build geometry from a 3x4 voxel-to-world affine given as rows.
    ///
    /// Spacing is the norm of each column of the linear part, direction its
    /// normalized columns. Degenerate columns fall back to the matching unit
    /// axis.
    pub fn from_affine(shape: [usize; 3], affine: [[f64; 4]; 3], datatype: i16) -> Self {
        let column = |c: usize| Vector3::new(affine[0][c], affine[1][c], affine[2][c]);
        let axes = [Vector3::x(), Vector3::y(), Vector3::z()];

        let mut spacing = [0.0; 3];
        let mut columns = [Vector3::zeros(); 3];
        for i in 0..3 {
            let col = column(i);
            let norm = col.norm();
            spacing[i] = norm;
            columns[i] = if norm > 1e-9 { col / norm } else { axes[i] };
        }

        Self {
            shape,
            spacing,
            origin: [affine[0][3], affine[1][3], affine[2][3]],
            direction: Matrix3::from_columns(&columns),
            datatype,
        }
    }

    /// Total number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the direction matrix is orthonormal within `1e-4`.
    pub fn is_orthogonal(&self) -> bool {
        let product = self.direction.transpose() * self.direction;
        (product - Matrix3::identity()).amax() < 1e-4
    }
}

impl fmt::Display for VolumeGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shape:     {} x {} x {}", self.shape[0], self.shape[1], self.shape[2])?;
        writeln!(
            f,
            "spacing:   {:.4} x {:.4} x {:.4}",
            self.spacing[0], self.spacing[1], self.spacing[2]
        )?;
        writeln!(
            f,
            "origin:    ({:.4}, {:.4}, {:.4})",
            self.origin[0], self.origin[1], self.origin[2]
        )?;
        for row in 0..3 {
            let label = if row == 0 { "direction:" } else { "" };
            writeln!(
                f,
                "{:<10} [{:>8.4} {:>8.4} {:>8.4}]",
                label,
                self.direction[(row, 0)],
                self.direction[(row, 1)],
                self.direction[(row, 2)]
            )?;
        }
        write!(f, "datatype:  {}", self.datatype)
    }
}
