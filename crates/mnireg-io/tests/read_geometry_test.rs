use anyhow::Result;
use mnireg_io::read_geometry;
use ndarray::Array3;
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use tempfile::tempdir;

fn volume(nx: usize, ny: usize, nz: usize) -> Array3<f32> {
    let data: Vec<f32> = (0..nx * ny * nz).map(|x| x as f32).collect();
    Array3::from_shape_vec((nx, ny, nz), data).unwrap()
}

#[test]
fn test_read_geometry_plain_nii() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("plain.nii");
    WriterOptions::new(&path).write_nifti(&volume(3, 4, 5))?;

    let geometry = read_geometry(&path)?;
    assert_eq!(geometry.shape, [3, 4, 5]);
    assert_eq!(geometry.voxel_count(), 60);
    assert!(geometry.is_orthogonal());
    Ok(())
}

#[test]
fn test_read_geometry_gzipped_with_sform() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("template.nii.gz");

    let mut reference = NiftiHeader::default();
    reference.sform_code = 4;
    reference.srow_x = [-2.0, 0.0, 0.0, 90.0];
    reference.srow_y = [0.0, 2.0, 0.0, -126.0];
    reference.srow_z = [0.0, 0.0, 2.0, -72.0];

    WriterOptions::new(&path)
        .reference_header(&reference)
        .write_nifti(&volume(6, 7, 8))?;

    let geometry = read_geometry(&path)?;
    assert_eq!(geometry.shape, [6, 7, 8]);
    assert_eq!(geometry.spacing, [2.0, 2.0, 2.0]);
    assert_eq!(geometry.origin, [90.0, -126.0, -72.0]);
    assert_eq!(geometry.direction[(0, 0)], -1.0);
    Ok(())
}

#[test]
fn test_read_geometry_missing_file() {
    let dir = tempdir().unwrap();
    let err = read_geometry(dir.path().join("absent.nii.gz")).unwrap_err();
    assert!(err.to_string().contains("Failed to read NIfTI header"));
}

#[test]
fn test_read_geometry_not_nifti() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("notes.nii");
    std::fs::write(&path, b"this is not an image")?;

    assert!(read_geometry(&path).is_err());
    Ok(())
}
