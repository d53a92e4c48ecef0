//! Loaded volume data and the in-process numeric variant.
//!
//! A [`Volume`] is a 4D array (x, y, z, diffusion volume). Reading and
//! writing on-disk image formats goes through the [`VolumeStore`] seam so
//! the orchestration core stays independent of any particular imaging
//! format; [`RawGzStore`] is the built-in store for the pipeline's own
//! gzip-compressed raw intermediates.
//!
//! `estimate_noise` implements the per-slice noise model: each axial slice
//! contributes one sigma estimate, and the pipeline-wide sigma is the
//! median of the per-slice values.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{s, Array3, Array4};

use crate::error::TaskError;

/// A loaded 4D diffusion volume, indexed (x, y, z, volume).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array4<f32>,
}

impl Volume {
    pub fn new(data: Array4<f32>) -> Self {
        Self { data }
    }

    /// Wraps a 3D boolean mask as a single-volume image (0.0 / 1.0), so a
    /// noise mask can be written through the same store as the data.
    pub fn from_mask(mask: &Array3<bool>) -> Self {
        let (nx, ny, nz) = mask.dim();
        let mut data = Array4::zeros((nx, ny, nz, 1));
        for ((x, y, z), &flag) in mask.indexed_iter() {
            data[(x, y, z, 0)] = if flag { 1.0 } else { 0.0 };
        }
        Self { data }
    }
}

/// Seam for reading and writing volumes on disk.
pub trait VolumeStore: Send + Sync {
    fn load(&self, path: &Path) -> Result<Volume, TaskError>;
    fn save(&self, volume: &Volume, path: &Path) -> Result<(), TaskError>;
}

/// Gzip-compressed raw little-endian f32 store.
///
/// Layout: magic `DWIF`, four u32 dimensions, then the array in row-major
/// order. Used for the pipeline's own intermediates and in tests; clinical
/// input conversion happens upstream of this tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawGzStore;

const MAGIC: &[u8; 4] = b"DWIF";

impl VolumeStore for RawGzStore {
    fn load(&self, path: &Path) -> Result<Volume, TaskError> {
        let mut reader = GzDecoder::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|_| malformed(path, "truncated header"))?;
        if &magic != MAGIC {
            return Err(malformed(path, "bad magic"));
        }

        let mut dims = [0usize; 4];
        for dim in &mut dims {
            let mut raw = [0u8; 4];
            reader.read_exact(&mut raw).map_err(|_| malformed(path, "truncated dims"))?;
            *dim = u32::from_le_bytes(raw) as usize;
        }

        let len = dims.iter().product::<usize>();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        if bytes.len() != len * 4 {
            return Err(malformed(path, "payload size does not match dimensions"));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let data = Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), values)
            .map_err(|_| malformed(path, "inconsistent dimensions"))?;
        Ok(Volume::new(data))
    }

    fn save(&self, volume: &Volume, path: &Path) -> Result<(), TaskError> {
        let mut writer = GzEncoder::new(File::create(path)?, Compression::default());

        writer.write_all(MAGIC)?;
        let (nx, ny, nz, nw) = volume.data.dim();
        for dim in [nx, ny, nz, nw] {
            writer.write_all(&(dim as u32).to_le_bytes())?;
        }
        for &value in volume.data.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.finish()?;
        Ok(())
    }
}

fn malformed(path: &Path, message: &str) -> TaskError {
    TaskError::MalformedInput {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Result of the per-slice noise estimation.
#[derive(Debug)]
pub struct NoiseEstimate {
    /// Median of the per-slice sigma estimates.
    pub sigma: f32,
    /// One sigma estimate per axial slice, in slice order.
    pub per_slice: Vec<f32>,
    /// Voxels identified as pure noise.
    pub mask: Array3<bool>,
}

/// Estimates the gaussian noise sigma of a diffusion volume.
///
/// For each axial slice, the lowest-intensity quarter of the slice's
/// voxels is taken as a background sample; under a Rayleigh background
/// with `coils` sum-of-squares channels, `E[x^2] = 2*N*sigma^2`, giving
/// one sigma per slice. The reported sigma is the median across slices.
/// A voxel joins the noise mask when it stays below `3*sigma_z*sqrt(2N)`
/// in every diffusion volume.
pub fn estimate_noise(volume: &Volume, coils: u32) -> NoiseEstimate {
    let (nx, ny, nz, nw) = volume.data.dim();
    let n = coils.max(1) as f32;

    let mut per_slice = Vec::with_capacity(nz);
    let mut mask = Array3::from_elem((nx, ny, nz), false);

    for z in 0..nz {
        let slice = volume.data.slice(s![.., .., z, ..]);
        let mut values: Vec<f32> = slice.iter().copied().filter(|v| v.is_finite()).collect();
        values.sort_by(f32::total_cmp);

        let background_len = (values.len() / 4).max(1).min(values.len());
        let sigma_z = if values.is_empty() {
            0.0
        } else {
            let mean_sq = values[..background_len]
                .iter()
                .map(|v| v * v)
                .sum::<f32>()
                / background_len as f32;
            (mean_sq / (2.0 * n)).sqrt()
        };
        per_slice.push(sigma_z);

        let threshold = 3.0 * sigma_z * (2.0 * n).sqrt();
        for x in 0..nx {
            for y in 0..ny {
                let mut is_noise = nw > 0;
                for w in 0..nw {
                    if volume.data[(x, y, z, w)] >= threshold {
                        is_noise = false;
                        break;
                    }
                }
                mask[(x, y, z)] = is_noise;
            }
        }
    }

    NoiseEstimate {
        sigma: median(&per_slice),
        per_slice,
        mask,
    }
}

/// Median with numpy semantics: even-length inputs average the two middle
/// values; empty input yields 0.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// In-process non-local means on loaded array data.
///
/// Each voxel is replaced by an intensity-weighted average of its 3x3x3
/// spatial neighborhood within the same diffusion volume, with weights
/// `exp(-(d/sigma)^2 / 2)`. A sigma of zero returns the input unchanged.
pub fn nlmeans(volume: &Volume, sigma: f32) -> Volume {
    if sigma <= 0.0 {
        return volume.clone();
    }

    let (nx, ny, nz, nw) = volume.data.dim();
    let mut out = Array4::zeros((nx, ny, nz, nw));
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

    for w in 0..nw {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let center = volume.data[(x, y, z, w)];
                    let mut total_weight = 0.0f32;
                    let mut total = 0.0f32;

                    for dz in -1i64..=1 {
                        for dy in -1i64..=1 {
                            for dx in -1i64..=1 {
                                let (px, py, pz) =
                                    (x as i64 + dx, y as i64 + dy, z as i64 + dz);
                                if px < 0
                                    || py < 0
                                    || pz < 0
                                    || px >= nx as i64
                                    || py >= ny as i64
                                    || pz >= nz as i64
                                {
                                    continue;
                                }
                                let value =
                                    volume.data[(px as usize, py as usize, pz as usize, w)];
                                let d = value - center;
                                let weight = (-d * d * inv_two_sigma_sq).exp();
                                total_weight += weight;
                                total += weight * value;
                            }
                        }
                    }

                    out[(x, y, z, w)] = if total_weight > 0.0 {
                        total / total_weight
                    } else {
                        center
                    };
                }
            }
        }
    }

    Volume::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_volume() -> Volume {
        let mut data = Array4::zeros((4, 4, 2, 3));
        // Slice 0: quiet background with one strong voxel.
        data[(1, 1, 0, 0)] = 100.0;
        data[(1, 1, 0, 1)] = 110.0;
        data[(1, 1, 0, 2)] = 90.0;
        // Slice 1: uniform low-level noise.
        for x in 0..4 {
            for y in 0..4 {
                for w in 0..3 {
                    data[(x, y, 1, w)] = 2.0;
                }
            }
        }
        Volume::new(data)
    }

    #[test]
    fn test_store_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dwi.nii.gz");
        let volume = test_volume();

        let store = RawGzStore;
        store.save(&volume, &path).unwrap();
        let loaded = store.load(&path).unwrap();

        assert_eq!(loaded, volume);
    }

    #[test]
    fn test_store_rejects_bad_magic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.nii.gz");
        let mut writer = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writer.write_all(b"NOPE0000000000000000").unwrap();
        writer.finish().unwrap();

        let err = RawGzStore.load(&path).unwrap_err();
        assert!(matches!(err, TaskError::MalformedInput { .. }));
    }

    #[test]
    fn test_store_rejects_truncated_payload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.nii.gz");
        let mut writer = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writer.write_all(MAGIC).unwrap();
        for dim in [2u32, 2, 2, 2] {
            writer.write_all(&dim.to_le_bytes()).unwrap();
        }
        writer.write_all(&[0u8; 8]).unwrap(); // 2 floats instead of 16
        writer.finish().unwrap();

        let err = RawGzStore.load(&path).unwrap_err();
        assert!(matches!(err, TaskError::MalformedInput { .. }));
    }

    #[test]
    fn test_median_odd_even_empty() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_estimate_noise_sigma_is_median_of_slices() {
        let volume = test_volume();
        let estimate = estimate_noise(&volume, 1);

        assert_eq!(estimate.per_slice.len(), 2);
        assert_eq!(estimate.sigma, median(&estimate.per_slice));
    }

    #[test]
    fn test_estimate_noise_masks_quiet_voxels_only() {
        let volume = test_volume();
        let estimate = estimate_noise(&volume, 1);

        // The strong voxel in slice 0 must not be flagged as noise.
        assert!(!estimate.mask[(1, 1, 0)]);
    }

    #[test]
    fn test_estimate_noise_coil_count_scales_sigma() {
        let volume = test_volume();
        let one = estimate_noise(&volume, 1);
        let four = estimate_noise(&volume, 4);

        // sigma ~ 1/sqrt(N); more coils means a smaller per-channel sigma.
        assert!(four.sigma <= one.sigma);
    }

    #[test]
    fn test_nlmeans_zero_sigma_is_identity() {
        let volume = test_volume();
        assert_eq!(nlmeans(&volume, 0.0), volume);
    }

    #[test]
    fn test_nlmeans_smooths_toward_neighbors() {
        let mut data = Array4::zeros((3, 3, 1, 1));
        data[(1, 1, 0, 0)] = 10.0;
        let volume = Volume::new(data);

        let denoised = nlmeans(&volume, 5.0);
        let center = denoised.data[(1, 1, 0, 0)];
        assert!(center < 10.0 && center > 0.0);
    }

    #[test]
    fn test_mask_round_trips_through_volume() {
        let mut mask = Array3::from_elem((2, 2, 1), false);
        mask[(0, 1, 0)] = true;

        let volume = Volume::from_mask(&mask);
        assert_eq!(volume.data[(0, 1, 0, 0)], 1.0);
        assert_eq!(volume.data[(0, 0, 0, 0)], 0.0);
    }
}
