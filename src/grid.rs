//! Binning of scattered samples onto the regular scan grid.

use image::{GrayImage, Luma};
use log::{debug, info};
use ndarray::{Array1, Array2};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::scan::{ScanPlan, ScanSample};

/// Peak and peak-to-peak images of one scan, shape `(y_steps, x_steps)`.
/// Cells without a sample hold NaN.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub peak: Array2<f64>,
    pub peak_to_peak: Array2<f64>,
    pub x_coords: Array1<f64>,
    pub y_coords: Array1<f64>,
    /// Acquired samples whose grid index fell outside the grid
    pub dropped: usize,
}

/// Grid index of `position` along one axis, or `None` outside `[0, steps)`.
/// Halfway cases round to even.
pub fn grid_index(position: f64, start: f64, step: f64, steps: usize) -> Option<usize> {
    let index = ((position - start) / step).round_ties_even();
    if index.is_finite() && index >= 0.0 && index < steps as f64 {
        Some(index as usize)
    } else {
        None
    }
}

/// Bin the acquired samples. Skipped points are ignored; when two samples land
/// in the same cell the later one wins.
pub fn reconstruct<'a>(
    samples: impl IntoIterator<Item = &'a ScanSample>,
    plan: &ScanPlan,
) -> Reconstruction {
    let (x_steps, y_steps) = (plan.x_steps(), plan.y_steps());
    let mut peak = Array2::from_elem((y_steps, x_steps), f64::NAN);
    let mut peak_to_peak = Array2::from_elem((y_steps, x_steps), f64::NAN);
    let mut dropped = 0;

    for sample in samples.into_iter().filter(|s| s.is_acquired()) {
        let col = grid_index(sample.x, plan.start_x(), plan.step_x, x_steps);
        let row = grid_index(sample.y, plan.start_y(), plan.step_y, y_steps);
        match (row, col) {
            (Some(row), Some(col)) => {
                peak[[row, col]] = sample.max;
                peak_to_peak[[row, col]] = sample.peak_to_peak();
            }
            _ => {
                debug!(
                    "Sample at ({:.3}, {:.3}) is outside the grid",
                    sample.x, sample.y
                );
                dropped += 1;
            }
        }
    }

    Reconstruction {
        peak,
        peak_to_peak,
        x_coords: Array1::linspace(plan.start_x(), plan.end_x(), x_steps),
        y_coords: Array1::linspace(plan.start_y(), plan.end_y(), y_steps),
        dropped,
    }
}

impl Reconstruction {
    pub fn filled_cells(&self) -> usize {
        self.peak.iter().filter(|v| !v.is_nan()).count()
    }

    /// Write `<stem>_peak.png` and `<stem>_pp.png` into `dir`.
    ///
    /// Each image is scaled linearly over its own finite range. Missing cells
    /// are black and the first grid row is the bottom image row.
    pub fn write_png(&self, dir: &Path, stem: &str) -> Result<(PathBuf, PathBuf), StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            source,
            context: format!("Creating {}", dir.display()),
        })?;

        let peak_path = dir.join(format!("{stem}_peak.png"));
        let pp_path = dir.join(format!("{stem}_pp.png"));
        to_grayscale(&self.peak).save(&peak_path)?;
        to_grayscale(&self.peak_to_peak).save(&pp_path)?;

        info!(
            "Images written to {} and {}",
            peak_path.display(),
            pp_path.display()
        );
        Ok((peak_path, pp_path))
    }
}

fn to_grayscale(grid: &Array2<f64>) -> GrayImage {
    let (rows, cols) = grid.dim();
    let (lo, hi) = grid
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = hi - lo;

    GrayImage::from_fn(cols as u32, rows as u32, |px, py| {
        let value = grid[[rows - 1 - py as usize, px as usize]];
        let level = if !value.is_finite() {
            0
        } else if span > 0.0 {
            (1.0 + (value - lo) / span * 254.0).round() as u8
        } else {
            255
        };
        Luma([level])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::PointStatus;

    fn plan() -> ScanPlan {
        ScanPlan {
            center_x: 1.0,
            center_y: 1.0,
            width: 2.0,
            height: 2.0,
            step_x: 1.0,
            step_y: 1.0,
            ..ScanPlan::default()
        }
    }

    fn sample(x: f64, y: f64, max: f64, min: f64) -> ScanSample {
        ScanSample::acquired(x, y, vec![max, min], max, min)
    }

    #[test]
    fn test_samples_land_in_rounded_cells() {
        let samples = [sample(0.0, 0.0, 3.0, -1.0), sample(2.1, 0.9, 5.0, 1.0)];
        let grid = reconstruct(&samples, &plan());

        assert_eq!(grid.peak.dim(), (3, 3));
        assert_eq!(grid.peak[[0, 0]], 3.0);
        assert_eq!(grid.peak_to_peak[[0, 0]], 4.0);
        assert_eq!(grid.peak[[1, 2]], 5.0);
        assert_eq!(grid.peak_to_peak[[1, 2]], 4.0);
        assert!(grid.peak[[2, 2]].is_nan());
        assert_eq!(grid.filled_cells(), 2);
        assert_eq!(grid.dropped, 0);
    }

    #[test]
    fn test_one_past_last_index_is_dropped() {
        // (3.0 - 0.0) / 1.0 rounds to 3 == x_steps
        let samples = [sample(3.0, 0.0, 1.0, 0.0), sample(-0.6, 0.0, 1.0, 0.0)];
        let grid = reconstruct(&samples, &plan());

        assert_eq!(grid.filled_cells(), 0);
        assert_eq!(grid.dropped, 2);
    }

    #[test]
    fn test_last_write_wins() {
        let samples = [sample(1.0, 1.0, 1.0, 0.0), sample(1.2, 0.8, 7.0, 2.0)];
        let grid = reconstruct(&samples, &plan());
        assert_eq!(grid.peak[[1, 1]], 7.0);
        assert_eq!(grid.peak_to_peak[[1, 1]], 5.0);
    }

    #[test]
    fn test_skipped_points_are_not_binned() {
        let samples = [ScanSample::skipped(1.0, 1.0, PointStatus::MoveFailed)];
        let grid = reconstruct(&samples, &plan());
        assert_eq!(grid.filled_cells(), 0);
        assert_eq!(grid.dropped, 0);
    }

    #[test]
    fn test_halfway_rounds_to_even() {
        assert_eq!(grid_index(0.5, 0.0, 1.0, 3), Some(0));
        assert_eq!(grid_index(1.5, 0.0, 1.0, 3), Some(2));
        assert_eq!(grid_index(2.5, 0.0, 1.0, 3), Some(2));
        assert_eq!(grid_index(f64::NAN, 0.0, 1.0, 3), None);
    }

    #[test]
    fn test_coordinates_span_plan() {
        let grid = reconstruct(std::iter::empty(), &ScanPlan::default());
        assert_eq!(grid.x_coords.len(), 11);
        assert_eq!(grid.x_coords[0], 80.0);
        assert_eq!(grid.x_coords[10], 90.0);
        assert_eq!(grid.y_coords[0], 135.0);
    }

    #[test]
    fn test_png_export() {
        let dir = tempfile::tempdir().unwrap();
        let samples = [sample(0.0, 0.0, 3.0, -1.0), sample(2.0, 2.0, 5.0, 1.0)];
        let grid = reconstruct(&samples, &plan());

        let (peak, pp) = grid.write_png(dir.path(), "scan").unwrap();
        let image = image::open(&peak).unwrap().to_luma8();
        assert_eq!(image.dimensions(), (3, 3));
        // Row 0 of the grid is the bottom of the image
        assert_eq!(image.get_pixel(0, 2)[0], 1);
        assert_eq!(image.get_pixel(2, 0)[0], 255);
        assert_eq!(image.get_pixel(1, 1)[0], 0);
        assert!(pp.exists());
    }
}
