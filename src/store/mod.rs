//! Persisted scan container.
//!
//! One file per scan, named `scan_data_YYYYMMDD_HHMMSS.<ext>`, holding:
//!
//! - `scan_parameters`: plan fields, humidity at start and end, completion
//!   flag and message, start time
//! - `positions` (N x 2), `spectra` (N x M), `max_values` (N), `min_values` (N)
//!   for the acquired points
//! - `time_axis` (M)
//! - `skipped_positions` (K x 2) and `skipped_status` (K) for points that
//!   failed to move or acquire
//!
//! The default `storage_hdf5` feature writes this layout as HDF5 groups,
//! attributes and datasets. The JSON backend is always built and becomes the
//! default when the crate is compiled without HDF5.

pub mod json;
#[cfg(feature = "storage_hdf5")]
pub mod h5;

use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::scan::{PointStatus, ScanPlan, ScanResult, ScanSample};

pub const FILE_PREFIX: &str = "scan_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Json,
    #[cfg(feature = "storage_hdf5")]
    Hdf5,
}

impl Default for StoreFormat {
    #[cfg(feature = "storage_hdf5")]
    fn default() -> Self {
        StoreFormat::Hdf5
    }

    #[cfg(not(feature = "storage_hdf5"))]
    fn default() -> Self {
        StoreFormat::Json
    }
}

impl StoreFormat {
    pub fn extension(self) -> &'static str {
        match self {
            StoreFormat::Json => "json",
            #[cfg(feature = "storage_hdf5")]
            StoreFormat::Hdf5 => "hdf5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    #[serde(flatten)]
    pub plan: ScanPlan,
    #[serde(default, with = "json::lossless::option")]
    pub start_humidity: Option<f64>,
    #[serde(default, with = "json::lossless::option")]
    pub end_humidity: Option<f64>,
    pub completed: bool,
    pub message: String,
    pub started_at: DateTime<Local>,
}

/// Column layout shared by every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub scan_parameters: ScanParameters,
    #[serde(with = "json::lossless::table")]
    pub positions: Vec<[f64; 2]>,
    #[serde(with = "json::lossless::matrix")]
    pub spectra: Vec<Vec<f64>>,
    #[serde(with = "json::lossless::vec")]
    pub max_values: Vec<f64>,
    #[serde(with = "json::lossless::vec")]
    pub min_values: Vec<f64>,
    #[serde(with = "json::lossless::vec")]
    pub time_axis: Vec<f64>,
    #[serde(with = "json::lossless::table")]
    pub skipped_positions: Vec<[f64; 2]>,
    pub skipped_status: Vec<PointStatus>,
}

impl Container {
    /// Split a result into columns. Fails when nothing was acquired or the
    /// acquired waveforms differ in length.
    pub fn from_result(result: &ScanResult) -> Result<Self, StoreError> {
        let acquired: Vec<&ScanSample> = result.acquired().collect();
        let Some(first) = acquired.first() else {
            return Err(StoreError::Empty);
        };

        let expected = first.waveform.len();
        if let Some((index, sample)) = acquired
            .iter()
            .enumerate()
            .find(|(_, s)| s.waveform.len() != expected)
        {
            return Err(StoreError::RaggedWaveforms {
                index,
                expected,
                found: sample.waveform.len(),
            });
        }

        let skipped: Vec<&ScanSample> = result.skipped().collect();

        Ok(Self {
            scan_parameters: ScanParameters {
                plan: result.plan.clone(),
                start_humidity: result.start_humidity,
                end_humidity: result.end_humidity,
                completed: result.completed,
                message: result.message.clone(),
                started_at: result.started_at,
            },
            positions: acquired.iter().map(|s| [s.x, s.y]).collect(),
            spectra: acquired.iter().map(|s| s.waveform.clone()).collect(),
            max_values: acquired.iter().map(|s| s.max).collect(),
            min_values: acquired.iter().map(|s| s.min).collect(),
            time_axis: result.time_axis.clone(),
            skipped_positions: skipped.iter().map(|s| [s.x, s.y]).collect(),
            skipped_status: skipped.iter().map(|s| s.status).collect(),
        })
    }

    /// Rebuild a result: acquired samples first, then skipped ones
    pub fn into_result(self, path: &Path) -> Result<ScanResult, StoreError> {
        let n = self.positions.len();
        if self.spectra.len() != n || self.max_values.len() != n || self.min_values.len() != n {
            return Err(StoreError::Format {
                path: path.to_path_buf(),
                message: format!(
                    "{n} positions but {} spectra, {} max values, {} min values",
                    self.spectra.len(),
                    self.max_values.len(),
                    self.min_values.len()
                ),
            });
        }
        if self.skipped_positions.len() != self.skipped_status.len() {
            return Err(StoreError::Format {
                path: path.to_path_buf(),
                message: "skipped positions and status differ in length".to_string(),
            });
        }

        let acquired = self
            .positions
            .into_iter()
            .zip(self.spectra)
            .zip(self.max_values.into_iter().zip(self.min_values))
            .map(|(([x, y], waveform), (max, min))| ScanSample::acquired(x, y, waveform, max, min));
        let skipped = self
            .skipped_positions
            .into_iter()
            .zip(self.skipped_status)
            .map(|([x, y], status)| ScanSample::skipped(x, y, status));

        let params = self.scan_parameters;
        Ok(ScanResult {
            plan: params.plan,
            samples: acquired.chain(skipped).collect(),
            time_axis: self.time_axis,
            start_humidity: params.start_humidity,
            end_humidity: params.end_humidity,
            completed: params.completed,
            message: params.message,
            started_at: params.started_at,
        })
    }
}

/// Save into `dir` in the default format
pub fn save(result: &ScanResult, dir: &Path) -> Result<PathBuf, StoreError> {
    save_as(result, dir, StoreFormat::default())
}

pub fn save_as(result: &ScanResult, dir: &Path, format: StoreFormat) -> Result<PathBuf, StoreError> {
    let container = Container::from_result(result)?;

    std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
        source,
        context: format!("Creating {}", dir.display()),
    })?;

    let stem = format!("{FILE_PREFIX}_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let path = match format {
        StoreFormat::Json => json::write_new(dir, &stem, &container)?,
        #[cfg(feature = "storage_hdf5")]
        StoreFormat::Hdf5 => h5::write_new(dir, &stem, &container)?,
    };

    info!(
        "Saved {} points ({} skipped) to {}",
        container.positions.len(),
        container.skipped_positions.len(),
        path.display()
    );
    Ok(path)
}

/// Read a container back, choosing the backend by file extension
pub fn load(path: &Path) -> Result<ScanResult, StoreError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let container = match extension.as_deref() {
        Some("json") => json::read(path)?,
        #[cfg(feature = "storage_hdf5")]
        Some("hdf5" | "h5") => h5::read(path)?,
        #[cfg(not(feature = "storage_hdf5"))]
        Some("hdf5" | "h5") => {
            return Err(StoreError::Format {
                path: path.to_path_buf(),
                message: "HDF5 support is not enabled in this build".to_string(),
            });
        }
        _ => {
            return Err(StoreError::Format {
                path: path.to_path_buf(),
                message: "unknown container extension".to_string(),
            });
        }
    };

    container.into_result(path)
}

/// `dir/stem.ext`, or `dir/stem_N.ext` for the first N that does not exist yet
pub(crate) fn candidate_paths(dir: &Path, stem: &str, extension: &str) -> impl Iterator<Item = PathBuf> {
    let dir = dir.to_path_buf();
    let stem = stem.to_string();
    let extension = extension.to_string();
    (0..1000u32).map(move |n| {
        if n == 0 {
            dir.join(format!("{stem}.{extension}"))
        } else {
            dir.join(format!("{stem}_{n}.{extension}"))
        }
    })
}
