use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::axis::{Axis, Opcode};

/// Failure to open or attach the byte stream of one axis. Fatal to that axis only.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to open {port} for axis {axis}: {source}")]
    Open {
        axis: Axis,
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Axis {0} is already connected")]
    AlreadyConnected(Axis),
    #[error("IO error: {source} ({context})")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
}

/// Failure of one move step. Aborts that move only.
#[derive(Error, Debug)]
pub enum MotionError {
    #[error("Axis {0} is not connected")]
    NotConnected(Axis),
    #[error("Timeout waiting for {command:?} response from axis {axis} after {timeout:?}")]
    Timeout {
        axis: Axis,
        command: Opcode,
        timeout: Duration,
    },
    #[error("Failed to write {command:?} to axis {axis}: {source}")]
    Link {
        axis: Axis,
        command: Opcode,
        #[source]
        source: std::io::Error,
    },
    #[error("Response listener of axis {0} has stopped")]
    ListenerStopped(Axis),
}

/// Failure of one request to the acquisition instrument. Aborts that point only.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Timeout waiting for instrument response")]
    Timeout,
    #[error("Data length error ({0} bytes is not a multiple of 8)")]
    BadLength(usize),
    #[error("Can not connect to the TCP server {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("IO error: {source} ({context})")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
}

/// Failure to persist or reload a scan result. In-memory data is never discarded.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No data can be saved")]
    Empty,
    #[error("Waveform {index} has {found} samples, expected {expected}")]
    RaggedWaveforms {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("IO error: {source} ({context})")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Malformed container {path:?}: {message}")]
    Format { path: PathBuf, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

/// Errors surfaced by the scan orchestrator.
///
/// Per-point motion and acquisition failures are not errors of the scan; they
/// are recorded as skipped points. Only the variants here end a scan or refuse
/// to start one.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Not ready to scan: {0}")]
    NotReady(String),
    #[error("Invalid scan plan: {0}")]
    InvalidPlan(String),
    #[error("No scan plan configured")]
    NotConfigured,
    #[error("A scan is already running")]
    AlreadyRunning,
    #[error("Can't get time axis: {0}")]
    TimeAxis(#[source] AcqError),
    #[error("Waveform has {waveform_len} samples but gate needs index {index}")]
    WaveformShape { waveform_len: usize, index: usize },
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Acquisition(#[from] AcqError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
