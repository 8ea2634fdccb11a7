use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::plan::ScanPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Acquired,
    MoveFailed,
    AcquireFailed,
}

/// One visited point. Skipped points carry an empty waveform and max = min = 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    pub x: f64,
    pub y: f64,
    pub waveform: Vec<f64>,
    pub max: f64,
    pub min: f64,
    pub status: PointStatus,
}

impl ScanSample {
    pub fn acquired(x: f64, y: f64, waveform: Vec<f64>, max: f64, min: f64) -> Self {
        Self {
            x,
            y,
            waveform,
            max,
            min,
            status: PointStatus::Acquired,
        }
    }

    pub fn skipped(x: f64, y: f64, status: PointStatus) -> Self {
        Self {
            x,
            y,
            waveform: Vec::new(),
            max: 0.0,
            min: 0.0,
            status,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.status == PointStatus::Acquired
    }

    pub fn peak_to_peak(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub plan: ScanPlan,
    pub samples: Vec<ScanSample>,
    pub time_axis: Vec<f64>,
    pub start_humidity: Option<f64>,
    pub end_humidity: Option<f64>,
    pub completed: bool,
    pub message: String,
    pub started_at: DateTime<Local>,
}

impl ScanResult {
    pub fn new(plan: ScanPlan, time_axis: Vec<f64>, start_humidity: Option<f64>) -> Self {
        Self {
            plan,
            samples: Vec::new(),
            time_axis,
            start_humidity,
            end_humidity: None,
            completed: false,
            message: String::new(),
            started_at: Local::now(),
        }
    }

    pub fn acquired(&self) -> impl Iterator<Item = &ScanSample> {
        self.samples.iter().filter(|s| s.is_acquired())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ScanSample> {
        self.samples.iter().filter(|s| !s.is_acquired())
    }

    pub fn collected(&self) -> usize {
        self.acquired().count()
    }
}
