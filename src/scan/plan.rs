use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ScanError;

/// Largest number of path points a plan may describe
pub const MAX_SCAN_POINTS: usize = 1_000_000;

/// Raster scan geometry and acquisition gate, all in physical units (mm, ps, s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
    pub step_x: f64,
    pub step_y: f64,
    pub t_min: f64,
    pub t_max: f64,
    /// Settle time between reaching a point and acquiring its waveform
    pub wait_time_secs: f64,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            center_x: 85.0,
            center_y: 140.0,
            width: 10.0,
            height: 10.0,
            step_x: 1.0,
            step_y: 1.0,
            t_min: 0.0,
            t_max: 100.0,
            wait_time_secs: 0.5,
        }
    }
}

impl ScanPlan {
    pub fn validate(&self) -> Result<(), ScanError> {
        let fields = [
            ("center_x", self.center_x),
            ("center_y", self.center_y),
            ("width", self.width),
            ("height", self.height),
            ("step_x", self.step_x),
            ("step_y", self.step_y),
            ("t_min", self.t_min),
            ("t_max", self.t_max),
            ("wait_time_secs", self.wait_time_secs),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| !value.is_finite()) {
            return Err(ScanError::InvalidPlan(format!("{name} must be finite")));
        }

        if self.step_x <= 0.0 || self.step_y <= 0.0 {
            return Err(ScanError::InvalidPlan(
                "step sizes must be positive".to_string(),
            ));
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(ScanError::InvalidPlan(
                "width and height must not be negative".to_string(),
            ));
        }
        if self.wait_time_secs < 0.0 {
            return Err(ScanError::InvalidPlan(
                "wait time must not be negative".to_string(),
            ));
        }

        let total = step_count(self.width, self.step_x)
            .zip(step_count(self.height, self.step_y))
            .and_then(|(x, y)| x.checked_mul(y));
        match total {
            Some(total) if total <= MAX_SCAN_POINTS => Ok(()),
            _ => Err(ScanError::InvalidPlan(format!(
                "plan exceeds {MAX_SCAN_POINTS} points"
            ))),
        }
    }

    pub fn start_x(&self) -> f64 {
        self.center_x - self.width / 2.0
    }

    pub fn end_x(&self) -> f64 {
        self.center_x + self.width / 2.0
    }

    pub fn start_y(&self) -> f64 {
        self.center_y - self.height / 2.0
    }

    pub fn end_y(&self) -> f64 {
        self.center_y + self.height / 2.0
    }

    pub fn x_steps(&self) -> usize {
        ((self.width / self.step_x).floor() as usize).saturating_add(1)
    }

    pub fn y_steps(&self) -> usize {
        ((self.height / self.step_y).floor() as usize).saturating_add(1)
    }

    pub fn total_points(&self) -> usize {
        self.x_steps().saturating_mul(self.y_steps())
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_secs_f64(self.wait_time_secs.max(0.0))
    }

    /// Boustrophedon traversal of the grid
    pub fn path(&self) -> ScanPath {
        ScanPath {
            start_x: self.start_x(),
            start_y: self.start_y(),
            step_x: self.step_x,
            step_y: self.step_y,
            x_steps: self.x_steps(),
            total: self.total_points(),
            next: 0,
        }
    }
}

/// Points along one axis, or `None` when the count cannot be represented
fn step_count(span: f64, step: f64) -> Option<usize> {
    let intervals = (span / step).floor();
    if intervals.is_finite() && intervals < MAX_SCAN_POINTS as f64 {
        Some(intervals as usize + 1)
    } else {
        None
    }
}

/// One point of the scan path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathPoint {
    /// Position in traversal order
    pub index: usize,
    pub row: usize,
    pub col: usize,
    pub x: f64,
    pub y: f64,
}

/// Even rows run columns ascending, odd rows descending
#[derive(Debug, Clone)]
pub struct ScanPath {
    start_x: f64,
    start_y: f64,
    step_x: f64,
    step_y: f64,
    x_steps: usize,
    total: usize,
    next: usize,
}

impl Iterator for ScanPath {
    type Item = PathPoint;

    fn next(&mut self) -> Option<PathPoint> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let row = index / self.x_steps;
        let offset = index % self.x_steps;
        let col = if row % 2 == 0 {
            offset
        } else {
            self.x_steps - 1 - offset
        };

        Some(PathPoint {
            index,
            row,
            col,
            x: self.start_x + col as f64 * self.step_x,
            y: self.start_y + row as f64 * self.step_y,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ScanPath {}
