//! Two-axis stage shared between manual control and the scan worker.
//!
//! Both axis controllers sit behind one mutex that is held for the whole of a
//! compound move, so an X leg and its Y leg are never interleaved with another
//! caller's move. The last confirmed position is also published through a
//! separate lock that readers can poll while a move is in flight.

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

use crate::axis::{
    Axis, AxisController, AxisLink, AxisSettings, CommandTimeouts, ConnectionState, Direction,
};
use crate::error::{ConnectionError, MotionError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// Distance rounded to zero pulses, nothing was sent
    AlreadyAtTarget,
}

/// Anything the scan worker can drive to a point
pub trait Positioner: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Move both axes to `(x, y)` as one step. Both legs are attempted even
    /// when the first fails; the first error is returned.
    fn move_to(&self, x: f64, y: f64) -> Result<(), MotionError>;

    fn position(&self) -> StagePosition;
}

pub struct StageAxes {
    pub x: AxisController,
    pub y: AxisController,
}

impl StageAxes {
    pub fn get_mut(&mut self, axis: Axis) -> &mut AxisController {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
        }
    }

    fn snapshot(&self) -> StagePosition {
        StagePosition {
            x: self.x.position_mm(),
            y: self.y.position_mm(),
        }
    }
}

#[derive(Clone)]
pub struct Stage {
    axes: Arc<Mutex<StageAxes>>,
    position: Arc<RwLock<StagePosition>>,
}

impl Stage {
    pub fn new(x: AxisSettings, y: AxisSettings, timeouts: CommandTimeouts) -> Self {
        Self {
            axes: Arc::new(Mutex::new(StageAxes {
                x: AxisController::new(x, timeouts),
                y: AxisController::new(y, timeouts),
            })),
            position: Arc::new(RwLock::new(StagePosition::default())),
        }
    }

    pub fn connect(&self, axis: Axis, port: &str) -> Result<(), ConnectionError> {
        self.axes.lock().get_mut(axis).connect(port)
    }

    /// Connect an axis over an already open link
    pub fn attach(&self, axis: Axis, link: Box<dyn AxisLink>) -> Result<(), ConnectionError> {
        self.axes.lock().get_mut(axis).attach(link)
    }

    pub fn disconnect(&self, axis: Axis) {
        self.axes.lock().get_mut(axis).disconnect();
    }

    pub fn disconnect_all(&self) {
        let mut axes = self.axes.lock();
        axes.x.disconnect();
        axes.y.disconnect();
    }

    pub fn state(&self, axis: Axis) -> ConnectionState {
        self.axes.lock().get_mut(axis).state()
    }

    /// Run `f` with exclusive access to both axes, republishing the position afterwards
    pub fn with_axes<T>(&self, f: impl FnOnce(&mut StageAxes) -> T) -> T {
        let mut axes = self.axes.lock();
        let result = f(&mut axes);
        *self.position.write() = axes.snapshot();
        result
    }

    /// Move one axis to `target_mm` from its last confirmed position
    pub fn move_axis_to(&self, axis: Axis, target_mm: f64) -> Result<MoveOutcome, MotionError> {
        self.with_axes(|axes| {
            let controller = axes.get_mut(axis);
            let current = controller.position_mm();
            let pulses = controller.pulses_for(target_mm - current);
            if pulses == 0 {
                info!("Motor {axis} already at target {target_mm:.2}mm");
                return Ok(MoveOutcome::AlreadyAtTarget);
            }

            let direction = Direction::toward(current, target_mm);
            info!(
                "Motor {axis} moving from {current:.2}mm to {target_mm:.2}mm, \
                 direction={direction:?}, pulses={pulses}"
            );
            controller.move_motor(direction, pulses)?;
            Ok(MoveOutcome::Moved)
        })
    }

    /// Run the homing procedure specific to `axis`
    pub fn home(&self, axis: Axis) -> Result<(), MotionError> {
        self.with_axes(|axes| match axis {
            Axis::X => axes.x.home_x(),
            Axis::Y => axes.y.home_y(),
        })
    }

    /// One leg of a scan move. After a move the position is set to the exact
    /// target so pulse rounding does not accumulate over a scan. A leg shorter
    /// than half a pulse sends nothing and leaves the position untouched.
    fn scan_leg(controller: &mut AxisController, target_mm: f64) -> Result<(), MotionError> {
        let current = controller.position_mm();
        let pulses = controller.pulses_for(target_mm - current);
        if pulses == 0 {
            return Ok(());
        }

        let direction = Direction::toward(current, target_mm);
        controller.move_motor(direction, pulses).inspect_err(|e| {
            warn!("Motor {} failed to reach {target_mm:.2}mm: {e}", controller.axis());
        })?;
        controller.confirm_position(target_mm);
        Ok(())
    }
}

impl Positioner for Stage {
    fn is_ready(&self) -> bool {
        let axes = self.axes.lock();
        axes.x.is_connected() && axes.y.is_connected()
    }

    fn move_to(&self, x: f64, y: f64) -> Result<(), MotionError> {
        self.with_axes(|axes| {
            let x_result = Self::scan_leg(&mut axes.x, x);
            let y_result = Self::scan_leg(&mut axes.y, y);
            x_result.and(y_result)
        })
    }

    /// Last confirmed position; does not wait for an in-flight move
    fn position(&self) -> StagePosition {
        *self.position.read()
    }
}
