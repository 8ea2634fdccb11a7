use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::{Duration, Instant};

use super::Axis;
use super::frame::{Command, Direction, Opcode};
use super::link::{AxisLink, SerialLink};
use super::listener::FrameListener;
use crate::error::{ConnectionError, MotionError};

/// Read timeout on the serial handle; the listener only reads once a whole frame is buffered
const LINK_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Static description of one axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSettings {
    pub axis: Axis,
    /// Address of the stage on the controller bus
    pub stage_id: u8,
    pub pulses_per_mm: u32,
    /// Full travel range, used to size homing moves
    pub max_travel_mm: f64,
}

impl AxisSettings {
    pub fn x() -> Self {
        Self {
            axis: Axis::X,
            stage_id: 2,
            pulses_per_mm: 2000,
            max_travel_mm: 200.0,
        }
    }

    pub fn y() -> Self {
        Self {
            axis: Axis::Y,
            stage_id: 1,
            pulses_per_mm: 2000,
            max_travel_mm: 200.0,
        }
    }
}

/// Response deadlines per command kind
#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    /// SetDirection and SetPulses
    pub step: Duration,
    /// ExecuteMove during ordinary moves
    pub execute: Duration,
    /// ExecuteMove during homing, which may cross the full travel range
    pub homing: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            execute: Duration::from_secs(180),
            homing: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Protocol engine for one motion axis.
///
/// Commands are strictly sequential: before each send the input buffer is
/// discarded and the frame mailbox drained, so at most one command is ever
/// awaiting its response. The tracked position only changes once a complete
/// SetDirection → SetPulses → ExecuteMove sequence has been acknowledged.
pub struct AxisController {
    settings: AxisSettings,
    timeouts: CommandTimeouts,
    position_mm: f64,
    link: Option<Box<dyn AxisLink>>,
    listener: Option<FrameListener>,
}

impl AxisController {
    pub fn new(settings: AxisSettings, timeouts: CommandTimeouts) -> Self {
        Self {
            settings,
            timeouts,
            position_mm: 0.0,
            link: None,
            listener: None,
        }
    }

    pub fn axis(&self) -> Axis {
        self.settings.axis
    }

    pub fn settings(&self) -> &AxisSettings {
        &self.settings
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    pub fn position_mm(&self) -> f64 {
        self.position_mm
    }

    /// Record a confirmed position, e.g. the exact target of an acknowledged move
    pub(crate) fn confirm_position(&mut self, position_mm: f64) {
        self.position_mm = position_mm;
    }

    pub fn state(&self) -> ConnectionState {
        if self.link.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the serial port at 9600-8-N-1 and start the response listener
    pub fn connect(&mut self, port: &str) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected(self.axis()));
        }

        let link = SerialLink::open(port, LINK_READ_TIMEOUT).map_err(|source| {
            warn!("Motor {} failed to connect to {port}: {source}", self.axis());
            ConnectionError::Open {
                axis: self.axis(),
                port: port.to_string(),
                source,
            }
        })?;

        self.attach(Box::new(link))?;
        info!("Motor {} connected to {port}", self.axis());
        Ok(())
    }

    /// Take ownership of an already open link and start listening on it
    pub fn attach(&mut self, link: Box<dyn AxisLink>) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected(self.axis()));
        }

        let reader = link.try_clone_link().map_err(|source| ConnectionError::Io {
            source,
            context: format!("Cloning link of axis {}", self.axis()),
        })?;
        let listener =
            FrameListener::spawn(self.axis(), reader).map_err(|source| ConnectionError::Io {
                source,
                context: format!("Starting listener of axis {}", self.axis()),
            })?;

        self.link = Some(link);
        self.listener = Some(listener);
        Ok(())
    }

    /// Stop the listener and close the link. Safe to call when already disconnected.
    pub fn disconnect(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if self.link.take().is_some() {
            info!("Motor {} disconnected", self.axis());
        }
    }

    /// Pulses needed to cover `distance_mm`. Rounded to the nearest pulse, not
    /// truncated, so a distance that lands just under a whole pulse count in
    /// floating point still yields that count.
    pub fn pulses_for(&self, distance_mm: f64) -> u32 {
        (distance_mm.abs() * f64::from(self.settings.pulses_per_mm)).round() as u32
    }

    fn travel_pulses(&self) -> u32 {
        self.pulses_for(self.settings.max_travel_mm)
    }

    fn ensure_connected(&self) -> Result<(), MotionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MotionError::NotConnected(self.axis()))
        }
    }

    /// Send one command and block until its correlated response or `timeout`
    pub fn send(&mut self, command: Command, timeout: Duration) -> Result<(), MotionError> {
        let axis = self.axis();
        let opcode = command.opcode();
        let (Some(link), Some(listener)) = (self.link.as_mut(), self.listener.as_ref()) else {
            return Err(MotionError::NotConnected(axis));
        };

        link.discard_input().map_err(|source| MotionError::Link {
            axis,
            command: opcode,
            source,
        })?;
        listener.drain();

        debug!("Motor {axis} sending command: {command:?}");
        let frame = command.encode(self.settings.stage_id);
        link.write_all(&frame)
            .and_then(|_| link.flush())
            .map_err(|source| MotionError::Link {
                axis,
                command: opcode,
                source,
            })?;

        Self::wait_for_response(axis, listener, opcode, timeout)
    }

    fn wait_for_response(
        axis: Axis,
        listener: &FrameListener,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<(), MotionError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match listener.frames().recv_timeout(remaining) {
                Ok(frame) if frame.acknowledges(opcode) => {
                    debug!("Motor {axis} received {opcode:?} response");
                    return Ok(());
                }
                Ok(frame) => debug!("Motor {axis} ignoring {frame:?} while waiting for {opcode:?}"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Timeout waiting for {opcode:?} response from motor {axis}");
                    return Err(MotionError::Timeout {
                        axis,
                        command: opcode,
                        timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MotionError::ListenerStopped(axis));
                }
            }
        }
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<(), MotionError> {
        self.send(Command::SetDirection(direction), self.timeouts.step)
    }

    pub fn set_pulse_count(&mut self, pulses: u32) -> Result<(), MotionError> {
        self.send(Command::SetPulses(pulses), self.timeouts.step)
    }

    pub fn execute_move(&mut self, timeout: Duration) -> Result<(), MotionError> {
        self.send(Command::ExecuteMove, timeout)
    }

    /// Run SetDirection → SetPulses → ExecuteMove, stopping at the first step without a response.
    ///
    /// `timeout` bounds the ExecuteMove acknowledgment and should cover the
    /// expected travel time. On success the position moves by
    /// `pulses / pulses_per_mm`, downward for `Direction::Reverse`.
    pub fn move_pulses(
        &mut self,
        direction: Direction,
        pulses: u32,
        timeout: Duration,
    ) -> Result<(), MotionError> {
        self.ensure_connected()?;
        let axis = self.axis();

        self.set_direction(direction).inspect_err(|e| {
            warn!("Failed to set direction for motor {axis}: {e}");
        })?;
        self.set_pulse_count(pulses).inspect_err(|e| {
            warn!("Failed to set pulse count for motor {axis}: {e}");
        })?;
        self.execute_move(timeout).inspect_err(|e| {
            warn!("Failed to execute movement for motor {axis}: {e}");
        })?;

        self.position_mm +=
            direction.sign() * f64::from(pulses) / f64::from(self.settings.pulses_per_mm);
        info!(
            "Motor {axis} movement completed. New position: {:.2}mm",
            self.position_mm
        );
        Ok(())
    }

    /// Move with the default ExecuteMove timeout
    pub fn move_motor(&mut self, direction: Direction, pulses: u32) -> Result<(), MotionError> {
        self.move_pulses(direction, pulses, self.timeouts.execute)
    }

    /// Homing procedure of the X stage: run the full travel in reverse onto
    /// the limit, then call that point zero.
    pub fn home_x(&mut self) -> Result<(), MotionError> {
        self.ensure_connected()?;
        let pulses = self.travel_pulses();
        info!(
            "Motor {} homing: direction={:?}, pulses={pulses}",
            self.axis(),
            Direction::Reverse
        );

        self.move_pulses(Direction::Reverse, pulses, self.timeouts.homing)?;
        self.position_mm = 0.0;
        info!("Motor {} reached home position", self.axis());
        Ok(())
    }

    /// Homing procedure of the Y stage: run the full travel forward onto the
    /// far limit, back off by the same amount, then call that point zero.
    pub fn home_y(&mut self) -> Result<(), MotionError> {
        self.ensure_connected()?;
        let pulses = self.travel_pulses();
        info!(
            "Motor {} homing: direction={:?}, pulses={pulses}",
            self.axis(),
            Direction::Forward
        );

        self.move_pulses(Direction::Forward, pulses, self.timeouts.homing)?;
        // Once the forward leg reached the limit the axis counts as homed
        if let Err(e) = self.move_pulses(Direction::Reverse, pulses, self.timeouts.homing) {
            warn!("Motor {} back-off after homing failed: {e}", self.axis());
        }
        self.position_mm = 0.0;
        info!("Motor {} reached home position", self.axis());
        Ok(())
    }
}

impl Drop for AxisController {
    fn drop(&mut self) {
        self.disconnect();
    }
}
