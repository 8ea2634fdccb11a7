pub mod controller;
pub mod frame;
pub mod link;
pub mod listener;
#[cfg(test)]
pub(crate) mod mock;

pub use controller::{AxisController, AxisSettings, CommandTimeouts, ConnectionState};
pub use frame::{Command, Direction, FRAME_SIZE, Frame, Opcode};
pub use link::{AxisLink, SerialLink};
pub use listener::FrameListener;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}
