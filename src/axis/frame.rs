//! Fixed-size binary frames exchanged with a motion controller.
//!
//! Every command is 10 bytes: `[0x00, 0x00, 0x40, stage_id, opcode, 0x00, payload(4)]`.
//! The controller answers each command with a 10-byte frame of the same layout.

use byteorder::{ByteOrder, LittleEndian};

use std::fmt;

pub const FRAME_SIZE: usize = 10;
pub const FRAME_PREFIX: [u8; 3] = [0x00, 0x00, 0x40];
pub const OPCODE_OFFSET: usize = 4;
pub const PAYLOAD_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SetDirection = 0x44,
    SetPulses = 0x50,
    ExecuteMove = 0x47,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x44 => Ok(Opcode::SetDirection),
            0x50 => Ok(Opcode::SetPulses),
            0x47 => Ok(Opcode::ExecuteMove),
            other => Err(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

/// Travel direction on the wire. `Reverse` (1) decreases the axis position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward = 0,
    Reverse = 1,
}

impl Direction {
    /// Direction that brings `current` towards `target`.
    pub fn toward(current: f64, target: f64) -> Self {
        if target > current {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    /// Sign applied to the position when moving in this direction
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

impl From<Direction> for u8 {
    fn from(direction: Direction) -> Self {
        direction as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetDirection(Direction),
    SetPulses(u32),
    ExecuteMove,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SetDirection(_) => Opcode::SetDirection,
            Command::SetPulses(_) => Opcode::SetPulses,
            Command::ExecuteMove => Opcode::ExecuteMove,
        }
    }

    /// Serialize the command for the stage addressed by `stage_id`
    pub fn encode(&self, stage_id: u8) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[..FRAME_PREFIX.len()].copy_from_slice(&FRAME_PREFIX);
        buf[3] = stage_id;
        buf[OPCODE_OFFSET] = self.opcode().into();

        match self {
            Command::SetDirection(direction) => buf[PAYLOAD_OFFSET] = (*direction).into(),
            Command::SetPulses(count) => {
                LittleEndian::write_u32(&mut buf[PAYLOAD_OFFSET..], *count)
            }
            Command::ExecuteMove => {}
        }

        buf
    }
}

/// A raw 10-byte frame received from the controller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(pub [u8; FRAME_SIZE]);

impl Frame {
    pub fn opcode_byte(&self) -> u8 {
        self.0[OPCODE_OFFSET]
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode_byte()).ok()
    }

    /// Whether this frame acknowledges a command with `opcode`.
    ///
    /// SetDirection and SetPulses need the echoed opcode at byte 4. The
    /// controller has no distinct motion-complete code, so any frame received
    /// while waiting on ExecuteMove counts as its acknowledgment.
    pub fn acknowledges(&self, opcode: Opcode) -> bool {
        match opcode {
            Opcode::ExecuteMove => true,
            Opcode::SetDirection | Opcode::SetPulses => self.opcode_byte() == u8::from(opcode),
        }
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.hex())
    }
}
