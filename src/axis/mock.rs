//! Scripted motion controller used by the unit tests.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;

use super::frame::{FRAME_SIZE, Opcode};
use super::link::AxisLink;

#[derive(Default)]
pub struct MockDevice {
    /// Bytes waiting for the host to read
    inbound: VecDeque<u8>,
    /// Partial command bytes not yet forming a frame
    pending: Vec<u8>,
    /// Every complete command frame received, in order
    pub written: Vec<[u8; FRAME_SIZE]>,
    /// Opcodes the device never answers
    pub silent: HashSet<Opcode>,
}

impl MockDevice {
    fn receive(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= FRAME_SIZE {
            let mut frame = [0u8; FRAME_SIZE];
            frame.copy_from_slice(&self.pending[..FRAME_SIZE]);
            self.pending.drain(..FRAME_SIZE);
            self.written.push(frame);

            let answered = Opcode::try_from(frame[4])
                .map(|opcode| !self.silent.contains(&opcode))
                .unwrap_or(false);
            if answered {
                self.inbound.extend(frame);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MockLink {
    device: Arc<Mutex<MockDevice>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silence(&self, opcode: Opcode) {
        self.device.lock().silent.insert(opcode);
    }

    pub fn unsilence(&self, opcode: Opcode) {
        self.device.lock().silent.remove(&opcode);
    }

    /// Queue raw bytes as if the device had sent them unprompted
    pub fn inject(&self, bytes: &[u8]) {
        self.device.lock().inbound.extend(bytes.iter().copied());
    }

    pub fn written(&self) -> Vec<[u8; FRAME_SIZE]> {
        self.device.lock().written.clone()
    }

    pub fn boxed(&self) -> Box<dyn AxisLink> {
        Box::new(self.clone())
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.device.lock();
        let n = buf.len().min(device.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(device.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device.lock().receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AxisLink for MockLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.device.lock().inbound.len())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.device.lock().inbound.clear();
        Ok(())
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn AxisLink>> {
        Ok(Box::new(self.clone()))
    }
}
