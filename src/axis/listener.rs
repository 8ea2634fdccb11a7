//! Background reader that turns the axis byte stream into a mailbox of frames.

use crossbeam_channel::{Receiver, unbounded};
use log::{debug, error, info};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::Axis;
use super::frame::{FRAME_SIZE, Frame};
use super::link::AxisLink;

/// Sleep between polls while fewer than a full frame is buffered
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct FrameListener {
    axis: Axis,
    frames: Receiver<Frame>,
    shutdown_signal: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl FrameListener {
    /// Start reading `link` on a dedicated thread.
    ///
    /// A frame is read only once at least `FRAME_SIZE` bytes are buffered, so
    /// partial frames stay in the link until the rest arrives.
    pub fn spawn(axis: Axis, mut link: Box<dyn AxisLink>) -> io::Result<Self> {
        let (sender, frames) = unbounded();
        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let shutdown = shutdown_signal.clone();

        let reader_thread = thread::Builder::new()
            .name(format!("axis-{axis}-listener"))
            .spawn(move || {
                info!("Motor {axis} response listener started");

                while !shutdown.load(Ordering::Relaxed) {
                    match link.bytes_available() {
                        Ok(available) if available >= FRAME_SIZE => {
                            let mut buf = [0u8; FRAME_SIZE];
                            if let Err(e) = link.read_exact(&mut buf) {
                                error!("Error reading response from motor {axis}: {e}");
                                break;
                            }
                            let frame = Frame(buf);
                            debug!("Motor {axis} received raw response: {}", frame.hex());
                            if sender.send(frame).is_err() {
                                break;
                            }
                        }
                        Ok(_) => thread::sleep(POLL_INTERVAL),
                        Err(e) => {
                            error!("Error polling motor {axis}: {e}");
                            break;
                        }
                    }
                }

                info!("Motor {axis} response listener stopped");
            })?;

        Ok(Self {
            axis,
            frames,
            shutdown_signal,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn frames(&self) -> &Receiver<Frame> {
        &self.frames
    }

    /// Drop every queued frame, returning how many were discarded
    pub fn drain(&self) -> usize {
        let stale = self.frames.try_iter().count();
        if stale > 0 {
            debug!("Motor {} discarded {stale} stale frame(s)", self.axis);
        }
        stale
    }

    pub fn is_running(&self) -> bool {
        self.reader_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                error!("Motor {} listener thread panicked", self.axis);
            }
        }
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        self.stop();
    }
}
