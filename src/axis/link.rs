use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte stream to one motion controller.
///
/// The listener thread reads through one handle while commands are written
/// through another, so implementations must be cloneable onto the same
/// underlying device.
pub trait AxisLink: Read + Write + Send {
    /// Number of received bytes waiting to be read
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Discard everything received but not yet read
    fn discard_input(&mut self) -> io::Result<()>;

    /// Open a second handle onto the same device
    fn try_clone_link(&self) -> io::Result<Box<dyn AxisLink>>;
}

/// Serial link at the controller's fixed framing: 9600 baud, 8 data bits, no parity, 1 stop bit.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub const BAUD_RATE: u32 = 9600;

    pub fn open(path: &str, read_timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, Self::BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()?;

        Ok(Self { port })
    }

    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl AxisLink for SerialLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn AxisLink>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(SerialLink { port }))
    }
}
