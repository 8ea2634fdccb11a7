//! Request/response client for the pulse-sampling instrument.
//!
//! Every request opens a fresh TCP connection, writes one newline-terminated
//! ASCII command and reads the reply as a packed little-endian `f64` array.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::AcqError;

pub const TIME_AXIS_COMMAND: &[u8] = b"GETTIMEAXIS\n";
pub const LATEST_PULSE_COMMAND: &[u8] = b"GETLATESTPULSE\n";

/// Source of the shared time axis and per-point waveforms
pub trait PulseSource: Send + Sync {
    fn time_axis(&self) -> Result<Vec<f64>, AcqError>;
    fn latest_waveform(&self) -> Result<Vec<f64>, AcqError>;
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Timeout for establishing each connection
    pub connect_timeout: Duration,
    /// Time allowed for the first byte of a reply to arrive
    pub response_timeout: Duration,
    /// A reply is considered complete once the stream has been quiet this long
    pub idle_gap: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            response_timeout: Duration::from_millis(2000),
            idle_gap: Duration::from_millis(100),
        }
    }
}

/// Builder for [`AcquisitionClient`]
#[derive(Default)]
pub struct AcquisitionClientBuilder {
    host: Option<String>,
    port: Option<u16>,
    config: AcquisitionConfig,
}

impl AcquisitionClientBuilder {
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn config(mut self, config: AcquisitionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Resolve the endpoint. No connection is made until the first request.
    pub fn build(self) -> Result<AcquisitionClient, AcqError> {
        let host = self.host.unwrap_or_else(|| "127.0.0.1".to_string());
        let port = self.port.unwrap_or(8001);
        let endpoint = format!("{host}:{port}");

        let address = endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| AcqError::InvalidEndpoint(endpoint.clone()))?;

        Ok(AcquisitionClient {
            endpoint,
            address,
            config: self.config,
        })
    }
}

/// Stateless client; holds only the resolved endpoint and timeouts
#[derive(Debug, Clone)]
pub struct AcquisitionClient {
    endpoint: String,
    address: SocketAddr,
    config: AcquisitionConfig,
}

impl AcquisitionClient {
    pub fn builder() -> AcquisitionClientBuilder {
        AcquisitionClientBuilder::default()
    }

    pub fn new(host: &str, port: u16) -> Result<Self, AcqError> {
        Self::builder().host(host).port(port).build()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn get_time_axis(&self) -> Result<Vec<f64>, AcqError> {
        let time_axis = self.request(TIME_AXIS_COMMAND)?;
        debug!("Time axis point num: {}", time_axis.len());
        Ok(time_axis)
    }

    pub fn get_latest_waveform(&self) -> Result<Vec<f64>, AcqError> {
        self.request(LATEST_PULSE_COMMAND)
    }

    fn request(&self, command: &[u8]) -> Result<Vec<f64>, AcqError> {
        let mut stream = TcpStream::connect_timeout(&self.address, self.config.connect_timeout)
            .map_err(|source| {
                warn!("Can not connect to the TCP server {}: {source}", self.endpoint);
                AcqError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    source,
                }
            })?;

        stream
            .write_all(command)
            .and_then(|_| stream.flush())
            .map_err(|source| AcqError::Io {
                source,
                context: format!("Sending {}", String::from_utf8_lossy(command).trim_end()),
            })?;

        let body = self.read_reply(&mut stream)?;
        decode_f64_array(&body)
    }

    /// Wait up to `response_timeout` for the first bytes, then keep reading
    /// until the peer closes or falls quiet on a whole number of samples.
    fn read_reply(&self, stream: &mut TcpStream) -> Result<Vec<u8>, AcqError> {
        let deadline = Instant::now() + self.config.response_timeout;
        let mut body = Vec::new();
        let mut chunk = [0u8; 8192];

        loop {
            let now = Instant::now();
            let wait = if body.is_empty() {
                deadline.saturating_duration_since(now)
            } else {
                self.config.idle_gap
            };
            if wait.is_zero() {
                return Err(AcqError::Timeout);
            }
            stream
                .set_read_timeout(Some(wait))
                .map_err(|source| AcqError::Io {
                    source,
                    context: "Setting read timeout".to_string(),
                })?;

            match stream.read(&mut chunk) {
                Ok(0) if body.is_empty() => return Err(AcqError::Timeout),
                Ok(0) => return Ok(body),
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if body.is_empty() {
                        return Err(AcqError::Timeout);
                    }
                    if body.len() % 8 == 0 || Instant::now() >= deadline {
                        return Ok(body);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(AcqError::Io {
                        source,
                        context: "Reading instrument reply".to_string(),
                    });
                }
            }
        }
    }
}

impl PulseSource for AcquisitionClient {
    fn time_axis(&self) -> Result<Vec<f64>, AcqError> {
        self.get_time_axis()
    }

    fn latest_waveform(&self) -> Result<Vec<f64>, AcqError> {
        self.get_latest_waveform()
    }
}

/// Interpret `bytes` as a packed little-endian `f64` array
pub fn decode_f64_array(bytes: &[u8]) -> Result<Vec<f64>, AcqError> {
    if bytes.len() % 8 != 0 {
        warn!("Data length error ({} bytes)", bytes.len());
        return Err(AcqError::BadLength(bytes.len()));
    }
    let mut values = vec![0.0; bytes.len() / 8];
    LittleEndian::read_f64_into(bytes, &mut values);
    Ok(values)
}
