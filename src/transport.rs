// src/transport.rs - Serial link to the arm
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial connection closed")]
    Closed,
}

/// Byte-oriented line channel to the arm.
///
/// The controller only ever needs three things from the wire: write one
/// CR-terminated command line, read one trimmed response line (or nothing
/// within a bounded wait), and discard whatever the arm has already sent.
/// Keeping this a trait lets tests and simulators stand in for real hardware.
#[async_trait]
pub trait SerialLink: Send {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read the next non-empty line, waiting at most `wait`. `Ok(None)` means
    /// the arm had nothing to say yet, which callers treat as not-yet-ready.
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, TransportError>;

    /// Drop any buffered inbound data, including late responses.
    fn clear_input(&mut self);
}

/// [`SerialLink`] over a real serial port.
pub struct SerialTransport {
    port: SerialPort,
    lines: VecDeque<String>,
    partial: Vec<u8>,
}

impl SerialTransport {
    pub async fn open(port_name: &str, baud: u32) -> Result<Self, TransportError> {
        let port = SerialPort::open(port_name, baud).map_err(|source| TransportError::Open {
            port: port_name.to_string(),
            source,
        })?;
        tracing::info!("Opened serial port {} at {} baud", port_name, baud);
        Ok(Self {
            port,
            lines: VecDeque::new(),
            partial: Vec::new(),
        })
    }

    /// Enumerate serial ports visible to the host.
    pub fn list_ports() -> Result<Vec<PathBuf>, TransportError> {
        Ok(SerialPort::available_ports()?)
    }

    /// Split raw bytes into trimmed lines; a trailing fragment stays buffered
    /// until its terminator arrives.
    fn ingest(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                    self.partial.clear();
                    if !line.is_empty() {
                        tracing::debug!("serial rx: {}", line);
                        self.lines.push_back(line);
                    }
                }
            } else {
                self.partial.push(byte);
            }
        }
    }
}

#[async_trait]
impl SerialLink for SerialTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        tracing::debug!("serial tx: {}", line);
        let framed = format!("{line}\r");
        let mut data = framed.as_bytes();
        while !data.is_empty() {
            let written = self.port.write(data).await?;
            if written == 0 {
                return Err(TransportError::Closed);
            }
            data = &data[written..];
        }
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut chunk = [0u8; 256];
            match timeout(remaining, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => self.ingest(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    fn clear_input(&mut self) {
        self.lines.clear();
        self.partial.clear();
        if let Err(e) = self.port.discard_input_buffer() {
            tracing::warn!("Failed to discard serial input buffer: {}", e);
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("buffered_lines", &self.lines.len())
            .finish()
    }
}
