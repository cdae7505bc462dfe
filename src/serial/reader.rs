/// Serial transport access and frame reading
use async_trait::async_trait;
use log::debug;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

use crate::config::SerialConfig;
use crate::error::TransportError;
use crate::models::{RawFrame, FRAME_LEN};

/// Byte-level access to the serial device
#[async_trait]
pub trait SerialTransport: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including the next `\n`; an empty result means end of stream
    async fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Drop any bytes received but not yet read
    async fn reset_input_buffer(&mut self) -> io::Result<()>;
}

/// Serial port opened in raw mode at the configured baud rate
pub struct TtyTransport {
    port: BufReader<SerialStream>,
}

impl TtyTransport {
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let stream = tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: SerialStream) -> Self {
        Self {
            port: BufReader::new(stream),
        }
    }
}

#[async_trait]
impl SerialTransport for TtyTransport {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.port.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::with_capacity(FRAME_LEN);
        self.port.read_until(b'\n', &mut line).await?;
        Ok(line)
    }

    async fn reset_input_buffer(&mut self) -> io::Result<()> {
        let pending = self.port.buffer().len();
        self.port.consume(pending);
        self.port.get_ref().clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Reads one fixed-length frame per call from a [`SerialTransport`]
pub struct FrameReader<T> {
    transport: T,
    config: SerialConfig,
}

impl<T: SerialTransport> FrameReader<T> {
    pub fn new(transport: T, config: SerialConfig) -> Self {
        Self { transport, config }
    }

    /// Clear stale input left over from before the gateway started
    pub async fn reset(&mut self) -> Result<(), TransportError> {
        self.transport.reset_input_buffer().await?;
        Ok(())
    }

    /// Send the poll token, if the device expects one, and wait for it to settle
    ///
    /// Returns whether a token was sent.
    pub async fn trigger(&mut self) -> Result<bool, TransportError> {
        let Some(token) = self.config.trigger.as_deref() else {
            return Ok(false);
        };
        self.transport.write(token).await?;
        sleep(self.config.settle_delay).await;
        Ok(true)
    }

    /// Read the next frame, which must be exactly [`FRAME_LEN`] bytes
    pub async fn read_frame(&mut self) -> Result<RawFrame, TransportError> {
        let line = timeout(self.config.read_timeout, self.transport.read_line())
            .await
            .map_err(|_| TransportError::Timeout(self.config.read_timeout))??;

        debug!("Original payload: {:?}", line);

        if line.is_empty() {
            return Err(TransportError::Closed);
        }
        if line.len() != FRAME_LEN {
            return Err(TransportError::FrameLength {
                actual: line.len(),
                expected: FRAME_LEN,
            });
        }
        Ok(line)
    }
}
