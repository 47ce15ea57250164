//! [Transport] over an operating system serial port

use std::{
    io::Write,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::debug;
use serialport::SerialPort;

use super::{
    reset::{ClassicReset, HardReset, LineControl, ResetStrategy},
    transport::{ByteQueue, Transport},
};
use crate::error::{ConnectionError, Error};

/// How long the reader thread blocks before checking whether it should stop
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

type Port = Box<dyn SerialPort>;

/// A serial port, read by a dedicated thread
pub struct SerialTransport {
    port: Arc<Mutex<Port>>,
    queue: ByteQueue,
    baud: u32,
}

impl SerialTransport {
    /// Open the serial port at `path`
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening serial port {path} at {baud} baud");
        let port = serialport::new(path, baud)
            .timeout(READ_POLL_INTERVAL)
            .open()?;

        Self::new(port)
    }

    /// Take over an already opened port
    pub fn new(port: Port) -> Result<Self, Error> {
        let reader = port.try_clone()?;
        let baud = port.baud_rate()?;

        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            queue: ByteQueue::from_blocking(reader),
            baud,
        })
    }

    fn port(&self) -> Result<MutexGuard<'_, Port>, Error> {
        self.port
            .lock()
            .map_err(|_| Error::Connection(ConnectionError::Disconnected))
    }
}

impl LineControl for SerialTransport {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.port()?.set_baud_rate(baud)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let port = Arc::clone(&self.port);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let mut port = port
                .lock()
                .map_err(|_| Error::Connection(ConnectionError::Disconnected))?;
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|_| Error::Connection(ConnectionError::Disconnected))?
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, Error> {
        self.queue.next_byte(timeout).await
    }

    fn discard_input(&mut self) {
        if let Ok(port) = self.port() {
            let _ = port.clear(serialport::ClearBuffer::Input);
        }
        self.queue.clear();
    }

    async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        LineControl::set_baud(self, baud)?;
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    async fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        ClassicReset::default().reset(self).await
    }

    async fn hard_reset(&mut self) -> Result<(), Error> {
        HardReset.reset(self).await
    }
}
