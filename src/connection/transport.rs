//! Byte-stream transports a session runs over
//!
//! A [Transport] moves raw bytes; framing and command handling live in
//! [Connection](super::Connection). Received bytes are pushed by a dedicated
//! reader into a bounded [ByteQueue] owned by the transport, so a slow
//! consumer applies backpressure to the reader instead of growing a buffer.

use std::{
    collections::VecDeque,
    io::{self, Read},
    thread,
    time::Duration,
};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::{timeout_at, Instant},
};

use super::{
    reset::{ClassicReset, HardReset, LineControl, NoLineControl, ResetStrategy},
    ESP_ROM_BAUD,
};
use crate::error::{ConnectionError, Error, TimedOutCommand};

/// Number of chunks the reader may run ahead of the session
const QUEUE_DEPTH: usize = 32;
const CHUNK_SIZE: usize = 1024;

/// A duplex byte stream with baud-rate and reset-line control
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Write all of `data` to the device
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Wait at most `timeout` for the next received byte
    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, Error>;

    /// Drop everything received but not yet read
    fn discard_input(&mut self);

    /// Change the local line speed
    async fn set_baud(&mut self, baud: u32) -> Result<(), Error>;

    /// The current local line speed
    fn baud(&self) -> u32;

    /// Reset the device into its serial bootloader
    async fn reset_to_bootloader(&mut self) -> Result<(), Error>;

    /// Reset the device and let it boot normally
    async fn hard_reset(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        (**self).write(data).await
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, Error> {
        (**self).read_byte(timeout).await
    }

    fn discard_input(&mut self) {
        (**self).discard_input()
    }

    async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        (**self).set_baud(baud).await
    }

    fn baud(&self) -> u32 {
        (**self).baud()
    }

    async fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        (**self).reset_to_bootloader().await
    }

    async fn hard_reset(&mut self) -> Result<(), Error> {
        (**self).hard_reset().await
    }
}

/// Bounded receive queue filled by a background reader
#[derive(Debug)]
pub struct ByteQueue {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: VecDeque<u8>,
    error: Option<io::Error>,
    task: Option<JoinHandle<()>>,
}

impl ByteQueue {
    /// Read `reader` from a tokio task
    pub fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let mut buf = vec![0; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
            debug!("Transport reader finished");
        });

        Self::with_receiver(rx, Some(task))
    }

    /// Read a blocking reader, such as a serial port, from an OS thread.
    ///
    /// The reader should use a short read timeout; the thread stops once the
    /// queue is dropped.
    pub fn from_blocking<R>(mut reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        thread::spawn(move || {
            let mut buf = vec![0; CHUNK_SIZE];
            while !tx.is_closed() {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        });

        Self::with_receiver(rx, None)
    }

    fn with_receiver(rx: mpsc::Receiver<io::Result<Vec<u8>>>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
            error: None,
            task,
        }
    }

    /// Wait at most `timeout` for the next byte
    pub async fn next_byte(&mut self, timeout: Duration) -> Result<u8, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return Ok(byte);
            }
            if let Some(err) = self.error.take() {
                return Err(err.into());
            }

            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => {
                    return Err(Error::Connection(ConnectionError::Timeout(
                        TimedOutCommand::default(),
                    )))
                }
                Ok(None) => return Err(Error::Connection(ConnectionError::Disconnected)),
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(chunk))) => self.pending.extend(chunk),
            }
        }
    }

    /// Drop all bytes received so far, keeping any reader error
    pub fn clear(&mut self) {
        self.pending.clear();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => self.error = Some(err),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

impl Drop for ByteQueue {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A [Transport] over any tokio byte stream
#[derive(Debug)]
pub struct StreamTransport<W, L = NoLineControl> {
    writer: W,
    queue: ByteQueue,
    lines: L,
    baud: u32,
}

impl<S> StreamTransport<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split `stream`, reading it from a background task
    pub fn new(stream: S) -> Self {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);

        Self {
            writer,
            queue: ByteQueue::spawn(reader),
            lines: NoLineControl,
            baud: ESP_ROM_BAUD,
        }
    }
}

impl<W, L> StreamTransport<W, L> {
    /// Drive baud rate and reset lines through `lines`
    pub fn with_line_control<L2: LineControl>(self, lines: L2) -> StreamTransport<W, L2> {
        StreamTransport {
            writer: self.writer,
            queue: self.queue,
            lines,
            baud: self.baud,
        }
    }
}

impl<W, L> Transport for StreamTransport<W, L>
where
    W: AsyncWrite + Unpin,
    L: LineControl,
{
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, Error> {
        self.queue.next_byte(timeout).await
    }

    fn discard_input(&mut self) {
        self.queue.clear();
    }

    async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.lines.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    async fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        ClassicReset::default().reset(&mut self.lines).await
    }

    async fn hard_reset(&mut self) -> Result<(), Error> {
        HardReset.reset(&mut self.lines).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn bytes_flow_through_the_queue() {
        let (device, host) = duplex(64);
        let mut transport = StreamTransport::new(host);
        let (_device_rx, mut device_tx) = tokio::io::split(device);

        device_tx.write_all(&[1, 2, 3]).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(transport.read_byte(timeout).await.unwrap(), 1);
        assert_eq!(transport.read_byte(timeout).await.unwrap(), 2);
        assert_eq!(transport.read_byte(timeout).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_a_timeout() {
        let (_device, host) = duplex(64);
        let mut transport = StreamTransport::new(host);

        let err = transport
            .read_byte(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_not_a_timeout() {
        let (device, host) = duplex(64);
        let mut transport = StreamTransport::new(host);
        drop(device);

        let err = transport
            .read_byte(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Disconnected)
        ));
    }

    #[derive(Default)]
    struct BaudLines(Vec<u32>);

    impl LineControl for BaudLines {
        fn set_dtr(&mut self, _level: bool) -> Result<(), Error> {
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> Result<(), Error> {
            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
            self.0.push(baud);
            Ok(())
        }
    }

    #[tokio::test]
    async fn baud_changes_reach_the_lines() {
        let (_device, host) = duplex(64);
        let mut transport = StreamTransport::new(host).with_line_control(BaudLines::default());
        assert_eq!(transport.baud(), ESP_ROM_BAUD);

        transport.set_baud(921_600).await.unwrap();

        assert_eq!(transport.baud(), 921_600);
        assert_eq!(transport.lines.0, vec![921_600]);
    }
}
