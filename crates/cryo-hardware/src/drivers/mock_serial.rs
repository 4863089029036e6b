//! Scriptable mock port for transport and driver tests.
//!
//! `MockSerialPort` is handed to the code under test; `MockDeviceHarness`
//! stays in the test and plays the instrument: it asserts on written bytes
//! and queues reply bytes.
//!
//! Unlike a plain duplex pipe, queued reply bytes are visible through
//! [`InstrumentPort::bytes_to_read`] and dropped by
//! [`InstrumentPort::clear_buffers`], which is what the transport's residual
//! flush relies on.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let mut link = OxfordTransport::with_port("ITC503", DeviceAddress::isobus("mock", 1), wrap_shared(Box::new(port)));
//! link.open().await?;
//! let task = tokio::spawn(async move { link.send_receive("R1").await });
//! harness.expect_and_respond(b"@1R1\r", b"@1R14.2\r").await;
//! ```

use cryo_core::serial::InstrumentPort;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Default)]
struct Inbox {
    bytes: VecDeque<u8>,
    waker: Option<Waker>,
    closed: bool,
}

/// Client-facing side of the mock.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    inbox: Arc<Mutex<Inbox>>,
}

/// Test-facing side of the mock.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    inbox: Arc<Mutex<Inbox>>,
    write_buffer: Vec<u8>,
}

/// Creates a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let inbox = Arc::new(Mutex::new(Inbox::default()));

    let port = MockSerialPort {
        writes_tx,
        inbox: inbox.clone(),
    };
    let harness = MockDeviceHarness {
        writes_rx,
        inbox,
        write_buffer: Vec::new(),
    };
    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl AsyncRead for MockSerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inbox = self.inbox.lock();
        if inbox.bytes.is_empty() {
            if inbox.closed {
                return Poll::Ready(Ok(()));
            }
            inbox.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(inbox.bytes.len());
        let chunk: Vec<u8> = inbox.bytes.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl InstrumentPort for MockSerialPort {
    fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(self.inbox.lock().bytes.len() as u32)
    }

    fn clear_buffers(&self) -> io::Result<()> {
        self.inbox.lock().bytes.clear();
        Ok(())
    }
}

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

impl MockDeviceHarness {
    /// Queues bytes for the client to read.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        if self.writes_rx.is_closed() {
            return Err("Failed to send response: client port disconnected");
        }
        let mut inbox = self.inbox.lock();
        inbox.bytes.extend(data.iter().copied());
        if let Some(waker) = inbox.waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Waits for the client to write `expected` and asserts on it.
    ///
    /// # Panics
    /// Panics if the bytes differ or do not arrive within 2 seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        while self.write_buffer.len() < expected.len() {
            match timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected `{:?}`, received `{:?}`.",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write, then queues a reply.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response).expect("Failed to send response");
    }

    /// Bytes queued for the client and not yet read.
    pub fn pending_input(&self) -> usize {
        self.inbox.lock().bytes.len()
    }

    /// Signals end of file to the client.
    pub fn hang_up(&self) {
        let mut inbox = self.inbox.lock();
        inbox.closed = true;
        if let Some(waker) = inbox.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_command_response() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            port.get_mut().write_all(b"@1V\r").await.unwrap();
            let mut response = Vec::new();
            port.read_until(b'\r', &mut response).await.unwrap();
            response
        });

        harness.expect_and_respond(b"@1V\r", b"@1VITC503\r").await;
        assert_eq!(app_task.await.unwrap(), b"@1VITC503\r");
    }

    #[tokio::test]
    async fn test_clear_discards_queued_bytes() {
        let (port, harness) = new();
        harness.send_response(b"noise").unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 5);
        tokio_test::assert_ok!(port.clear_buffers());
        assert_eq!(harness.pending_input(), 0);
    }

    #[tokio::test]
    async fn test_hang_up_reads_eof() {
        let (port, harness) = new();
        let mut port = BufReader::new(port);
        harness.hang_up();
        let mut response = Vec::new();
        assert_eq!(port.read_until(b'\r', &mut response).await.unwrap(), 0);
    }
}
