//! Device channel transport and reader loop
//!
//! The receiver and the satellite-link demodulator present as byte-stream
//! devices read synchronously at a fixed cadence. [`DeviceTransport`] keeps
//! the blocking I/O behind a trait so tests can script a channel; the
//! production implementation rides the `serialport` crate. Blocking calls are
//! pushed onto the runtime's blocking pool so readers coexist with the async
//! dispatcher.

use crate::bounded_queue::BoundedQueue;
use crate::options::ChannelSpec;
use crate::queue_config::DEVICE_READ_BUFFER_SIZE;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-read timeout on the serial port; an expired timeout reads as "no data
/// this poll", not an error.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Synchronous byte-level device channel.
pub trait DeviceTransport: Send {
    /// Read whatever is available into `buf`, blocking until data arrives or
    /// the transport's own timeout passes. Returns the byte count (0 = no
    /// data this poll).
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the full buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

/// Serial-port [`DeviceTransport`].
pub struct SerialDevice {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

impl SerialDevice {
    pub fn open(spec: &ChannelSpec) -> Result<Self> {
        let port = serialport::new(&spec.path, spec.baud)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("opening serial port {}", spec.path))?;
        info!("opened {} at {} baud", spec.path, spec.baud);
        Ok(Self {
            port,
            path: spec.path.clone(),
        })
    }

    /// Second handle onto the same port, so the reader and the output writer
    /// can own their halves independently.
    pub fn try_clone(&self) -> Result<Self> {
        let port = self
            .port
            .try_clone()
            .with_context(|| format!("cloning serial handle {}", self.path))?;
        Ok(Self {
            port,
            path: self.path.clone(),
        })
    }
}

impl DeviceTransport for SerialDevice {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port
            .write_all(data)
            .and_then(|()| self.port.flush())
            .with_context(|| format!("writing {}", self.path))
    }
}

/// Spawn the polling reader for one device channel.
///
/// Each pass reads one chunk, skips empty/all-zero buffers, pushes the rest
/// into the channel's queue, signals the dispatcher, and sleeps the poll
/// interval. Fire-and-forget: the bounded queue absorbs any dispatcher lag.
/// Runs until the shutdown token fires; transport errors are channel-local
/// and never end the loop.
pub fn spawn_reader(
    name: &'static str,
    device: Box<dyn DeviceTransport>,
    queue: Arc<BoundedQueue<Vec<u8>>>,
    wakeup: Arc<Notify>,
    poll_interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("{name} reader started");
        let mut slot = Some(device);

        while !token.is_cancelled() {
            let mut device = slot.take().expect("device handle present");
            let join = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; DEVICE_READ_BUFFER_SIZE];
                let result = device.read_some(&mut buf);
                (device, buf, result)
            })
            .await;

            let (device, buf, result) = match join {
                Ok(parts) => parts,
                Err(e) => {
                    error!("{name} reader blocking task failed: {e}");
                    break;
                }
            };
            slot = Some(device);

            match result {
                Ok(n) if n > 0 && buf[..n].iter().any(|&b| b != 0) => {
                    metrics::counter!("device.bytes_read_total", "channel" => name)
                        .increment(n as u64);
                    queue.push(buf[..n].to_vec());
                    wakeup.notify_one();
                }
                Ok(_) => {} // nothing read, or an all-zero buffer: skip
                Err(e) => warn!("{name} read failed: {e:#}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = token.cancelled() => break,
            }
        }
        info!("{name} reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport yielding a fixed script of reads, then empty polls.
    struct ScriptedDevice {
        reads: Mutex<VecDeque<Vec<u8>>>,
    }

    impl ScriptedDevice {
        fn new(reads: Vec<Vec<u8>>) -> Self {
            Self {
                reads: Mutex::new(reads.into()),
            }
        }
    }

    impl DeviceTransport for ScriptedDevice {
        fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reader_queues_non_empty_reads_and_skips_zeros() {
        let queue = Arc::new(BoundedQueue::new("test", 8));
        let wakeup = Arc::new(Notify::new());
        let token = CancellationToken::new();

        let device = ScriptedDevice::new(vec![
            b"$GPGGA,1".to_vec(),
            vec![0u8; 16], // all-zero read must be skipped
            b"ephemeris".to_vec(),
        ]);

        let handle = spawn_reader(
            "test",
            Box::new(device),
            queue.clone(),
            wakeup,
            Duration::from_millis(5),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(queue.pop_front(), Some(b"$GPGGA,1".to_vec()));
        assert_eq!(queue.pop_front(), Some(b"ephemeris".to_vec()));
        assert_eq!(queue.pop_front(), None);
    }

    #[tokio::test]
    async fn reader_joins_cleanly_on_cancel() {
        let queue = Arc::new(BoundedQueue::new("test", 2));
        let token = CancellationToken::new();
        let handle = spawn_reader(
            "test",
            Box::new(ScriptedDevice::new(vec![])),
            queue,
            Arc::new(Notify::new()),
            Duration::from_millis(5),
            token.clone(),
        );

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader joined within timeout")
            .unwrap();
    }
}
