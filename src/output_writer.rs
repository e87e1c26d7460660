//! Output writer
//!
//! Drains the outbound correction queue onto the primary device channel.
//! Also the only place device reconfiguration happens after startup: when
//! the dispatcher stages a beam frequency, the writer emits the fixed
//! command sequence before going back to forwarding corrections. Waits are
//! bounded so the loop stays responsive to shutdown and to the pending
//! frequency flag even when no corrections flow.

use crate::bounded_queue::BoundedQueue;
use crate::device::DeviceTransport;
use crate::dispatcher::FrequencyUpdate;
use crate::receiver_config::{self, AUX_PORT, COMMAND_MODE_ESCAPE, MAIN_PORT};
use crate::rtcm;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the writer sleeps waiting for outbound data before re-checking
/// the shutdown token and the pending frequency flag.
const OUTBOUND_WAIT: Duration = Duration::from_millis(750);

/// Settle time after the command-mode escape; the receiver needs it before
/// accepting commands.
const ESCAPE_SETTLE: Duration = Duration::from_secs(2);

/// Settle time between configuration commands.
const COMMAND_SETTLE: Duration = Duration::from_secs(1);

pub struct OutputWriter {
    // Option so the handle can move through spawn_blocking and back
    device: Option<Box<dyn DeviceTransport>>,
    outbound: Arc<BoundedQueue<Vec<u8>>>,
    notify: Arc<Notify>,
    frequency: Arc<FrequencyUpdate>,
}

impl OutputWriter {
    pub fn new(
        device: Box<dyn DeviceTransport>,
        outbound: Arc<BoundedQueue<Vec<u8>>>,
        notify: Arc<Notify>,
        frequency: Arc<FrequencyUpdate>,
    ) -> Self {
        Self {
            device: Some(device),
            outbound,
            notify,
            frequency,
        }
    }

    /// Drain the outbound queue until shutdown.
    ///
    /// Each pass applies a pending frequency reconfiguration first, then
    /// forwards at most one correction buffer. A reconfiguration or write in
    /// flight is allowed to complete before the shutdown token is honored.
    pub async fn run(mut self, token: CancellationToken) {
        info!("output writer started");
        loop {
            if token.is_cancelled() {
                break;
            }

            if let Some(hz) = self.frequency.take()
                && let Err(e) = self.apply_frequency(hz).await
            {
                warn!("beam reconfiguration failed: {e:#}");
            }

            if self.outbound.is_empty() {
                tokio::select! {
                    _ = tokio::time::timeout(OUTBOUND_WAIT, self.notify.notified()) => {}
                    _ = token.cancelled() => break,
                }
            }

            if let Some(message) = self.outbound.pop_front() {
                let ids = rtcm::message_ids(&message);
                if ids.is_empty() {
                    debug!("forwarding {} bytes to receiver", message.len());
                } else {
                    debug!(
                        "forwarding {} bytes to receiver, message types {ids:?}",
                        message.len()
                    );
                }

                match self.write(message).await {
                    Ok(len) => {
                        metrics::counter!("writer.bytes_total").increment(len as u64);
                    }
                    Err(e) => warn!("device write failed: {e:#}"),
                }
            }
        }
        info!("output writer stopped");
    }

    /// One-shot device reconfiguration for a new beam frequency: enter
    /// command mode, tune and select the beam, route the demodulated stream
    /// to the auxiliary port.
    async fn apply_frequency(&mut self, hz: u64) -> Result<()> {
        info!("reconfiguring receiver for beam frequency {hz} Hz");
        metrics::counter!("writer.reconfigurations_total").increment(1);

        self.write(COMMAND_MODE_ESCAPE.as_bytes().to_vec()).await?;
        tokio::time::sleep(ESCAPE_SETTLE).await;

        for command in receiver_config::beam_commands(hz, AUX_PORT) {
            debug!("receiver command: {}", command.trim_end());
            self.write(command.into_bytes()).await?;
            tokio::time::sleep(COMMAND_SETTLE).await;
        }
        Ok(())
    }

    /// Startup stream configuration (optionally from factory defaults).
    /// Runs before the pipeline starts, from the task that owns this writer.
    pub async fn send_startup_config(&mut self, reset_default: bool) -> Result<()> {
        if reset_default {
            info!("resetting receiver to factory defaults");
            self.write(COMMAND_MODE_ESCAPE.as_bytes().to_vec()).await?;
            tokio::time::sleep(ESCAPE_SETTLE).await;
            self.write(receiver_config::FACTORY_RESET.as_bytes().to_vec())
                .await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        info!("sending receiver stream configuration");
        self.write(COMMAND_MODE_ESCAPE.as_bytes().to_vec()).await?;
        tokio::time::sleep(ESCAPE_SETTLE).await;

        for command in receiver_config::startup_commands(MAIN_PORT) {
            info!("receiver command: {}", command.trim_end());
            self.write(command.into_bytes()).await?;
            tokio::time::sleep(COMMAND_SETTLE).await;
        }
        Ok(())
    }

    /// Blocking device write on the blocking pool; the handle travels with
    /// the closure and comes back for the next call.
    async fn write(&mut self, data: Vec<u8>) -> Result<usize> {
        let mut device = self.device.take().expect("device handle present");
        let len = data.len();
        let (device, result) = tokio::task::spawn_blocking(move || {
            let result = device.write_all(&data);
            (device, result)
        })
        .await
        .context("device write task failed")?;
        self.device = Some(device);
        result.map(|()| len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DeviceTransport for SharedSink {
        fn read_some(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_outbound_messages_in_order() {
        let sink = SharedSink::default();
        let outbound = Arc::new(BoundedQueue::new("outbound", 4));
        let notify = Arc::new(Notify::new());
        let frequency = Arc::new(FrequencyUpdate::new());
        let token = CancellationToken::new();

        outbound.push(vec![1, 2, 3]);
        outbound.push(vec![4, 5]);
        notify.notify_one();

        let writer = OutputWriter::new(
            Box::new(sink.clone()),
            outbound.clone(),
            notify,
            frequency,
        );
        let handle = tokio::spawn(writer.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        let writes = sink.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn pending_frequency_triggers_command_sequence_before_data() {
        let sink = SharedSink::default();
        let outbound = Arc::new(BoundedQueue::new("outbound", 4));
        let notify = Arc::new(Notify::new());
        let frequency = Arc::new(FrequencyUpdate::new());
        let token = CancellationToken::new();

        frequency.stage(1_545_260_000);
        outbound.push(vec![9]);
        notify.notify_one();

        let writer = OutputWriter::new(
            Box::new(sink.clone()),
            outbound,
            notify,
            frequency.clone(),
        );
        let handle = tokio::spawn(writer.run(token.clone()));

        // The sequence spends several seconds in settle sleeps
        tokio::time::sleep(Duration::from_secs(8)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(!frequency.is_pending(), "flag cleared after application");
        let writes = sink.writes.lock().unwrap().clone();
        assert_eq!(writes[0], COMMAND_MODE_ESCAPE.as_bytes());
        let as_text: Vec<String> = writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect();
        assert!(as_text.iter().any(|w| w.contains("slbb, User1, 1545260000")));
        // Correction data goes out only after the reconfiguration
        assert_eq!(writes.last().unwrap(), &vec![9]);
    }
}
