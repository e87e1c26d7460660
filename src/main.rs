use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::bounded_queue::BoundedQueue;
use tether::broker::{self, BrokerClient, BrokerListener, NatsBroker};
use tether::device::{self, SerialDevice};
use tether::dispatcher::{Dispatcher, DispatcherConfig, FrequencyUpdate};
use tether::engine::{CorrectionEngine, NullEngine, channel_mask};
use tether::options::Options;
use tether::output_writer::OutputWriter;
use tether::queue_config::{
    AUX_POLL_INTERVAL_MS, AUX_QUEUE_SIZE, BROKER_QUEUE_SIZE, EPHEMERIS_QUEUE_SIZE,
    MAIN_POLL_INTERVAL_MS, OUTBOUND_QUEUE_SIZE,
};
use tether::raw_log::RawLog;
use tether::subscription::{SubscriptionManager, SubscriptionState};
use tether::topics;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();
    options.validate()?;

    run(options).await
}

async fn run(options: Options) -> Result<()> {
    let band = options.band();
    let mode = options.mode;
    info!(
        "starting: mode {mode:?}, band {band}, region {}, localized {}",
        options.region, options.localized
    );

    // Shared pipeline state
    let broker_queue = Arc::new(BoundedQueue::new("broker", BROKER_QUEUE_SIZE));
    let ephemeris_queue = Arc::new(BoundedQueue::new("ephemeris", EPHEMERIS_QUEUE_SIZE));
    let aux_queue = Arc::new(BoundedQueue::new("aux", AUX_QUEUE_SIZE));
    let outbound = Arc::new(BoundedQueue::new("outbound", OUTBOUND_QUEUE_SIZE));
    let wakeup = Arc::new(Notify::new());
    let outbound_notify = Arc::new(Notify::new());
    let frequency = Arc::new(FrequencyUpdate::new());
    let subscription_state = Arc::new(Mutex::new(SubscriptionState::new(
        options.broker_host.clone(),
    )));
    let broker_ops_lock = Arc::new(tokio::sync::Mutex::new(()));

    // Correction engine. The real engine binding is supplied by the
    // deployment; the stand-in keeps the full pipeline runnable without one.
    let mut engine: Box<dyn CorrectionEngine> = Box::new(NullEngine::new());
    let mut mask = 0u32;
    if mode.uses_network() {
        mask |= channel_mask::NETWORK;
    }
    if mode.uses_aux() {
        mask |= channel_mask::AUX;
    }
    let status = engine.initialize(mask);
    if !status.is_success() {
        bail!("engine initialization failed: {status}");
    }

    // Device channels. The primary port is shared: one handle reads
    // ephemeris/GGA, the clone carries corrections and commands back.
    let main_reader = SerialDevice::open(&options.main_device)?;
    let main_writer = main_reader.try_clone()?;
    let aux_reader = match &options.aux_device {
        Some(spec) if mode.uses_aux() => Some(SerialDevice::open(spec)?),
        _ => None,
    };

    // Raw stream capture, per active correction channel
    let (network_log, aux_log) = match &options.raw_log {
        Some(prefix) => {
            let open = |suffix: &str| match RawLog::open(format!("{prefix}_{suffix}.bin")) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("raw capture disabled: {e:#}");
                    None
                }
            };
            (
                mode.uses_network().then(|| open("ip")).flatten(),
                mode.uses_aux().then(|| open("lb")).flatten(),
            )
        }
        None => (None, None),
    };

    // Broker client + listener
    let listener = Arc::new(BrokerListener::new(
        broker_queue.clone(),
        wakeup.clone(),
        subscription_state.clone(),
        broker_ops_lock.clone(),
    ));
    let broker: Arc<dyn BrokerClient> =
        Arc::new(NatsBroker::new(listener.clone(), options.client_id.clone()));
    listener.attach_broker(broker.clone());

    broker
        .connect(&options.broker_host)
        .await
        .with_context(|| format!("connecting to broker {}", options.broker_host))?;
    broker.start_loop().await?;

    let base_subscriptions =
        broker::base_subscriptions(mode, options.localized, &band, &options.region);
    for (topic, qos) in &base_subscriptions {
        broker
            .subscribe(topic, *qos)
            .await
            .with_context(|| format!("subscribing to {topic}"))?;
    }

    let manager = SubscriptionManager::new(
        broker.clone(),
        subscription_state.clone(),
        broker_ops_lock,
        options.tile_level,
        base_subscriptions,
    );

    // Output writer owns the primary channel's write handle; startup
    // configuration goes out before any pipeline traffic.
    let mut writer = OutputWriter::new(
        Box::new(main_writer),
        outbound.clone(),
        outbound_notify.clone(),
        frequency.clone(),
    );
    if options.send_startup_config {
        writer
            .send_startup_config(options.reset_default)
            .await
            .context("receiver startup configuration")?;
    }

    let dispatcher = Dispatcher::new(DispatcherConfig {
        mode,
        localized: options.localized,
        region: options.region.clone(),
        key_topic: topics::key_topic(&band),
        frequency_topic: topics::frequency_topic(&band),
        correction_topic: (mode.uses_network() && !options.localized)
            .then(|| topics::correction_topic(&band, &options.region)),
        broker_queue,
        ephemeris_queue: ephemeris_queue.clone(),
        aux_queue: aux_queue.clone(),
        wakeup: wakeup.clone(),
        outbound,
        outbound_notify,
        engine,
        manager,
        subscription_state,
        frequency,
        network_log,
        aux_log,
    });

    // Workers
    let token = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push(device::spawn_reader(
        "main",
        Box::new(main_reader),
        ephemeris_queue,
        wakeup.clone(),
        Duration::from_millis(MAIN_POLL_INTERVAL_MS),
        token.clone(),
    ));
    if let Some(aux) = aux_reader {
        workers.push(device::spawn_reader(
            "aux",
            Box::new(aux),
            aux_queue,
            wakeup.clone(),
            Duration::from_millis(AUX_POLL_INTERVAL_MS),
            token.clone(),
        ));
    }
    workers.push(tokio::spawn(writer.run(token.clone())));
    workers.push(tokio::spawn(dispatcher.run(token.clone())));

    // Run until ctrl-c or the optional bounded-run timer
    match options.run_for {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("bounded run of {secs}s complete")
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
            info!("interrupt received");
        }
    }

    // Orderly shutdown: stop producers and consumers, then drop the broker
    info!("shutting down");
    token.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker task failed during shutdown: {e}");
        }
    }
    broker.disconnect().await.ok();
    info!("shutdown complete");
    Ok(())
}
