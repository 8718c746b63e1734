use async_trait::async_trait;
use base64::Engine;
use clap::{Parser, Subcommand};
use pg_outbox::config::AppConfig;
use pg_outbox::kafka::{ConsumedMessage, ConsumerGroup, KafkaProducer, MessageHandler};
use pg_outbox::postgres::PgEventStore;
use pg_outbox::{Error, Relay, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pg-outbox")]
#[command(about = "Transactional outbox relay from PostgreSQL to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Deliver outbox events to Kafka (default)
    Relay,
    /// Join the configured consumer group and log every message
    Tail,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-outbox");
    info!("Loading configuration from {:?}", args.config);

    let config = match AppConfig::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        kafka_brokers = ?config.kafka.brokers,
        outbox_limit = config.outbox.limit,
        "Configuration summary"
    );

    match args.command.unwrap_or(Command::Relay) {
        Command::Relay => run_relay(config).await,
        Command::Tail => run_tail(config).await,
    }
}

async fn run_relay(config: AppConfig) -> Result<()> {
    let outbox = config.outbox.to_outbox_config();
    outbox.validate()?;

    let store = PgEventStore::connect(&config.postgres_url()).await?;
    store.ensure_schema().await?;

    let producer = Arc::new(KafkaProducer::new(&config.kafka, outbox.flush_config())?);
    let relay = Relay::new(store, producer.clone(), outbox)?;

    relay.start();
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stopped = relay.stop(STOP_TIMEOUT).await;
    if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
        error!("Failed to flush producer: {}", e);
    }
    stopped
}

async fn run_tail(config: AppConfig) -> Result<()> {
    let group = config
        .consumer_group_config()
        .ok_or_else(|| Error::Config("missing [consumer] section".to_string()))?;

    let handler = LogHandler {
        header_event_id: config.outbox.header_event_id.clone(),
        header_event_type: config.outbox.header_event_type.clone(),
    };

    let consumer = ConsumerGroup::connect(&group, handler)?;
    consumer.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    consumer.stop(STOP_TIMEOUT).await
}

struct LogHandler {
    header_event_id: String,
    header_event_type: String,
}

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: ConsumedMessage) -> Result<()> {
        let header = |key: &str| {
            message
                .header(key)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()
        };

        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = %message.key.as_deref().map(String::from_utf8_lossy).unwrap_or_default(),
            event_id = %header(&self.header_event_id),
            event_type = %header(&self.header_event_type),
            payload = %render_payload(message.payload.as_deref().unwrap_or_default()),
            "message consumed"
        );
        Ok(())
    }
}

fn render_payload(payload: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(json) => json.to_string(),
        Err(_) => match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(payload),
        },
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_outbox=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_outbox=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
