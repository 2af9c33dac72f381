//! CLI command handlers.
//!
//! Every command runs against an in-memory broker loaded from the snapshot in
//! the data directory and saved back once the command finishes, so streams,
//! producer dedup state and stored offsets survive between invocations.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rill_stream::{
    ConfirmationTracker, ConsumerConfig, Environment, InMemoryBroker, MessageContext, Offset,
    ProducerConfig, PublishingId, Record, StreamOptions, TracingBroker, TrackingPolicy, snapshot,
};
use tracing::{info, warn};

use crate::cli::{Commands, ConsumeArgs, PublishArgs};
use crate::config::RillConfig;

/// Body of the record that tells a consumer to stop.
pub const POISON: &str = "poison";

/// Execute a CLI command.
///
/// The snapshot is saved even when the command fails, so offsets stored
/// before a handler failure are kept.
///
/// # Errors
/// Returns the command's error, or the snapshot error if only saving failed.
pub async fn execute_command(config: &RillConfig, command: Commands) -> Result<()> {
    let session = Session::open(config).await?;

    let outcome = match command {
        Commands::CreateStream {
            stream,
            recreate,
            max_length_bytes,
        } => cmd_create_stream(&session.env, &stream, recreate, max_length_bytes).await,

        Commands::DeleteStream { stream } => cmd_delete_stream(&session.env, &stream).await,

        Commands::Publish(args) => cmd_publish(&session.env, config, &args).await,

        Commands::Consume(args) => cmd_consume(&session.env, config, &args).await,

        Commands::Offsets { stream, name } => cmd_offsets(&session.env, &stream, &name).await,
    };

    let saved = session.save().await;
    outcome.and(saved)
}

/// Broker state loaded for the duration of one command.
struct Session {
    broker: Arc<InMemoryBroker>,
    env: Environment,
    path: PathBuf,
}

impl Session {
    async fn open(config: &RillConfig) -> Result<Self> {
        let path = config.snapshot_path();
        let broker = Arc::new(
            snapshot::load(&path)
                .await
                .with_context(|| format!("Failed to load broker snapshot {}", path.display()))?,
        );
        let env = Environment::new(Arc::new(TracingBroker::new(Arc::clone(&broker))));
        Ok(Self { broker, env, path })
    }

    async fn save(&self) -> Result<()> {
        snapshot::save(&self.broker, &self.path)
            .await
            .with_context(|| format!("Failed to save broker snapshot {}", self.path.display()))
    }
}

// ============================================================================
// Streams
// ============================================================================

async fn cmd_create_stream(
    env: &Environment,
    stream: &str,
    recreate: bool,
    max_length_bytes: Option<u64>,
) -> Result<()> {
    if recreate {
        env.delete_stream_if_exists(stream).await?;
    }

    let options = max_length_bytes.map_or_else(StreamOptions::new, |bytes| {
        StreamOptions::new().with_max_length_bytes(bytes)
    });
    env.create_stream(stream, options)
        .await
        .with_context(|| format!("Failed to create stream {stream}"))?;

    println!("Created stream {stream}");
    Ok(())
}

async fn cmd_delete_stream(env: &Environment, stream: &str) -> Result<()> {
    if env.delete_stream_if_exists(stream).await? {
        println!("Deleted stream {stream}");
    } else {
        println!("Stream {stream} does not exist");
    }
    Ok(())
}

async fn cmd_offsets(env: &Environment, stream: &str, name: &str) -> Result<()> {
    match env.stored_offset(name, stream).await? {
        Some(offset) => println!("{name} on {stream}: {offset}"),
        None => println!("{name} on {stream}: no offset stored"),
    }
    Ok(())
}

// ============================================================================
// Publish
// ============================================================================

/// Outcome of one `publish` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    /// Index of the first record sent.
    pub start: u64,
    pub sent: u64,
    pub confirmed: u64,
    pub failed: u64,
    /// Whether every confirmation arrived before the wait expired.
    pub all_confirmed: bool,
    pub elapsed: Duration,
}

impl PublishSummary {
    /// True when every record was confirmed and none failed.
    pub const fn succeeded(&self) -> bool {
        self.all_confirmed && self.failed == 0
    }
}

async fn cmd_publish(env: &Environment, config: &RillConfig, args: &PublishArgs) -> Result<()> {
    let summary = publish(env, config, args).await?;

    println!(
        "Messages confirmed? {} ({} ms)",
        if summary.succeeded() { "yes" } else { "no" },
        summary.elapsed.as_millis()
    );
    println!(
        "Sent {} record(s) from index {}: {} confirmed, {} failed",
        summary.sent, summary.start, summary.confirmed, summary.failed
    );
    Ok(())
}

/// Publish records `start..args.count` and wait for their confirmations.
///
/// # Errors
/// Fails when the producer cannot be opened or a record is refused.
pub async fn publish(
    env: &Environment,
    config: &RillConfig,
    args: &PublishArgs,
) -> Result<PublishSummary> {
    if (args.dedup || args.resume) && args.name.is_none() {
        bail!("--dedup and --resume need a producer --name");
    }
    if args.resume && !args.dedup {
        bail!("--resume needs --dedup; records without publishing ids cannot be resumed");
    }

    let producer_config = args.name.as_deref().map_or_else(
        || ProducerConfig::new(&args.stream),
        |name| ProducerConfig::new(&args.stream).with_name(name),
    );
    let producer = env
        .producer(producer_config.with_confirm_timeout(config.confirm_timeout))
        .await
        .with_context(|| format!("Failed to open producer on {}", args.stream))?;

    let start = if args.resume {
        let start = producer.resume_point().await?;
        info!("Resuming at publishing id {}", start);
        start
    } else {
        args.start
    };

    let sent = args.count.saturating_sub(start);
    let tracker = Arc::new(ConfirmationTracker::expecting(sent));
    let started = Instant::now();

    for index in start..args.count {
        producer
            .send(build_record(args, index), tracker.callback())
            .with_context(|| format!("Failed to send record {index}"))?;
    }

    let all_confirmed = tracker.await_all(config.wait).await;
    let elapsed = started.elapsed();
    if !all_confirmed {
        warn!("{} confirmation(s) still missing", tracker.remaining());
    }
    producer.close().await?;

    Ok(PublishSummary {
        start,
        sent,
        confirmed: tracker.confirmed_count(),
        failed: tracker.failed_count(),
        all_confirmed,
        elapsed,
    })
}

fn build_record(args: &PublishArgs, index: PublishingId) -> Record {
    let is_last = index.saturating_add(1) == args.count;
    let body = if args.poison_last && is_last {
        POISON.to_string()
    } else {
        args.body
            .clone()
            .unwrap_or_else(|| format!("message {index}"))
    };

    let record = Record::new(body)
        .with_message_id(index)
        .with_creation_time(Utc::now());
    if args.dedup {
        record.with_publishing_id(index)
    } else {
        record
    }
}

// ============================================================================
// Consume
// ============================================================================

/// Outcome of one `consume` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub consumed: u64,
    /// Whether the poison record was reached.
    pub poisoned: bool,
    /// Whether the wait expired before the consumer stopped on its own.
    pub timed_out: bool,
    pub last_stored: Option<Offset>,
    pub elapsed: Duration,
}

async fn cmd_consume(env: &Environment, config: &RillConfig, args: &ConsumeArgs) -> Result<()> {
    let summary = consume(env, config, args).await?;

    if args.until_poison && !summary.poisoned {
        println!("Did not receive poison message to stop consuming");
    }
    println!(
        "Consumed {} record(s) in {} ms",
        summary.consumed,
        summary.elapsed.as_millis()
    );
    if let Some(offset) = summary.last_stored {
        println!("Stored offset: {offset}");
    }
    Ok(())
}

/// Consume until the poison record, `args.expect` records, or the wait expires.
///
/// # Errors
/// Fails on invalid consumer settings, a missing stream or a handler failure.
pub async fn consume(
    env: &Environment,
    config: &RillConfig,
    args: &ConsumeArgs,
) -> Result<ConsumeSummary> {
    let wait = args.wait_secs.map_or(config.wait, Duration::from_secs);

    let mut consumer_config = ConsumerConfig::new(&args.stream).with_offset(args.offset);
    if let Some(name) = &args.name {
        consumer_config = consumer_config.with_name(name);
    }
    if let Some(every) = args.store_every {
        consumer_config = consumer_config.with_tracking(TrackingPolicy::periodic(every));
    }

    let consumed = Arc::new(AtomicU64::new(0));
    let poisoned = Arc::new(AtomicBool::new(false));
    let handler = {
        let consumed = Arc::clone(&consumed);
        let poisoned = Arc::clone(&poisoned);
        let until_poison = args.until_poison;
        let expect = args.expect;
        let quiet = args.quiet;
        move |ctx: &mut MessageContext, record: &Record| -> anyhow::Result<()> {
            if !quiet {
                println!("{}", String::from_utf8_lossy(record.body()));
            }
            let seen = consumed.fetch_add(1, Ordering::SeqCst).saturating_add(1);

            if until_poison && record.body_str() == Some(POISON) {
                if ctx.consumer_name().is_some() {
                    ctx.store_offset()?;
                }
                poisoned.store(true, Ordering::SeqCst);
                ctx.stop();
            } else if expect.is_some_and(|n| seen >= n) {
                ctx.stop();
            }
            Ok(())
        }
    };

    let started = Instant::now();
    let consumer = env
        .consumer(consumer_config, handler)
        .with_context(|| format!("Failed to subscribe to {}", args.stream))?;
    let handle = consumer.handle();

    let join = consumer.join();
    tokio::pin!(join);
    let (report, timed_out) = tokio::select! {
        report = &mut join => (report, false),
        () = tokio::time::sleep(wait) => {
            info!("Stopping consumer after {:?}", wait);
            handle.close();
            (join.await, true)
        }
    };
    let report = report.with_context(|| format!("Consumer on {} failed", args.stream))?;

    Ok(ConsumeSummary {
        consumed: consumed.load(Ordering::SeqCst),
        poisoned: poisoned.load(Ordering::SeqCst),
        timed_out,
        last_stored: report.last_stored,
        elapsed: started.elapsed(),
    })
}
