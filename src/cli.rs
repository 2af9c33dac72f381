//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rill_stream::OffsetSpec;

/// rill - deduplicating producers and offset-tracked consumers
#[derive(Parser, Debug)]
#[command(name = "rill")]
#[command(version)]
#[command(about = "Publish to and consume from append-only streams")]
#[command(
    long_about = "rill publishes records with deduplication, consumes them with stored offsets, and keeps the streams in a local snapshot between invocations."
)]
pub struct Cli {
    /// Config file (defaults to ./rill.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the broker snapshot
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a stream
    CreateStream {
        /// Stream name
        stream: String,

        /// Delete the stream first if it exists
        #[arg(long, default_value_t = false)]
        recreate: bool,

        /// Retention limit in bytes; oldest records are evicted beyond it
        #[arg(long)]
        max_length_bytes: Option<u64>,
    },

    /// Delete a stream and the offsets stored for it
    DeleteStream {
        /// Stream name
        stream: String,
    },

    /// Publish records and wait for their confirmations
    Publish(PublishArgs),

    /// Consume records, optionally tracking the offset
    Consume(ConsumeArgs),

    /// Show the offset stored for a consumer
    Offsets {
        /// Stream name
        stream: String,

        /// Consumer name
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Stream name
    pub stream: String,

    /// Publish records up to this index (exclusive)
    #[arg(short, long)]
    pub count: u64,

    /// Producer name, required for deduplication
    #[arg(short, long)]
    pub name: Option<String>,

    /// Give each record its index as publishing id
    #[arg(long, default_value_t = false)]
    pub dedup: bool,

    /// Start after the last publishing id the broker stored for this producer (needs --dedup)
    #[arg(long, default_value_t = false, requires = "dedup", conflicts_with = "start")]
    pub resume: bool,

    /// First record index
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Fixed body instead of "message <index>"
    #[arg(long)]
    pub body: Option<String>,

    /// Make the last record the poison record
    #[arg(long, default_value_t = false)]
    pub poison_last: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConsumeArgs {
    /// Stream name
    pub stream: String,

    /// Consumer name, required for offset tracking
    #[arg(short, long)]
    pub name: Option<String>,

    /// Where to start when no offset is stored: first, last, next or a number
    #[arg(long, default_value_t = OffsetSpec::First)]
    pub offset: OffsetSpec,

    /// Store the offset every K records
    #[arg(long)]
    pub store_every: Option<u64>,

    /// Stop on the poison record, storing its offset
    #[arg(long, default_value_t = false)]
    pub until_poison: bool,

    /// Stop after this many records
    #[arg(long)]
    pub expect: Option<u64>,

    /// Give up after this many seconds
    #[arg(long)]
    pub wait_secs: Option<u64>,

    /// Do not print record bodies
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_dedup_publish() {
        let cli = Cli::try_parse_from([
            "rill", "publish", "orders", "--count", "20", "--name", "app-1", "--dedup", "--resume",
        ])
        .unwrap();

        let Commands::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.stream, "orders");
        assert_eq!(args.count, 20);
        assert_eq!(args.name.as_deref(), Some("app-1"));
        assert!(args.dedup);
        assert!(args.resume);
    }

    #[test]
    fn should_reject_resume_without_dedup() {
        let result = Cli::try_parse_from([
            "rill", "publish", "orders", "--count", "20", "--name", "app-1", "--resume",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn should_reject_resume_with_explicit_start() {
        let result = Cli::try_parse_from([
            "rill", "publish", "orders", "--count", "20", "--name", "app-1", "--dedup", "--resume",
            "--start", "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn should_parse_offset_spec_and_global_flags() {
        let cli = Cli::try_parse_from([
            "rill", "consume", "orders", "--offset", "last", "--data-dir", "/tmp/rill",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rill")));
        let Commands::Consume(args) = cli.command else {
            panic!("expected consume");
        };
        assert_eq!(args.offset, OffsetSpec::Last);
        assert!(!args.until_poison);
    }

    #[test]
    fn should_reject_bad_offset_spec() {
        let result = Cli::try_parse_from(["rill", "consume", "orders", "--offset", "middle"]);
        assert!(result.is_err());
    }
}
