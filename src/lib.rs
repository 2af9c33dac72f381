#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # rill
//!
//! Command-line front end for [`rill_stream`]: create and delete streams,
//! publish with deduplication, consume with stored offsets.

pub mod cli;
pub mod commands;
pub mod config;

pub use rill_stream;
