//! CLI module - Command-line interface for companion-enricher
//!
//! This module provides a structured CLI using clap for argument parsing.

mod commands;

use crate::domain::AttributeKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// companion-enricher - fills missing companion avatars, descriptions and greetings
#[derive(Parser)]
#[command(name = "companion-enricher")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config.toml (default: search ./, the user config dir, then ~/.companion-enricher)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enrich one attribute across all eligible companions
    #[command(alias = "r")]
    Run(RunArgs),

    /// List companions that are eligible for enrichment without generating anything
    #[command(alias = "check")]
    Scan {
        /// Attribute to check: avatar, description or greeting
        attribute: AttributeKind,

        /// Stop after this many eligible companions
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Insert a new companion with empty attributes
    #[command(alias = "add")]
    Create(CreateArgs),

    /// Run as background daemon with scheduler
    #[command(alias = "-d", alias = "--daemon")]
    Daemon,

    /// Create default config file
    #[command(alias = "--init")]
    Init,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Attribute to fill: avatar, description or greeting
    pub attribute: AttributeKind,

    /// Log what would happen without calling generators or writing records
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum companions to process (default: job.max_per_run)
    #[arg(long, conflicts_with = "test")]
    pub limit: Option<usize>,

    /// Companions per batch before a breather pause (default: job.batch_size)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Process only a small test subset (job.test_subset)
    #[arg(long)]
    pub test: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Display name
    #[arg(long)]
    pub name: String,

    /// URL slug (default: derived from the name)
    #[arg(long)]
    pub slug: Option<String>,

    #[arg(long)]
    pub sex: Option<String>,

    /// Art style, e.g. realistic or anime
    #[arg(long)]
    pub style: Option<String>,

    #[arg(long)]
    pub ethnicity: Option<String>,

    #[arg(long)]
    pub hair_length: Option<String>,

    #[arg(long)]
    pub hair_color: Option<String>,

    #[arg(long)]
    pub content_filter: Option<String>,

    #[arg(long)]
    pub created_by: Option<String>,

    /// Create the companion as private
    #[arg(long)]
    pub private: bool,
}

pub use commands::*;
