//! Argument parsing for the `tachyon` CLI (spec section 6's "CLI surface").

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tachyon", about = "Columnar storage for variant-call data", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import a VCF file into a .yon container.
    Import {
        /// Input VCF path.
        #[arg(short = 'i', long = "input")]
        input: String,
        /// Output .yon path.
        #[arg(short = 'o', long = "output")]
        output: String,
        /// Zstandard compression level.
        #[arg(short = 'c', long = "codec-level", default_value_t = 6)]
        zstd_level: i32,
        /// Maximum records per block.
        #[arg(short = 'r', long = "records-per-block", default_value_t = 65_536)]
        records_per_block: u32,
        /// Maximum bases spanned per block.
        #[arg(short = 'b', long = "bases-per-block", default_value_t = 10_000_000)]
        bases_per_block: i64,
        /// Encrypt every container with a fresh per-field key.
        #[arg(short = 'e', long = "encrypt", default_value_t = false)]
        encrypt: bool,
    },
    /// Print a simplified VCF-like rendering of a .yon file to stdout.
    View {
        /// Path to the .yon file.
        path: String,
        /// Restrict output to these INFO/FORMAT field names (comma-separated).
        #[arg(short = 'f', long = "fields")]
        fields: Option<String>,
        /// Restrict output to these sample names (comma-separated).
        #[arg(short = 's', long = "samples")]
        samples: Option<String>,
        /// Restrict output to a `contig:start-end` region.
        #[arg(short = 'r', long = "region")]
        region: Option<String>,
    },
    /// Print per-column compressed/uncompressed size statistics.
    Stats {
        /// Path to the .yon file.
        path: String,
    },
}
