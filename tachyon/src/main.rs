mod cli;
mod commands;
mod vcf;

use clap::Parser;
use tachyon_base::Kind;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let result = match cli.command {
        cli::Command::Import { input, output, zstd_level, records_per_block, bases_per_block, encrypt } => {
            commands::import::run(&input, &output, zstd_level, records_per_block, bases_per_block, encrypt)
        }
        cli::Command::View { path, fields, samples, region } => {
            commands::view::run(&path, fields.as_deref(), samples.as_deref(), region.as_deref())
        }
        cli::Command::Stats { path } => commands::stats::run(&path),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        std::process::exit(exit_code_for(&e));
    }
}

/// Spec section 6: 0 success, 1 user error, 2 IO error, 3 integrity
/// failure (checksum or GCM tag mismatch).
fn exit_code_for(e: &tachyon_base::Error) -> i32 {
    match e.kind() {
        Kind::Io => 2,
        Kind::IntegrityFailure => 3,
        _ => 1,
    }
}
