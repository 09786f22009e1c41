//! flowmeter CLI entry point.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use flowmeter::cli::Args;
use flowmeter::detection::detect_ntp_amplification;
use flowmeter::export::{export_to_path, write_records};
use flowmeter::{FeatureProcessor, Progress};

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_filter().into()))
        .init();

    let config = args.meter_config().context("Invalid configuration")?;
    let format = args.export_format();
    let quiet = args.quiet;

    let mut processor = FeatureProcessor::new(config)?.with_progress(move |p: &Progress| {
        if !quiet {
            let percent = if p.packets_total > 0 {
                p.packets_processed as f64 * 100.0 / p.packets_total as f64
            } else {
                0.0
            };
            eprint!(
                "\r{:>6.1}%  {}/{} packets  {:.1}s  {:.1} MiB",
                percent,
                p.packets_processed,
                p.packets_total,
                p.elapsed_secs,
                p.memory_usage_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        true
    });

    let token = processor.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, stopping after the current batch...");
        token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;

    let report = processor
        .process_file(&args.pcap)
        .with_context(|| format!("Failed to process {}", args.pcap.display()))?;
    if !quiet {
        eprintln!();
    }

    match &args.output {
        Some(path) => {
            export_to_path(path, format, &report.records)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} flows to {}", report.records.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            write_records(stdout.lock(), format, &report.records).context("Failed to write records")?;
        }
    }

    let stats = &report.stats;
    eprintln!(
        "{} packets read, {} skipped, {} flows ({} spilled) in {:.2}s{}",
        stats.packets_read,
        stats.packets_skipped(),
        report.records.len(),
        stats.flows_spilled,
        stats.elapsed_secs,
        if report.is_cancelled() { " [cancelled]" } else { "" }
    );

    if args.detect {
        let ntp = detect_ntp_amplification(&report.records);
        let mut stderr = io::stderr();
        writeln!(stderr, "{}", ntp.message())?;
        if ntp.ntp_flows > 0 {
            writeln!(stderr, "{}", serde_json::to_string_pretty(&ntp)?)?;
        }
    }

    Ok(())
}
