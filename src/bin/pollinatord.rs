//! pollinatord - flower and pollinator detection daemon
//!
//! This daemon:
//! 1. Pulls image paths from a directory scan or a work queue
//! 2. Detects flowers on each image, then pollinators on each flower crop
//! 3. Writes one JSON result per image and forwards it over MQTT and/or HTTP
//! 4. Sleeps when the source is idle, until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pollinator_inference::{
    config::PipelineConfig,
    pipeline::{Outcome, Pipeline, RunSummary},
    ui::{Ui, UiMode},
};

const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Cascaded flower and pollinator detection")]
struct Args {
    /// Pipeline configuration file (JSON, or TOML/YAML by extension).
    #[arg(long, env = "POLLINATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Exit once the work source is idle instead of polling forever.
    #[arg(long)]
    once: bool,

    /// Stage reporting style on stderr.
    #[arg(long, value_enum, default_value = "auto")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("loading configuration");
        PipelineConfig::load_from(args.config.as_deref())?
    };
    let mut pipeline = {
        let _stage = ui.stage("loading models");
        Pipeline::from_config(&cfg)?
    };
    log::info!(
        "pollinatord {} reading from {}",
        env!("CARGO_PKG_VERSION"),
        pipeline.source_name()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let mut summary = RunSummary::default();
    while !stop.load(Ordering::SeqCst) {
        let Some(item) = pipeline.next_item()? else {
            if args.once {
                break;
            }
            log::info!("no data available");
            sleep_unless_stopped(cfg.input.poll_interval, &stop);
            continue;
        };

        let name = item
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut stage = ui.stage(&name);
        let outcome = pipeline.process_item(&item)?;
        stage.set_detail(describe(&outcome));
        summary.record(&outcome);
    }

    log::info!(
        "stopping after {} images ({} delivered, {} skipped empty, {} abandoned)",
        summary.processed(),
        summary.delivered,
        summary.skipped_empty,
        summary.abandoned
    );
    Ok(())
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Idle => "idle".to_string(),
        Outcome::Delivered {
            flowers,
            pollinators,
            failed_sinks,
            ..
        } => {
            let mut detail = format!("{} flowers, {} pollinators", flowers, pollinators);
            if *failed_sinks > 0 {
                detail.push_str(&format!(", {} sinks failed", failed_sinks));
            }
            detail
        }
        Outcome::SkippedEmpty => "no pollinators, skipped".to_string(),
        Outcome::Abandoned => "abandoned".to_string(),
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}
