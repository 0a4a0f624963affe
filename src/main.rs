// HOTPLUGD v1.0.0 -- LOAD-DRIVEN CPU HOTPLUG GOVERNOR
// ONLINES A CORE WHEN FREQUENCY-WEIGHTED LOAD OUTGROWS THE ONES RUNNING,
// OFFLINES ONE WHEN THE REST CAN ABSORB ITS WORK.
//
// CONTROL LOOP RUNS ON ITS OWN WORKER THREAD (governor.rs).
// MAIN THREAD: CONFIGURATION, SIGNALS, REPORTING.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hotplugd::config::Config;
use hotplugd::control::ControlServer;
use hotplugd::governor::{Event, Governor};
use hotplugd::platform::{CpuSource, FrequencyWatcher, SysfsPlatform};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "hotplugd")]
#[command(about = "HOTPLUGD -- LOAD-DRIVEN CPU HOTPLUG GOVERNOR")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    // RUN THE GOVERNOR IN THE FOREGROUND
    Run {
        // TOML CONFIG (DEFAULT /etc/hotplugd.toml IF PRESENT)
        #[arg(long)]
        config: Option<PathBuf>,

        // DECIDE BUT NEVER WRITE cpuN/online
        #[arg(long)]
        dry_run: bool,

        // SECONDS BEFORE THE FIRST CYCLE (OVERRIDES CONFIG)
        #[arg(long)]
        boot_delay: Option<u64>,

        // CONTROL SOCKET PATH (OVERRIDES CONFIG)
        #[arg(long)]
        socket: Option<PathBuf>,

        // DEBUG-LEVEL LOGGING
        #[arg(long)]
        verbose: bool,

        // DUMP FULL EVENT LOG ON EXIT
        #[arg(long)]
        dump_log: bool,
    },

    // TALK TO A RUNNING GOVERNOR
    Ctl {
        #[arg(long)]
        socket: Option<PathBuf>,

        // get KEY | set KEY VALUE | keys | status | suspend | resume
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,
    },

    // PRINT THE CALIBRATED THRESHOLD TABLE FOR THIS MACHINE
    Table {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    // ENVIRONMENT CHECKS
    Check,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, dry_run, boot_delay, socket, verbose, dump_log } => {
            init_logging(verbose);
            let mut cfg = Config::resolve(config.as_deref())?;
            cfg.dry_run |= dry_run;
            if let Some(s) = boot_delay {
                cfg.boot_delay_secs = s;
            }
            if let Some(s) = socket {
                cfg.socket = s;
            }
            run(cfg, dump_log)
        }
        Command::Ctl { socket, request } => cli::ctl::run_ctl(socket, &request),
        Command::Table { config } => cli::table::run_table(config.as_deref()),
        Command::Check => cli::check::run_check(),
    }
}

fn run(cfg: Config, dump_log: bool) -> Result<()> {
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let platform = Arc::new(SysfsPlatform::new(cfg.dry_run)?);

    println!("HOTPLUGD v1.0.0");
    println!("CPUS:            {}", platform.possible_cpus());
    println!("DRY RUN:         {}", cfg.dry_run);
    println!("BOOT DELAY:      {} s", cfg.boot_delay_secs);
    println!("SOCKET:          {}", cfg.socket.display());
    println!();

    let governor = Arc::new(Governor::start(platform.clone(), &cfg).context("governor start failed")?);

    let g = governor.clone();
    let mut watcher = FrequencyWatcher::spawn(platform, Duration::from_millis(cfg.freq_poll_ms.max(1)), move |old, new| {
        g.handle(Event::FrequencyChanged { old, new });
    })?;

    let mut control = ControlServer::spawn(&cfg.socket, governor.clone())?;

    println!("HOTPLUGD IS ACTIVE (CTRL+C TO EXIT)");

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    println!("HOTPLUGD IS SHUTTING DOWN");
    control.stop();
    watcher.stop();
    governor.shutdown();
    info!(status = %governor.status(), "final state");

    governor.with_log(|log| {
        if dump_log {
            log.dump();
        }
        log.summary();
    });

    println!("HOTPLUGD OUT.");
    Ok(())
}
