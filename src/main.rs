//! motiond — motion-control daemon entry point.
//!
//! Wires the pieces together (logger, configuration, driver registry,
//! worker pool) and parks.  Requests arrive through the client-transport
//! layer, which attaches to [`Daemon::submit`]; `--search` runs a one-shot
//! bus discovery instead.

use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motiond::config::DaemonConfig;
use motiond::daemon::request::Request;
use motiond::daemon::Daemon;

fn usage() -> ! {
    eprintln!("usage: motiond [--config <file>] [--search [<driver>]]");
    std::process::exit(2);
}

struct Options {
    config: Option<PathBuf>,
    search: Option<String>,
}

fn parse_args() -> Options {
    let mut options = Options {
        config: None,
        search: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => options.config = Some(PathBuf::from(path)),
                None => usage(),
            },
            "--search" => {
                options.search = Some(args.next().unwrap_or_else(|| "mdrive".into()));
            }
            _ => usage(),
        }
    }
    options
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = parse_args();
    let config = match &options.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    let daemon = Daemon::new(&config);

    if let Some(class) = options.search {
        return run_search(&daemon, &class);
    }

    info!("motiond: open for business ({:?} scheduling)", config.scheduler);

    // Park until asked to leave; all real work happens on the workers.
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("installing SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("installing SIGTERM handler")?;
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("motiond: shutting down");
    daemon.shutdown();
    Ok(())
}

fn run_search(daemon: &Daemon, class: &str) -> Result<()> {
    let (reply, results) = mpsc::channel();
    daemon
        .submit(Request::Search {
            class: class.to_owned(),
            reply,
        })
        .context("queueing search")?;

    let found = results
        .recv_timeout(Duration::from_secs(120))
        .context("awaiting search results")?
        .context("search failed")?;

    for cxn in &found {
        println!("{cxn}");
    }
    info!("motiond: search found {} unit(s)", found.len());
    daemon.shutdown();
    Ok(())
}
