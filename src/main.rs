mod cli;
mod ui;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use gridflow::{Application, Core, Engine, FileStore, GridConfig, GridError, ResourceSpec};
use ui::EngineProgress;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = GridConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Demo {
            tasks,
            interval_ms,
            max_in_flight,
            max_submitted,
            output_dir,
            store,
        } => {
            let mut config = config;
            if let Some(max) = max_in_flight {
                config.engine.max_in_flight = max;
            }
            if let Some(max) = max_submitted {
                config.engine.max_submitted = max;
            }
            if output_dir.is_some() {
                config.engine.output_dir = output_dir;
            }
            run_demo(config, tasks, Duration::from_millis(interval_ms), store)
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Resources => {
            if config.resources.is_empty() {
                println!("No resources configured.");
            }
            for spec in &config.resources {
                let status = if spec.enabled { "enabled" } else { "disabled" };
                println!(
                    "{:<20} {:<8} {:>3} cores  {status}",
                    spec.name, spec.kind, spec.max_cores
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gridflow=debug" } else { "gridflow=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_demo(
    mut config: GridConfig,
    count: usize,
    interval: Duration,
    store_dir: Option<PathBuf>,
) -> Result<()> {
    if config.resources.is_empty() {
        info!("No resources configured, using two simulated ones");
        config.resources = vec![
            ResourceSpec::new("sim-small").with_max_cores(2),
            ResourceSpec::new("sim-large").with_max_cores(6),
        ];
    }

    let core = Core::from_config(&config).context("failed to set up resources")?;
    let mut engine = Engine::new(core, config.engine.clone());
    if let Some(dir) = store_dir {
        let store = FileStore::open(&dir)
            .with_context(|| format!("failed to open task store in {}", dir.display()))?;
        engine = engine.with_store(store);
    }

    let retrieve = config.engine.output_dir.is_some();
    for i in 0..count {
        let mut app = Application::new(format!("demo-{i}"), vec!["hostname".to_string()]);
        if retrieve {
            app = app.with_stdout("stdout.txt");
        }
        engine.submit(Box::new(app), false)?;
    }

    let progress = EngineProgress::start(engine.len());
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        if let Err(err) = engine.progress() {
            if err.is_fatal() || matches!(err, GridError::NoResources(_)) {
                progress.finish(&engine.stats(None));
                return Err(err).context("engine stopped");
            }
            warn!("Cycle {cycle} failed: {err}");
            progress.warn(&format!("cycle {cycle}: {err}"));
        }
        let stats = engine.stats(None);
        progress.update(cycle, &stats);
        if stats.is_done() {
            break;
        }
        thread::sleep(interval);
    }

    let stats = engine.stats(None);
    progress.finish(&stats);
    progress.print_stats(&stats);
    engine.close();
    Ok(())
}
