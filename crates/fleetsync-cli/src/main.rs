//! `fleetsync` – run the sync and dispatch engine against a simulated fleet.
//!
//! The binary:
//!
//! 1. Loads `~/.fleetsync/config.toml`, writing a default file on first run.
//! 2. Initialises tracing (`RUST_LOG`, `FLEETSYNC_LOG_FORMAT`,
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`).
//! 3. Initializes the engine, fetches the building map, streams simulated
//!    robot, door, lift and task traffic into it and dispatches one demo
//!    goal.
//! 4. Prints per-category message statistics every two seconds.
//! 5. Intercepts **Ctrl-C** and runs a full cleanup before exiting.

mod config;
mod demo;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use fleetsync_middleware::{EventBus, OutwardSocket, SimTransport, Topic, WsOutwardSocket};
use fleetsync_runtime::{
    CallerContext, EngineServices, InitOutcome, MessageStats, Orchestrator, init_tracing,
};
use fleetsync_types::{EventPayload, StreamCategory};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

const STATS_PERIOD: Duration = Duration::from_secs(2);
const TELEMETRY_PERIOD: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let cfg = load_or_create_config();
    let _tracing = init_tracing("fleetsync", cfg.quiet_logging);

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – cleaning up …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the engine will not clean up on Ctrl-C");
    }

    // The runtime is built after tracing so the OTLP exporter needs none.
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(cfg, shutdown));
    drop(runtime);
    code
}

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

async fn run(cfg: config::Config, shutdown: Arc<AtomicBool>) -> ExitCode {
    let engine_cfg = cfg.to_engine_config();
    let bus = Arc::new(EventBus::default());
    let sim = Arc::new(SimTransport::new());
    sim.set_map_data(Some(demo::building_map()));
    sim.set_goal_script(demo::goal_script());

    let socket = engine_cfg
        .socket_target()
        .map(|_| Arc::new(WsOutwardSocket::new(Arc::clone(&bus))) as Arc<dyn OutwardSocket>);
    let services = EngineServices {
        telemetry: sim.clone(),
        map_source: sim.clone(),
        goals: sim.clone(),
        socket,
    };
    let engine = Arc::new(Orchestrator::new(services, Arc::clone(&bus)));

    spawn_lifecycle_printer(&bus);

    match engine.initialize(engine_cfg).await {
        InitOutcome::Initialized { steps } => {
            let names: Vec<String> = steps.iter().map(ToString::to_string).collect();
            println!("  {} engine initialized ({})", "✓".green().bold(), names.join(" → ").dimmed());
        }
        InitOutcome::Failed { failed_step, error, .. } => {
            println!("  {} {} failed: {}", "✗".red().bold(), failed_step, error);
            return ExitCode::FAILURE;
        }
        other => {
            println!("  {} unexpected initialize outcome: {:?}", "✗".red().bold(), other);
            return ExitCode::FAILURE;
        }
    }

    match engine.fetch_map_data().await {
        Ok(Some(map)) => println!("  Map loaded: {} ({} level(s))", map.building_name.bold(), map.levels.len()),
        Ok(None) => println!("  {}", "No building map available".dimmed()),
        Err(e) => println!("  {}: {}", "Map fetch failed".yellow(), e),
    }

    let mut fleet = demo::DemoFleet::new(cfg.demo_robots);
    fleet.seed(&sim);

    let mut telemetry = tokio::time::interval(TELEMETRY_PERIOD);
    let mut stats = tokio::time::interval(STATS_PERIOD);
    stats.tick().await;
    let mut goal_sent = false;

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = telemetry.tick() => {
                fleet.step(&sim);
                if !goal_sent && fleet_reported(&engine) {
                    goal_sent = true;
                    spawn_demo_goal(&engine);
                }
            }
            _ = stats.tick() => print_stats(&engine.message_stats()),
        }
    }

    let report = engine.cleanup().await;
    for (step, e) in &report.failed {
        println!("  {} cleanup step {:?} failed: {}", "✗".red(), step, e);
    }
    println!("  {} {} cleanup step(s) completed. Bye.", "✓".green().bold(), report.completed.len());
    if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn fleet_reported(engine: &Orchestrator) -> bool {
    engine
        .store()
        .get_robot(&demo::robot_name(0), demo::FLEET)
        .is_some_and(|r| r.dynamic_event.is_some() && !r.task_id.is_empty())
}

fn spawn_lifecycle_printer(bus: &Arc<EventBus>) {
    let mut events = bus.subscribe_to(Topic::Lifecycle);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let EventPayload::Lifecycle(ev) = event.payload {
                        println!("  {} {}", "◆".cyan(), ev.name().bold());
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "lifecycle printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_demo_goal(engine: &Arc<Orchestrator>) {
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        let caller = CallerContext::robot(demo::robot_name(0), demo::FLEET);
        let mut rx = engine
            .send_goal("go_to_place", json!({ "place": "pantry" }), json!({ "source": "demo" }), &caller)
            .await;
        while let Some(out) = rx.recv().await {
            if let Some(status) = out.status {
                println!("  {} goal status: {}", "…".dimmed(), status["status"]);
            } else if let Some(success) = out.success {
                println!("  {} goal succeeded: {}", "✓".green(), success);
            } else if let Some(failure) = out.failure {
                error!(%failure, "demo goal failed");
                println!("  {} goal failed: {}", "✗".red(), failure);
            }
        }
    });
}

fn print_stats(stats: &BTreeMap<StreamCategory, MessageStats>) {
    println!();
    println!(
        "  {:<14} {:>9} {:>9} {:>9} {:>7} {:>9}",
        "category".bold(),
        "received".bold(),
        "processed".bold(),
        "skipped".bold(),
        "failed".bold(),
        "interval".bold()
    );
    for (category, s) in stats {
        let failed = if s.failed > 0 { s.failed.to_string().red() } else { s.failed.to_string().normal() };
        println!(
            "  {:<14} {:>9} {:>9} {:>9} {:>7} {:>7}ms",
            category.as_str().cyan(),
            s.received,
            s.processed.to_string().green(),
            s.skipped.to_string().yellow(),
            failed,
            s.interval_ms
        );
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   ______          __                      "#.bold().cyan());
    println!("{}", r#"  / __/ /__ ___ __/ /____ __ _____  ____   "#.bold().cyan());
    println!("{}", r#" / _// / -_) -_) _  __(_-</ // / _ \/ __/  "#.bold().cyan());
    println!("{}", r#"/_/ /_/\__/\__/\__/\__/___/\_, /_//_/\__/  "#.bold().cyan());
    println!("{}", r#"                          /___/            "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "fleetsync".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fleet telemetry sync and goal dispatch");
    println!();
}
