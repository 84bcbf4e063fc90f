use choreo::cli::Args;
use choreo::config::{self, JsonPreferenceStore, PathConfig, Settings};
use choreo::core::engine_manager::{AnimationFactory, tween_factory};
use choreo::core::resource_manager::LoadOptions;
use choreo::entities::{
    AnimationRequest, PresetData, Priority, RequestId, ResourceKind, ResourcePayload, SystemSignal, TimelineOptions,
    TweenEngine, TweenProps,
};
use choreo::headless::{HeadlessEngine, Stage};
use choreo::orchestrator::{Host, Orchestrator};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Longest session `--seconds` accepts.
const MAX_SESSION: Duration = Duration::from_secs(3600);

const STAGE: [&str; 7] = ["#hero", "#title", "#card-1", "#card-2", "#card-3", "#toast", "#spinner"];

fn main() -> Result<()> {
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let paths = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths.ensure_dir() {
        eprintln!("Warning: Failed to create application directories: {:#}", e);
    }

    init_logging(&args, &paths)?;

    info!("choreo starting...");
    debug!("Command-line args: {:?}", args);
    info!("Config path: {}", paths.file(config::SETTINGS_FILE).display());

    let settings_path = paths.file(config::SETTINGS_FILE);
    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{:#}, using defaults", e);
            Settings::default()
        }
    };

    if args.write_config {
        settings.save(&settings_path)?;
        println!("{}", settings_path.display());
        return Ok(());
    }

    let engine = Arc::new(HeadlessEngine::new());
    let stage = Arc::new(Stage::new());
    for selector in STAGE {
        stage.add(selector);
    }

    let host = Host::system(stage.clone(), Arc::new(JsonPreferenceStore::in_dir(&paths)));
    let orchestrator = Orchestrator::initialize(&settings, engine.clone(), host)?;
    engine.set_frame_observer(orchestrator.frame_observer());

    register_recipes(&orchestrator);
    orchestrator
        .resources()
        .load_resource(
            "slow",
            ResourceKind::Preset,
            || {
                Ok(ResourcePayload::Preset(PresetData {
                    name: "slow".into(),
                    config: json!({ "duration": 1.2, "ease": "sine.inOut" }),
                }))
            },
            LoadOptions::with_priority(Priority::High),
        )
        .context("Failed to load preset 'slow'")?;

    let ids = enqueue_requests(&orchestrator, &args)?;
    info!("Enqueued {} request(s)", ids.len());

    // Ticks follow the engine frame rate, which drops with the performance tier
    let session = Duration::try_from_secs_f64(args.seconds.max(0.0)).map_or(MAX_SESSION, |d| d.min(MAX_SESSION));
    let mut elapsed = Duration::ZERO;
    let mut signalled = false;
    while elapsed < session {
        if args.reduced_motion && !signalled && elapsed >= session / 2 {
            orchestrator.policy().set_system_signal(SystemSignal::ReducedMotion(true));
            signalled = true;
        }
        let frame = Duration::from_secs(1) / engine.frame_rate().max(1);
        engine.advance(frame);
        std::thread::sleep(frame);
        elapsed += frame;
    }

    let statuses: Vec<_> = ids.iter().filter_map(|id| orchestrator.get_status(*id)).collect();
    let output = json!({
        "requests": statuses,
        "report": orchestrator.report(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    orchestrator.destroy();
    Ok(())
}

fn init_logging(args: &Args, paths: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths.file(config::LOG_FILE));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Two-step timeline: scale up then settle.
fn pulse_factory() -> AnimationFactory {
    Arc::new(|engine, target, config| {
        let timeline = engine.create_timeline(&TimelineOptions::default());
        let step = config.get("duration").and_then(|d| d.as_f64()).unwrap_or(0.5) / 2.0;
        for scale in [1.1, 1.0] {
            let props = TweenProps::from_config(&json!({ "duration": step, "scale": scale }));
            timeline.append(engine.tween(target, &props)?);
        }
        Ok(timeline)
    })
}

fn register_recipes(orchestrator: &Orchestrator) {
    let engine = orchestrator.engine();
    engine.register_animation("fade-in", tween_factory(), json!({ "duration": 0.4, "opacity": 1.0 }));
    engine.register_animation("slide-up", tween_factory(), json!({ "duration": 0.6, "y": 0 }));
    engine.register_animation("toast", tween_factory(), json!({ "duration": 0.3 }));
    engine.register_animation("pulse", pulse_factory(), json!({ "duration": 0.5 }));
}

fn enqueue_requests(orchestrator: &Orchestrator, args: &Args) -> Result<Vec<RequestId>> {
    let requests = match &args.animation {
        Some(animation) => {
            let priority: Priority = args.priority.parse()?;
            let targets = if args.targets.is_empty() {
                vec!["#hero".to_string()]
            } else {
                args.targets.clone()
            };
            targets
                .into_iter()
                .map(|target| AnimationRequest::new(animation.as_str(), target.as_str()).with_priority(priority))
                .collect::<Vec<_>>()
        }
        None => vec![
            AnimationRequest::new("fade-in", "#hero").with_priority(Priority::Critical),
            AnimationRequest::new("slide-up", "#title").with_priority(Priority::High),
            AnimationRequest::new("fade-in", "#card-1").with_preset("slow"),
            AnimationRequest::new("fade-in", "#card-2").with_options(json!({ "duration": 0.8 })),
            AnimationRequest::new("fade-in", "#card-3"),
            AnimationRequest::new("pulse", "#spinner").with_priority(Priority::Low),
            AnimationRequest::new("toast", "#toast").with_priority(Priority::Low),
            // Never resolves: exercises retries
            AnimationRequest::new("toast", "#missing").with_priority(Priority::Low),
        ],
    };

    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        let request = request.on_error(|id, err| warn!("Request {} failed: {}", id, err));
        ids.push(orchestrator.enqueue(request)?);
    }
    Ok(ids)
}
