use meshvault::cli::Args;
use meshvault::config::{self, LoaderSettings};
use meshvault::core::cleanup::{CleanupPhase, CleanupReport};
use meshvault::core::loader::{BackgroundLoader, LoadOutcome, LoadedModel};
use meshvault::core::tracker::ResourceKind;
use meshvault::core::traits::ProgressSink;
use meshvault::entities::mesh::{self, MeshBounds, Triangle};
use meshvault::entities::session::{SharedContextFlag, ViewerSession};
use meshvault::entities::stl::{self, StlParser};
use meshvault::progress_bar::LoadProgressBar;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

/// Poll interval while waiting for the load
const WAIT_SLICE: Duration = Duration::from_millis(100);

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // Determine log level based on verbosity flags
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        // File logging with specified verbosity level
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging with specified verbosity level (respects RUST_LOG if set)
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

fn load_settings(args: &Args, path_config: &config::PathConfig) -> LoaderSettings {
    let path = config::config_file(config::SETTINGS_FILE, path_config);
    info!("Config path: {}", path.display());

    let mut settings = LoaderSettings::load(&path).unwrap_or_else(|e| {
        warn!("{:#}, using defaults", e);
        LoaderSettings::default()
    });
    if args.workers.is_some() {
        settings.workers = args.workers;
    }
    if let Some(step) = args.step {
        settings.progress_step = step;
    }
    settings.sanitized()
}

fn main() -> Result<()> {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());

    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;

    info!("meshvault {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let settings = load_settings(&args, &path_config);
    debug!("Loader settings: {:?}", settings);

    let header = stl::read_header(&args.file_path)?;
    info!(
        "Input file: {} ({} triangles declared, \"{}\")",
        args.file_path.display(),
        header.triangle_count,
        header.description
    );

    let model = load(&args, settings)?;
    if model.records.len() as u64 != header.triangle_count as u64 && !model.is_partial() {
        warn!(
            "Header declares {} triangles, file holds {}",
            header.triangle_count,
            model.records.len()
        );
    }
    print_model(&args.file_path, &model);

    let report = dispose_demo_session(&model.records)?;
    print_cleanup(&report);
    Ok(())
}

fn load(args: &Args, settings: LoaderSettings) -> Result<LoadedModel<Triangle>> {
    let loader = BackgroundLoader::new(settings);

    let file_name = args
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bar = (!args.quiet).then(|| LoadProgressBar::new(&file_name));
    let mut bar_sink = bar.as_ref().map(|b| b.sink());
    let sink = move |progress: f64, message: &str| {
        if let Some(s) = bar_sink.as_mut() {
            s.on_progress(progress, message);
        }
    };

    let handle = loader.start_with(StlParser::request(&args.file_path), StlParser, sink)?;
    info!(
        "Load {} started: {} chunks, {} workers",
        handle.id(),
        handle.chunks().len(),
        handle.worker_count()
    );

    let deadline = args.timeout.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let outcome = loop {
        if let Some(outcome) = handle.wait_timeout(WAIT_SLICE) {
            break outcome;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) && loader.cancel(&handle) {
            warn!("Load exceeded {:.1}s timeout, cancelling", args.timeout.unwrap_or_default());
        }
    };

    match outcome {
        LoadOutcome::Completed(model) => {
            if let Some(b) = &bar {
                b.finish(&format!("Loaded {}", file_name));
            }
            Ok(model)
        }
        LoadOutcome::Cancelled(c) => {
            if let Some(b) = &bar {
                b.abandon("Cancelled");
            }
            bail!(
                "load cancelled at {:.1}% ({} chunks done, {} abandoned)",
                c.progress * 100.0,
                c.chunks_completed,
                c.chunks_abandoned
            )
        }
        LoadOutcome::Failed(e) => {
            if let Some(b) = &bar {
                b.abandon("Failed");
            }
            Err(e).with_context(|| format!("Failed to load {}", args.file_path.display()))
        }
    }
}

fn print_model(path: &Path, model: &LoadedModel<Triangle>) {
    println!("File:      {}", path.display());
    println!("Triangles: {}", model.records.len());
    println!(
        "Chunks:    {} ({} MiB in {:.2}s)",
        model.chunk_count,
        model.bytes / (1024 * 1024),
        model.elapsed.as_secs_f64()
    );
    match MeshBounds::from_triangles(&model.records) {
        Some(b) => {
            println!("Bounds:    min {:?} max {:?}", b.min.to_array(), b.max.to_array());
            println!("Size:      {:?}", b.size().to_array());
        }
        None => println!("Bounds:    (empty)"),
    }
    if model.is_partial() {
        println!("Failed chunks: {:?}", model.failed_chunk_ids());
        for err in &model.chunk_errors {
            println!("  {}", err);
        }
    }
}

/// Register the resources a viewer would create for `triangles`, then tear
/// them down through the phased cleanup.
fn dispose_demo_session(triangles: &[Triangle]) -> Result<CleanupReport> {
    let mut session = ViewerSession::new(SharedContextFlag::new());

    let vbo_bytes = mesh::as_bytes(triangles).len();
    session.track(ResourceKind::Buffer, 1, move || {
        debug!("Freeing vertex buffer ({} bytes)", vbo_bytes);
        Ok(())
    });
    session.track(ResourceKind::Shader, 5, || {
        debug!("Deleting shader program");
        Ok(())
    });
    session.track(ResourceKind::Mapper, 2, || {
        debug!("Releasing mesh mapper");
        Ok(())
    });

    let objects = [
        (CleanupPhase::ActorCleanup, ResourceKind::Actor),
        (CleanupPhase::RendererCleanup, ResourceKind::Renderer),
        (CleanupPhase::WindowCleanup, ResourceKind::RenderWindowBinding),
        (CleanupPhase::InteractorCleanup, ResourceKind::Interactor),
    ];
    for (phase, kind) in objects {
        session.attach(phase, kind, 0, move || {
            debug!("Releasing {}", kind);
            Ok(())
        })?;
    }

    Ok(session.dispose()?)
}

fn print_cleanup(report: &CleanupReport) {
    println!(
        "Cleanup:   {} released, {} discarded, {} failed{} ({:.1}ms)",
        report.released(),
        report.discarded(),
        report.failures.len(),
        if report.degraded { ", degraded" } else { "" },
        report.elapsed.as_secs_f64() * 1000.0
    );
}
