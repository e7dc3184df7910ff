//! burnguard - Systemd user daemon that protects idle monitors from burn-in.
//!
//! Dims (or blacks out) each monitor that has seen no activity for its
//! configured timeout, and restores it the moment activity returns.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use burnguard::actuation::BlackoutService;
use burnguard::actuation::DimmingService;
use burnguard::actuation::dimming::BrightnessStore;
use burnguard::actuation::dimming::JsonBrightnessStore;
use burnguard::actuation::dimming::MemoryBrightnessStore;
use burnguard::actuation::register_handlers;
use burnguard::config::Config;
use burnguard::coordinator::Coordinator;
use burnguard::dispatch::Dispatcher;
use burnguard::dispatch::RestoreAllDimmed;
use burnguard::events::BusEvent;
use burnguard::events::EventBus;
use burnguard::idle::IdleEngine;
use burnguard::native::ActivitySource;
use burnguard::native::BrightnessControl;
use burnguard::native::OverlayHost;
use burnguard::native::ddcutil::DdcutilControl;
use burnguard::native::dry_run::DryRunBrightness;
use burnguard::native::dry_run::DryRunOverlays;
use burnguard::native::hyprland::HyprlandActivity;
use burnguard::native::hyprland::HyprlandIpc;
use burnguard::native::idle_notify::InputIdleWatch;
use burnguard::native::layer_shell::LayerShellHost;
use burnguard::topology::TopologyProvider;
use burnguard::watcher::TopologyWatcher;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Burn-in protection daemon for Hyprland.
///
/// Dims or blacks out monitors nobody is using.
#[derive(Parser, Debug)]
#[command(name = "burnguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (log brightness and overlay actions instead of executing them).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the detected monitors and exit.
    #[arg(long)]
    list_monitors: bool,

    /// Restore brightness left dimmed by a previous run and exit.
    #[arg(long)]
    restore_only: bool,

    /// Write the config file with an entry for every detected monitor and exit.
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("burnguard v{} starting", env!("CARGO_PKG_VERSION"));

    let ipc = match HyprlandIpc::from_env() {
        Ok(ipc) => Arc::new(ipc),
        Err(e) => {
            error!("Hyprland environment not detected: {}", e);
            error!("Required environment variables:");
            for diag in HyprlandIpc::get_diagnostics() {
                error!("  {}", diag);
            }
            error!("");
            error!("If running as a systemd user service, ensure these variables are available.");
            error!("See: dbus-update-activation-environment --systemd XDG_RUNTIME_DIR");
            anyhow::bail!("Hyprland environment not available");
        }
    };

    for diag in HyprlandIpc::get_diagnostics() {
        debug!("{}", diag);
    }

    let config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    let dry_run = args.dry_run || config.dry_run;

    info!("Configuration loaded (dry_run={})", dry_run);

    let brightness: Arc<dyn BrightnessControl> = if dry_run {
        Arc::new(DryRunBrightness::new())
    } else {
        Arc::new(DdcutilControl::new())
    };
    let provider = TopologyProvider::new(ipc.clone(), brightness.clone());

    if args.list_monitors {
        return list_monitors(&provider).await;
    }

    if args.write_config {
        return write_config(config, args.config, &provider).await;
    }

    let store = brightness_store(&config, dry_run)?;

    if args.restore_only {
        return restore_only(&provider, brightness, store).await;
    }

    run_daemon(config, dry_run, ipc, provider, brightness, store).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("burnguard={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

fn brightness_store(config: &Config, dry_run: bool) -> Result<Arc<dyn BrightnessStore>> {
    if dry_run {
        return Ok(Arc::new(MemoryBrightnessStore::default()));
    }
    let path = config
        .brightness_state_path()
        .context("No state directory for brightness records")?;
    debug!("Brightness records at {}", path.display());
    Ok(Arc::new(JsonBrightnessStore::new(path)))
}

async fn list_monitors(provider: &TopologyProvider) -> Result<()> {
    let monitors = provider
        .monitors()
        .await
        .context("Failed to enumerate monitors")?;

    for m in &monitors {
        println!(
            "{} | display={} bounds={} ddc_ci={} hardware_id={}",
            m.device_name, m.display_number, m.bounds, m.ddc_ci, m.hardware_id
        );
    }
    Ok(())
}

async fn write_config(
    mut config: Config,
    path: Option<PathBuf>,
    provider: &TopologyProvider,
) -> Result<()> {
    let path = path
        .or_else(Config::default_path)
        .context("No config directory available")?;
    let monitors = provider
        .monitors()
        .await
        .context("Failed to enumerate monitors")?;

    let added = config.adopt_monitors(monitors.iter().map(|m| &m.hardware_id));
    info!("Added {} monitor entries", added);
    config.save(&path)
}

async fn restore_only(
    provider: &TopologyProvider,
    brightness: Arc<dyn BrightnessControl>,
    store: Arc<dyn BrightnessStore>,
) -> Result<()> {
    // Probing maps each monitor to its brightness channel.
    provider
        .monitors()
        .await
        .context("Failed to enumerate monitors")?;

    let report = DimmingService::new(brightness, store)
        .restore_all()
        .await
        .context("Failed to restore brightness")?;

    info!(
        "Restore complete: {} restored, {} failed",
        report.restored.len(),
        report.failed.len()
    );
    if !report.failed.is_empty() {
        anyhow::bail!("{} monitors could not be restored", report.failed.len());
    }
    Ok(())
}

/// Run daemon event loop.
async fn run_daemon(
    config: Config,
    dry_run: bool,
    ipc: Arc<HyprlandIpc>,
    provider: TopologyProvider,
    brightness: Arc<dyn BrightnessControl>,
    store: Arc<dyn BrightnessStore>,
) -> Result<()> {
    let overlays: Arc<dyn OverlayHost> = if dry_run {
        Arc::new(DryRunOverlays::new())
    } else {
        Arc::new(LayerShellHost::spawn().context("Failed to start overlay host")?)
    };

    let dimming = Arc::new(DimmingService::new(brightness, store));
    let blackout = Arc::new(BlackoutService::new(overlays));
    let dispatcher = Arc::new(
        register_handlers(Dispatcher::builder(), dimming, blackout.clone())
            .context("Failed to register command handlers")?
            .build(),
    );
    let coordinator = Coordinator::new(dispatcher.clone(), blackout);

    let input = match InputIdleWatch::spawn() {
        Ok(watch) => Some(watch),
        Err(e) => {
            warn!("Input activity unavailable, using pointer and focus only: {}", e);
            None
        }
    };
    let activity = HyprlandActivity::new(ipc, input);

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let watcher = TopologyWatcher::new(provider, bus.clone(), config.poll_interval());
    let monitors = watcher
        .start()
        .await
        .context("Initial monitor discovery failed")?;

    // Probing during discovery registered the brightness channels.
    if let Err(e) = dispatcher.send(RestoreAllDimmed).await {
        error!("Startup recovery failed: {}", e);
    }

    let mut engine = IdleEngine::new(bus.clone());
    engine.set_monitors(&monitors, &config, Instant::now());

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    let mut idle_timer = tokio::time::interval(config.idle_check_interval());
    idle_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Daemon started, watching {} monitors", monitors.len());

    loop {
        tokio::select! {
            _ = idle_timer.tick() => {
                match activity.sample().await {
                    Ok(sample) => engine.tick(&sample, Instant::now(), &coordinator).await,
                    Err(e) => warn!("Failed to sample activity: {}", e),
                }
            }

            event = events.recv() => {
                match event {
                    Some(BusEvent::MonitorsChanged(monitors)) => {
                        let removed = engine.set_monitors(&monitors, &config, Instant::now());
                        coordinator.release_removed(&removed).await;
                    }
                    Some(BusEvent::RestoreAll) => {
                        info!("Restoring all monitors");
                        if let Err(e) = coordinator.restore_everything().await {
                            error!("Restore failed: {}", e);
                        }
                        engine.reset(Instant::now());
                    }
                    Some(BusEvent::IdleStateChanged { hardware_id, state, reason }) => {
                        trace!("{} -> {:?} ({})", hardware_id, state, reason.as_str());
                    }
                    None => break,
                }
            }

            _ = sigusr1.recv() => {
                bus.publish(BusEvent::RestoreAll);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    watcher.stop().await;
    coordinator
        .restore_everything()
        .await
        .context("Failed to restore monitors on shutdown")?;

    info!("Shutdown complete");
    Ok(())
}
