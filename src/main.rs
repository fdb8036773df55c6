//! desync-tunnel: userspace relay with first-segment desynchronization
//!
//! The process that creates the TUN device (a VPN service, a setup script)
//! passes its file descriptor down; this binary owns the packet loop.
//!
//! # Usage
//!
//! ```bash
//! # Run over an inherited TUN descriptor
//! desync-tunnel -c /etc/desync-tunnel/config.json --tun-fd 3
//!
//! # Reload DPI settings without dropping sessions
//! kill -HUP $(pidof desync-tunnel)
//!
//! # Run with environment overrides
//! DESYNC_TUNNEL_METHOD=DISORDER desync-tunnel --tun-fd 3
//! ```

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use desync_tunnel::config::{create_default_config, load_config_with_env, EngineConfig, SettingsStore};
use desync_tunnel::tunnel::{DirectDialer, FdInterface, MarkProtector, SocketProtector, TunnelEngine};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Inherited TUN descriptor
    tun_fd: Option<RawFd>,
    /// Write a default configuration here and exit
    generate_config: Option<PathBuf>,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: PathBuf::from("/etc/desync-tunnel/config.json"),
            tun_fd: None,
            generate_config: None,
            check_config: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config_path = PathBuf::from(path);
                }
                "--tun-fd" => {
                    let fd = args.next().context("--tun-fd needs a descriptor number")?;
                    let fd: RawFd = fd.parse().with_context(|| format!("invalid descriptor: {fd}"))?;
                    if fd < 0 {
                        bail!("invalid descriptor: {fd}");
                    }
                    parsed.tun_fd = Some(fd);
                }
                "--generate-config" => {
                    let path = args.next().context("--generate-config needs a path")?;
                    parsed.generate_config = Some(PathBuf::from(path));
                }
                "--check-config" => parsed.check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("desync-tunnel v{}", desync_tunnel::VERSION);
                    std::process::exit(0);
                }
                other => {
                    print_help();
                    bail!("unknown argument: {other}");
                }
            }
        }

        Ok(parsed)
    }
}

fn print_help() {
    println!(
        r"desync-tunnel v{}

Userspace TCP/UDP relay with first-segment desynchronization.

USAGE:
    desync-tunnel [OPTIONS] --tun-fd <FD>

OPTIONS:
    -c, --config <PATH>         Configuration file path [default: /etc/desync-tunnel/config.json]
    --tun-fd <FD>               Inherited TUN file descriptor
    --generate-config <PATH>    Write a default configuration and exit
    --check-config              Validate the configuration and exit
    -h, --help                  Print help information
    -v, --version               Print version information

ENVIRONMENT:
    DESYNC_TUNNEL_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    DESYNC_TUNNEL_METHOD         Override desync method (SPLIT, SPLIT_REVERSE, DISORDER, DISORDER_REVERSE, FAKE)
    DESYNC_TUNNEL_MAX_SESSIONS   Override TCP session limit
    DESYNC_TUNNEL_ROUTING_MARK   Override SO_MARK on real sockets

SIGNALS:
    SIGHUP                       Reload DPI settings from the configuration file
    SIGINT, SIGTERM              Close all sessions and exit
",
        desync_tunnel::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &EngineConfig) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Re-read the configuration file on every SIGHUP and push the DPI section
async fn reload_on_sighup(config_path: PathBuf, engine: Arc<TunnelEngine>) -> Result<()> {
    let mut hangup = unix_signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", config_path.display());
        match reload(&config_path, &engine) {
            Ok(()) => info!("Settings reloaded"),
            Err(e) => warn!("Reload failed, keeping current settings: {:#}", e),
        }
    }
    Ok(())
}

fn reload(config_path: &Path, engine: &TunnelEngine) -> Result<()> {
    let config = load_config_with_env(config_path)?;
    engine.reload_settings(config.dpi)?;
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse()?;

    if let Some(path) = &args.generate_config {
        create_default_config(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Generated default configuration at {}", path.display());
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("failed to load configuration from {}", args.config_path.display()))?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);
    info!("desync-tunnel v{}", desync_tunnel::VERSION);
    info!("Configuration loaded from {}", args.config_path.display());

    let Some(tun_fd) = args.tun_fd else {
        bail!("--tun-fd is required");
    };
    // SAFETY: the parent process handed this descriptor to us and nothing
    // else in this process owns it
    let owned = unsafe { OwnedFd::from_raw_fd(tun_fd) };
    let iface = FdInterface::new(owned).context("failed to prepare TUN descriptor")?;

    let protector = MarkProtector::new(&config.protect);
    if protector.is_active() {
        info!(
            mark = ?config.protect.routing_mark,
            interface = ?config.protect.bind_interface,
            "Real sockets will be protected"
        );
    } else {
        warn!("No socket protection configured; relayed traffic may loop back into the tunnel");
    }
    let protector: Arc<dyn SocketProtector> = Arc::new(protector);

    let settings = Arc::new(SettingsStore::new(config.dpi.clone()));
    let engine = Arc::new(TunnelEngine::new(
        Arc::new(iface),
        settings,
        &config,
        Arc::new(DirectDialer::new(Arc::clone(&protector))),
        protector,
    ));

    let mut sigterm = unix_signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let reloader = tokio::spawn(reload_on_sighup(args.config_path.clone(), Arc::clone(&engine)));

    let loop_engine = Arc::clone(&engine);
    let mut read_loop = tokio::spawn(async move { loop_engine.run().await });

    let loop_result = tokio::select! {
        joined = &mut read_loop => Some(joined),
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            None
        }
    };

    engine.stop().await;
    reloader.abort();

    let loop_result = match loop_result {
        Some(joined) => joined,
        None => read_loop.await,
    };

    let stats = engine.stats();
    info!(
        "Final stats: {} frames in, {} frames out, {} desynced flows, {} QUIC datagrams dropped",
        stats.packets_in, stats.packets_out, stats.desynced_flows, stats.quic_dropped
    );
    info!("Shutdown complete after {:?}", start_time.elapsed());

    match loop_result.context("read loop task failed")? {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Read loop error: {}", e);
            Err(e.into())
        }
    }
}
