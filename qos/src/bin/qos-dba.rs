//! Class rebalancer daemon.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};

use qos::{
    dba::{config::DEFAULT_CONFIG_PATH, DbaStatus, QosConfig, Supervisor, SupervisorOptions, SystemState},
    logging::{self, Verbosity},
    net::detect_wan_interface,
    parse_bandwidth_kbps,
    pid::PidFile,
    status::StatusFile,
    tc::{MemoryTc, TcCli, TrafficControl},
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const DEFAULT_STATUS_FILE: &str = "/tmp/qos_dba_status.json";
const DEFAULT_PID_FILE: &str = "/var/run/qos_dba.pid";

#[derive(Debug, Parser)]
#[command(name = "qos-dba", version, about = "Dynamic bandwidth allocation between traffic classes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// UCI or TOML configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// WAN interface for both directions. Detected when the configuration names none.
    #[arg(short, long, global = true)]
    interface: Option<String>,
    /// Total bandwidth for both directions, in kbps or with a unit (`20mbit`).
    #[arg(short, long, global = true, value_parser = parse_bandwidth_kbps)]
    bandwidth: Option<u64>,
    #[arg(long, global = true, default_value = DEFAULT_STATUS_FILE)]
    status_file: PathBuf,
    #[arg(long, global = true, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,
    /// Keep allocations in memory instead of calling tc.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and apply the initial allocations.
    Init,
    /// Run the rebalancer.
    Start {
        /// Detach from the terminal first.
        #[arg(short, long)]
        daemon: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Make the running daemon re-read its configuration.
    Reload,
    /// Print the last status written by the daemon.
    Status,
    /// Run a single tick and print what it did.
    ///
    /// The tick starts from a fresh state: usage reads as zero and no class has been HIGH or LOW
    /// long enough yet. It therefore almost never reports an adjustment; it shows the resolved
    /// configuration and the rates the link is shaped to.
    Once,
}

impl Cli {
    fn load_config(&self) -> Result<QosConfig> {
        let mut config = QosConfig::load(&self.config)?;

        if let Some(interface) = &self.interface {
            config = config.with_interface(interface.as_str());
        } else if config.needs_interface() {
            let interface = detect_wan_interface().ok_or("no WAN interface found, pass --interface")?;
            tracing::info!(%interface, "using detected WAN interface");
            config.fill_interface(&interface);
        }
        if let Some(kbps) = self.bandwidth {
            config = config.with_total_bandwidth(kbps);
        }
        Ok(config)
    }

    fn status_file(&self) -> StatusFile {
        StatusFile::new(&self.status_file)
    }
}

/// The tc adapter for `state`. Dry runs get an in-memory one provisioned with the configured
/// allocations.
fn traffic_control(state: &SystemState, dry_run: bool) -> Arc<dyn TrafficControl> {
    if !dry_run {
        return Arc::new(TcCli::new());
    }

    let tc = MemoryTc::new();
    for link in state.links() {
        if let Some(root) = &link.root {
            tc.provision(root, link.total_kbps);
        }
        for class in &link.classes {
            tc.provision(&class.target, class.current_kbps);
        }
    }
    Arc::new(tc)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, false));

    match cli.command {
        Command::Init => init(&cli),
        Command::Start { daemon } => start(&cli, daemon),
        Command::Stop => signal_daemon(&cli, Signal::SIGTERM),
        Command::Reload => signal_daemon(&cli, Signal::SIGHUP),
        Command::Status => status(&cli),
        Command::Once => once(&cli),
    }
}

fn init(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    let mut state = SystemState::new(&config)?;
    let tc = traffic_control(&state, cli.dry_run);

    let failed = state.reset_allocations(&*tc);
    if failed > 0 {
        tracing::warn!(failed, "some allocations could not be applied");
    }

    let snapshot = state.snapshot();
    cli.status_file().write(&snapshot)?;
    println!("{snapshot}");
    Ok(())
}

fn once(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    let mut state = SystemState::new(&config)?;
    let tc = traffic_control(&state, cli.dry_run);

    let report = state.tick(&*tc, std::time::Instant::now());
    if report.is_empty() {
        println!("No adjustments");
    }
    for adjustment in &report.adjustments {
        println!(
            "{} {:?}: {} -> {} ({} kbps)",
            adjustment.direction, adjustment.kind, adjustment.from, adjustment.to, adjustment.kbps
        );
    }
    println!("{}", state.snapshot());
    Ok(())
}

fn status(cli: &Cli) -> Result<()> {
    match cli.status_file().read::<DbaStatus>()? {
        Some(status) => println!("{status}"),
        None => println!("No status at {}, is qos-dba running?", cli.status_file.display()),
    }
    Ok(())
}

fn signal_daemon(cli: &Cli, signal: Signal) -> Result<()> {
    if !PidFile::new(&cli.pid_file).signal(signal)? {
        println!("qos-dba is not running");
    }
    Ok(())
}

fn start(cli: &Cli, daemon: bool) -> Result<()> {
    let pid_file = PidFile::new(&cli.pid_file);
    if let Some(pid) = pid_file.running() {
        println!("qos-dba is already running (pid {pid})");
        return Ok(());
    }

    // validate before detaching so errors reach the terminal
    let config = cli.load_config()?;
    let state = SystemState::new(&config)?;

    if daemon {
        nix::unistd::daemon(false, false)?;
    }
    pid_file.write()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run(cli, state));

    pid_file.remove()?;
    result
}

async fn run(cli: &Cli, state: SystemState) -> Result<()> {
    let tc = traffic_control(&state, cli.dry_run);
    let failed = state.apply_allocations(&*tc);
    if failed > 0 {
        tracing::warn!(failed, "some allocations could not be applied");
    }

    let options = SupervisorOptions::default().with_status_file(cli.status_file());
    let supervisor = Supervisor::spawn(state, tc, options);
    let handle = supervisor.handle();

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
            _ = hangup.recv() => {
                tracing::info!("reloading configuration");
                let reloaded = match cli.load_config() {
                    Ok(config) => handle.reload(config).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                if let Err(e) = reloaded {
                    tracing::error!(error = %e, "reload failed, keeping the current configuration");
                }
            }
        }
    }

    handle.stop().await?;
    supervisor.join().await?;
    Ok(())
}
