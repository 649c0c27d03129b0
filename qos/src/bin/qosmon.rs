//! Latency-driven link capacity daemon.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use qos::{
    logging::{self, Verbosity},
    mon::{
        config::DEFAULT_CLASSID,
        icmp::{resolve_ipv4, IcmpProber},
        ControlFlags, Controller, Monitor, MonitorConfig,
    },
    net::detect_wan_interface,
    status::StatusFile,
    tc::{ClassId, MemoryTc, TcCli, TrafficControl},
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const DEFAULT_STATUS_FILE: &str = "/tmp/qosmon.status";

#[derive(Debug, Parser)]
#[command(name = "qosmon", version, about = "Keeps link latency in check by steering the link rate ceiling")]
struct Cli {
    /// Milliseconds between probes (100-2000).
    ping_interval_ms: u64,
    /// Host to probe.
    target: String,
    /// Provisioned link bandwidth in kbps.
    bandwidth_kbps: u64,
    /// Ping limit in milliseconds. Same as `-p`.
    legacy_ping_limit_ms: Option<u64>,
    /// Run in the background.
    #[arg(short = 'b')]
    background: bool,
    /// Add the ping limit to the calibrated latency and run in the minimum-RTT mode.
    #[arg(short = 'a')]
    auto_entitlement: bool,
    /// Skip calibration and start with seeded values.
    #[arg(short = 's')]
    skip_calibration: bool,
    /// Seed latency in milliseconds, with `-s`.
    #[arg(short = 't', value_name = "MS")]
    seed_ping_ms: Option<u64>,
    /// Seed ceiling in kbps, with `-s`.
    #[arg(short = 'l', value_name = "KBPS")]
    seed_limit_kbps: Option<u64>,
    /// Ping limit in milliseconds.
    #[arg(short = 'p', value_name = "MS")]
    ping_limit_ms: Option<u64>,
    /// Initial maximum ping in milliseconds.
    #[arg(short = 'm', value_name = "MS")]
    max_ping_ms: Option<u64>,
    /// WAN interface. Detected from the default route when omitted.
    #[arg(short = 'i')]
    interface: Option<String>,
    /// HTB class holding the link ceiling.
    #[arg(long, default_value_t = DEFAULT_CLASSID)]
    classid: ClassId,
    #[arg(short = 'v')]
    verbose: bool,
    #[arg(short = 'd')]
    debug: bool,
    #[arg(long, default_value = DEFAULT_STATUS_FILE)]
    status_file: PathBuf,
    /// Shape an in-memory link instead of calling tc.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn monitor_config(&self) -> Result<MonitorConfig> {
        let interface = match &self.interface {
            Some(interface) => interface.clone(),
            None => detect_wan_interface().ok_or("no WAN interface found, pass -i")?,
        };
        let ms = Duration::from_millis;

        let config = MonitorConfig {
            classid: self.classid,
            ping_limit: self.ping_limit_ms.or(self.legacy_ping_limit_ms).map(ms),
            auto_entitlement: self.auto_entitlement,
            skip_calibration: self.skip_calibration,
            seed_ping: self.seed_ping_ms.map(ms),
            seed_limit_kbps: self.seed_limit_kbps,
            max_ping: self.max_ping_ms.map(ms),
            ..MonitorConfig::new(ms(self.ping_interval_ms), &self.target, self.bandwidth_kbps, interface)
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.debug));

    let config = cli.monitor_config()?;
    let target = resolve_ipv4(&config.target)?;
    let prober = IcmpProber::new(target)?;

    if cli.background {
        nix::unistd::daemon(false, false)?;
    }

    let tc: Arc<dyn TrafficControl> = if cli.dry_run {
        let tc = MemoryTc::new();
        tc.provision(&config.link_target(), config.total_kbps);
        Arc::new(tc)
    } else {
        Arc::new(TcCli::new())
    };

    tracing::info!(%target, interface = %config.interface, total_kbps = config.total_kbps, "starting");
    let monitor =
        Monitor::new(Controller::new(config), prober, tc).with_status_file(StatusFile::new(&cli.status_file));
    let flags = monitor.flags();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let status = runtime.block_on(async move {
        let signals = tokio::spawn(forward_signals(Arc::clone(&flags)));
        let status = tokio::task::spawn_blocking(move || monitor.run()).await;
        signals.abort();
        status
    })?;

    println!("{status}");
    Ok(())
}

/// Turns signals into monitor requests until the monitor is told to stop.
async fn forward_signals(flags: Arc<ControlFlags>) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut reset = signal(SignalKind::user_defined1())?;
    let mut toggle = signal(SignalKind::user_defined2())?;

    while !flags.terminated() {
        tokio::select! {
            _ = terminate.recv() => flags.terminate(),
            _ = interrupt.recv() => flags.terminate(),
            _ = reset.recv() => flags.reset(),
            _ = toggle.recv() => flags.toggle_safe_mode(),
        }
    }
    Ok(())
}
