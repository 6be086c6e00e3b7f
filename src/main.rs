//! nl80211d - command-line front end.
//!
//! Thin wrapper over the `nl80211d` library: one-shot queries and mode
//! changes, plus a `monitor` loop that prints driver events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nl80211d::netlink::socket::NetlinkSocketFactory;
use nl80211d::os::IoctlIfaceControl;
use nl80211d::session::radio;
use nl80211d::{
    dispatch, Ctx, DriverConfig, DriverEvent, EventSink, GlobalSession, InterfaceMode, PollReactor, ReactorEvent,
    SessionRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "nl80211d")]
#[command(version = VERSION)]
#[command(about = "nl80211 control and event monitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the nl80211 family id and the event groups joined
    Families,
    /// Switch an interface to another mode (station, ap, adhoc, mesh, ...)
    Mode {
        /// Interface name
        ifname: String,
        /// Target mode
        mode: InterfaceMode,
    },
    /// Dump the current scan results of an interface
    ScanResults {
        /// Interface name
        ifname: String,
    },
    /// Attach interfaces and print their events until interrupted
    Monitor {
        /// Interface names
        #[arg(required = true)]
        ifnames: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

/// Sink that writes every event to stdout.
struct PrintSink;

impl EventSink for PrintSink {
    fn emit(&mut self, event: DriverEvent) {
        println!("{:?}", event);
    }
}

/// Everything the library operations borrow through a [`Ctx`].
struct Driver {
    global: GlobalSession,
    registry: SessionRegistry,
    reactor: PollReactor,
    os: IoctlIfaceControl,
}

impl Driver {
    fn start() -> Result<Self> {
        let config = DriverConfig::load()?;
        let factory = NetlinkSocketFactory {
            rx_buffer_size: config.rx_buffer_size,
            event_rx_buffer_size: config.event_rx_buffer_size,
        };
        let mut reactor = PollReactor::new();
        let mut global = GlobalSession::new(config, Box::new(factory));
        global
            .init(&mut reactor)
            .context("Failed to initialize nl80211 session")?;
        let os = IoctlIfaceControl::new().context("Failed to open interface control socket")?;
        Ok(Self {
            global,
            registry: SessionRegistry::new(),
            reactor,
            os,
        })
    }

    fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            global: &mut self.global,
            registry: &mut self.registry,
            reactor: &mut self.reactor,
            os: &mut self.os,
        }
    }

    fn attach(&mut self, ifname: &str) -> Result<nl80211d::RadioId> {
        radio::attach_radio(&mut self.ctx(), ifname).with_context(|| format!("Failed to attach {}", ifname))
    }

    /// Release every radio and close the global sockets.
    fn shutdown(&mut self) {
        for id in self.registry.ids() {
            if let Err(e) = radio::release_radio(&mut self.ctx(), id) {
                log::warn!("Releasing {} failed: {}", id, e);
            }
        }
        self.global.shutdown(&mut self.reactor);
    }

    fn run(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;

        while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            let events = self.reactor.wait(Duration::from_millis(500))?;
            for event in events {
                let result = match event {
                    ReactorEvent::Readable(token) => dispatch::on_readable(&mut self.ctx(), sink, token),
                    ReactorEvent::Timeout(token) => dispatch::on_timeout(&mut self.ctx(), token),
                };
                if let Err(e) = result {
                    log::warn!("Dispatch failed for {:?}: {}", event, e);
                }
            }
            if let Err(e) = dispatch::flush_backlogs(&mut self.ctx(), sink) {
                log::warn!("Flushing parked events failed: {}", e);
            }
        }
        Ok(())
    }
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("NL80211D_LOG_FILE") {
        let log_file =
            std::fs::File::create(&path).with_context(|| format!("Failed to create log file at {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Families => {
            let driver = Driver::start()?;
            if let Some(family) = driver.global.nl80211() {
                println!("{} id={}", family.name, family.id);
                for group in &family.groups {
                    println!("  group {} id={}", group.name, group.id);
                }
            }
            for (name, id) in driver.global.joined_groups() {
                println!("joined {} ({})", name, id);
            }
        }
        Commands::Mode { ifname, mode } => {
            let mut driver = Driver::start()?;
            let id = driver.attach(&ifname)?;
            let result = nl80211d::mode::set_mode(&mut driver.ctx(), id, mode);
            driver.shutdown();
            result.with_context(|| format!("Failed to switch {} to {}", ifname, mode))?;
            println!("{} is now in {} mode", ifname, mode);
        }
        Commands::ScanResults { ifname } => {
            let mut driver = Driver::start()?;
            let id = driver.attach(&ifname)?;
            let entries = radio::scan_results(&mut driver.ctx(), id);
            driver.shutdown();
            for entry in entries.with_context(|| format!("Failed to dump scan results of {}", ifname))? {
                println!(
                    "{} {:>5} MHz {:>6.1} dBm {}",
                    entry.bssid,
                    entry.freq,
                    f64::from(entry.signal_mbm) / 100.0,
                    entry.ssid().unwrap_or_default()
                );
            }
        }
        Commands::Monitor { ifnames } => {
            let mut driver = Driver::start()?;
            for ifname in &ifnames {
                let id = driver.attach(ifname)?;
                println!("Attached {} as {}", ifname, id);
            }
            log::info!("nl80211d v{} monitoring {}", VERSION, ifnames.join(", "));
            let result = driver.run(&mut PrintSink);
            println!("Shutting down...");
            driver.shutdown();
            result?;
        }
        Commands::Config => {
            let config = DriverConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
