//! instlink - command-line host for instrument drivers
//!
//! Opens one instrument through a driver and prints every published event
//! to stdout as one JSON document per line. Logs go to stderr.

mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use inst_link::{
    list_serial_ports, spawn_driver, ConnectionState, Connector, DriverEvent, DriverHandle, Endpoint,
    InstrumentConfig, StaticRegistry, SystemConnector, VirtualPorts,
};
use inst_protocol::{InstrumentKind, Reading, Request};
use inst_sim::{attach_ft817, attach_onyx, attach_sigma25, VirtualFt817, VirtualOnyx, VirtualSigma25};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

/// How long to wait for the final status after closing
const CLOSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "instlink", version, about = "Talk to measurement instruments")]
struct Cli {
    /// Settings file (defaults to $XDG_CONFIG_HOME/instlink/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// List configured instruments
    List,
    /// Open an instrument and print live readings
    Stream {
        /// Instrument id from the settings file
        id: String,
        /// Poll period in seconds for polled instruments
        #[arg(long)]
        period: Option<f64>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
        /// Ask for the instrument's unique id once open
        #[arg(long)]
        unique_id: bool,
    },
    /// Open an instrument, send one raw command and print what comes back
    Send {
        id: String,
        /// Command text, sent as-is
        text: String,
        /// Seconds to listen for answers
        #[arg(long, default_value_t = 2.0)]
        wait: f64,
    },
    /// Stream from a simulated instrument
    Demo {
        #[arg(value_enum)]
        kind: DemoKind,
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DemoKind {
    Ft817,
    Onyx,
    Sigma25,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "instlink=info,inst_link=info,inst_protocol=info,inst_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Ports => ports(),
        Command::List => {
            list(&settings);
            Ok(())
        }
        Command::Stream {
            id,
            period,
            duration,
            unique_id,
        } => {
            let registry = settings.registry();
            let connector = Arc::new(SystemConnector::new());
            let period = period.or(settings.default_stream_period_secs);
            let session = Session::open(registry, connector, &settings, &id).await?;
            session
                .stream(period, duration.map(Duration::from_secs_f64), unique_id)
                .await
        }
        Command::Send { id, text, wait } => {
            let registry = settings.registry();
            let connector = Arc::new(SystemConnector::new());
            let session = Session::open(registry, connector, &settings, &id).await?;
            session.send(Request::Raw { text }, Duration::from_secs_f64(wait)).await
        }
        Command::Demo { kind, duration } => {
            let ports = VirtualPorts::new();
            let instrument = demo_instrument(&ports, kind);
            let id = instrument.id.clone();
            let registry = StaticRegistry::from_configs([instrument]);
            let session = Session::open(registry, Arc::new(ports), &settings, &id).await?;
            session
                .stream(Some(1.0), Some(Duration::from_secs_f64(duration)), true)
                .await
        }
    }
}

fn ports() -> Result<()> {
    let ports = list_serial_ports().context("Failed to list serial ports")?;
    let mut out = std::io::stdout().lock();
    for port in ports {
        writeln!(out, "{}", serde_json::to_string(&port)?)?;
    }
    Ok(())
}

fn list(settings: &Settings) {
    if settings.instruments.is_empty() {
        println!("No instruments configured");
        return;
    }
    for instrument in &settings.instruments {
        println!(
            "{}\t{}\t{}",
            instrument.id,
            instrument.display_name(),
            instrument.endpoint
        );
    }
}

/// Start a simulated instrument and describe how to reach it
fn demo_instrument(ports: &VirtualPorts, kind: DemoKind) -> InstrumentConfig {
    let (id, kind) = match kind {
        DemoKind::Ft817 => {
            let mut radio = VirtualFt817::new("demo-ft817");
            radio.set_frequency(14_074_000);
            radio.set_smeter(5);
            attach_ft817(ports, "demo-ft817", radio);
            ("demo-ft817", InstrumentKind::Ft817)
        }
        DemoKind::Onyx => {
            let mut counter = VirtualOnyx::new("demo-onyx", "0000-DEMO");
            counter.set_cpm(27.0, true);
            attach_onyx(ports, "demo-onyx", counter);
            ("demo-onyx", InstrumentKind::Onyx)
        }
        DemoKind::Sigma25 => {
            attach_sigma25(
                ports,
                "demo-sigma25",
                VirtualSigma25::new("demo-sigma25", 16),
                inst_sim::sigma25::DEFAULT_SPECTRUM_INTERVAL,
            );
            ("demo-sigma25", InstrumentKind::Sigma25)
        }
    };

    InstrumentConfig {
        id: id.to_string(),
        name: String::new(),
        kind,
        endpoint: Endpoint::Virtual {
            name: id.to_string(),
        },
    }
}

fn print_event(event: &DriverEvent) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string(event)?)?;
    out.flush()?;
    Ok(())
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One opened instrument
struct Session {
    id: String,
    driver: DriverHandle,
    events: mpsc::Receiver<DriverEvent>,
}

impl Session {
    /// Open `id` and wait until the port reports open
    async fn open(
        registry: StaticRegistry,
        connector: Arc<dyn Connector>,
        settings: &Settings,
        id: &str,
    ) -> Result<Self> {
        let (driver, mut events) =
            spawn_driver(Arc::new(registry), connector, settings.driver.clone());
        driver.open_port(id).await?;

        loop {
            let Some(event) = events.recv().await else {
                bail!("Driver stopped while opening {}", id);
            };
            print_event(&event)?;
            if event.portopen() == Some(true) {
                info!("{} open", id);
                break;
            }
            if let Some(Reading::OpenError {
                reason,
                description,
            }) = event.data().map(|d| &d.reading)
            {
                bail!(
                    "Failed to open {}: {}{}",
                    id,
                    reason,
                    description
                        .as_deref()
                        .map(|d| format!(" ({})", d))
                        .unwrap_or_default()
                );
            }
        }

        Ok(Self {
            id: id.to_string(),
            driver,
            events,
        })
    }

    async fn stream(
        mut self,
        period_secs: Option<f64>,
        duration: Option<Duration>,
        unique_id: bool,
    ) -> Result<()> {
        self.driver.start_live_stream(period_secs).await?;
        if unique_id {
            self.driver.send_unique_id().await?;
        }
        self.print_until(duration.map(|d| Instant::now() + d)).await?;
        self.driver.stop_live_stream().await?;
        self.close().await
    }

    async fn send(mut self, request: Request, wait: Duration) -> Result<()> {
        self.driver.output(request).await?;
        self.print_until(Some(Instant::now() + wait)).await?;
        self.close().await
    }

    /// Print events until the deadline, Ctrl-C or the port closes
    async fn print_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        bail!("Driver stopped");
                    };
                    print_event(&event)?;
                    if event.portopen() == Some(false) {
                        warn!("{} closed unexpectedly", self.id);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    return Ok(());
                }
                _ = sleep_opt(deadline) => return Ok(()),
            }
        }
    }

    /// Close the port and wait for the final status
    async fn close(mut self) -> Result<()> {
        self.driver.close_port().await?;
        let deadline = Instant::now() + CLOSE_WAIT;
        // Nothing to wait for if the port had already gone away
        let mut closed = self.driver.sync().await?.state == ConnectionState::Closed;
        while !closed {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        print_event(&event)?;
                        closed = event.portopen() == Some(false);
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    warn!("{} did not confirm close", self.id);
                    break;
                }
            }
        }
        while let Ok(event) = self.events.try_recv() {
            print_event(&event)?;
        }
        self.driver.shutdown().await?;
        info!("{} closed", self.id);
        Ok(())
    }
}
