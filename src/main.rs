//! gpib-ctl - talk to GPIB instruments through USB-GPIB adapters

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use gpib_usb::adapters::agilent_82357a::{Agilent82357ADriver, SimulatedBackend, Simulated82357A};
use gpib_usb::bus::parse_eos_char;
use gpib_usb::logging::{init_tracing, LogFormat};
use gpib_usb::{AdapterRegistry, BusConfig, GpibConfig, Instrument, Interface};

/// Address of the instrument on the simulated bus.
const SIMULATED_INSTRUMENT_ADDRESS: u8 = 22;

#[derive(Parser)]
#[command(name = "gpib-ctl")]
#[command(about = "Talk to GPIB instruments through USB-GPIB adapters")]
#[command(version)]
struct Cli {
    /// Configuration file (default: gpib.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a simulated adapter with an HP 3457A at address 22
    #[arg(long, global = true)]
    simulate: bool,

    /// Index of the adapter to use when several are attached
    #[arg(long, global = true)]
    adapter: Option<usize>,

    /// Primary address of the controller
    #[arg(long, global = true)]
    controller_address: Option<u8>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached adapters
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
    #[command(flatten)]
    Bus(BusCommand),
}

/// Commands that need an open interface.
#[derive(Subcommand)]
enum BusCommand {
    /// Send a message to an instrument
    Write {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        termination: Termination,
        /// Message to send
        message: String,
    },
    /// Read one message from an instrument
    Read {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        termination: Termination,
    },
    /// Send a message and print the answer
    Query {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        termination: Termination,
        /// Message to send
        message: String,
    },
    /// Query repeatedly and report how many attempts failed
    Stress {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        termination: Termination,
        /// Message to send
        #[arg(default_value = "ID?")]
        message: String,
        /// Number of queries
        #[arg(short = 'n', long, default_value_t = 20)]
        count: u32,
    },
    /// Show the controller's line status
    Status,
}

#[derive(Args)]
struct Target {
    /// Primary address of the instrument
    #[arg(short, long, required_unless_present = "instrument", conflicts_with = "instrument")]
    address: Option<u8>,

    /// Instrument name from the configuration file
    #[arg(short, long)]
    instrument: Option<String>,
}

#[derive(Args)]
struct Termination {
    /// End reads on this character (one character, or \n, \r, \0)
    #[arg(long)]
    eos: Option<String>,

    /// End reads on the configured EOS character
    #[arg(long)]
    end_on_eos: bool,

    /// Do not assert EOI with the last byte of writes
    #[arg(long)]
    no_eoi: bool,

    /// Read timeout (e.g. 500ms, 2s)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

fn parse_duration(text: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(text)
}

impl Termination {
    fn apply(&self, mut bus: BusConfig) -> Result<BusConfig> {
        if let Some(eos) = &self.eos {
            bus = bus.with_eos(parse_eos_char(eos)?);
        }
        if self.end_on_eos {
            bus = bus.with_end_read_on_eos(true);
        }
        if self.no_eoi {
            bus = bus.with_send_eoi(false);
        }
        if let Some(timeout) = self.timeout {
            bus = bus.with_read_timeout(timeout);
        }
        bus.validate()?;
        Ok(bus)
    }
}

fn load_config(cli: &Cli) -> Result<GpibConfig> {
    let mut config = match &cli.config {
        Some(path) => GpibConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => GpibConfig::load().context("Failed to load configuration")?,
    };

    if let Some(address) = cli.controller_address {
        config.controller.primary_address = address;
    }
    if let Some(index) = cli.adapter {
        config.controller.adapter_index = index;
    }
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn simulated_hp3457a() -> Simulated82357A {
    Simulated82357A::new().with_instrument(SIMULATED_INSTRUMENT_ADDRESS, |msg| {
        match String::from_utf8_lossy(msg).trim() {
            "ID?" => Some(b"HP3457A\r\n".to_vec()),
            "ERR?" => Some(b"0\r\n".to_vec()),
            _ => None,
        }
    })
}

fn build_registry(cli: &Cli, config: &GpibConfig) -> Result<AdapterRegistry> {
    let options = config.adapter_options();

    if cli.simulate {
        let backend = SimulatedBackend::new().with_device(simulated_hp3457a());
        info!("Using simulated 82357A adapter");
        return Ok(AdapterRegistry::new().with_driver(Box::new(
            Agilent82357ADriver::new(Arc::new(backend)).with_options(options),
        )));
    }

    #[cfg(feature = "usb")]
    {
        let backend = gpib_usb::usb::NusbBackend::new();
        Ok(AdapterRegistry::new().with_driver(Box::new(
            Agilent82357ADriver::new(Arc::new(backend)).with_options(options),
        )))
    }

    #[cfg(not(feature = "usb"))]
    {
        Err(gpib_usb::GpibError::FeatureNotEnabled("usb".to_string()))
            .context("Real adapters need the usb feature; try --simulate")
    }
}

fn resolve_instrument(
    interface: &Interface,
    config: &GpibConfig,
    target: &Target,
    termination: &Termination,
) -> Result<Instrument> {
    let (address, bus) = match (&target.instrument, target.address) {
        (Some(name), _) => {
            let entry = config
                .instrument(name)
                .ok_or_else(|| anyhow!("No instrument named '{}' in the configuration", name))?;
            (entry.primary_address, entry.bus_config(&config.defaults)?)
        }
        (None, Some(address)) => {
            let bus = match config.instruments.iter().find(|i| i.primary_address == address) {
                Some(entry) => entry.bus_config(&config.defaults)?,
                None => config.default_bus_config()?,
            };
            (address, bus)
        }
        (None, None) => bail!("Give an instrument with --address or --instrument"),
    };

    let instrument = interface.get_instrument(address)?;
    instrument.configure(termination.apply(bus)?)?;
    debug!(address, config = ?instrument.config(), "Instrument resolved");
    Ok(instrument)
}

async fn open_interface(registry: &AdapterRegistry, config: &GpibConfig) -> Result<Interface> {
    let adapters = registry.list_adapters().context("Adapter enumeration failed")?;
    let index = config.controller.adapter_index;
    let interface = adapters.get(index).cloned().ok_or_else(|| {
        if adapters.is_empty() {
            anyhow!("No GPIB adapter found")
        } else {
            anyhow!("Adapter index {} out of range ({} attached)", index, adapters.len())
        }
    })?;

    interface
        .open(config.controller.primary_address)
        .await
        .with_context(|| format!("Failed to open {}", interface.info().describe()))?;
    Ok(interface)
}

async fn stress(instrument: &Instrument, message: &str, count: u32) -> Result<()> {
    let mut runs = 0;
    let mut fails = 0;

    while runs < count {
        match instrument.query_text(message).await {
            Ok(reply) if !reply.is_empty() => println!("{}", reply),
            Ok(_) => fails += 1,
            Err(err) if err.is_timeout() => {
                warn!(address = %instrument.address(), error = %err, "Query failed");
                fails += 1;
            }
            Err(err) => return Err(err.into()),
        }

        runs += 1;
        if runs % 10 == 0 {
            println!("Failed {}/{}", fails, runs);
        }
    }

    if runs % 10 != 0 {
        println!("Failed {}/{}", fails, runs);
    }
    Ok(())
}

fn list(registry: &AdapterRegistry, json: bool) -> Result<()> {
    let adapters = registry.list_adapters().context("Adapter enumeration failed")?;
    if json {
        let infos: Vec<_> = adapters.iter().map(|a| a.info()).collect();
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else if adapters.is_empty() {
        println!("No GPIB adapter found");
    } else {
        for (index, adapter) in adapters.iter().enumerate() {
            println!("{}: {}", index, adapter.info().describe());
        }
    }
    Ok(())
}

async fn run_command(command: &BusCommand, config: &GpibConfig, interface: &Interface) -> Result<()> {
    match command {
        BusCommand::Write {
            target,
            termination,
            message,
        } => {
            let instrument = resolve_instrument(interface, config, target, termination)?;
            instrument.write(message).await?;
        }
        BusCommand::Read {
            target,
            termination,
        } => {
            let instrument = resolve_instrument(interface, config, target, termination)?;
            let reply = instrument.read().await?;
            println!("{}", String::from_utf8_lossy(&reply).trim_end_matches(['\r', '\n']));
        }
        BusCommand::Query {
            target,
            termination,
            message,
        } => {
            let instrument = resolve_instrument(interface, config, target, termination)?;
            println!("{}", instrument.query_text(message).await?);
        }
        BusCommand::Stress {
            target,
            termination,
            message,
            count,
        } => {
            let instrument = resolve_instrument(interface, config, target, termination)?;
            stress(&instrument, message, *count).await?;
        }
        BusCommand::Status => {
            let status = interface.line_status().await?;
            println!("{}", status);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(&config.application.log_level, format);

    let command = match &cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Commands::List { json } => {
            let registry = build_registry(&cli, &config)?;
            return list(&registry, *json);
        }
        Commands::Bus(command) => command,
    };

    let registry = build_registry(&cli, &config)?;
    let interface = open_interface(&registry, &config).await?;
    let result = run_command(command, &config, &interface).await;

    if let Err(err) = interface.close().await {
        warn!(error = %err, "Failed to close interface");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bus_commands_parse_at_top_level() {
        let cli = Cli::try_parse_from(["gpib-ctl", "--simulate", "query", "-a", "22", "ID?"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Bus(BusCommand::Query { ref message, .. }) if message == "ID?"
        ));

        let cli = Cli::try_parse_from(["gpib-ctl", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Bus(BusCommand::Status)));

        let cli = Cli::try_parse_from(["gpib-ctl", "list", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));

        assert!(Cli::try_parse_from(["gpib-ctl", "read"]).is_err());
    }
}
