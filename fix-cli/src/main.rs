//! Fixfinder command line tool
//!
//! Finds NMEA location receivers on serial, Bluetooth and multiplexer ports,
//! remembers how reliable each one has been, and opens the best of them.

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fix_detect::{
    JsonProfileStore, MemoryProfileStore, PortScanner, ProfileStore, TransportEnumerator,
};
use fix_locator::{DetectionEvent, Locator, LocatorConfig, LocatorError};
use fix_sim::Scenario;
use settings::Settings;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fixfinder", version, about = "Locate NMEA location devices")]
struct Cli {
    /// Probe a simulated desk instead of real ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Settings file (defaults to the XDG config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Reliability profile store (defaults to the XDG config directory)
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one detection session and list the confirmed devices
    Detect {
        /// Stop at the first confirmed device
        #[arg(long)]
        first: bool,
    },
    /// Open the best device and print what it sends
    Acquire {
        /// Sentences to print before exiting
        #[arg(long, default_value_t = 5)]
        lines: usize,
    },
    /// List stored reliability profiles
    Profiles,
    /// Forget stored profiles
    Forget {
        /// Only forget this address
        address: Option<String>,
    },
    /// Show the settings file
    Settings {
        /// Overwrite the file with defaults
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fixfinder=info,fix_protocol=info,fix_detect=info,fix_locator=info,fix_sim=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let settings_path = match &cli.settings {
        Some(path) => path.clone(),
        None => Settings::settings_path().context("Could not determine settings path")?,
    };
    let settings = Settings::load_from(&settings_path)?;

    match cli.command {
        Command::Settings { reset } => show_settings(&settings_path, settings, reset),
        Command::Profiles => list_profiles(&open_store(cli.profiles.as_deref())?),
        Command::Forget { address } => forget(&open_store(cli.profiles.as_deref())?, address),
        Command::Detect { first } => {
            let mut config =
                LocatorConfig::try_from(&settings).context("Invalid settings")?;
            config.only_first_device_detected |= first;
            let locator = build_locator(config, cli.simulate, cli.profiles.as_deref())?;
            detect(&locator).await
        }
        Command::Acquire { lines } => {
            let config = LocatorConfig::try_from(&settings).context("Invalid settings")?;
            let locator = build_locator(config, cli.simulate, cli.profiles.as_deref())?;
            acquire(&locator, lines).await
        }
    }
}

fn open_store(path: Option<&Path>) -> Result<JsonProfileStore> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Settings::profiles_path().context("Could not determine profile store path")?,
    };
    JsonProfileStore::open(&path)
        .with_context(|| format!("Failed to open profile store {}", path.display()))
}

fn build_locator(config: LocatorConfig, simulate: bool, profiles: Option<&Path>) -> Result<Locator> {
    let transports: Vec<Arc<dyn TransportEnumerator>>;
    let store: Arc<dyn ProfileStore>;
    if simulate {
        tracing::info!("Using the simulated device layout");
        transports = Scenario::demo().transports;
        store = Arc::new(MemoryProfileStore::new());
    } else {
        transports = vec![Arc::new(PortScanner::new())];
        store = Arc::new(open_store(profiles)?);
    }

    Ok(Locator::new(config, transports, store)?)
}

async fn detect(locator: &Locator) -> Result<()> {
    let mut events = locator.subscribe();
    if !locator.begin_detection() {
        bail!("A detection session is already running");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                println!("Canceling detection...");
                if !locator.cancel_detection().await {
                    tracing::warn!("Not every device acknowledged cancellation");
                }
                continue;
            }
        };

        match event {
            Ok(event) => {
                print_event(&event);
                if matches!(
                    event,
                    DetectionEvent::DetectionCompleted { .. } | DetectionEvent::DetectionCanceled { .. }
                ) {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} detection event(s)", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    let confirmed = locator.confirmed_devices();
    if confirmed.is_empty() {
        println!("No location device found");
        return Ok(());
    }

    println!();
    println!("Confirmed devices, best first:");
    for (rank, device) in confirmed.iter().enumerate() {
        let profile = device.profile();
        println!(
            "  {}. {} - {} ({}) at {} baud",
            rank + 1,
            device.address(),
            device.friendly_name(),
            device.kind(),
            profile
                .last_success_baud
                .map_or_else(|| "?".to_string(), |b| b.to_string()),
        );
    }
    Ok(())
}

fn print_event(event: &DetectionEvent) {
    match event {
        DetectionEvent::DetectionStarted { session } => println!("Session {} started", session),
        DetectionEvent::DeviceDiscovered {
            address,
            kind,
            friendly_name,
        } => println!("  found {} - {} ({})", address, friendly_name, kind),
        DetectionEvent::AttemptStarted { address } => println!("  probing {}", address),
        DetectionEvent::AttemptFailed { address, cause } => {
            println!("  {} failed: {}", address, cause)
        }
        DetectionEvent::DeviceConfirmed { address, baud_rate } => match baud_rate {
            Some(baud) => println!("  {} confirmed at {} baud", address, baud),
            None => println!("  {} confirmed", address),
        },
        DetectionEvent::DetectionCanceled { session } => println!("Session {} canceled", session),
        DetectionEvent::DetectionCompleted { session, confirmed } => {
            println!("Session {} completed, {} device(s) confirmed", session, confirmed)
        }
    }
}

async fn acquire(locator: &Locator, lines: usize) -> Result<()> {
    let device = match locator.acquire_connection().await {
        Ok(device) => device,
        Err(LocatorError::NotFound) => bail!("No location device found"),
        Err(e) => return Err(e).context("Failed to acquire a location device"),
    };

    println!(
        "Connected to {} - {} at {} baud",
        device.address(),
        device.friendly_name(),
        device
            .connection_baud()
            .map_or_else(|| "?".to_string(), |b| b.to_string()),
    );

    let Some(link) = device.take_connection() else {
        bail!("Connection to {} closed before it could be read", device.address());
    };

    let read_timeout = locator.config().sniffer.read_timeout * 5;
    let mut reader = BufReader::new(link).lines();
    for _ in 0..lines {
        match timeout(read_timeout, reader.next_line()).await {
            Ok(Ok(Some(line))) => println!("{}", line.trim_end()),
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e).context("Failed to read from device"),
            Err(_) => {
                println!("(device went quiet)");
                break;
            }
        }
    }
    Ok(())
}

fn list_profiles(store: &JsonProfileStore) -> Result<()> {
    let entries = store.entries();
    if entries.is_empty() {
        println!("No profiles in {}", store.path().display());
        return Ok(());
    }

    println!("Profiles in {}:", store.path().display());
    for (address, profile) in entries {
        let ratio = profile
            .success_ratio()
            .map_or_else(|| "untried".to_string(), |r| format!("{:.0}%", r * 100.0));
        let baud = profile
            .last_success_baud
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        println!(
            "  {} - {}: {} ok, {} failed ({}), last baud {}",
            address, profile.friendly_name, profile.success_count, profile.fail_count, ratio, baud
        );
    }
    Ok(())
}

fn forget(store: &JsonProfileStore, address: Option<String>) -> Result<()> {
    match address {
        Some(address) => {
            store
                .delete(&address)
                .with_context(|| format!("Failed to forget {}", address))?;
            println!("Forgot {}", address);
        }
        None => {
            store.clear().context("Failed to clear profiles")?;
            println!("Forgot every device");
        }
    }
    Ok(())
}

fn show_settings(path: &Path, settings: Settings, reset: bool) -> Result<()> {
    let settings = if reset {
        let defaults = Settings::default();
        defaults.save_to(path)?;
        println!("Reset {}", path.display());
        defaults
    } else {
        settings
    };

    println!("Settings file: {}", path.display());
    println!(
        "{}",
        serde_json::to_string_pretty(&settings).context("Failed to serialize settings")?
    );
    Ok(())
}
