//! Serial Acquire
//!
//! Data-acquisition client for the sampling firmware: waits for the device
//! to report `ready`, sends the trigger byte, waits for `transmitting` and
//! prints every `sample`/`timestamp` record until the device reports `done`.
//!
//! # Usage
//!
//! ```bash
//! # Acquire from a device (requires serial feature)
//! serial-acquire acquire -p /dev/ttyS0 -b 115200 --log capture.log
//!
//! # Run the protocol against a captured byte log
//! serial-acquire replay capture.bin
//!
//! # Write the default profile, then use an edited copy
//! serial-acquire profile init -o daq.toml
//! serial-acquire acquire --profile daq.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::thread;

use serial_acquire::dispatch::{self, ConsoleSink, Fanout, LogFileSink};
use serial_acquire::profile::DEFAULT_PROFILE;
use serial_acquire::{
    protocol, AcquisitionReport, CancelToken, FramedSession, ProtocolProfile, RecordSink,
    ReplayTransport, SessionState, Transport,
};

/// Serial Acquire
///
/// Handshake-driven serial data acquisition
#[derive(Parser)]
#[command(name = "serial-acquire")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "Serial data-acquisition client with handshake sequencing")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (debug logging, handshake hex dumps)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire records from a serial device (requires --features serial)
    #[cfg(feature = "serial")]
    Acquire {
        /// Serial port path (overrides the profile)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate (overrides the profile)
        #[arg(short, long)]
        baud: Option<u32>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run the acquisition protocol against a captured byte log
    Replay {
        /// Raw bytes as received from the device
        capture: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Protocol profile operations
    #[command(subcommand)]
    Profile(ProfileCommands),
}

#[derive(Args)]
struct OutputArgs {
    /// Protocol profile (TOML); defaults to the built-in profile
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Also write records to this file
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Disable timestamps
    #[arg(long)]
    no_timestamps: bool,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the effective profile
    Show {
        /// Profile file to show instead of the built-in one
        #[arg(long)]
        profile: Option<PathBuf>,
    },

    /// Write the built-in profile as TOML
    Init {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        #[cfg(feature = "serial")]
        Commands::Acquire { port, baud, output } => handle_acquire(port, baud, output),
        Commands::Replay { capture, output } => handle_replay(&capture, output),
        Commands::Profile(cmd) => handle_profile(cmd),
    }
}

fn load_profile(path: Option<&Path>) -> Result<ProtocolProfile> {
    match path {
        Some(path) => ProtocolProfile::load(path)
            .with_context(|| format!("Failed to load profile: {}", path.display())),
        None => Ok(DEFAULT_PROFILE.clone()),
    }
}

#[cfg(feature = "serial")]
fn handle_acquire(port: Option<String>, baud: Option<u32>, output: OutputArgs) -> Result<()> {
    let mut profile = load_profile(output.profile.as_deref())?;
    if let Some(port) = port {
        profile.serial.port = port;
    }
    if let Some(baud) = baud {
        profile.serial.baud_rate = baud;
    }
    profile.validate()?;

    let cancel = CancelToken::new();
    install_ctrlc(cancel.clone())?;

    let config = profile.transport_config();
    let session = FramedSession::open_with(&config, profile.session_options()?, cancel.clone())?;

    println!(
        "{} Connected to {} at {} baud",
        "[OK]".green().bold(),
        session.device().white().bold(),
        config.baud_rate
    );

    run_session(session, &profile, &output, cancel)
}

fn handle_replay(capture: &Path, output: OutputArgs) -> Result<()> {
    let profile = load_profile(output.profile.as_deref())?;
    let bytes = std::fs::read(capture)
        .with_context(|| format!("Failed to read capture: {}", capture.display()))?;

    println!(
        "{} Replaying {} ({} bytes)",
        "[*]".cyan().bold(),
        capture.display().to_string().white(),
        bytes.len()
    );

    let cancel = CancelToken::new();
    install_ctrlc(cancel.clone())?;

    let transport =
        ReplayTransport::from_bytes(&capture.display().to_string(), bytes).disconnect_at_end();
    let session = FramedSession::new(transport, profile.session_options()?, cancel.clone());

    run_session(session, &profile, &output, cancel)
}

/// Run the protocol on the current thread while a printer thread drains
/// the record queue.
fn run_session<T: Transport>(
    mut session: FramedSession<T>,
    profile: &ProtocolProfile,
    output: &OutputArgs,
    cancel: CancelToken,
) -> Result<()> {
    let (sink, receiver) =
        dispatch::bounded(profile.stream.queue_capacity, profile.stream.overflow);
    let mut sink = sink.with_cancel(cancel);

    let mut printer = Fanout::new().with(ConsoleSink::new(!output.no_timestamps));
    if let Some(ref path) = output.log {
        let log = LogFileSink::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        printer = printer.with(log);
        println!(
            "{} Logging to: {}",
            "[LOG]".cyan().bold(),
            path.display().to_string().white()
        );
    }

    let consumer = thread::spawn(move || -> serial_acquire::Result<usize> {
        while let Some(record) = receiver.recv() {
            printer.accept(record)?;
        }
        printer.finish()?;
        Ok(receiver.dropped())
    });

    println!("{}", "\n--- Acquisition Started ---".cyan().bold());
    println!("{}", "Press Ctrl+C to stop\n".yellow());

    let result = protocol::run(&mut session, &profile.plan(), &mut sink);
    drop(sink);

    let printed = consumer
        .join()
        .map_err(|_| anyhow!("record printer thread panicked"))?;
    let report =
        result.with_context(|| format!("Acquisition on {} failed", session.device()))?;
    let dropped = printed.context("Failed to output records")?;

    print_summary(&report, dropped, output.log.as_deref());
    Ok(())
}

/// Setup Ctrl+C signal handler
fn install_ctrlc(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\n{}", "Stopping acquisition...".yellow());
        cancel.cancel();
    })
    .with_context(|| "Failed to set Ctrl+C handler")
}

/// Print summary statistics
fn print_summary(report: &AcquisitionReport, dropped: usize, log: Option<&Path>) {
    println!("\n{}", "=".repeat(70).dimmed());
    println!("{}", "--- Acquisition Summary ---".cyan().bold());

    let state = match report.state {
        SessionState::Done => report.state.to_string().green().bold(),
        _ => report.state.to_string().yellow().bold(),
    };
    println!("Final state: {}", state);
    println!("Samples: {}", report.samples);
    println!("Timestamps: {}", report.timestamps);
    if report.unrecognized > 0 {
        println!("Unrecognized lines: {}", report.unrecognized);
    }
    println!(
        "Malformed lines: {}",
        if report.malformed > 0 {
            report.malformed.to_string().red().bold().to_string()
        } else {
            report.malformed.to_string().green().to_string()
        }
    );
    if report.idle_timeouts > 0 {
        println!("Idle timeouts: {}", report.idle_timeouts);
    }
    if dropped > 0 {
        println!("Dropped by queue: {}", dropped.to_string().red().bold());
    }
    if let Some(log) = log {
        println!("Log saved to: {}", log.display().to_string().white());
    }
    println!("{}", "=".repeat(70).dimmed());
}

fn handle_profile(cmd: ProfileCommands) -> Result<()> {
    match cmd {
        ProfileCommands::Show { profile } => {
            let loaded = load_profile(profile.as_deref())?;
            print_profile(&loaded, profile.as_deref());
        }

        ProfileCommands::Init { output } => {
            if let Some(path) = output {
                DEFAULT_PROFILE.save(&path)?;
                println!(
                    "{} Default profile written to {}",
                    "[OK]".green().bold(),
                    path.display()
                );
            } else {
                println!("{}", DEFAULT_PROFILE.to_toml()?);
            }
        }
    }

    Ok(())
}

fn print_profile(profile: &ProtocolProfile, source: Option<&Path>) {
    let title = match source {
        Some(path) => format!("Protocol Profile: {}", path.display()),
        None => "Protocol Profile: built-in".to_string(),
    };

    println!("{}", "=".repeat(70));
    println!("{}", title.cyan().bold());
    println!("{}", "=".repeat(70));

    let serial = &profile.serial;
    println!("\n{}", "Serial Settings:".white().bold());
    println!("  Port: {}", serial.port);
    println!("  Baud rate: {}", serial.baud_rate);
    println!("  Data bits: {}", serial.data_bits);
    println!("  Parity: {}", serial.parity);
    println!("  Stop bits: {}", serial.stop_bits);
    println!("  Flow control: {}", serial.flow_control);
    println!("  Driver timeout: {} ms", serial.timeout_ms);

    let handshake = &profile.handshake;
    println!("\n{}", "Handshake:".white().bold());
    println!("  1. wait for {:?}", handshake.ready);
    println!("  2. send {:?}", handshake.trigger);
    println!("  3. wait for {:?}", handshake.transmitting);
    println!("  4. stream until {:?}", handshake.done);
    println!("  Timeout per step: {} ms", handshake.timeout_ms);

    let stream = &profile.stream;
    println!("\n{}", "Streaming:".white().bold());
    println!("  Delimiter: {:?}", stream.delimiter);
    println!("  Record timeout: {} ms", stream.record_timeout_ms);
    println!("  Poll interval: {} ms", stream.poll_interval_ms);
    println!("  Write timeout: {} ms", stream.write_timeout_ms);
    println!(
        "  Queue: {} records, {} when full",
        stream.queue_capacity, stream.overflow
    );

    println!("\n{}", "=".repeat(70));
}
