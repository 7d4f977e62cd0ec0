//! CAN Telemetry CLI Application
//!
//! Command-line front end for the can-telemetry-pipeline library:
//! - `run` receives Cannelloni datagrams over UDP, decodes them against a DBC file and
//!   writes signal rows as JSON lines
//! - `generate` sends synthetic Cannelloni traffic for testing a running receiver

use anyhow::{Context, Result};
use can_telemetry_pipeline::{
    load_dbc_or_empty, CancellationToken, CannelloniCodec, CannelloniDecoder, Connector,
    Decoder, JsonLinesSink, Pipeline, ProcessorStage, RawCanFrame, ReorderStage, RowMapper,
    SinkHandler, SourceStage, TransportMessage, UdpSource,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rand::Rng;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;

use config::AppConfig;

/// CAN identifier of the generated integer frame
const GENERATED_INT_FRAME_ID: u32 = 1000;
/// CAN identifier of the generated enum frame
const GENERATED_ENUM_FRAME_ID: u32 = 2000;

/// CAN Telemetry - Decode CAN-over-UDP traffic into signal rows
#[derive(Parser, Debug)]
#[command(name = "can-telemetry")]
#[command(about = "Receive Cannelloni CAN traffic and decode it into signal rows", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the telemetry pipeline (default)
    Run,

    /// Send synthetic Cannelloni traffic
    Generate(GenerateArgs),
}

#[derive(ClapArgs, Debug)]
struct GenerateArgs {
    /// Destination address (default: the configured UDP address)
    #[arg(short, long, value_name = "ADDR")]
    target: Option<SocketAddr>,

    /// Interval between datagrams in milliseconds
    #[arg(short, long, default_value_t = 10)]
    interval_ms: u64,

    /// Frame pairs per datagram
    #[arg(long, default_value_t = 10)]
    pairs: usize,

    /// Stop after this many datagrams
    #[arg(long, value_name = "COUNT")]
    count: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using pipeline library v{}", can_telemetry_pipeline::VERSION);

    let config = AppConfig::load(args.config.as_deref())?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, shutting down");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    match args.command {
        None | Some(Command::Run) => run_pipeline(&config, &cancel),
        Some(Command::Generate(generate)) => run_generator(&config, &generate, &cancel),
    }
}

/// Build the stage chain from the configuration and run it until interrupted
fn run_pipeline(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    log::info!("Starting {}", config.service_name);

    let size = config.connector_size;
    let udp_to_cannelloni = Arc::new(Connector::new(size));
    let cannelloni_to_rob = Arc::new(Connector::new(size));
    let rob_to_can = Arc::new(Connector::new(size));
    let can_to_rows = Arc::new(Connector::new(size));
    let rows_to_sink = Arc::new(Connector::new(size));

    let database = load_dbc_or_empty(Some(config.can.dbc_file_path.as_path()));
    let sink = match &config.sink.output_path {
        Some(path) => JsonLinesSink::file(path),
        None => JsonLinesSink::stdout(),
    };

    let mut pipeline = Pipeline::new();
    pipeline.add_stage(SourceStage::new(
        "udp",
        UdpSource::new(config.udp_addr()?),
        Arc::clone(&udp_to_cannelloni),
    ));
    pipeline.add_stage(ProcessorStage::new(
        CannelloniDecoder::new(),
        udp_to_cannelloni,
        Arc::clone(&cannelloni_to_rob),
        config.cannelloni.to_stage_config("cannelloni"),
    ));
    pipeline.add_stage(ReorderStage::new(
        cannelloni_to_rob,
        Arc::clone(&rob_to_can),
        config.reorder_config(),
    ));
    pipeline.add_stage(ProcessorStage::new(
        Decoder::with_database(database),
        rob_to_can,
        Arc::clone(&can_to_rows),
        config.can.stage.to_stage_config("can"),
    ));
    pipeline.add_stage(ProcessorStage::new(
        RowMapper::new(),
        can_to_rows,
        Arc::clone(&rows_to_sink),
        config.rows.to_stage_config("rows"),
    ));
    pipeline.add_stage(ProcessorStage::sink(
        SinkHandler::new(sink),
        rows_to_sink,
        config.sink.stage.to_stage_config("sink"),
    ));

    pipeline.init().context("Failed to initialize pipeline")?;
    pipeline.run(cancel)?;
    pipeline.close();

    log::info!("{} stopped", config.service_name);
    Ok(())
}

/// One synthetic datagram: `pairs` copies of an integer frame and an enum frame
fn generated_message(tick: u64, pairs: usize, rng: &mut impl Rng) -> TransportMessage {
    let int_value: u8 = rng.gen_range(0..255);
    let enum_value: u8 = rng.gen_range(0..3);

    let int_frame = RawCanFrame::new(GENERATED_INT_FRAME_ID, &[int_value; 8]);
    let enum_frame = RawCanFrame::new(GENERATED_ENUM_FRAME_ID, &[enum_value; 4]);

    let mut message = TransportMessage::new((tick % 256) as u8);
    for _ in 0..pairs {
        message.push(int_frame);
        message.push(enum_frame);
    }
    message
}

/// Send generated datagrams until interrupted or `count` is reached
fn run_generator(config: &AppConfig, args: &GenerateArgs, cancel: &CancellationToken) -> Result<()> {
    let target = match args.target {
        Some(target) => target,
        None => config.udp_addr()?,
    };
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind_addr).context("Failed to bind generator socket")?;
    let interval = Duration::from_millis(args.interval_ms);
    let mut rng = rand::thread_rng();

    log::info!("Sending generated traffic to {} every {:?}", target, interval);

    let mut tick: u64 = 0;
    while args.count.map_or(true, |count| tick < count) {
        let message = generated_message(tick, args.pairs, &mut rng);
        let datagram = CannelloniCodec::encode(&message)?;
        if let Err(e) = socket.send_to(&datagram, target) {
            log::warn!("Failed to send datagram {}: {}", tick, e);
        }
        tick += 1;

        if cancel.wait_timeout(interval) {
            break;
        }
    }

    log::info!("Sent {} datagrams", tick);
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
