// tekscope: keep a Tektronix MSO and a set of named values in step.
//
// Reads commands from stdin while the poll loop runs:
//   start | stop | exit | get <name> | set <name> <value>

use clap::Parser;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tekscope_rs::{
    connector, ByteOrder, MemoryStore, PollCycle, RunState, ScopeConfig, ScopeContext,
    SetterDispatcher, ValueStore,
};

#[derive(Parser)]
#[command(name = "tekscope")]
#[command(version)]
#[command(about = "Bridge a Tektronix MSO oscilloscope to a named-value store")]
struct Args {
    /// Instrument resource, e.g. TCPIP::10.0.0.5::5025::SOCKET, ASRL/dev/ttyUSB0::INSTR or SIM::MSO58
    #[arg(short, long, default_value = tekscope_rs::config::DEFAULT_RESOURCE)]
    resource: String,

    /// Number of analog channels
    #[arg(short, long, default_value_t = 4)]
    channels: u8,

    /// Device name used in the value prefix
    #[arg(short, long, default_value = "tektronix")]
    device: String,

    /// Device index used in the value prefix
    #[arg(short, long, default_value_t = 0)]
    index: u32,

    /// Pacing sleep between trigger polls
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Interval of the slow settings refresh
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,

    /// Instrument read timeout
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Transfer curves big-endian
    #[arg(long)]
    msb: bool,

    /// Publish waveforms in volts instead of divisions
    #[arg(long)]
    raw_volts: bool,

    /// Stay connected but wait for `start` before polling for triggers
    #[arg(long)]
    stopped: bool,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> ScopeConfig {
        ScopeConfig::default()
            .with_resource(&self.resource)
            .with_channels(self.channels)
            .with_prefix(format!("{}{}:", self.device, self.index))
            .with_poll_interval(Duration::from_millis(self.poll_ms))
            .with_refresh_interval(Duration::from_millis(self.refresh_ms))
            .with_io_timeout(Duration::from_millis(self.timeout_ms))
            .with_byte_order(if self.msb { ByteOrder::Msb } else { ByteOrder::Lsb })
            .with_normalize(!self.raw_volts)
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.init();
}

/// Handle one console line; returns what to print back.
fn console_command(
    line: &str,
    ctx: &ScopeContext,
    store: &MemoryStore,
    setters: &SetterDispatcher,
) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }
    let prefix = ctx.config.prefix.as_str();
    let strip = |name: &str| name.strip_prefix(prefix).unwrap_or(name).to_string();
    let mut words = line.trim().splitn(3, char::is_whitespace);

    match words.next()? {
        "get" => {
            let name = strip(words.next()?);
            Some(match store.entry(&name) {
                Some(entry) => format!("{prefix}{name} = {}", entry.value),
                None => format!("{prefix}{name} is not set"),
            })
        }
        "set" => {
            let name = strip(words.next()?);
            let value = words.next().unwrap_or_default();
            Some(match setters.apply(&name, value) {
                Ok(()) => format!("{prefix}{name} <- {value}"),
                Err(e) => format!("error: {e}"),
            })
        }
        "list" => Some(
            store
                .names()
                .iter()
                .map(|name| format!("{prefix}{name}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        other => match other.parse::<RunState>() {
            Ok(state) => {
                ctx.control.set_state(state);
                Some(format!("server {}", ctx.control.state()))
            }
            Err(e) => Some(format!("error: {e}")),
        },
    }
}

fn spawn_console(ctx: ScopeContext, store: Arc<MemoryStore>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let setters = SetterDispatcher::new(ctx.clone());
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Some(reply) = console_command(&line, &ctx, &store, &setters) {
                println!("{reply}");
            }
            if ctx.control.state() == RunState::Exit {
                break;
            }
        }
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    #[cfg(feature = "cpu-profiling")]
    let _tracy = tracy_client::Client::start();

    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn ValueStore> = store.clone();
    let (ctx, _simulator) = match connector::connect(args.config(), dyn_store) {
        Ok(connected) => connected,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if !args.stopped {
        ctx.control.set_state(RunState::Started);
    }

    // the console thread blocks on stdin; it is not joined on exit
    let _console = spawn_console(ctx.clone(), store);

    match PollCycle::new(ctx).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
