//! `comod`: the CAPTURE core daemon (spec.md §6's CLI table). A single
//! binary; flags select a config file and verbosity. Module loading and
//! concrete sniffer drivers are external collaborators (spec.md §1) —
//! this binary wires up whatever the config names and hands control to
//! `CaptureCore`'s turn loop.

use std::path::Path;
use std::process;

use log::{error, info, warn};

use como_capture::config::{Config, SheddingMethodConfig};
use como_capture::event_loop::{install_signal_handlers, CaptureCore};
use como_capture::filter::FilterExpr;
use como_capture::loadshed::{LoadShedController, ShedMethod};
use como_capture::module::{IntervalState, ModuleCallbacks, ModuleState};
use como_capture::timestamp::Timestamp;
use como_capture::{arena::ShmArena, CaptureError};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_SHMEM: i32 = 2;
const EXIT_NO_SNIFFERS: i32 = 3;

struct Args {
    config_path: String,
    verbosity: u32,
}

fn parse_args() -> Args {
    let mut config_path = "/etc/como/comod.toml".to_string();
    let mut verbosity = 0u32;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = it.next().unwrap_or_else(|| {
                    eprintln!("-c/--config requires a path argument");
                    process::exit(EXIT_CONFIG);
                });
            }
            "-v" => verbosity += 1,
            "-q" => verbosity = 0,
            "-h" | "--help" => {
                print_usage();
                process::exit(EXIT_OK);
            }
            other => {
                eprintln!("unrecognised argument: {}", other);
                print_usage();
                process::exit(EXIT_CONFIG);
            }
        }
    }

    Args { config_path, verbosity }
}

fn print_usage() {
    eprintln!("usage: comod [-c|--config PATH] [-v] [-h|--help]");
}

/// Business logic per module is opaque (spec.md §1); absent a dlopen'd
/// driver registry, this demo binary runs every configured module
/// through a no-op callback set so the core's dispatch/flush/IPC
/// machinery is still exercised end to end.
struct NoopIntervalState;
impl IntervalState for NoopIntervalState {}

struct NoopCallbacks;
impl ModuleCallbacks for NoopCallbacks {
    fn init(&mut self, _ivl_start: Timestamp) -> Box<dyn IntervalState> {
        Box::new(NoopIntervalState)
    }

    fn capture(
        &mut self,
        _state: &mut dyn IntervalState,
        _pkt: &como_capture::packet::Packet,
        _shedding_rate: f64,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// The filter language a real SUPERVISOR compiles (spec.md Design Note
/// §9) is out of scope for this core; this binary understands only the
/// two filter-expression literals `"true"`/`"false"`, enough to exercise
/// dispatch. A real deployment replaces this with the compiled
/// `FilterExpr` tree SUPERVISOR would hand over in `ADD_MODULE`.
fn parse_trivial_filter(text: &str) -> Result<FilterExpr, String> {
    match text.trim() {
        "true" => Ok(FilterExpr::True),
        "false" => Ok(FilterExpr::False),
        other => Err(format!(
            "comod's built-in filter literal parser only understands \"true\"/\"false\", got {:?}; \
             a real deployment supplies a compiled filter tree via ADD_MODULE",
            other
        )),
    }
}

fn main() {
    let args = parse_args();

    let level = match args.verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if let Err(e) = install_signal_handlers() {
        error!("failed to install signal handlers: {}", e);
        process::exit(EXIT_CONFIG);
    }

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    let arena = match ShmArena::new(config.shmem_min, config.shmem_max) {
        Ok(a) => a,
        Err(e) => {
            error!("{}", e);
            process::exit(EXIT_SHMEM);
        }
    };

    // Sniffer drivers are external collaborators implementing the
    // interface in spec.md §4.2; this core ships none of its own, so
    // every configured entry is unresolvable here. A real deployment
    // links driver crates and resolves `driver` names against a
    // registry before reaching this point.
    for s in &config.sniffers {
        warn!(
            "sniffer {:?} (driver {:?}) not started: comod carries no driver registry, \
             sniffer drivers are external collaborators per spec.md §1",
            s.device, s.driver
        );
    }

    let num_sources = config.sniffers.len();
    if num_sources == 0 && config.inline_mode {
        error!("no sniffer could be initialised and inline_mode requires at least one");
        process::exit(EXIT_NO_SNIFFERS);
    }

    let mut loadshed = LoadShedController::new(config.cpu_freq_hz, 0x5eed);

    let mut core = match CaptureCore::new(
        arena,
        num_sources,
        false, // no sniffer in this binary advertises SHARED_BUFFER
        config.timebin(),
        config.live_threshold(),
        config.inline_mode,
        {
            for (i, m) in config.modules.iter().enumerate() {
                let method = match m.shedding_method {
                    SheddingMethodConfig::Packet => Some(ShedMethod::Packet),
                    SheddingMethodConfig::Flow => Some(ShedMethod::Flow),
                    SheddingMethodConfig::None => None,
                };
                if let Some(method) = method {
                    loadshed.register_module(i as u8, method, true);
                }
            }
            loadshed
        },
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to start capture core: {}", e);
            process::exit(EXIT_SHMEM);
        }
    };

    for (i, m) in config.modules.iter().enumerate() {
        if !Path::new(&m.binary).exists() {
            warn!("module {:?}: binary {:?} not found, reporting MODULE_FAILED", m.name, m.binary);
            core.stats.record_module_failed();
            continue;
        }

        let filter = match parse_trivial_filter(&m.filter) {
            Ok(f) => f,
            Err(reason) => {
                warn!("module {:?}: {}", m.name, reason);
                core.stats.record_module_failed();
                continue;
            }
        };

        let mut module = ModuleState::new(
            m.name.clone(),
            i as u8,
            filter,
            std::time::Duration::from_secs(m.flush_interval_secs),
            m.use_shmem,
            Box::new(NoopCallbacks),
        );
        module.status = como_capture::module::ModuleStatus::Active;
        core.modules.add(module);
        info!("module {:?} active", m.name);
    }

    info!("comod starting, {} module(s), {} sniffer(s) configured", config.modules.len(), num_sources);

    loop {
        match core.turn() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                match e {
                    CaptureError::ControlPlaneIpc { .. } => error!("fatal control-plane IPC error: {}", e),
                    other => error!("fatal error in capture core: {}", other),
                }
                process::exit(EXIT_SHMEM);
            }
        }
    }

    info!("comod exiting cleanly");
    process::exit(EXIT_OK);
}
