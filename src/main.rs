use std::ffi::CString;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use warden::control::ControllerSet;
use warden::fdtab::FdTable;
use warden::logging::LogControl;
use warden::options::PoolSpec;
use warden::service::ServiceTable;
use warden::signals::{self, SignalQueue};
use warden::supervisor::{Core, Supervisor};
use warden::term::Terminator;

#[derive(Parser)]
#[command(name = "warden", version, about = "process supervisor usable as init")]
struct Args {
    /// Treat stdin/stdout as a controller
    #[arg(long)]
    stdin: bool,

    /// Run commands from this file before entering the main loop
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen on a unix socket for additional controllers
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Preallocate the service table
    #[arg(long, value_name = "N:BYTES")]
    service_pool: Option<PoolSpec>,

    /// Preallocate the named-fd table
    #[arg(long, value_name = "N:BYTES")]
    fd_pool: Option<PoolSpec>,

    /// Preallocate the controller table
    #[arg(long, value_name = "N:BYTES")]
    controller_pool: Option<PoolSpec>,

    /// Exec this command line instead of exiting
    #[arg(long, value_name = "ARGV", num_args = 1.., allow_hyphen_values = true)]
    exec_on_exit: Vec<String>,

    /// Pre-arm the failsafe with a code
    #[arg(long, value_name = "CODE")]
    failsafe: Option<String>,

    /// Initial log filter (off, error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log = LogControl::init(args.log_level);
    let pid1 = nix::unistd::getpid().as_raw() == 1;
    if pid1 {
        tracing::info!("running as init");
    }

    let mut term = Terminator::new(pid1, args.failsafe.clone());
    term.exec_on_exit = args.exec_on_exit.clone();

    // an internal bug must not dump PID 1 back into the kernel; hand off
    // to the armed replacement instead
    if pid1 && !args.exec_on_exit.is_empty() {
        let argv = args.exec_on_exit.clone();
        std::panic::set_hook(Box::new(move |info| {
            eprintln!("warden panic: {info}");
            let cargv: Vec<CString> = argv
                .iter()
                .filter_map(|a| CString::new(a.as_str()).ok())
                .collect();
            if !cargv.is_empty() {
                let _ = nix::unistd::execvp(&cargv[0], &cargv);
            }
        }));
    }

    let signals = SignalQueue::new().context("creating signal pipe")?;
    signals::trap_signals().context("trapping signals")?;

    let core = Core {
        services: ServiceTable::new(
            args.service_pool.map(|p| p.count),
            args.service_pool.map(|p| p.bytes),
        ),
        fds: FdTable::init(args.fd_pool.map(|p| p.count)).context("populating fd table")?,
        signals,
        term,
        log,
    };
    let ctls = ControllerSet::new(args.controller_pool.map(|p| p.count));

    let listener = match &args.socket {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("binding control socket {}", path.display()))?;
            listener.set_nonblocking(true)?;
            tracing::info!("listening on {}", path.display());
            Some(listener)
        }
        None => None,
    };

    let mut sup = Supervisor::new(core, ctls, listener);
    if args.stdin {
        sup.add_stdio_controller()
            .context("attaching stdio controller")?;
    }
    if let Some(config) = &args.config {
        sup.feed_config(config)
            .with_context(|| format!("reading config {}", config.display()))?;
    }

    let code = sup.run()?;
    let code = sup.core.term.exec_or(code);
    std::process::exit(code);
}
