use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use nix::unistd::Pid;
use proctrace::tracer::manager::TraceManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Attach to a running process and print a JSON trace event for every
/// breakpoint hit or delivered signal.
#[derive(Parser)]
#[command(name = "proctrace", version)]
struct Args {
    /// Pid of the process to trace, or its name with --name
    target: String,

    /// Treat the target as a process name instead of a pid
    #[arg(long)]
    name: bool,

    /// Set a breakpoint at every function matching this name
    #[arg(long = "break-at", short = 'b')]
    break_at: Vec<String>,

    /// Require exact function name matches for --break-at
    #[arg(long)]
    exact: bool,

    /// Log verbosity: off, error, warn, info, debug or trace
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    proctrace::log::init(args.log_level);

    let pid = if args.name {
        proctrace::process::process_by_name(&args.target)?
    } else {
        Pid::from_raw(args.target.parse().context("target must be a pid")?)
    };

    let done = Arc::new(AtomicBool::new(false));
    let done_on_event = done.clone();

    let mut manager = TraceManager::attach(
        pid,
        Box::new(move |_tracer, event, error| {
            if let Some(event) = event {
                match serde_json::to_string(event) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("serialize event: {e}"),
                }
                // the event loop stops after a segfault
                if event.signal == nix::sys::signal::Signal::SIGSEGV as i32 {
                    done_on_event.store(true, Ordering::SeqCst);
                }
            }
            if let Some(error) = error {
                eprintln!("tracer error: {error}");
                done_on_event.store(true, Ordering::SeqCst);
            }
        }),
    )?;

    if !args.break_at.is_empty() {
        // code patching needs stopped threads
        manager.interrupt()?;
        for name in &args.break_at {
            let addrs = manager.set_breakpoint_at_function(name, args.exact)?;
            for addr in addrs {
                eprintln!("breakpoint set at {addr:#x} ({name})");
            }
        }
        manager.run()?;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_in_handler = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_in_handler.store(true, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    eprintln!("tracing pid {pid}, press ctrl-c to detach");
    while !interrupted.load(Ordering::SeqCst) && !done.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    if let Err(e) = manager.close() {
        // the worker tears itself down on fatal events; a closed channel
        // here just means there is nothing left to detach
        log::debug!("close: {e}");
    }
    Ok(())
}
