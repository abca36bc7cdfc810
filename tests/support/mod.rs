//! Shared helpers for the integration tests: fixture compilation and
//! traced-child lifecycle.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use proctrace::tracer::TraceEvent;

/// Compile a C fixture with debug info and without PIE (so link-time
/// addresses equal runtime addresses, like the zero static base assumes).
/// Returns `None` when no C compiler is available.
pub fn build_fixture(name: &str) -> Option<PathBuf> {
    let src = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(format!("{name}.c"));
    let out = std::env::temp_dir().join(format!("proctrace-{name}-{}", std::process::id()));

    let status = Command::new("cc")
        .args(["-g", "-O0", "-no-pie", "-pthread", "-o"])
        .arg(&out)
        .arg(&src)
        .status()
        .ok()?;

    status.success().then_some(out)
}

/// A spawned fixture process, killed on drop.
pub struct Target {
    child: Child,
}

impl Target {
    pub fn spawn(binary: &Path) -> Target {
        let child = Command::new(binary)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn fixture");
        // give the target time to exec and start its threads
        std::thread::sleep(Duration::from_millis(300));
        Target { child }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn is_alive(&self) -> bool {
        kill(self.pid(), None).is_ok()
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        let _ = kill(self.pid(), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

/// Drain events from the callback channel until `pred` matches or the
/// timeout expires.
pub fn wait_for<F>(events: &Receiver<TraceEvent>, timeout: Duration, mut pred: F) -> Option<TraceEvent>
where
    F: FnMut(&TraceEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    None
}

/// Skip a test (with a visible note) when fixtures cannot be built.
#[macro_export]
macro_rules! fixture_or_skip {
    ($name: expr) => {
        match crate::support::build_fixture($name) {
            Some(path) => path,
            None => {
                eprintln!("no C compiler available, skipping");
                return;
            }
        }
    };
}
