//! The trace manager: a dedicated worker thread that owns the tracer for
//! the whole session and serializes external requests against the event
//! poll loop.
//!
//! ptrace demands that every request comes from the kernel thread that
//! attached, so the tracer never leaves the worker. Consumers talk to it
//! through a request channel; each request is executed between event polls
//! and answered on its own reply channel.

use crate::error::{Error, Result};
use crate::tracer::{TraceEvent, Tracer};
use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

const EVENT_POLL: Duration = Duration::from_millis(100);

type Request = Box<dyn FnOnce(&mut Tracer) + Send>;

/// Invoked on the worker thread for every trace event (or tracer error).
/// Consumers must not submit new requests from inside the callback.
pub type EventCallback = Box<dyn FnMut(&Tracer, Option<&TraceEvent>, Option<&Error>) + Send>;

pub struct TraceManager {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    pid: Pid,
}

impl TraceManager {
    /// Attach to `pid` on a fresh worker thread and start the event loop.
    /// Returns once the tracer is attached and running.
    pub fn attach(pid: Pid, on_event: EventCallback) -> Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = std::thread::Builder::new()
            .name(format!("trace-{pid}"))
            .spawn(move || worker_loop(pid, req_rx, ready_tx, on_event))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                requests: Some(req_tx),
                worker: Some(worker),
                pid,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ManagerClosed),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Execute a closure on the tracer inside the worker thread and wait
    /// for its result.
    fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tracer) -> Result<T> + Send + 'static,
    {
        let requests = self.requests.as_ref().ok_or(Error::ManagerClosed)?;

        let (reply_tx, reply_rx) = mpsc::channel::<Result<T>>();
        requests
            .send(Box::new(move |tracer| {
                let _ = reply_tx.send(f(tracer));
            }))
            .map_err(|_| Error::ManagerClosed)?;

        reply_rx.recv().map_err(|_| Error::ManagerClosed)?
    }

    pub fn set_breakpoint(&self, addr: usize) -> Result<()> {
        self.submit(move |tracer| tracer.set_breakpoint(addr))
    }

    pub fn set_breakpoint_at_function(&self, name: &str, exact: bool) -> Result<Vec<usize>> {
        let name = name.to_string();
        self.submit(move |tracer| tracer.set_breakpoint_at_function(&name, exact))
    }

    pub fn remove_breakpoint(&self, addr: usize) -> Result<()> {
        self.submit(move |tracer| tracer.remove_breakpoint(addr))
    }

    pub fn run(&self) -> Result<()> {
        self.submit(|tracer| tracer.run())
    }

    pub fn interrupt(&self) -> Result<()> {
        self.submit(|tracer| tracer.interrupt())
    }

    pub fn pc(&self) -> Result<usize> {
        self.submit(|tracer| tracer.pc())
    }

    pub fn registers(&self) -> Result<std::collections::BTreeMap<String, String>> {
        self.submit(|tracer| tracer.registers())
    }

    pub fn read_memory(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.submit(move |tracer| {
            let mut buf = vec![0u8; len];
            tracer.read_memory(addr, &mut buf)?;
            Ok(buf)
        })
    }

    pub fn backtrace(&self, max_frames: usize) -> Result<Vec<crate::reading::BacktraceFrame>> {
        self.submit(move |tracer| tracer.backtrace(max_frames))
    }

    pub fn globals(&self) -> Result<Vec<crate::reading::Reading>> {
        self.submit(|tracer| {
            let pc = tracer.pc()?;
            tracer.globals(pc)
        })
    }

    /// Detach the tracer and stop the worker. Further requests fail with
    /// [`Error::ManagerClosed`].
    pub fn close(&mut self) -> Result<()> {
        let result = self.submit(|tracer| tracer.detach());
        self.requests = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        result
    }
}

impl Drop for TraceManager {
    fn drop(&mut self) {
        if self.requests.is_some() {
            let _ = self.close();
        }
    }
}

fn worker_loop(
    pid: Pid,
    requests: Receiver<Request>,
    ready: Sender<Result<()>>,
    mut on_event: EventCallback,
) {
    let mut tracer = match Tracer::new(pid) {
        Ok(tracer) => tracer,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = tracer.run() {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        match requests.try_recv() {
            Ok(request) => {
                request(&mut tracer);
                // a request may have torn the session down; never touch the
                // target again after detach
                if tracer.is_detached() {
                    return;
                }
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                debug!(target: "tracer", "request channel closed, stopping worker");
                let _ = tracer.detach();
                return;
            }
        }

        match tracer.wait_for_event(EVENT_POLL) {
            Ok(None) => {}
            Ok(Some(event)) => {
                let fatal = event.signal == Signal::SIGSEGV as i32;
                on_event(&tracer, Some(&event), None);
                if fatal {
                    debug!(target: "tracer", "target delivered SIGSEGV, stopping worker");
                    if let Err(e) = tracer.detach() {
                        warn!(target: "tracer", "detach after SIGSEGV: {e}");
                    }
                    return;
                }
            }
            Err(e) => {
                on_event(&tracer, None, Some(&e));
                if let Err(e) = tracer.detach() {
                    warn!(target: "tracer", "detach after error: {e}");
                }
                return;
            }
        }
    }
}
