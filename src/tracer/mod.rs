//! The tracer: owns the debug database, the breakpoint table and the
//! per-thread ptrace state, and turns wait events into structured trace
//! events.

pub mod manager;

use crate::arch::TRAP_SIZE;
use crate::breakpoint::Breakpoint;
use crate::dwarf::unwind::StackIterator;
use crate::dwarf::DebugData;
use crate::error::{Error, Result};
use crate::process::{self, Thread};
use crate::reading::{BacktraceFrame, Reading};
use crate::register::DwarfRegisters;
use crate::weak_error;
use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Default backtrace depth of a trace event.
const MAX_BACKTRACE_FRAMES: usize = 8;

/// Produced on every breakpoint hit or delivered signal.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    #[serde(skip)]
    pub status: WaitStatus,
    pub signal: i32,
    pub pid: i32,
    pub tid: i32,
    #[serde(rename = "breakpoint")]
    pub is_breakpoint: bool,
    pub pc: String,
    #[serde(rename = "regs")]
    pub registers: BTreeMap<String, String>,
    pub globals: Vec<Reading>,
    pub backtrace: Vec<BacktraceFrame>,
}

/// Traces one running process and all of its kernel threads.
pub struct Tracer {
    prog_name: String,
    pid: Pid,
    /// The currently stopped thread, if any.
    tid: Option<Thread>,
    debug_data: DebugData,
    breakpoints: HashMap<usize, Breakpoint>,
    /// Signal delivered on the next continue.
    deliver_signal: Signal,
    detached: bool,
}

impl Tracer {
    /// Load debug data for the process and attach to all of its threads.
    pub fn new(pid: Pid) -> Result<Self> {
        let prog_name =
            process::process_name(pid).map_err(|_| Error::ProcessNotFound(pid))?;

        let exe = PathBuf::from(format!("/proc/{pid}/exe"));
        let mut debug_data = DebugData::new(&exe, 0)?;
        if !debug_data.has_debug_info() {
            return Err(Error::NoDebugInformation(prog_name));
        }

        if let Some(libs) = weak_error!(process::shared_libraries(pid)) {
            for lib in &libs {
                if let Err(e) = debug_data.add_shared_library(lib) {
                    debug!(target: "tracer", "skip shared library {:?}: {e}", lib.path);
                }
            }
        }

        let mut tracer = Self {
            prog_name,
            pid,
            tid: None,
            debug_data,
            breakpoints: HashMap::new(),
            deliver_signal: Signal::SIGCONT,
            detached: false,
        };
        tracer.attach()?;

        Ok(tracer)
    }

    pub fn prog_name(&self) -> &str {
        &self.prog_name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn debug_data(&self) -> &DebugData {
        &self.debug_data
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Attach to every thread of the process. Per-thread failures are
    /// logged, not fatal: a thread may be gone before we reach it.
    fn attach(&mut self) -> Result<()> {
        for thread in process::threads(self.pid)? {
            if let Err(e) = thread.attach() {
                warn!(target: "tracer", "attach thread {}: {e}", thread.0);
            }
        }
        Ok(())
    }

    /// Detach from the process: step every thread over live breakpoints,
    /// restore all patched code and release the threads. Skipped entirely
    /// when the target is dying of SIGSEGV.
    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;

        if self.deliver_signal == Signal::SIGSEGV {
            return Ok(());
        }

        let threads = process::threads(self.pid)?;
        let mut errors: Vec<Error> = vec![];

        let stopped = self.tid;
        for thread in &threads {
            if Some(*thread) != stopped {
                match thread.interrupt() {
                    // a timeout means the thread was already sitting in a
                    // stop we reaped earlier
                    Ok(()) | Err(Error::WaitTimeout) => {}
                    Err(e) => errors.push(e),
                }
            }

            self.tid = Some(*thread);
            if let Err(e) = self.step_over_breakpoint() {
                errors.push(e);
            }
        }

        for bp in self.breakpoints.values_mut() {
            if bp.is_enabled() {
                if let Err(e) = bp.disable() {
                    errors.push(e);
                }
            }
        }

        self.tid = None;
        self.breakpoints.clear();

        for thread in &threads {
            if let Err(e) = thread.detach() {
                errors.push(e);
            }
        }

        match Error::merge(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn stopped_thread(&self) -> Result<Thread> {
        self.tid.ok_or(Error::NoStoppedThread)
    }

    /// Program counter of the stopped thread.
    pub fn pc(&self) -> Result<usize> {
        self.stopped_thread()?.pc()
    }

    /// Rewrite the program counter of the stopped thread.
    pub fn set_pc(&self, pc: usize) -> Result<()> {
        self.stopped_thread()?.set_pc(pc)
    }

    /// Register snapshot of the stopped thread, keyed by DWARF register
    /// number.
    fn dwarf_registers(&self) -> Result<DwarfRegisters> {
        let native = self.stopped_thread()?.registers()?;
        let mut regs = DwarfRegisters::from_native(&native);
        regs.byte_order = self.debug_data.endian();
        regs.static_base = self.debug_data.static_base() as u64;
        Ok(regs)
    }

    /// Registers of the stopped thread rendered as a
    /// `DW_OP_reg<n> -> hex value` map.
    pub fn registers(&self) -> Result<BTreeMap<String, String>> {
        let regs = self.dwarf_registers()?;

        let mut out = BTreeMap::new();
        for (reg, value) in regs.iter() {
            let mut name = if reg < 32 {
                format!("DW_OP_reg{reg}")
            } else {
                format!("DW_OP_regx {reg:#x}")
            };

            if reg == regs.pc_num {
                name.push_str(" (PC)");
            } else if reg == regs.sp_num {
                name.push_str(" (SP)");
            } else if reg == regs.bp_num {
                name.push_str(" (FP/BP)");
            }

            out.insert(name, format!("{value:#x}"));
        }

        Ok(out)
    }

    /// Read the target's memory through the stopped thread, falling back to
    /// the main thread (valid whenever it is interrupt-stopped).
    pub fn read_memory(&self, addr: usize, out: &mut [u8]) -> Result<()> {
        let thread = self.tid.unwrap_or(Thread(self.pid));
        thread.peek(addr, out)
    }

    /// Unwind up to `max_frames` stack frames of the stopped thread.
    pub fn backtrace(&self, max_frames: usize) -> Result<Vec<BacktraceFrame>> {
        let thread = self.stopped_thread()?;
        let mut frames = vec![];

        let mut stack = StackIterator::new(thread, &self.debug_data)?;
        let mut depth = 0;
        while depth < max_frames && stack.next() {
            if let Some(func) = stack.function() {
                frames.push(BacktraceFrame::new(
                    func,
                    &self.debug_data,
                    thread,
                    stack.pc(),
                    stack.registers(),
                ));
            }
            depth += 1;
        }

        if let Some(err) = stack.take_err() {
            warn!(target: "tracer", "backtrace stopped: {err}");
        }

        Ok(frames)
    }

    /// Read the global variables of the compilation unit at the given pc.
    pub fn globals(&self, pc: usize) -> Result<Vec<Reading>> {
        let vars = self.debug_data.globals(pc)?;
        let regs = self.dwarf_registers()?;
        Ok(Reading::collect(
            &vars,
            &self.debug_data,
            self.stopped_thread()?,
            pc,
            &regs,
        ))
    }

    /// Set a breakpoint at an address.
    pub fn set_breakpoint(&mut self, addr: usize) -> Result<()> {
        if self.breakpoints.contains_key(&addr) {
            return Err(Error::BreakpointExists(addr));
        }

        let mut bp = Breakpoint::new(Thread(self.pid), addr);
        bp.enable()?;
        self.breakpoints.insert(addr, bp);
        debug!(target: "tracer", "breakpoint set at {addr:#x}");
        Ok(())
    }

    /// Remove the breakpoint at an address, restoring the original code.
    pub fn remove_breakpoint(&mut self, addr: usize) -> Result<()> {
        let Some(mut bp) = self.breakpoints.remove(&addr) else {
            return Ok(());
        };
        if bp.is_enabled() {
            bp.disable()?;
        }
        Ok(())
    }

    /// Set a breakpoint at every function matching `name`; returns the
    /// breakpoint addresses.
    pub fn set_breakpoint_at_function(&mut self, name: &str, exact: bool) -> Result<Vec<usize>> {
        let addresses = self.debug_data.function_addresses(name, exact);
        if addresses.is_empty() {
            return Err(Error::FunctionNameNotFound(name.to_string()));
        }

        for &addr in &addresses {
            self.set_breakpoint(addr)?;
        }
        Ok(addresses)
    }

    /// Continue every thread of the process.
    pub fn run(&mut self) -> Result<()> {
        for thread in process::threads(self.pid)? {
            thread.cont()?;
        }
        Ok(())
    }

    /// SIGSTOP every thread of the process.
    pub fn interrupt(&mut self) -> Result<()> {
        for thread in process::threads(self.pid)? {
            thread.interrupt()?;
        }
        Ok(())
    }

    /// Step the stopped thread over a live breakpoint at its pc: disable,
    /// single-step out of the patched range, re-enable.
    fn step_over_breakpoint(&mut self) -> Result<()> {
        let Some(thread) = self.tid else {
            return Ok(());
        };

        let addr = thread.pc()?;
        let Some(bp) = self.breakpoints.get_mut(&addr) else {
            return Ok(());
        };
        if !bp.is_enabled() {
            return Ok(());
        }

        bp.set_thread(thread);
        bp.disable()?;

        loop {
            thread.single_step()?;
            let pc = thread.pc()?;
            // on multi-byte trap architectures a step can land inside the
            // patched range
            if pc < addr || pc >= addr + TRAP_SIZE {
                break;
            }
        }

        bp.enable()
    }

    /// Resume the stopped thread, stepping over its breakpoint first and
    /// delivering the pending signal.
    fn continue_execution(&mut self) -> Result<()> {
        let Some(thread) = self.tid else {
            return Ok(());
        };

        self.step_over_breakpoint()?;
        thread.cont_with_signal(self.deliver_signal)?;
        self.tid = None;
        Ok(())
    }

    /// Block until a trace event happens (bounded by `timeout`), then build
    /// the event record: stop classification, registers, backtrace and
    /// globals.
    pub fn wait_for_event(&mut self, timeout: Duration) -> Result<Option<TraceEvent>> {
        self.continue_execution()?;

        let Some((thread, status)) = Thread(self.pid).wait_event(timeout)? else {
            return Ok(None);
        };

        self.deliver_signal = Signal::SIGCONT;
        // the stopped thread must be set before reading the pc
        self.tid = Some(thread);

        let mut pc = self.pc()?;
        let signal = match status {
            WaitStatus::Stopped(_, signal) => signal,
            WaitStatus::Signaled(_, signal, _) => signal,
            _ => Signal::SIGTRAP,
        };

        let mut is_breakpoint = false;
        if signal == Signal::SIGTRAP {
            is_breakpoint =
                pc >= TRAP_SIZE && self.breakpoints.contains_key(&(pc - TRAP_SIZE));
            if is_breakpoint {
                // rewind onto the original instruction
                pc -= TRAP_SIZE;
                self.set_pc(pc)?;
            }
        } else {
            self.deliver_signal = signal;
        }

        let registers = self.registers()?;
        let backtrace = self.backtrace(MAX_BACKTRACE_FRAMES).unwrap_or_else(|e| {
            warn!(target: "tracer", "backtrace failed: {e}");
            vec![]
        });
        let globals = self.globals(pc).unwrap_or_else(|e| {
            warn!(target: "tracer", "globals failed: {e}");
            vec![]
        });

        Ok(Some(TraceEvent {
            status,
            signal: signal as i32,
            pid: self.pid.as_raw(),
            tid: thread.0.as_raw(),
            is_breakpoint,
            pc: format!("{pc:#x}"),
            registers,
            globals,
            backtrace,
        }))
    }
}
