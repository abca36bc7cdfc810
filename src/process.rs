//! Process discovery over `/proc` and the ptrace thread controller.
//!
//! Every kernel-visible thread of the traced process is itself a ptrace
//! target, so the controller operates on [`Thread`] values; whole-process
//! operations enumerate `/proc/<pid>/task` first.

use crate::arch;
use crate::error::{Error, Result};
use crate::register::{regs_to_vec, vec_to_regs};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{c_long, c_void};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, Pid};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const WORD_SIZE: usize = std::mem::size_of::<c_long>();

/// Bounded wait applied after attach, interrupt and single-step.
const STOP_WAIT: Duration = Duration::from_secs(1);

/// A shared library mapped into the traced process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLibrary {
    pub path: PathBuf,
    /// Runtime load address of the library image.
    pub static_base: usize,
}

/// Return the pids of all running processes.
pub fn running_processes() -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return vec![];
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect()
}

/// Return the short name of a process from `/proc/<pid>/comm`.
pub fn process_name(pid: Pid) -> Result<String> {
    let raw = fs::read_to_string(format!("/proc/{pid}/comm"))?;
    Ok(raw.trim_end_matches('\n').to_string())
}

/// Return the pids of all processes with the given name.
pub fn processes_by_name(name: &str) -> Vec<Pid> {
    running_processes()
        .into_iter()
        .filter(|&pid| process_name(pid).map(|n| n == name).unwrap_or(false))
        .collect()
}

/// Return the pid of the single process with the given name, or an error if
/// the name is missing or ambiguous.
pub fn process_by_name(name: &str) -> Result<Pid> {
    let mut found = processes_by_name(name);
    match found.len() {
        0 => Err(Error::ProcessNameNotFound(name.to_string())),
        1 => Ok(found.remove(0)),
        _ => Err(Error::AmbiguousProcessName(name.to_string())),
    }
}

/// Path of the executable image of a process.
pub fn exe_path(pid: Pid) -> Result<PathBuf> {
    Ok(fs::read_link(format!("/proc/{pid}/exe"))?)
}

/// Kernel-visible threads of a process, from `/proc/<pid>/task`.
pub fn threads(pid: Pid) -> Result<Vec<Thread>> {
    let entries =
        fs::read_dir(format!("/proc/{pid}/task")).map_err(|_| Error::ProcessNotFound(pid))?;
    Ok(entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .map(|tid| Thread(Pid::from_raw(tid)))
        .collect())
}

/// Shared libraries mapped by the process: the first mapping of every
/// distinct `.so` pathname, whose start address is the library's load base.
pub fn shared_libraries(pid: Pid) -> Result<Vec<SharedLibrary>> {
    let maps = proc_maps::get_process_maps(pid.as_raw())?;

    let mut libs: Vec<SharedLibrary> = vec![];
    for region in maps {
        let Some(path) = region.filename() else {
            continue;
        };
        let is_so = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(".so") || n.contains(".so."))
            .unwrap_or(false);
        if !is_so {
            continue;
        }
        if libs.iter().any(|l| l.path == path) {
            continue;
        }
        libs.push(SharedLibrary {
            path: path.to_path_buf(),
            static_base: region.start(),
        });
    }

    Ok(libs)
}

/// A single ptrace-addressable kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread(pub Pid);

impl Thread {
    pub fn new(tid: i32) -> Self {
        Thread(Pid::from_raw(tid))
    }

    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Start tracing the thread.
    ///
    /// `PTRACE_ATTACH` on a thread we already trace fails with EPERM; in that
    /// case the thread still answers event-message queries, which
    /// distinguishes "traced by us" from a real permission failure.
    pub fn attach(&self) -> Result<()> {
        debug!(target: "tracer", "attach thread {}", self.0);
        match ptrace::attach(self.0) {
            Ok(()) => {}
            Err(Errno::EPERM) => {
                ptrace::getevent(self.0).map_err(Error::Ptrace)?;
            }
            Err(e) => return Err(Error::Ptrace(e)),
        }

        // try to set the options even if the first stop never arrives
        if let Err(e) = self.wait_stop(STOP_WAIT) {
            warn!(target: "tracer", "no stop after attach, thread {}: {e}", self.0);
        }

        ptrace::setoptions(
            self.0,
            Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEFORK,
        )
        .map_err(Error::Ptrace)
    }

    /// Stop tracing the thread.
    pub fn detach(&self) -> Result<()> {
        debug!(target: "tracer", "detach thread {}", self.0);
        ptrace::detach(self.0, None).map_err(Error::Ptrace)
    }

    /// Resume the thread, delivering the default continue signal.
    pub fn cont(&self) -> Result<()> {
        self.cont_with_signal(Signal::SIGCONT)
    }

    /// Resume the thread, delivering `signal`.
    pub fn cont_with_signal(&self, signal: Signal) -> Result<()> {
        debug!(target: "tracer", "continue thread {} with {signal}", self.0);
        ptrace::cont(self.0, Some(signal)).map_err(Error::Ptrace)
    }

    /// Stop the thread with SIGSTOP and wait (bounded) until it reports.
    pub fn interrupt(&self) -> Result<()> {
        kill(self.0, Signal::SIGSTOP).map_err(|e| Error::Syscall("kill", e))?;
        self.wait_stop(STOP_WAIT)
    }

    /// Execute one instruction and stop again.
    pub fn single_step(&self) -> Result<()> {
        ptrace::step(self.0, None).map_err(Error::Ptrace)?;
        self.wait_stop(STOP_WAIT)
    }

    /// Read the full native register block as a flat word vector.
    pub fn registers(&self) -> Result<Vec<u64>> {
        let regs = ptrace::getregs(self.0).map_err(Error::Ptrace)?;
        Ok(regs_to_vec(&regs))
    }

    /// Write the native register block from a flat word vector.
    pub fn set_registers(&self, values: &[u64]) -> Result<()> {
        let mut regs = ptrace::getregs(self.0).map_err(Error::Ptrace)?;
        vec_to_regs(values, &mut regs);
        ptrace::setregs(self.0, regs).map_err(Error::Ptrace)
    }

    /// Current program counter.
    pub fn pc(&self) -> Result<usize> {
        Ok(self.registers()?[arch::PC_REG_IDX] as usize)
    }

    /// Rewrite the program counter.
    pub fn set_pc(&self, pc: usize) -> Result<()> {
        let mut regs = self.registers()?;
        regs[arch::PC_REG_IDX] = pc as u64;
        self.set_registers(&regs)
    }

    /// Read arbitrary-length data from the thread's memory, one word at a
    /// time.
    pub fn peek(&self, addr: usize, out: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < out.len() {
            let word = ptrace::read(self.0, (addr + offset) as *mut c_void)
                .map_err(Error::Ptrace)? as u64;
            let bytes = word.to_ne_bytes();
            let n = WORD_SIZE.min(out.len() - offset);
            out[offset..offset + n].copy_from_slice(&bytes[..n]);
            offset += n;
        }
        Ok(())
    }

    /// Write arbitrary-length data to the thread's memory. A partial trailing
    /// word is merged with the existing memory contents.
    pub fn poke(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let chunk = &data[offset..];
            let word_addr = (addr + offset) as *mut c_void;

            let word = if chunk.len() >= WORD_SIZE {
                u64::from_ne_bytes(chunk[..WORD_SIZE].try_into().expect("word-sized chunk"))
            } else {
                let existing =
                    ptrace::read(self.0, word_addr).map_err(Error::Ptrace)? as u64;
                let mut bytes = existing.to_ne_bytes();
                bytes[..chunk.len()].copy_from_slice(chunk);
                u64::from_ne_bytes(bytes)
            };

            unsafe {
                ptrace::write(self.0, word_addr, word as *mut c_void).map_err(Error::Ptrace)?;
            }
            offset += WORD_SIZE.min(chunk.len());
        }
        Ok(())
    }

    /// Read a pointer-sized address from the thread's memory.
    pub fn read_address_at(&self, addr: usize) -> Result<usize> {
        let mut buf = [0u8; arch::PTR_SIZE];
        self.peek(addr, &mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    /// Wait (bounded) until this very thread changes state. Waiting on the
    /// tid and not the process group keeps pending stops of sibling threads
    /// queued for the event demultiplexer.
    fn wait_stop(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout);
            }

            match waitpid(self.0, Some(nohang_flags())).map_err(Error::Waitpid)? {
                WaitStatus::StillAlive => std::thread::yield_now(),
                _ => return Ok(()),
            }
        }
    }

    /// Demultiplex wait events for the whole traced process group.
    ///
    /// Exit and continue notifications are swallowed. SIGTRAP stops are
    /// dispatched by trap cause: a plain trap is a breakpoint hit and is
    /// returned; clone/fork events attach and resume the new thread, resume
    /// the parent and keep polling; any other cause resumes the thread and
    /// keeps polling. All other stop or termination signals are returned.
    /// `Ok(None)` means the timeout expired.
    pub fn wait_event(&self, timeout: Duration) -> Result<Option<(Thread, WaitStatus)>> {
        let target = self.wait_target()?;
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let status = waitpid(target, Some(nohang_flags())).map_err(Error::Waitpid)?;
            match status {
                WaitStatus::StillAlive => {
                    std::thread::yield_now();
                }
                WaitStatus::Exited(_, _) | WaitStatus::Continued(_) => {}
                WaitStatus::PtraceEvent(pid, _, code)
                    if code == nix::libc::PTRACE_EVENT_CLONE
                        || code == nix::libc::PTRACE_EVENT_FORK =>
                {
                    let new_tid = ptrace::getevent(pid)
                        .map_err(|e| Error::Syscall("ptrace_geteventmsg", e))?;
                    debug!(target: "tracer", "thread {pid} spawned {new_tid}, attaching");

                    let new_thread = Thread::new(new_tid as i32);
                    if let Err(e) = new_thread.attach() {
                        warn!(target: "tracer", "attach new thread {new_tid}: {e}");
                    }
                    let _ = new_thread.cont();
                    let _ = ptrace::cont(pid, None);
                }
                WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => {
                    let _ = ptrace::cont(pid, None);
                }
                WaitStatus::Stopped(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                    return Ok(Some((Thread(pid), status)));
                }
            }
        }
    }

    fn wait_target(&self) -> Result<Pid> {
        let pgid = getpgid(Some(self.0)).map_err(|e| Error::Syscall("getpgid", e))?;
        Ok(Pid::from_raw(-pgid.as_raw()))
    }
}

fn nohang_flags() -> WaitPidFlag {
    WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::__WALL
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_running_processes_contains_self() {
        let me = getpid();
        assert!(running_processes().contains(&me));
    }

    #[test]
    fn test_process_name_of_self() {
        let name = process_name(getpid()).unwrap();
        assert!(!name.is_empty());
        assert!(!name.ends_with('\n'));
    }

    #[test]
    fn test_threads_of_self() {
        let threads = threads(getpid()).unwrap();
        assert!(threads.contains(&Thread(getpid())));
    }

    #[test]
    fn test_threads_of_missing_process() {
        let err = threads(Pid::from_raw(i32::MAX - 1)).unwrap_err();
        assert!(matches!(err, Error::ProcessNotFound(_)));
    }

    #[test]
    fn test_shared_libraries_of_self() {
        let libs = shared_libraries(getpid()).unwrap();
        // the test binary links against glibc
        assert!(libs
            .iter()
            .any(|l| l.path.to_string_lossy().contains("libc.so")));
        for lib in &libs {
            assert!(lib.static_base > 0);
        }
    }

    #[test]
    fn test_exe_path_of_self() {
        let exe = exe_path(getpid()).unwrap();
        assert!(exe.is_absolute());
    }
}
