use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
    #[error("process not found: {0}")]
    ProcessNameNotFound(String),
    #[error("there are multiple processes named '{0}'")]
    AmbiguousProcessName(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("wait timeout expired")]
    WaitTimeout,
    #[error("multiple errors: {}", render_multiple(.0))]
    MultipleErrors(Vec<Error>),

    // --------------------------------- debug data not found --------------------------------------
    #[error("compilation unit not found for pc {0:#x}")]
    CompilationUnitNotFound(usize),
    #[error("function not found for pc {0:#x}")]
    FunctionNotFound(usize),
    #[error("function not found: {0}")]
    FunctionNameNotFound(String),
    #[error("no line entry for pc {0:#x}")]
    LineNotFound(usize),
    #[error("no loclist entry for relative pc {relpc:#x} (offset {offset:#x})")]
    LoclistEntryNotFound { offset: u64, relpc: u64 },
    #[error("frame context not found for pc {0:#x}")]
    FrameContextNotFound(usize),
    #[error("{0}: missing attribute '{1}'")]
    MissingAttribute(String, &'static str),
    #[error("no location instructions")]
    NoLocation,
    #[error("no debug information for {0}")]
    NoDebugInformation(String),

    // --------------------------------- malformed debug data --------------------------------------
    #[error("dwarf parsing error: {0}")]
    Dwarf(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    Obj(#[from] object::Error),
    #[error("dwarf expression yields an empty result")]
    EmptyEvalResult,
    #[error("unsupported evaluation requirement: {0}")]
    EvalUnsupportedRequire(&'static str),
    #[error("CFA becomes undefined at pc {0:#x}")]
    UndefinedCfa(usize),
    #[error("undefined return address at pc {0:#x}")]
    UndefinedReturnAddress(usize),
    #[error("architectural frame rules are unsupported")]
    ArchitecturalRule,

    // --------------------------------- invariant violations --------------------------------------
    #[error("breakpoint already exists at {0:#x}")]
    BreakpointExists(usize),
    #[error("breakpoint already enabled")]
    BreakpointEnabled,
    #[error("breakpoint already disabled")]
    BreakpointDisabled,
    #[error("could not save original instruction at {0:#x}")]
    SaveInstruction(usize),

    // --------------------------------- tracing session -------------------------------------------
    #[error("no thread is stopped")]
    NoStoppedThread,
    #[error("the tracer is already detached")]
    ManagerClosed,
    #[error("traced process delivered {0}")]
    FatalSignal(Signal),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Return a hint to the event loop - keep tracing after this error or tear the session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::ProcessNotFound(_) => true,
            Error::ProcessNameNotFound(_) => false,
            Error::AmbiguousProcessName(_) => false,
            Error::Ptrace(_) => false,
            Error::Waitpid(_) => true,
            Error::Syscall(_, _) => false,
            Error::WaitTimeout => false,
            Error::MultipleErrors(errors) => errors.iter().any(Error::is_fatal),
            Error::CompilationUnitNotFound(_) => false,
            Error::FunctionNotFound(_) => false,
            Error::FunctionNameNotFound(_) => false,
            Error::LineNotFound(_) => false,
            Error::LoclistEntryNotFound { .. } => false,
            Error::FrameContextNotFound(_) => false,
            Error::MissingAttribute(_, _) => false,
            Error::NoLocation => false,
            Error::NoDebugInformation(_) => false,
            Error::Dwarf(_) => false,
            Error::Obj(_) => true,
            Error::EmptyEvalResult => false,
            Error::EvalUnsupportedRequire(_) => false,
            Error::UndefinedCfa(_) => false,
            Error::UndefinedReturnAddress(_) => false,
            Error::ArchitecturalRule => false,
            Error::BreakpointExists(_) => false,
            Error::BreakpointEnabled => false,
            Error::BreakpointDisabled => false,
            Error::SaveInstruction(_) => false,
            Error::NoStoppedThread => false,
            Error::ManagerClosed => true,
            Error::FatalSignal(_) => true,
        }
    }

    /// Merge a list of errors into a single error. `None` if the list is empty,
    /// the error itself if there is exactly one.
    pub fn merge(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::MultipleErrors(errors)),
        }
    }
}

fn render_multiple(errors: &[Error]) -> String {
    use itertools::Itertools;
    errors.iter().map(|e| e.to_string()).join("; ")
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "tracer", "{:#}", e);
                None
            }
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_merge_errors() {
        assert!(Error::merge(vec![]).is_none());

        let merged = Error::merge(vec![Error::BreakpointEnabled]).unwrap();
        assert!(matches!(merged, Error::BreakpointEnabled));

        let merged = Error::merge(vec![
            Error::BreakpointEnabled,
            Error::SaveInstruction(0x1000),
        ])
        .unwrap();
        assert!(matches!(&merged, Error::MultipleErrors(errs) if errs.len() == 2));
        let rendered = merged.to_string();
        assert!(rendered.contains("breakpoint already enabled"));
        assert!(rendered.contains("0x1000"));
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::BreakpointEnabled.is_fatal());
        assert!(!Error::WaitTimeout.is_fatal());
        assert!(Error::FatalSignal(Signal::SIGSEGV).is_fatal());
        assert!(Error::MultipleErrors(vec![
            Error::BreakpointDisabled,
            Error::FatalSignal(Signal::SIGSEGV)
        ])
        .is_fatal());
    }
}
