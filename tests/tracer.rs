//! End-to-end tests driving a real traced child process.

mod support;

use nix::sys::signal::Signal;
use proctrace::tracer::manager::TraceManager;
use proctrace::tracer::TraceEvent;
use serial_test::serial;
use std::sync::mpsc;
use std::time::Duration;
use support::{wait_for, Target};

const EVENT_WAIT: Duration = Duration::from_secs(10);

fn sigtrap() -> i32 {
    Signal::SIGTRAP as i32
}

/// Attach a manager that forwards every event into a channel; breakpoint
/// events also carry the byte currently at the breakpoint address.
fn attach_with_events(
    target: &Target,
) -> (TraceManager, mpsc::Receiver<TraceEvent>, mpsc::Receiver<u8>) {
    let (event_tx, event_rx) = mpsc::channel();
    let (byte_tx, byte_rx) = mpsc::channel();

    let manager = TraceManager::attach(
        target.pid(),
        Box::new(move |tracer, event, _error| {
            if let Some(event) = event {
                if event.is_breakpoint {
                    // the trap byte must still be installed while we are
                    // stopped at the rewound pc
                    let addr = usize::from_str_radix(
                        event.pc.trim_start_matches("0x"),
                        16,
                    )
                    .expect("hex pc");
                    let mut byte = [0u8; 1];
                    if tracer.read_memory(addr, &mut byte).is_ok() {
                        let _ = byte_tx.send(byte[0]);
                    }
                }
                let _ = event_tx.send(event.clone());
            }
        }),
    )
    .expect("attach");

    (manager, event_rx, byte_rx)
}

#[test]
#[serial]
fn test_attach_and_detach_leaves_target_running() {
    let binary = fixture_or_skip!("calc");
    let target = Target::spawn(&binary);

    let (mut manager, _events, _bytes) = attach_with_events(&target);
    assert_eq!(manager.pid(), target.pid());

    manager.close().expect("close");
    assert!(target.is_alive());
}

#[test]
#[serial]
fn test_breakpoint_event_with_backtrace_and_globals() {
    let binary = fixture_or_skip!("calc");
    let target = Target::spawn(&binary);

    let (mut manager, events, bytes) = attach_with_events(&target);

    manager.interrupt().expect("interrupt");
    let addrs = manager
        .set_breakpoint_at_function("work", true)
        .expect("set breakpoint");
    assert_eq!(addrs.len(), 1);
    let bp_addr = addrs[0];
    manager.run().expect("run");

    let event = wait_for(&events, EVENT_WAIT, |e| e.is_breakpoint).expect("breakpoint event");

    assert_eq!(event.signal, sigtrap());
    assert_eq!(event.pid, target.pid().as_raw());
    assert!(event.tid > 0);
    // the pc is rewound onto the original instruction
    assert_eq!(event.pc, format!("{bp_addr:#x}"));

    // registers are reported under their DWARF names
    assert!(!event.registers.is_empty());
    assert!(event.registers.keys().any(|name| name.ends_with("(PC)")));
    assert!(event.registers.keys().any(|name| name.ends_with("(SP)")));

    // frame 0 is the broken function with its char* argument decoded
    let frame = event.backtrace.first().expect("at least one frame");
    assert!(frame.function.starts_with("work ("), "frame: {frame:?}");
    let arg = frame
        .variables
        .iter()
        .find(|v| v.name == "s")
        .expect("argument reading");
    assert_eq!(arg.type_name.as_deref(), Some("char*"));
    assert!(arg.value.contains("hello"), "value: {}", arg.value);
    assert!(arg.error.is_empty(), "error: {}", arg.error);

    // main is further up the stack
    assert!(event
        .backtrace
        .iter()
        .any(|f| f.function.starts_with("main (")));

    // the compilation unit's global is decoded (0x41424344 little-endian)
    let global = event
        .globals
        .iter()
        .find(|g| g.name == "x")
        .expect("global reading");
    assert_eq!(global.type_name.as_deref(), Some("int"));
    assert_eq!(global.size, Some(4));
    assert_eq!(global.value, "0x44434241");

    // the trap byte is still installed while stopped at the rewound pc
    let byte = bytes.recv_timeout(EVENT_WAIT).expect("trap byte");
    assert_eq!(byte, 0xCC);

    // the loop continues past the breakpoint without losing it
    let second = wait_for(&events, EVENT_WAIT, |e| e.is_breakpoint).expect("second hit");
    assert_eq!(second.pc, format!("{bp_addr:#x}"));

    manager.close().expect("close");
    assert!(target.is_alive());
}

#[test]
#[serial]
fn test_breakpoint_removal_restores_code() {
    let binary = fixture_or_skip!("calc");
    let target = Target::spawn(&binary);

    let (mut manager, events, _bytes) = attach_with_events(&target);

    manager.interrupt().expect("interrupt");
    let addrs = manager
        .set_breakpoint_at_function("work", true)
        .expect("set breakpoint");
    let bp_addr = addrs[0];

    let original = manager.read_memory(bp_addr, 1).expect("read original");
    assert_eq!(original[0], 0xCC);

    manager.remove_breakpoint(bp_addr).expect("remove");
    let restored = manager.read_memory(bp_addr, 1).expect("read restored");
    assert_ne!(restored[0], 0xCC);

    manager.run().expect("run");

    // with the breakpoint gone no further breakpoint events arrive
    assert!(wait_for(&events, Duration::from_secs(1), |e| e.is_breakpoint).is_none());

    manager.close().expect("close");
    assert!(target.is_alive());
}

#[test]
#[serial]
fn test_two_threads_hit_the_same_breakpoint() {
    let binary = fixture_or_skip!("threads");
    let target = Target::spawn(&binary);

    let (mut manager, events, _bytes) = attach_with_events(&target);

    manager.interrupt().expect("interrupt");
    let addrs = manager
        .set_breakpoint_at_function("work", true)
        .expect("set breakpoint");
    let bp_addr = addrs[0];
    manager.run().expect("run");

    let mut tids = std::collections::HashSet::new();
    wait_for(&events, EVENT_WAIT, |e| {
        if e.is_breakpoint {
            assert_eq!(e.pc, format!("{bp_addr:#x}"));
            tids.insert(e.tid);
        }
        tids.len() >= 2
    });

    assert!(
        tids.len() >= 2,
        "expected breakpoint hits from two threads, got {tids:?}"
    );

    manager.close().expect("close");
    assert!(target.is_alive());
}

#[test]
#[serial]
fn test_fork_does_not_disturb_the_parent_stream() {
    let binary = fixture_or_skip!("forker");
    let target = Target::spawn(&binary);

    let (mut manager, events, _bytes) = attach_with_events(&target);

    manager.interrupt().expect("interrupt");
    manager
        .set_breakpoint_at_function("work", true)
        .expect("set breakpoint");
    manager.run().expect("run");

    // the fixture forks after ~10 iterations; the parent's breakpoint
    // stream must keep flowing across the fork
    let parent = target.pid().as_raw();
    for _ in 0..15 {
        let event = wait_for(&events, EVENT_WAIT, |e| e.is_breakpoint).expect("parent event");
        assert_eq!(event.pid, parent);
    }

    manager.close().expect("close");
    assert!(target.is_alive());
}

#[test]
#[serial]
fn test_segv_terminates_the_session() {
    let binary = fixture_or_skip!("segv");
    let target = Target::spawn(&binary);

    let (mut manager, events, _bytes) = attach_with_events(&target);

    let segv = wait_for(&events, EVENT_WAIT, |e| e.signal == Signal::SIGSEGV as i32);
    let segv = segv.expect("segv event");
    assert!(!segv.is_breakpoint);

    // the worker tears the session down; further requests must fail
    std::thread::sleep(Duration::from_millis(300));
    assert!(manager.interrupt().is_err());
    assert!(manager.close().is_err());
}
