//! Variable readings: turn a variable's location into bytes and a rendered
//! value at a given pc and register snapshot.

use crate::arch::PTR_SIZE;
use crate::dwarf::eval::{render_expression, EvalResult, ExpressionEvaluator, LocationPiece};
use crate::dwarf::unit::{FunctionEntry, VariableEntry};
use crate::dwarf::DebugData;
use crate::error::Result;
use crate::process::Thread;
use crate::register::DwarfRegisters;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use std::fmt::Write;

/// Cap for NUL-terminated string reads.
const MAX_STRING_READ: usize = 256;

/// The pc-dependent location and value of a variable.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub location: String,
    pub value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Reading {
    /// Read one variable. Failures land in the `error` field, the reading
    /// itself is always produced.
    pub fn read(
        var: &VariableEntry,
        data: &DebugData,
        thread: Thread,
        pc: usize,
        regs: &DwarfRegisters,
    ) -> Reading {
        let mut reading = Reading {
            name: var.name.clone(),
            type_name: var.type_name.clone(),
            size: Some(var.deref_size),
            location: String::new(),
            value: String::new(),
            error: String::new(),
        };

        if var.byte_size == 0 && !var.is_pointer {
            return reading;
        }

        let expr = match data.location_expression(var, pc) {
            Ok(expr) => expr,
            Err(e) => {
                reading.error = e.to_string();
                return reading;
            }
        };
        reading.location = render_expression(&expr, var.static_base);

        let evaluator = ExpressionEvaluator::new(data.unit_encoding(var, pc), thread, regs);
        let result = match evaluator.evaluate(expr) {
            Ok(result) => result,
            Err(e) => {
                reading.error = e.to_string();
                return reading;
            }
        };

        let mut bytes = match fetch_bytes(&result, thread, regs, var.byte_size as usize) {
            Ok(bytes) => bytes,
            Err(e) => {
                reading.error = e.to_string();
                return reading;
            }
        };

        if var.is_pointer {
            let addr = read_address(&bytes);
            let _ = write!(reading.value, "{addr:#x} : ");

            if var.type_name.as_deref() == Some("char*") {
                match read_string(thread, addr) {
                    Ok(string) => {
                        reading.value.push_str(&String::from_utf8_lossy(&string));
                        reading.size = None;
                    }
                    Err(e) => reading.error = e.to_string(),
                }
                return reading;
            }

            bytes = vec![0u8; var.byte_size as usize];
            if let Err(e) = thread.peek(addr, &mut bytes) {
                reading.error = format!("couldn't read data at location {addr:#x}: {e}");
                return reading;
            }
        }

        bytes.truncate(var.byte_size as usize);
        reading.value.push_str("0x");
        for byte in &bytes {
            let _ = write!(reading.value, "{byte:02x}");
        }

        reading
    }

    /// Read a list of variables; one reading per variable, errors included.
    pub fn collect(
        vars: &[VariableEntry],
        data: &DebugData,
        thread: Thread,
        pc: usize,
        regs: &DwarfRegisters,
    ) -> Vec<Reading> {
        vars.iter()
            .map(|var| Reading::read(var, data, thread, pc, regs))
            .collect()
    }
}

/// Fetch the raw bytes for an evaluation result: a single peek for an
/// address, a concatenation for a piece list (register pieces render the
/// register value as pointer-sized native-order bytes, memory pieces are
/// peeked at their own size).
fn fetch_bytes(
    result: &EvalResult,
    thread: Thread,
    regs: &DwarfRegisters,
    size: usize,
) -> Result<Vec<u8>> {
    match result {
        EvalResult::Address(addr) => {
            let mut buf = vec![0u8; size];
            thread.peek(*addr, &mut buf)?;
            Ok(buf)
        }
        EvalResult::Pieces(pieces) => {
            let mut buf = BytesMut::new();
            for piece in pieces {
                match piece {
                    LocationPiece::Register { reg, .. } => {
                        let value = regs.value(*reg).unwrap_or_default();
                        buf.put_slice(&value.to_ne_bytes());
                    }
                    LocationPiece::Memory { addr, size } => {
                        let mut chunk = vec![0u8; *size];
                        thread.peek(*addr, &mut chunk)?;
                        buf.put_slice(&chunk);
                    }
                }
            }
            Ok(buf.to_vec())
        }
    }
}

/// Read a pointer from the head of a byte buffer.
fn read_address(bytes: &[u8]) -> usize {
    if bytes.len() < PTR_SIZE {
        return 0;
    }
    usize::from_ne_bytes(bytes[..PTR_SIZE].try_into().expect("pointer bytes"))
}

/// Read a NUL-terminated string, one word at a time. Stops at the first
/// zero byte, at the first failed peek after at least one word, or at the
/// read cap.
pub fn read_string(thread: Thread, addr: usize) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = vec![];
    let mut addr = addr;

    loop {
        let mut word = [0u8; PTR_SIZE];
        if let Err(e) = thread.peek(addr, &mut word) {
            if out.is_empty() {
                return Err(e);
            }
            break;
        }
        addr += PTR_SIZE;

        if let Some(nul) = word.iter().position(|&b| b == 0) {
            out.extend_from_slice(&word[..nul]);
            return Ok(out);
        }

        out.extend_from_slice(&word);
        if out.len() > MAX_STRING_READ {
            break;
        }
    }

    Ok(out)
}

/// One frame of a backtrace: the function, its source position and the
/// decoded variable readings.
#[derive(Debug, Clone, Serialize)]
pub struct BacktraceFrame {
    pub function: String,
    pub source: String,
    pub pc: String,
    pub cfa: String,
    pub framebase: String,
    pub variables: Vec<Reading>,
}

impl BacktraceFrame {
    pub fn new(
        func: &FunctionEntry,
        data: &DebugData,
        thread: Thread,
        pc: usize,
        regs: &DwarfRegisters,
    ) -> Self {
        let variables = Reading::collect(&func.variables, data, thread, pc, regs);

        let fn_addr = func.low_pc as usize + func.static_base;
        let source = data
            .find_place(pc)
            .unwrap_or_else(|| "no debug info".to_string());

        Self {
            function: format!("{} ({fn_addr:#x})", func.name),
            source,
            pc: format!("{pc:#x}"),
            cfa: format!("{:#x}", regs.cfa),
            framebase: format!("{:#x}", regs.frame_base),
            variables,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reading_serialized_field_names() {
        let reading = Reading {
            name: "x".to_string(),
            type_name: Some("int".to_string()),
            size: Some(4),
            location: "0x404010".to_string(),
            value: "0x44434241".to_string(),
            error: String::new(),
        };

        let json = serde_json::to_value(&reading).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj["name"], "x");
        assert_eq!(obj["type"], "int");
        assert_eq!(obj["size"], 4);
        assert_eq!(obj["location"], "0x404010");
        assert_eq!(obj["value"], "0x44434241");
        // empty error is omitted entirely
        assert!(!obj.contains_key("error"));
    }

    #[test]
    fn test_frame_serialized_field_names() {
        let frame = BacktraceFrame {
            function: "main (0x401136)".to_string(),
            source: "main.c:3".to_string(),
            pc: "0x401140".to_string(),
            cfa: "0x7ffc000".to_string(),
            framebase: "0x7ffbff0".to_string(),
            variables: vec![],
        };

        let json = serde_json::to_value(&frame).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["function", "source", "pc", "cfa", "framebase", "variables"] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
    }

    #[test]
    fn test_read_address_from_short_buffer() {
        assert_eq!(read_address(&[1, 2, 3]), 0);
        let addr = 0x7fff_dead_beefusize;
        assert_eq!(read_address(&addr.to_ne_bytes()), addr);
    }
}
