//! DWARF expression evaluation over a register snapshot.
//!
//! The gimli stack machine does the opcode interpretation; this module
//! resolves everything the machine asks for from the tracing session: target
//! memory through ptrace, register values from the snapshot, the frame base,
//! the call frame address and static-base relocation. Unknown opcodes and
//! unsupported requirements surface as errors, never as silent guesses.

use crate::arch::PTR_SIZE;
use crate::dwarf::EndianArcSlice;
use crate::error::{Error, Result};
use crate::process::Thread;
use crate::register::DwarfRegisters;
use gimli::{Encoding, EvaluationResult, Expression, Location, Reader, Value, ValueType};

/// One fragment of a value's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationPiece {
    /// The fragment lives in a register.
    Register { reg: u16, size: usize },
    /// The fragment lives in target memory.
    Memory { addr: usize, size: usize },
}

/// Outcome of evaluating a location expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalResult {
    /// The expression yields a single target-memory address.
    Address(usize),
    /// The expression yields a list of register/memory pieces.
    Pieces(Vec<LocationPiece>),
}

impl EvalResult {
    /// The result interpreted as a plain value (used by CFI value rules and
    /// frame bases, where the "address" is the computed value itself).
    pub fn into_value(self, regs: &DwarfRegisters) -> Result<u64> {
        match self {
            EvalResult::Address(addr) => Ok(addr as u64),
            EvalResult::Pieces(pieces) => match pieces.as_slice() {
                [LocationPiece::Register { reg, .. }] => {
                    Ok(regs.value(*reg).unwrap_or_default())
                }
                _ => Err(Error::EvalUnsupportedRequire("composite value")),
            },
        }
    }
}

pub struct ExpressionEvaluator<'a> {
    encoding: Encoding,
    thread: Thread,
    regs: &'a DwarfRegisters,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(encoding: Encoding, thread: Thread, regs: &'a DwarfRegisters) -> Self {
        Self {
            encoding,
            thread,
            regs,
        }
    }

    pub fn evaluate(&self, expr: Expression<EndianArcSlice>) -> Result<EvalResult> {
        let mut eval = expr.evaluation(self.encoding);

        let mut state = eval.evaluate()?;
        while state != EvaluationResult::Complete {
            state = match state {
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let mut buf = vec![0u8; size as usize];
                    self.thread.peek(address as usize, &mut buf)?;
                    buf.resize(8, 0);
                    let value = u64::from_ne_bytes(buf.try_into().expect("8 bytes"));
                    eval.resume_with_memory(Value::Generic(value))?
                }
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = self.regs.value(register.0).unwrap_or_default();
                    eval.resume_with_register(Value::Generic(value))?
                }
                EvaluationResult::RequiresFrameBase => {
                    eval.resume_with_frame_base(self.regs.frame_base)?
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    if self.regs.cfa == 0 {
                        return Err(Error::EvalUnsupportedRequire(
                            "no CFA available for the current pc",
                        ));
                    }
                    eval.resume_with_call_frame_cfa(self.regs.cfa)?
                }
                EvaluationResult::RequiresRelocatedAddress(addr) => {
                    eval.resume_with_relocated_address(addr + self.regs.static_base)?
                }
                EvaluationResult::RequiresBaseType(_) => {
                    eval.resume_with_base_type(ValueType::Generic)?
                }
                EvaluationResult::RequiresTls(_) => {
                    return Err(Error::EvalUnsupportedRequire("thread-local storage"))
                }
                EvaluationResult::RequiresAtLocation(_) => {
                    return Err(Error::EvalUnsupportedRequire("DW_OP_call"))
                }
                EvaluationResult::RequiresEntryValue(_) => {
                    return Err(Error::EvalUnsupportedRequire("DW_OP_entry_value"))
                }
                EvaluationResult::RequiresParameterRef(_) => {
                    return Err(Error::EvalUnsupportedRequire("parameter reference"))
                }
                EvaluationResult::RequiresIndexedAddress { .. } => {
                    return Err(Error::EvalUnsupportedRequire("indexed address"))
                }
                EvaluationResult::Complete => unreachable!(),
            };
        }

        let pieces = eval.result();
        if pieces.is_empty() {
            return Err(Error::EmptyEvalResult);
        }

        // a single sizeless address piece is the plain top-of-stack result
        if pieces.len() == 1 && pieces[0].size_in_bits.is_none() {
            if let Location::Address { address } = pieces[0].location {
                return Ok(EvalResult::Address(address as usize));
            }
        }

        let mut out = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let size = piece
                .size_in_bits
                .map(|bits| (bits / 8) as usize)
                .unwrap_or(PTR_SIZE);
            match piece.location {
                Location::Register { register } => out.push(LocationPiece::Register {
                    reg: register.0,
                    size,
                }),
                Location::Address { address } => out.push(LocationPiece::Memory {
                    addr: address as usize,
                    size,
                }),
                Location::Empty => {}
                other => {
                    return Err(Error::EvalUnsupportedRequire(match other {
                        Location::Value { .. } => "value location",
                        Location::Bytes { .. } => "byte literal location",
                        Location::ImplicitPointer { .. } => "implicit pointer",
                        _ => "unknown location",
                    }))
                }
            }
        }

        Ok(EvalResult::Pieces(out))
    }
}

/// Render a location expression for humans. A leading `DW_OP_addr` is
/// printed as the literal address; anything else is printed opcode by
/// opcode with decoded operands where known.
pub fn render_expression(expr: &Expression<EndianArcSlice>, static_base: usize) -> String {
    use std::fmt::Write;

    let Ok(bytes) = expr.0.to_slice() else {
        return String::new();
    };
    let bytes: &[u8] = &bytes;
    if bytes.is_empty() {
        return String::new();
    }

    if bytes[0] == gimli::DW_OP_addr.0 && bytes.len() >= 1 + PTR_SIZE {
        let addr = usize::from_le_bytes(bytes[1..1 + PTR_SIZE].try_into().expect("ptr bytes"));
        return format!("{:#x}", addr + static_base);
    }

    let mut reader = gimli::EndianSlice::new(bytes, gimli::RunTimeEndian::Little);
    let mut out = String::new();

    while let Ok(opcode) = reader.read_u8() {
        if !out.is_empty() {
            out.push(' ');
        }
        let op = gimli::DwOp(opcode);
        match op.static_string() {
            Some(name) => out.push_str(name),
            None => {
                let _ = write!(out, "{opcode:#x}");
            }
        }

        // operands of the opcode subset this crate produces and consumes
        let rendered = match op {
            gimli::DW_OP_addr => reader.read_u64().map(|v| format!(" {v:#x}")).ok(),
            gimli::DW_OP_consts | gimli::DW_OP_fbreg => reader
                .read_sleb128()
                .map(|v| format!(" {}", fmt_signed_hex(v)))
                .ok(),
            gimli::DW_OP_plus_uconst | gimli::DW_OP_piece | gimli::DW_OP_regx => reader
                .read_uleb128()
                .map(|v| format!(" {v:#x}"))
                .ok(),
            gimli::DW_OP_bregx => {
                let reg = reader.read_uleb128();
                let off = reader.read_sleb128();
                match (reg, off) {
                    (Ok(reg), Ok(off)) => Some(format!(" {reg:#x} {}", fmt_signed_hex(off))),
                    _ => None,
                }
            }
            op if (gimli::DW_OP_breg0.0..=gimli::DW_OP_breg31.0).contains(&op.0) => reader
                .read_sleb128()
                .map(|v| format!(" {}", fmt_signed_hex(v)))
                .ok(),
            _ => Some(String::new()),
        };

        match rendered {
            Some(operands) => out.push_str(&operands),
            // truncated operands, stop decoding
            None => break,
        }
    }

    out
}

fn fmt_signed_hex(v: i64) -> String {
    if v < 0 {
        format!("-{:#x}", v.unsigned_abs())
    } else {
        format!("{v:#x}")
    }
}
