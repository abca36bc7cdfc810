//! Stack unwinding through the CFI state machine.
//!
//! The iterator repeatedly evaluates the frame rules at the current pc to
//! recover the previous frame's register set and return address. It stops at
//! a zero or unresolvable return address, or at a pc with no known function.

use crate::arch;
use crate::dwarf::eval::ExpressionEvaluator;
use crate::dwarf::frame::{CfaRule, Expression, UnwindRule};
use crate::dwarf::unit::FunctionEntry;
use crate::dwarf::DebugData;
use crate::error::{Error, Result};
use crate::process::Thread;
use crate::register::DwarfRegisters;

pub struct StackIterator<'a> {
    thread: Thread,
    data: &'a DebugData,
    pc: usize,
    retaddr: usize,
    regs: DwarfRegisters,
    func: Option<FunctionEntry>,
    err: Option<Error>,
}

impl<'a> StackIterator<'a> {
    pub fn new(thread: Thread, data: &'a DebugData) -> Result<Self> {
        let native = thread.registers()?;
        let mut regs = DwarfRegisters::from_native(&native);
        regs.byte_order = data.endian();
        regs.static_base = data.static_base() as u64;

        let pc = regs.pc() as usize;
        let mut iter = Self {
            thread,
            data,
            pc,
            retaddr: pc,
            regs,
            func: None,
            err: None,
        };

        // pc is 0 when the target jumped through a null pointer; the faulting
        // frame is recovered from the stack before iteration starts
        if pc == 0 && !iter.advance() {
            return Err(iter
                .err
                .take()
                .unwrap_or(Error::UndefinedReturnAddress(0)));
        }

        Ok(iter)
    }

    /// Step to the next frame. Returns false when iteration is over.
    pub fn next(&mut self) -> bool {
        self.pc = self.retaddr;
        if self.pc == 0 {
            return false;
        }

        let Ok(func) = self.data.function_for_pc(self.pc) else {
            return false;
        };

        self.regs.static_base = func.static_base as u64;
        self.func = Some(func);

        self.advance()
    }

    /// The function of the current frame.
    pub fn function(&self) -> Option<&FunctionEntry> {
        self.func.as_ref()
    }

    /// Program counter of the current frame.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Register snapshot of the current frame (CFA and frame base included).
    pub fn registers(&self) -> &DwarfRegisters {
        &self.regs
    }

    /// The error that ended iteration, if any.
    pub fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }

    /// Recover the caller's registers from the frame rules at the current
    /// pc.
    fn advance(&mut self) -> bool {
        let ctx = self.data.frame_context(self.pc).unwrap_or(None);
        let ctx = arch::fix_frame_context(ctx, self.pc, &self.regs);

        let cfa = match &ctx.cfa {
            CfaRule::RegisterAndOffset { register, offset } => {
                match self.regs.value(*register) {
                    Some(base) => base.wrapping_add_signed(*offset),
                    None => {
                        self.err = Some(Error::UndefinedCfa(self.pc));
                        return false;
                    }
                }
            }
            CfaRule::Expression(expr) => match self.eval_value(expr.clone()) {
                Ok(value) => value,
                Err(e) => {
                    self.err = Some(e);
                    return false;
                }
            },
        };
        self.regs.cfa = cfa;

        // the frame base needs this frame's CFA, and must see this frame's
        // register values before the rules below replace them with the
        // caller's
        if let Some(func) = &self.func {
            self.regs.frame_base = self
                .data
                .frame_base(func, self.thread, self.pc, &self.regs)
                .unwrap_or_default();
        }

        let mut retaddr = 0usize;
        for (&reg, rule) in &ctx.regs {
            let value = match self.exec_rule(reg, rule, cfa) {
                Ok(value) => value,
                Err(e) => {
                    if reg == ctx.ret_addr_reg {
                        self.err = Some(e);
                        return false;
                    }
                    None
                }
            };

            self.regs.set(reg, value);

            if reg == ctx.ret_addr_reg {
                match value {
                    Some(value) => retaddr = value as usize,
                    None => {
                        self.err = Some(Error::UndefinedReturnAddress(self.pc));
                        return false;
                    }
                }
            }
        }

        self.retaddr = retaddr;
        true
    }

    fn exec_rule(&self, reg: u16, rule: &UnwindRule, cfa: u64) -> Result<Option<u64>> {
        match rule {
            UnwindRule::Undefined => Ok(None),
            UnwindRule::SameValue => Ok(self.regs.value(reg)),
            UnwindRule::Offset(offset) => {
                let addr = cfa.wrapping_add_signed(*offset) as usize;
                Ok(Some(self.thread.read_address_at(addr)? as u64))
            }
            UnwindRule::ValOffset(offset) => Ok(Some(cfa.wrapping_add_signed(*offset))),
            UnwindRule::Register(other) => Ok(self.regs.value(*other)),
            UnwindRule::Expression(expr) => {
                let addr = self.eval_value(expr.clone())? as usize;
                Ok(Some(self.thread.read_address_at(addr)? as u64))
            }
            UnwindRule::ValExpression(expr) => Ok(Some(self.eval_value(expr.clone())?)),
            UnwindRule::Constant(value) => Ok(Some(*value)),
            UnwindRule::Architectural => Err(Error::ArchitecturalRule),
            UnwindRule::FramePointer(other) => match self.regs.value(*other) {
                None => Ok(None),
                // while the chain entry points below the CFA it still holds
                // a saved frame pointer to load
                Some(current) if current <= cfa => {
                    Ok(Some(self.thread.read_address_at(current as usize)? as u64))
                }
                Some(current) => Ok(Some(current)),
            },
        }
    }

    fn eval_value(&self, expr: Expression) -> Result<u64> {
        let encoding = self.data.encoding_for_pc(self.pc);
        let evaluator = ExpressionEvaluator::new(encoding, self.thread, &self.regs);
        evaluator.evaluate(expr)?.into_value(&self.regs)
    }
}
