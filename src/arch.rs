//! x86-64 architecture descriptor: trap instruction, special register
//! indices and the default call-frame rules used when `.eh_frame` has no
//! entry for a pc.

use crate::dwarf::frame::{CfaRule, FrameContext, UnwindRule};
use crate::register::DwarfRegisters;

/// int3
pub const TRAP_INSTRUCTION: [u8; 1] = [0xCC];
pub const TRAP_SIZE: usize = TRAP_INSTRUCTION.len();

pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

// Indexes into the native register block (the order of fields in
// `user_regs_struct`, see arch/x86/include/uapi/asm/ptrace.h).
pub const PC_REG_IDX: usize = 16; // rip
pub const SP_REG_IDX: usize = 19; // rsp
pub const FP_REG_IDX: usize = 4; // rbp

/// DWARF register numbers of the special purpose registers.
pub const DWARF_PC_REG: u16 = 49;
pub const DWARF_SP_REG: u16 = 7;
pub const DWARF_BP_REG: u16 = 6;

/// Convert a native register block index to a DWARF register number.
pub fn native_to_dwarf_reg(reg: usize) -> Option<u16> {
    let dreg = match reg {
        0 => 15,  // r15
        1 => 14,  // r14
        2 => 13,  // r13
        3 => 12,  // r12
        4 => 6,   // rbp
        5 => 3,   // rbx
        6 => 11,  // r11
        7 => 10,  // r10
        8 => 9,   // r9
        9 => 8,   // r8
        10 => 0,  // rax
        11 => 2,  // rcx
        12 => 1,  // rdx
        13 => 4,  // rsi
        14 => 5,  // rdi
        16 => 49, // rip
        19 => 7,  // rsp
        _ => return None,
    };
    Some(dreg)
}

/// Patch up a frame context before rule execution.
///
/// Functions without CFI (or with a frame-pointer-omitting prologue not yet
/// executed) unwind through the classic rbp chain: the caller pushed the
/// return address, the prologue pushed rbp, so
/// `CFA = rbp + 2*8`, `rip = *(CFA - 8)`, `rbp = *(CFA - 16)`, `rsp = CFA`.
pub fn fix_frame_context(
    ctx: Option<FrameContext>,
    _pc: usize,
    _regs: &DwarfRegisters,
) -> FrameContext {
    let mut ctx = match ctx {
        Some(ctx) => ctx,
        None => {
            let mut ctx = FrameContext::new(
                CfaRule::RegisterAndOffset {
                    register: DWARF_BP_REG,
                    offset: 2 * PTR_SIZE as i64,
                },
                DWARF_PC_REG,
            );
            ctx.regs
                .insert(DWARF_PC_REG, UnwindRule::Offset(-(PTR_SIZE as i64)));
            ctx.regs
                .insert(DWARF_BP_REG, UnwindRule::Offset(-2 * PTR_SIZE as i64));
            ctx.regs.insert(DWARF_SP_REG, UnwindRule::ValOffset(0));
            return ctx;
        }
    };

    // A CFI entry that leaves rbp undefined still has a live frame pointer
    // chain to walk.
    match ctx.regs.get(&DWARF_BP_REG) {
        None | Some(UnwindRule::Undefined) => {
            ctx.regs
                .insert(DWARF_BP_REG, UnwindRule::FramePointer(DWARF_BP_REG));
        }
        _ => {}
    }

    ctx
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::register::DwarfRegisters;

    #[test]
    fn test_special_register_mapping() {
        assert_eq!(native_to_dwarf_reg(PC_REG_IDX), Some(DWARF_PC_REG));
        assert_eq!(native_to_dwarf_reg(SP_REG_IDX), Some(DWARF_SP_REG));
        assert_eq!(native_to_dwarf_reg(FP_REG_IDX), Some(DWARF_BP_REG));
        // orig_rax and the segment registers have no mapping
        assert_eq!(native_to_dwarf_reg(15), None);
        assert_eq!(native_to_dwarf_reg(17), None);
        assert_eq!(native_to_dwarf_reg(26), None);
    }

    #[test]
    fn test_mapped_register_count() {
        let mapped = (0..27).filter(|&i| native_to_dwarf_reg(i).is_some()).count();
        assert_eq!(mapped, 17);
    }

    #[test]
    fn test_default_frame_context() {
        let regs = DwarfRegisters::default();
        let ctx = fix_frame_context(None, 0x1000, &regs);

        assert!(matches!(
            ctx.cfa,
            CfaRule::RegisterAndOffset {
                register: DWARF_BP_REG,
                offset: 16
            }
        ));
        assert!(matches!(
            ctx.regs.get(&DWARF_PC_REG),
            Some(UnwindRule::Offset(-8))
        ));
        assert!(matches!(
            ctx.regs.get(&DWARF_BP_REG),
            Some(UnwindRule::Offset(-16))
        ));
        assert!(matches!(
            ctx.regs.get(&DWARF_SP_REG),
            Some(UnwindRule::ValOffset(0))
        ));
        assert_eq!(ctx.ret_addr_reg, DWARF_PC_REG);
    }

    #[test]
    fn test_undefined_frame_pointer_rewritten() {
        let regs = DwarfRegisters::default();
        let mut ctx = FrameContext::new(
            CfaRule::RegisterAndOffset {
                register: DWARF_SP_REG,
                offset: 8,
            },
            DWARF_PC_REG,
        );
        ctx.regs.insert(DWARF_BP_REG, UnwindRule::Undefined);

        let fixed = fix_frame_context(Some(ctx), 0x1000, &regs);
        assert!(matches!(
            fixed.regs.get(&DWARF_BP_REG),
            Some(UnwindRule::FramePointer(DWARF_BP_REG))
        ));

        // an existing meaningful rule is left alone
        let mut ctx = FrameContext::new(
            CfaRule::RegisterAndOffset {
                register: DWARF_SP_REG,
                offset: 8,
            },
            DWARF_PC_REG,
        );
        ctx.regs.insert(DWARF_BP_REG, UnwindRule::Offset(-16));
        let fixed = fix_frame_context(Some(ctx), 0x1000, &regs);
        assert!(matches!(
            fixed.regs.get(&DWARF_BP_REG),
            Some(UnwindRule::Offset(-16))
        ));
    }
}
