//! Call Frame Information from `.eh_frame`.
//!
//! The section is parsed into CIEs and FDEs once at load time; a frame
//! context for a pc is produced by running the CIE initial instructions and
//! the FDE instructions up to that pc, then freezing the resulting unwind
//! rules into [`FrameContext`]. Rule execution itself lives in the stack
//! iterator.

use crate::dwarf::EndianArcSlice;
use crate::error::{Error, Result};
use gimli::{BaseAddresses, EhFrame, UnwindSection};
use log::warn;
use std::collections::BTreeMap;

pub type Expression = gimli::Expression<EndianArcSlice>;

/// How to recover one register of the previous frame.
#[derive(Debug, Clone)]
pub enum UnwindRule {
    Undefined,
    SameValue,
    /// Value lives in memory at CFA + offset.
    Offset(i64),
    /// Value is CFA + offset itself.
    ValOffset(i64),
    /// Value lives in another register.
    Register(u16),
    /// Expression yields an address to load the value from.
    Expression(Expression),
    /// Expression yields the value.
    ValExpression(Expression),
    /// Value is a constant.
    Constant(u64),
    Architectural,
    /// The register holds a frame-pointer chain entry: dereference it while
    /// it points below the CFA, otherwise take it as-is.
    FramePointer(u16),
}

/// How to compute the call frame address.
#[derive(Debug, Clone)]
pub enum CfaRule {
    RegisterAndOffset { register: u16, offset: i64 },
    Expression(Expression),
}

/// Frozen unwind state for one pc.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub cfa: CfaRule,
    pub regs: BTreeMap<u16, UnwindRule>,
    pub ret_addr_reg: u16,
}

impl FrameContext {
    pub fn new(cfa: CfaRule, ret_addr_reg: u16) -> Self {
        Self {
            cfa,
            regs: BTreeMap::new(),
            ret_addr_reg,
        }
    }
}

/// `.eh_frame` of one ELF image. The section keeps link-time addresses;
/// lookups take relocated pcs and strip the image's load bias first.
pub struct FrameTable {
    eh_frame: EhFrame<EndianArcSlice>,
    bases: BaseAddresses,
    static_base: usize,
}

impl FrameTable {
    /// `section_addr` is the virtual address of `.eh_frame` within the image,
    /// `static_base` the image's runtime load address.
    pub fn new(section: EndianArcSlice, section_addr: u64, static_base: usize) -> Self {
        let eh_frame = EhFrame::from(section);
        let bases = BaseAddresses::default().set_eh_frame(section_addr);
        Self {
            eh_frame,
            bases,
            static_base,
        }
    }

    /// Establish the frame context for a (relocated) pc, or `None` when no
    /// FDE covers it.
    pub fn frame_context(&self, pc: usize) -> Result<Option<FrameContext>> {
        let pc = if pc > self.static_base {
            pc - self.static_base
        } else {
            pc
        };

        let fde = match self
            .eh_frame
            .fde_for_address(&self.bases, pc as u64, EhFrame::cie_from_offset)
        {
            Ok(fde) => fde,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(e) => return Err(Error::Dwarf(e)),
        };

        let mut ucx = Box::new(gimli::UnwindContext::new());
        let row = fde.unwind_info_for_address(&self.eh_frame, &self.bases, &mut ucx, pc as u64)?;

        let cfa = match row.cfa() {
            gimli::CfaRule::RegisterAndOffset { register, offset } => CfaRule::RegisterAndOffset {
                register: register.0,
                offset: *offset,
            },
            gimli::CfaRule::Expression(expr) => CfaRule::Expression(expr.clone()),
        };

        let mut ctx = FrameContext::new(cfa, fde.cie().return_address_register().0);
        for (reg, rule) in row.registers() {
            ctx.regs.insert(reg.0, convert_rule(rule));
        }

        Ok(Some(ctx))
    }
}

fn convert_rule(rule: &gimli::RegisterRule<EndianArcSlice>) -> UnwindRule {
    match rule {
        gimli::RegisterRule::Undefined => UnwindRule::Undefined,
        gimli::RegisterRule::SameValue => UnwindRule::SameValue,
        gimli::RegisterRule::Offset(offset) => UnwindRule::Offset(*offset),
        gimli::RegisterRule::ValOffset(offset) => UnwindRule::ValOffset(*offset),
        gimli::RegisterRule::Register(reg) => UnwindRule::Register(reg.0),
        gimli::RegisterRule::Expression(expr) => UnwindRule::Expression(expr.clone()),
        gimli::RegisterRule::ValExpression(expr) => UnwindRule::ValExpression(expr.clone()),
        gimli::RegisterRule::Constant(value) => UnwindRule::Constant(*value),
        gimli::RegisterRule::Architectural => UnwindRule::Architectural,
        other => {
            warn!(target: "tracer", "unsupported register rule {other:?}");
            UnwindRule::Undefined
        }
    }
}

/// Determine DWARF data endianness from the version field of `.debug_info`
/// (bytes 4 and 5 hold the version number in section byte order; a valid
/// version is small, so the zero byte marks the big end).
pub fn dwarf_endian(debug_info: &[u8]) -> gimli::RunTimeEndian {
    if debug_info.len() < 6 {
        return gimli::RunTimeEndian::Big;
    }
    let (x, y) = (debug_info[4], debug_info[5]);
    if x == 0 {
        gimli::RunTimeEndian::Big
    } else if y == 0 {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch;
    use gimli::RunTimeEndian;
    use std::sync::Arc;

    fn slice(data: &[u8]) -> EndianArcSlice {
        EndianArcSlice::new(Arc::from(data), RunTimeEndian::Little)
    }

    /// Hand-assembled .eh_frame: one CIE (version 1, augmentation "zR",
    /// code align 1, data align -8, RA register 16, encoding absptr) and one
    /// FDE covering [0x1000, 0x1100) with `DW_CFA_def_cfa rsp+8`.
    fn synthetic_eh_frame() -> Vec<u8> {
        let mut cie: Vec<u8> = vec![];
        cie.extend_from_slice(&[0, 0, 0, 0]); // CIE id
        cie.push(1); // version
        cie.extend_from_slice(b"zR\0"); // augmentation
        cie.push(1); // code alignment factor (uleb)
        cie.push(0x78); // data alignment factor (sleb -8)
        cie.push(16); // return address register
        cie.push(1); // augmentation data length
        cie.push(0x00); // R: DW_EH_PE_absptr
        cie.extend_from_slice(&[0x0c, 0x07, 0x08]); // DW_CFA_def_cfa rsp 8
        while (cie.len() + 4) % 8 != 0 {
            cie.push(0x00); // DW_CFA_nop padding
        }

        let mut out: Vec<u8> = vec![];
        out.extend_from_slice(&(cie.len() as u32).to_le_bytes());
        out.extend_from_slice(&cie);

        let cie_offset = out.len();
        let mut fde: Vec<u8> = vec![];
        fde.extend_from_slice(&((cie_offset + 4) as u32).to_le_bytes()); // CIE pointer
        fde.extend_from_slice(&0x1000u64.to_le_bytes()); // initial location
        fde.extend_from_slice(&0x100u64.to_le_bytes()); // address range
        fde.push(0); // augmentation data length
        fde.extend_from_slice(&[0x8f, 0x02]); // DW_CFA_offset r15 at cfa-16
        while fde.len() % 8 != 0 {
            fde.push(0x00);
        }

        out.extend_from_slice(&((fde.len()) as u32).to_le_bytes());
        out.extend_from_slice(&fde);
        out.extend_from_slice(&[0, 0, 0, 0]); // terminator
        out
    }

    #[test]
    fn test_frame_context_for_pc() {
        let data = synthetic_eh_frame();
        let table = FrameTable::new(slice(&data), 0, 0);

        let ctx = table.frame_context(0x1080).unwrap().unwrap();
        assert!(matches!(
            ctx.cfa,
            CfaRule::RegisterAndOffset {
                register: arch::DWARF_SP_REG,
                offset: 8
            }
        ));
        assert_eq!(ctx.ret_addr_reg, 16);
        assert!(matches!(ctx.regs.get(&15), Some(UnwindRule::Offset(-16))));
    }

    #[test]
    fn test_frame_context_respects_static_base() {
        let data = synthetic_eh_frame();
        let table = FrameTable::new(slice(&data), 0, 0x7f0000000000);

        // a relocated pc is translated back to the link-time address
        assert!(table.frame_context(0x7f0000001080).unwrap().is_some());
        assert!(table.frame_context(0x7f0000005000).unwrap().is_none());
    }

    #[test]
    fn test_no_fde_for_foreign_pc() {
        let data = synthetic_eh_frame();
        let table = FrameTable::new(slice(&data), 0, 0);

        assert!(table.frame_context(0x5000).unwrap().is_none());
        assert!(table.frame_context(0x1100).unwrap().is_none()); // end is exclusive
    }

    #[test]
    fn test_dwarf_endian_heuristic() {
        // version 4 little-endian: 04 00
        assert_eq!(
            dwarf_endian(&[0, 0, 0, 0, 4, 0]),
            RunTimeEndian::Little
        );
        // version 4 big-endian: 00 04
        assert_eq!(dwarf_endian(&[0, 0, 0, 0, 0, 4]), RunTimeEndian::Big);
        // both nonzero: assume big
        assert_eq!(dwarf_endian(&[0, 0, 0, 0, 1, 1]), RunTimeEndian::Big);
        // too short: assume big
        assert_eq!(dwarf_endian(&[0, 0]), RunTimeEndian::Big);
    }
}
