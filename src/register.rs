//! The native register block as a flat vector of words in kernel ABI order,
//! plus the DWARF-numbered register snapshot used by expression evaluation
//! and unwinding.

use crate::arch;
use gimli::RunTimeEndian;
use nix::libc::user_regs_struct;
use std::collections::BTreeMap;

/// Number of words in `user_regs_struct` on x86-64.
pub const REGS_COUNT: usize = 27;

/// Names of the native registers, in kernel ABI order
/// (see arch/x86/include/uapi/asm/ptrace.h).
pub const REG_NAMES: [&str; REGS_COUNT] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx", "rsi",
    "rdi", "orig_rax", "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds", "es", "fs",
    "gs",
];

/// Flatten `user_regs_struct` into a word vector indexed by the arch
/// descriptor constants.
pub fn regs_to_vec(regs: &user_regs_struct) -> Vec<u64> {
    vec![
        regs.r15,
        regs.r14,
        regs.r13,
        regs.r12,
        regs.rbp,
        regs.rbx,
        regs.r11,
        regs.r10,
        regs.r9,
        regs.r8,
        regs.rax,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.orig_rax,
        regs.rip,
        regs.cs,
        regs.eflags,
        regs.rsp,
        regs.ss,
        regs.fs_base,
        regs.gs_base,
        regs.ds,
        regs.es,
        regs.fs,
        regs.gs,
    ]
}

/// Write a word vector back into a `user_regs_struct`.
pub fn vec_to_regs(values: &[u64], regs: &mut user_regs_struct) {
    let mut fields: [&mut u64; REGS_COUNT] = [
        &mut regs.r15,
        &mut regs.r14,
        &mut regs.r13,
        &mut regs.r12,
        &mut regs.rbp,
        &mut regs.rbx,
        &mut regs.r11,
        &mut regs.r10,
        &mut regs.r9,
        &mut regs.r8,
        &mut regs.rax,
        &mut regs.rcx,
        &mut regs.rdx,
        &mut regs.rsi,
        &mut regs.rdi,
        &mut regs.orig_rax,
        &mut regs.rip,
        &mut regs.cs,
        &mut regs.eflags,
        &mut regs.rsp,
        &mut regs.ss,
        &mut regs.fs_base,
        &mut regs.gs_base,
        &mut regs.ds,
        &mut regs.es,
        &mut regs.fs,
        &mut regs.gs,
    ];
    for (field, value) in fields.iter_mut().zip(values) {
        **field = *value;
    }
}

/// A register snapshot keyed by DWARF register number, together with the
/// frame state an expression needs: CFA, frame base and static base.
#[derive(Debug, Clone)]
pub struct DwarfRegisters {
    regs: BTreeMap<u16, u64>,
    pub byte_order: RunTimeEndian,
    pub pc_num: u16,
    pub sp_num: u16,
    pub bp_num: u16,
    pub cfa: u64,
    pub frame_base: u64,
    pub static_base: u64,
}

impl Default for DwarfRegisters {
    fn default() -> Self {
        Self {
            regs: BTreeMap::new(),
            byte_order: RunTimeEndian::default(),
            pc_num: arch::DWARF_PC_REG,
            sp_num: arch::DWARF_SP_REG,
            bp_num: arch::DWARF_BP_REG,
            cfa: 0,
            frame_base: 0,
            static_base: 0,
        }
    }
}

impl DwarfRegisters {
    /// Build a snapshot from the flat native register vector.
    pub fn from_native(native: &[u64]) -> Self {
        let mut this = Self::default();
        for (idx, &value) in native.iter().enumerate() {
            if let Some(dwarf_num) = arch::native_to_dwarf_reg(idx) {
                this.regs.insert(dwarf_num, value);
            }
        }
        this
    }

    pub fn value(&self, reg: u16) -> Option<u64> {
        self.regs.get(&reg).copied()
    }

    /// Record a register value; `None` clears the register, which models an
    /// undefined rule result during unwinding.
    pub fn set(&mut self, reg: u16, value: Option<u64>) {
        match value {
            Some(v) => {
                self.regs.insert(reg, v);
            }
            None => {
                self.regs.remove(&reg);
            }
        }
    }

    pub fn pc(&self) -> u64 {
        self.value(self.pc_num).unwrap_or(0)
    }

    pub fn sp(&self) -> u64 {
        self.value(self.sp_num).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.regs.iter().map(|(&reg, &val)| (reg, val))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn zeroed_regs() -> user_regs_struct {
        // user_regs_struct has no Default impl
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_flat_vector_round_trip() {
        let mut regs = zeroed_regs();
        regs.rip = 0xdead_beef;
        regs.rsp = 0x7fff_0000;
        regs.rbp = 0x7fff_0100;
        regs.rax = 42;

        let v = regs_to_vec(&regs);
        assert_eq!(v.len(), REGS_COUNT);
        assert_eq!(v[arch::PC_REG_IDX], 0xdead_beef);
        assert_eq!(v[arch::SP_REG_IDX], 0x7fff_0000);
        assert_eq!(v[arch::FP_REG_IDX], 0x7fff_0100);
        assert_eq!(v[10], 42);

        let mut restored = zeroed_regs();
        vec_to_regs(&v, &mut restored);
        assert_eq!(restored.rip, 0xdead_beef);
        assert_eq!(restored.rsp, 0x7fff_0000);
        assert_eq!(restored.rbp, 0x7fff_0100);
        assert_eq!(restored.rax, 42);
    }

    #[test]
    fn test_dwarf_snapshot() {
        let mut native = vec![0u64; REGS_COUNT];
        native[arch::PC_REG_IDX] = 0x4000;
        native[arch::SP_REG_IDX] = 0x7fff_1000;
        native[10] = 0x1234; // rax -> DWARF 0

        let snapshot = DwarfRegisters::from_native(&native);
        assert_eq!(snapshot.pc(), 0x4000);
        assert_eq!(snapshot.sp(), 0x7fff_1000);
        assert_eq!(snapshot.value(0), Some(0x1234));
        // orig_rax has no DWARF number and must not leak into the snapshot
        assert_eq!(snapshot.iter().count(), 17);
    }

    #[test]
    fn test_set_and_clear() {
        let mut snapshot = DwarfRegisters::default();
        snapshot.set(6, Some(0xa0));
        assert_eq!(snapshot.value(6), Some(0xa0));
        snapshot.set(6, None);
        assert_eq!(snapshot.value(6), None);
    }
}
