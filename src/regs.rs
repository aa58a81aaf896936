//! Physical register conventions for the System V AMD64 target.
//!
//! Registers are split into disjoint roles per operand kind:
//!
//! - *Intermediates* are scratch registers used while lowering a single
//!   instruction. They are never assumed live across lowered instructions,
//!   so any lowering routine may clobber them freely.
//! - *Generals* hold parameters, locals and virtual-stack values. Register
//!   allocation hands them out in pool order; values past the pool spill to
//!   the machine stack.
//! - The remaining tables describe what the outside world (System V callers,
//!   the kernel) expects.

use crate::asm::Width;

/// A general purpose x86-64 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    /// Returns the assembler name of this register at the given access width.
    pub fn name(self, width: Width) -> &'static str {
        use self::Gpr::*;

        let names: [&'static str; 4] = match self {
            Rax => ["al", "ax", "eax", "rax"],
            Rcx => ["cl", "cx", "ecx", "rcx"],
            Rdx => ["dl", "dx", "edx", "rdx"],
            Rbx => ["bl", "bx", "ebx", "rbx"],
            Rsp => ["spl", "sp", "esp", "rsp"],
            Rbp => ["bpl", "bp", "ebp", "rbp"],
            Rsi => ["sil", "si", "esi", "rsi"],
            Rdi => ["dil", "di", "edi", "rdi"],
            R8 => ["r8b", "r8w", "r8d", "r8"],
            R9 => ["r9b", "r9w", "r9d", "r9"],
            R10 => ["r10b", "r10w", "r10d", "r10"],
            R11 => ["r11b", "r11w", "r11d", "r11"],
            R12 => ["r12b", "r12w", "r12d", "r12"],
            R13 => ["r13b", "r13w", "r13d", "r13"],
            R14 => ["r14b", "r14w", "r14d", "r14"],
            R15 => ["r15b", "r15w", "r15d", "r15"],
        };
        match width {
            Width::B => names[0],
            Width::W => names[1],
            Width::L => names[2],
            Width::Q | Width::S | Width::D => names[3],
        }
    }
}

/// An SSE register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl Xmm {
    /// Returns the assembler name of this register.
    pub fn name(self) -> &'static str {
        use self::Xmm::*;

        match self {
            Xmm0 => "xmm0",
            Xmm1 => "xmm1",
            Xmm2 => "xmm2",
            Xmm3 => "xmm3",
            Xmm4 => "xmm4",
            Xmm5 => "xmm5",
            Xmm6 => "xmm6",
            Xmm7 => "xmm7",
            Xmm8 => "xmm8",
            Xmm9 => "xmm9",
            Xmm10 => "xmm10",
            Xmm11 => "xmm11",
            Xmm12 => "xmm12",
            Xmm13 => "xmm13",
            Xmm14 => "xmm14",
            Xmm15 => "xmm15",
        }
    }
}

/// Either kind of physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reg {
    /// A general purpose register.
    Int(Gpr),
    /// An SSE register.
    Float(Xmm),
}

impl Reg {
    /// Whether this is an SSE register.
    pub fn is_float(self) -> bool {
        matches!(self, Reg::Float(_))
    }

    /// Returns the assembler name at the given width; the width only matters
    /// for general purpose registers.
    pub fn name(self, width: Width) -> &'static str {
        match self {
            Reg::Int(gpr) => gpr.name(width),
            Reg::Float(xmm) => xmm.name(),
        }
    }
}

impl From<Gpr> for Reg {
    fn from(gpr: Gpr) -> Reg {
        Reg::Int(gpr)
    }
}

impl From<Xmm> for Reg {
    fn from(xmm: Xmm) -> Reg {
        Reg::Float(xmm)
    }
}

/// Integer scratch registers, in allocation priority order.
/// The first one doubles as the integer result register.
pub const INT_INTERMEDIATES: [Gpr; 3] = [Gpr::Rax, Gpr::Rcx, Gpr::Rdx];

/// Float scratch registers. The first one doubles as the float result
/// register; the last one is the float relocation temporary.
pub const FLOAT_INTERMEDIATES: [Xmm; 3] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm15];

/// Integer registers handed out to parameters, locals and virtual-stack
/// values, in allocation order.
pub const INT_GENERALS: [Gpr; 12] = [
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
    Gpr::Rbx,
    Gpr::Rbp,
];

/// Float registers handed out to parameters, locals and virtual-stack
/// values, in allocation order.
pub const FLOAT_GENERALS: [Xmm; 13] = [
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
    Xmm::Xmm8,
    Xmm::Xmm9,
    Xmm::Xmm10,
    Xmm::Xmm11,
    Xmm::Xmm12,
    Xmm::Xmm13,
    Xmm::Xmm14,
];

/// System V integer argument registers, in argument order.
pub const SYSV_INT_PARAMS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// System V float argument registers, in argument order.
pub const SYSV_FLOAT_PARAMS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// Registers a System V callee must preserve.
pub const SYSV_CALLEE_SAVE: [Gpr; 6] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// General registers clobbered around an mmap syscall: the argument
/// registers rdi, rsi, r10, r8, r9 plus r11, which the syscall instruction
/// itself destroys. rax, rcx and rdx are also involved but are
/// intermediates and never live across an instruction.
pub const MMAP_GENERAL_CLOBBERS: [Gpr; 6] =
    [Gpr::Rdi, Gpr::Rsi, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11];

/// The only register x86 shifts accept a variable count in.
pub const SHIFT_REGISTER: Gpr = Gpr::Rcx;

/// Quotient / low half of the divide pair.
pub const DIV_LOW_REGISTER: Gpr = Gpr::Rax;

/// Remainder / high half of the divide pair.
pub const DIV_HIGH_REGISTER: Gpr = Gpr::Rdx;

/// Integer result register of the internal and System V conventions.
pub const INT_RESULT_REGISTER: Gpr = Gpr::Rax;

/// Float result register of the internal and System V conventions.
pub const FLOAT_RESULT_REGISTER: Xmm = Xmm::Xmm0;

/// Returns the size of the general pool for the given operand kind.
pub fn general_count(float: bool) -> usize {
    if float {
        FLOAT_GENERALS.len()
    } else {
        INT_GENERALS.len()
    }
}

/// Returns the `index`-th general register of the given kind, or `None` once
/// the pool is exhausted.
pub fn general(float: bool, index: usize) -> Option<Reg> {
    if float {
        FLOAT_GENERALS.get(index).copied().map(Reg::Float)
    } else {
        INT_GENERALS.get(index).copied().map(Reg::Int)
    }
}

/// Returns the `index`-th intermediate register of the given kind.
///
/// # Panics
///
/// Panics if `index` is past the intermediate pool; lowering routines only
/// ever stage through the three scratch registers of each kind.
pub fn intermediate(float: bool, index: usize) -> Reg {
    if float {
        Reg::Float(FLOAT_INTERMEDIATES[index])
    } else {
        Reg::Int(INT_INTERMEDIATES[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_are_disjoint() {
        for gpr in &INT_GENERALS {
            assert!(!INT_INTERMEDIATES.contains(gpr));
        }
        for xmm in &FLOAT_GENERALS {
            assert!(!FLOAT_INTERMEDIATES.contains(xmm));
        }
    }

    #[test]
    fn generals_run_out() {
        assert_eq!(general(false, 0), Some(Reg::Int(Gpr::Rdi)));
        assert_eq!(general(false, 11), Some(Reg::Int(Gpr::Rbp)));
        assert_eq!(general(false, 12), None);
        assert_eq!(general(true, 0), Some(Reg::Float(Xmm::Xmm2)));
        assert_eq!(general(true, 12), Some(Reg::Float(Xmm::Xmm14)));
        assert_eq!(general(true, 13), None);
    }

    #[test]
    fn sub_register_names() {
        assert_eq!(Gpr::Rax.name(Width::B), "al");
        assert_eq!(Gpr::Rax.name(Width::L), "eax");
        assert_eq!(Gpr::R8.name(Width::B), "r8b");
        assert_eq!(Gpr::R8.name(Width::Q), "r8");
    }
}
