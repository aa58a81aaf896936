//! Structured x86-64 assembly instructions.
//!
//! The code generator builds a flat stream of these records; nothing in the
//! crate manipulates assembly text. Each record knows how to render itself
//! as one line of GNU assembler (AT&T) syntax through [`core::fmt::Display`],
//! which is the seam an embedder uses to serialize a compiled module.
//!
//! The operand model is deliberately small: a register (optionally accessed
//! at a narrower width than the instruction), a base + displacement +
//! scaled-index memory reference, a label, or an immediate. Labels render
//! rip-relative in memory positions and bare in branch positions.

use alloc::string::String;
use core::fmt;

use parity_wasm::elements::ValueType;

use crate::regs::{Gpr, Reg};

/// Operand width. `b`/`w`/`l`/`q` are the integer widths, `s`/`d` the
/// scalar float widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Width {
    B,
    W,
    L,
    Q,
    S,
    D,
}

impl Width {
    /// The width a value of the given wasm type occupies.
    pub fn of(value_type: ValueType) -> Width {
        match value_type {
            ValueType::I32 => Width::L,
            ValueType::I64 => Width::Q,
            ValueType::F32 => Width::S,
            ValueType::F64 => Width::D,
        }
    }

    /// Whether this is a scalar float width.
    pub fn is_float(self) -> bool {
        matches!(self, Width::S | Width::D)
    }

    /// The GAS mnemonic suffix for integer instructions of this width.
    fn suffix(self) -> &'static str {
        match self {
            Width::B => "b",
            Width::W => "w",
            Width::L => "l",
            Width::Q => "q",
            Width::S => "s",
            Width::D => "d",
        }
    }

    /// The `ss`/`sd` mnemonic tail for scalar float instructions.
    fn scalar(self) -> &'static str {
        match self {
            Width::S => "ss",
            Width::D => "sd",
            _ => panic!("scalar suffix of an integer width"),
        }
    }

    /// The `ps`/`pd` mnemonic tail for packed float instructions.
    fn packed(self) -> &'static str {
        match self {
            Width::S => "ps",
            Width::D => "pd",
            _ => panic!("packed suffix of an integer width"),
        }
    }
}

/// A branch condition code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    S,
    Ns,
    P,
    Np,
}

impl Cond {
    fn code(self) -> &'static str {
        match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::Le => "le",
            Cond::G => "g",
            Cond::Ge => "ge",
            Cond::B => "b",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::Ae => "ae",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
        }
    }
}

/// An SSE rounding mode, as encoded in the `round*` immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// Round to nearest, ties to even.
    Nearest,
    /// Round toward negative infinity.
    Down,
    /// Round toward positive infinity.
    Up,
    /// Round toward zero.
    Truncate,
}

impl RoundMode {
    fn immediate(self) -> i64 {
        match self {
            RoundMode::Nearest => 0,
            RoundMode::Down => 1,
            RoundMode::Up => 2,
            RoundMode::Truncate => 3,
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    /// A register, optionally accessed at a width other than the
    /// instruction's.
    Register(Reg, Option<Width>),
    /// A memory reference `displacement(base, index, scale)`.
    Indirect {
        /// Base register.
        base: Gpr,
        /// Signed displacement added to the base.
        displacement: i32,
        /// Optional scaled index register.
        index: Option<(Gpr, u8)>,
    },
    /// A label; rip-relative in memory positions, bare in branch positions.
    Label(String),
    /// An immediate value.
    Immediate(i64),
}

impl Datum {
    /// A register operand at the instruction width.
    pub fn reg(register: impl Into<Reg>) -> Datum {
        Datum::Register(register.into(), None)
    }

    /// A register operand at an explicit width (e.g. `%cl` in a shift).
    pub fn reg_width(register: impl Into<Reg>, width: Width) -> Datum {
        Datum::Register(register.into(), Some(width))
    }

    /// A base + displacement memory operand.
    pub fn mem(base: Gpr, displacement: i32) -> Datum {
        Datum::Indirect {
            base,
            displacement,
            index: None,
        }
    }

    /// A base + displacement + scaled index memory operand.
    pub fn mem_index(base: Gpr, displacement: i32, index: Gpr, scale: u8) -> Datum {
        Datum::Indirect {
            base,
            displacement,
            index: Some((index, scale)),
        }
    }

    /// A label operand.
    pub fn label(name: impl Into<String>) -> Datum {
        Datum::Label(name.into())
    }

    /// An immediate operand.
    pub fn imm(value: i64) -> Datum {
        Datum::Immediate(value)
    }

    fn is_xmm(&self) -> bool {
        matches!(self, Datum::Register(Reg::Float(_), _))
    }

    fn write(&self, f: &mut fmt::Formatter, width: Width) -> fmt::Result {
        match self {
            Datum::Register(reg, override_width) => {
                write!(f, "%{}", reg.name(override_width.unwrap_or(width)))
            }
            Datum::Indirect {
                base,
                displacement,
                index,
            } => {
                if *displacement != 0 {
                    write!(f, "{}", displacement)?;
                }
                write!(f, "(%{}", base.name(Width::Q))?;
                if let Some((index, scale)) = index {
                    write!(f, ",%{},{}", index.name(Width::Q), scale)?;
                }
                write!(f, ")")
            }
            Datum::Label(name) => write!(f, "{}(%rip)", name),
            Datum::Immediate(value) => write!(f, "${}", value),
        }
    }

    /// Branch positions render labels bare and everything else as an
    /// indirect `*` target.
    fn write_branch(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datum::Label(name) => write!(f, "{}", name),
            other => {
                write!(f, "*")?;
                other.write(f, Width::Q)
            }
        }
    }
}

/// The value stored by a `.quad` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuadValue {
    /// A constant.
    Constant(i64),
    /// The address of a label.
    Label(String),
    /// The difference of two label addresses.
    Difference(String, String),
}

/// A GAS directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `.text`
    Text,
    /// `.data`
    Data,
    /// `.section .rodata`
    Rodata,
    /// `.globl NAME`
    Globl(String),
    /// `.balign N`
    Balign(u32),
    /// `.long V`
    Long(i64),
    /// `.quad V`
    Quad(QuadValue),
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Directive::Text => write!(f, ".text"),
            Directive::Data => write!(f, ".data"),
            Directive::Rodata => write!(f, ".section .rodata"),
            Directive::Globl(name) => write!(f, ".globl {}", name),
            Directive::Balign(alignment) => write!(f, ".balign {}", alignment),
            Directive::Long(value) => write!(f, ".long {}", value),
            Directive::Quad(QuadValue::Constant(value)) => write!(f, ".quad {}", value),
            Directive::Quad(QuadValue::Label(name)) => write!(f, ".quad {}", name),
            Directive::Quad(QuadValue::Difference(a, b)) => write!(f, ".quad {}-{}", a, b),
        }
    }
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// One line of assembly: a label, a directive, or a machine instruction.
///
/// The set is closed; the lowering pass matches and constructs these
/// directly, and text only appears at `Display` time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Instruction {
    Label(String),
    Directive(Directive),

    // Data movement.
    Mov { src: Datum, dest: Datum, width: Width },
    MovExtend {
        sign: bool,
        src: Datum,
        dest: Datum,
        src_width: Width,
        dest_width: Width,
    },
    Push(Datum),
    Pop(Datum),
    Lea { src: Datum, dest: Datum },
    CMov { cond: Cond, src: Datum, dest: Datum, width: Width },

    // Integer arithmetic and logic.
    Add { src: Datum, dest: Datum, width: Width },
    Sub { src: Datum, dest: Datum, width: Width },
    And { src: Datum, dest: Datum, width: Width },
    Or { src: Datum, dest: Datum, width: Width },
    Xor { src: Datum, dest: Datum, width: Width },
    Not { dest: Datum, width: Width },
    Shl { count: Datum, dest: Datum, width: Width },
    Shr { count: Datum, dest: Datum, width: Width },
    Sar { count: Datum, dest: Datum, width: Width },
    Rol { count: Datum, dest: Datum, width: Width },
    Ror { count: Datum, dest: Datum, width: Width },
    IMul { src: Datum, dest: Datum, width: Width },
    /// `cdq` (l) or `cqto` (q): sign-extend rax into rdx ahead of a signed
    /// division.
    ConvertWord(Width),
    Div { signed: bool, divisor: Datum, width: Width },
    Lzcnt { src: Datum, dest: Datum, width: Width },
    Tzcnt { src: Datum, dest: Datum, width: Width },
    Popcnt { src: Datum, dest: Datum, width: Width },

    // Comparisons.
    Cmp { src: Datum, dest: Datum, width: Width },
    Test { src: Datum, dest: Datum, width: Width },
    SetCc { cond: Cond, dest: Datum },
    Ucomi { src: Datum, dest: Datum, width: Width },

    // Control.
    Call(Datum),
    Ret,
    Jmp { cond: Option<Cond>, target: Datum },
    Syscall,

    // Scalar and packed float operations.
    Sqrt { src: Datum, dest: Datum, width: Width },
    Round { mode: RoundMode, src: Datum, dest: Datum, width: Width },
    FMin { src: Datum, dest: Datum, width: Width },
    FMax { src: Datum, dest: Datum, width: Width },
    FMul { src: Datum, dest: Datum, width: Width },
    FDiv { src: Datum, dest: Datum, width: Width },
    AndPacked { src: Datum, dest: Datum, width: Width },
    AndNotPacked { src: Datum, dest: Datum, width: Width },
    XorPacked { src: Datum, dest: Datum, width: Width },
    /// `cvtts*2si`: truncating float-to-int conversion.
    TruncFloatToInt {
        src: Datum,
        dest: Datum,
        float_width: Width,
        int_width: Width,
    },
    /// `cvtsi2s*`: int-to-float conversion.
    IntToFloat {
        src: Datum,
        dest: Datum,
        int_width: Width,
        float_width: Width,
    },
    /// `cvtss2sd` / `cvtsd2ss`, keyed on the source width.
    FloatToFloat { src: Datum, dest: Datum, from: Width },

    // Frame management.
    Enter { frame_size: u32 },
    Leave,
}

fn write_pair(
    f: &mut fmt::Formatter,
    mnemonic: &str,
    src: &Datum,
    dest: &Datum,
    width: Width,
) -> fmt::Result {
    write!(f, "\t{} ", mnemonic)?;
    src.write(f, width)?;
    write!(f, ", ")?;
    dest.write(f, width)
}

fn write_int_pair(
    f: &mut fmt::Formatter,
    mnemonic: &str,
    src: &Datum,
    dest: &Datum,
    width: Width,
) -> fmt::Result {
    if width.is_float() {
        // add/sub double as their scalar SSE forms when given a float
        // width.
        return write_pair(f, &[mnemonic, width.scalar()].concat(), src, dest, width);
    }
    write!(f, "\t{}{} ", mnemonic, width.suffix())?;
    src.write(f, width)?;
    write!(f, ", ")?;
    dest.write(f, width)
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Instruction::*;

        match self {
            Label(name) => write!(f, "{}:", name),
            Directive(directive) => write!(f, "\t{}", directive),

            Mov { src, dest, width } => {
                if width.is_float() {
                    return write_pair(f, &["mov", width.scalar()].concat(), src, dest, *width);
                }
                if src.is_xmm() || dest.is_xmm() {
                    // Cross-domain or SSE 64/32-bit data move.
                    let mnemonic = match width {
                        Width::L => "movd",
                        _ => "movq",
                    };
                    return write_pair(f, mnemonic, src, dest, *width);
                }
                if *width == Width::Q {
                    if let Datum::Immediate(value) = src {
                        if !fits_i32(*value) {
                            return write_pair(f, "movabsq", src, dest, *width);
                        }
                    }
                }
                write_int_pair(f, "mov", src, dest, *width)
            }
            MovExtend {
                sign,
                src,
                dest,
                src_width,
                dest_width,
            } => {
                write!(
                    f,
                    "\tmov{}{}{} ",
                    if *sign { "s" } else { "z" },
                    src_width.suffix(),
                    dest_width.suffix()
                )?;
                src.write(f, *src_width)?;
                write!(f, ", ")?;
                dest.write(f, *dest_width)
            }
            Push(datum) => {
                write!(f, "\tpushq ")?;
                datum.write(f, Width::Q)
            }
            Pop(datum) => {
                write!(f, "\tpopq ")?;
                datum.write(f, Width::Q)
            }
            Lea { src, dest } => write_pair(f, "leaq", src, dest, Width::Q),
            CMov {
                cond,
                src,
                dest,
                width,
            } => write_pair(f, &["cmov", cond.code()].concat(), src, dest, *width),

            Add { src, dest, width } => write_int_pair(f, "add", src, dest, *width),
            Sub { src, dest, width } => write_int_pair(f, "sub", src, dest, *width),
            And { src, dest, width } => write_int_pair(f, "and", src, dest, *width),
            Or { src, dest, width } => write_int_pair(f, "or", src, dest, *width),
            Xor { src, dest, width } => write_int_pair(f, "xor", src, dest, *width),
            Not { dest, width } => {
                write!(f, "\tnot{} ", width.suffix())?;
                dest.write(f, *width)
            }
            Shl { count, dest, width } => write_int_pair(f, "shl", count, dest, *width),
            Shr { count, dest, width } => write_int_pair(f, "shr", count, dest, *width),
            Sar { count, dest, width } => write_int_pair(f, "sar", count, dest, *width),
            Rol { count, dest, width } => write_int_pair(f, "rol", count, dest, *width),
            Ror { count, dest, width } => write_int_pair(f, "ror", count, dest, *width),
            IMul { src, dest, width } => write_int_pair(f, "imul", src, dest, *width),
            ConvertWord(width) => match width {
                Width::Q => write!(f, "\tcqto"),
                _ => write!(f, "\tcdq"),
            },
            Div {
                signed,
                divisor,
                width,
            } => {
                write!(
                    f,
                    "\t{}div{} ",
                    if *signed { "i" } else { "" },
                    width.suffix()
                )?;
                divisor.write(f, *width)
            }
            Lzcnt { src, dest, width } => write_int_pair(f, "lzcnt", src, dest, *width),
            Tzcnt { src, dest, width } => write_int_pair(f, "tzcnt", src, dest, *width),
            Popcnt { src, dest, width } => write_int_pair(f, "popcnt", src, dest, *width),

            Cmp { src, dest, width } => write_int_pair(f, "cmp", src, dest, *width),
            Test { src, dest, width } => write_int_pair(f, "test", src, dest, *width),
            SetCc { cond, dest } => {
                write!(f, "\tset{} ", cond.code())?;
                dest.write(f, Width::B)
            }
            Ucomi { src, dest, width } => {
                write_pair(f, &["ucomi", width.scalar()].concat(), src, dest, *width)
            }

            Call(target) => {
                write!(f, "\tcall ")?;
                target.write_branch(f)
            }
            Ret => write!(f, "\tret"),
            Jmp { cond, target } => {
                match cond {
                    Some(cond) => write!(f, "\tj{} ", cond.code())?,
                    None => write!(f, "\tjmp ")?,
                }
                target.write_branch(f)
            }
            Syscall => write!(f, "\tsyscall"),

            Sqrt { src, dest, width } => {
                write_pair(f, &["sqrt", width.scalar()].concat(), src, dest, *width)
            }
            Round {
                mode,
                src,
                dest,
                width,
            } => {
                write!(f, "\tround{} ${}, ", width.scalar(), mode.immediate())?;
                src.write(f, *width)?;
                write!(f, ", ")?;
                dest.write(f, *width)
            }
            FMin { src, dest, width } => {
                write_pair(f, &["min", width.scalar()].concat(), src, dest, *width)
            }
            FMax { src, dest, width } => {
                write_pair(f, &["max", width.scalar()].concat(), src, dest, *width)
            }
            FMul { src, dest, width } => {
                write_pair(f, &["mul", width.scalar()].concat(), src, dest, *width)
            }
            FDiv { src, dest, width } => {
                write_pair(f, &["div", width.scalar()].concat(), src, dest, *width)
            }
            AndPacked { src, dest, width } => {
                write_pair(f, &["and", width.packed()].concat(), src, dest, *width)
            }
            AndNotPacked { src, dest, width } => {
                write_pair(f, &["andn", width.packed()].concat(), src, dest, *width)
            }
            XorPacked { src, dest, width } => {
                write_pair(f, &["xor", width.packed()].concat(), src, dest, *width)
            }
            TruncFloatToInt {
                src,
                dest,
                float_width,
                int_width,
            } => {
                write!(f, "\tcvtt{}2si ", float_width.scalar())?;
                src.write(f, *float_width)?;
                write!(f, ", ")?;
                dest.write(f, *int_width)
            }
            IntToFloat {
                src,
                dest,
                int_width,
                float_width,
            } => {
                write!(f, "\tcvtsi2{}{} ", float_width.scalar(), int_width.suffix())?;
                src.write(f, *int_width)?;
                write!(f, ", ")?;
                dest.write(f, *float_width)
            }
            FloatToFloat { src, dest, from } => {
                let mnemonic = match from {
                    Width::S => "cvtss2sd",
                    _ => "cvtsd2ss",
                };
                write!(f, "\t{} ", mnemonic)?;
                src.write(f, *from)?;
                write!(f, ", ")?;
                dest.write(
                    f,
                    match from {
                        Width::S => Width::D,
                        _ => Width::S,
                    },
                )
            }

            Enter { frame_size } => write!(f, "\tenter ${}, $0", frame_size),
            Leave => write!(f, "\tleave"),
        }
    }
}

/// Renders an instruction stream as assembly source, one line per record.
pub fn render(instructions: &[Instruction]) -> String {
    use core::fmt::Write;

    let mut text = String::new();
    for instruction in instructions {
        let _ = writeln!(text, "{}", instruction);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{Gpr, Xmm};
    use alloc::string::ToString;

    #[test]
    fn integer_moves() {
        let mov = Instruction::Mov {
            src: Datum::imm(7),
            dest: Datum::reg(Gpr::Rdi),
            width: Width::L,
        };
        assert_eq!(mov.to_string(), "\tmovl $7, %edi");

        let big = Instruction::Mov {
            src: Datum::imm(0x1_0000_0000),
            dest: Datum::reg(Gpr::Rax),
            width: Width::Q,
        };
        assert_eq!(big.to_string(), "\tmovabsq $4294967296, %rax");
    }

    #[test]
    fn cross_domain_moves() {
        let movq = Instruction::Mov {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::reg(Xmm::Xmm2),
            width: Width::Q,
        };
        assert_eq!(movq.to_string(), "\tmovq %rax, %xmm2");

        let movd = Instruction::Mov {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::reg(Xmm::Xmm15),
            width: Width::L,
        };
        assert_eq!(movd.to_string(), "\tmovd %eax, %xmm15");

        let movss = Instruction::Mov {
            src: Datum::label("MODULE0_GLOBAL0"),
            dest: Datum::reg(Xmm::Xmm2),
            width: Width::S,
        };
        assert_eq!(movss.to_string(), "\tmovss MODULE0_GLOBAL0(%rip), %xmm2");
    }

    #[test]
    fn memory_operands() {
        let load = Instruction::Mov {
            src: Datum::mem_index(Gpr::Rax, 16, Gpr::Rcx, 8),
            dest: Datum::reg(Gpr::Rdx),
            width: Width::Q,
        };
        assert_eq!(load.to_string(), "\tmovq 16(%rax,%rcx,8), %rdx");

        let store = Instruction::Mov {
            src: Datum::reg(Gpr::R8),
            dest: Datum::mem(Gpr::Rsp, 8),
            width: Width::B,
        };
        assert_eq!(store.to_string(), "\tmovb %r8b, 8(%rsp)");
    }

    #[test]
    fn extending_moves() {
        let movsbq = Instruction::MovExtend {
            sign: true,
            src: Datum::mem(Gpr::Rax, 0),
            dest: Datum::reg(Gpr::Rdi),
            src_width: Width::B,
            dest_width: Width::Q,
        };
        assert_eq!(movsbq.to_string(), "\tmovsbq (%rax), %rdi");

        let movzwl = Instruction::MovExtend {
            sign: false,
            src: Datum::reg(Gpr::Rcx),
            dest: Datum::reg(Gpr::Rcx),
            src_width: Width::W,
            dest_width: Width::L,
        };
        assert_eq!(movzwl.to_string(), "\tmovzwl %cx, %ecx");
    }

    #[test]
    fn branches() {
        let jmp = Instruction::Jmp {
            cond: None,
            target: Datum::label("MODULE0_RETURN3"),
        };
        assert_eq!(jmp.to_string(), "\tjmp MODULE0_RETURN3");

        let je = Instruction::Jmp {
            cond: Some(Cond::E),
            target: Datum::label("MODULE0_FUNC0_L1"),
        };
        assert_eq!(je.to_string(), "\tje MODULE0_FUNC0_L1");

        let indirect = Instruction::Jmp {
            cond: None,
            target: Datum::reg(Gpr::Rdx),
        };
        assert_eq!(indirect.to_string(), "\tjmp *%rdx");

        let call = Instruction::Call(Datum::mem_index(Gpr::Rax, 0, Gpr::Rcx, 8));
        assert_eq!(call.to_string(), "\tcall *(%rax,%rcx,8)");
    }

    #[test]
    fn shifts_take_cl() {
        let shl = Instruction::Shl {
            count: Datum::reg_width(Gpr::Rcx, Width::B),
            dest: Datum::reg(Gpr::Rdi),
            width: Width::L,
        };
        assert_eq!(shl.to_string(), "\tshll %cl, %edi");
    }

    #[test]
    fn divide_setup() {
        assert_eq!(Instruction::ConvertWord(Width::L).to_string(), "\tcdq");
        assert_eq!(Instruction::ConvertWord(Width::Q).to_string(), "\tcqto");
        let div = Instruction::Div {
            signed: true,
            divisor: Datum::reg(Gpr::Rcx),
            width: Width::L,
        };
        assert_eq!(div.to_string(), "\tidivl %ecx");
    }

    #[test]
    fn conversions() {
        let trunc = Instruction::TruncFloatToInt {
            src: Datum::reg(Xmm::Xmm0),
            dest: Datum::reg(Gpr::Rax),
            float_width: Width::D,
            int_width: Width::L,
        };
        assert_eq!(trunc.to_string(), "\tcvttsd2si %xmm0, %eax");

        let convert = Instruction::IntToFloat {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::reg(Xmm::Xmm0),
            int_width: Width::Q,
            float_width: Width::S,
        };
        assert_eq!(convert.to_string(), "\tcvtsi2ssq %rax, %xmm0");

        let promote = Instruction::FloatToFloat {
            src: Datum::reg(Xmm::Xmm0),
            dest: Datum::reg(Xmm::Xmm0),
            from: Width::S,
        };
        assert_eq!(promote.to_string(), "\tcvtss2sd %xmm0, %xmm0");
    }

    #[test]
    fn directives() {
        assert_eq!(
            Instruction::Directive(Directive::Rodata).to_string(),
            "\t.section .rodata"
        );
        assert_eq!(
            Instruction::Directive(Directive::Quad(QuadValue::Difference(
                "CASE".to_string(),
                "TABLE".to_string()
            )))
            .to_string(),
            "\t.quad CASE-TABLE"
        );
        assert_eq!(
            Instruction::Directive(Directive::Balign(8)).to_string(),
            "\t.balign 8"
        );
        assert_eq!(Instruction::Label("MODULE0_FUNC0".to_string()).to_string(), "MODULE0_FUNC0:");
    }

    #[test]
    fn rounds_and_packed_logic() {
        let round = Instruction::Round {
            mode: RoundMode::Truncate,
            src: Datum::reg(Xmm::Xmm0),
            dest: Datum::reg(Xmm::Xmm0),
            width: Width::D,
        };
        assert_eq!(round.to_string(), "\troundsd $3, %xmm0, %xmm0");

        let xorps = Instruction::XorPacked {
            src: Datum::reg(Xmm::Xmm15),
            dest: Datum::reg(Xmm::Xmm2),
            width: Width::S,
        };
        assert_eq!(xorps.to_string(), "\txorps %xmm15, %xmm2");
    }
}
