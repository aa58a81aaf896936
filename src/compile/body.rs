//! Lowering of wasm instruction sequences to assembly.
//!
//! One dispatcher walks the flat instruction stream; `block`, `loop` and
//! `if` recurse into [`compile_sequence`], everything else lowers in
//! [`compile_instruction`]. Every lowered fragment reports a
//! [`BranchResult`]: which enclosing labels it can jump to and whether
//! control definitely leaves it, which is what lets block ends prune dead
//! tails and decide whether a result value lands.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

use parity_wasm::elements::{BlockType, Instruction as WasmInstruction, ValueType};

use crate::asm::{Cond, Datum, Directive, Instruction, QuadValue, RoundMode, Width};
use crate::compile::helpers::{
    compile_branch, compile_return, grow_stack, relocate_arguments, restore_register,
    save_register, shrink_stack,
};
use crate::context::{is_float, CompilationContext, FunctionStats, LocalValue, ModuleContext};
use crate::regs::{self, Gpr, Reg, Xmm};
use crate::Error;

/// Exit analysis of a lowered fragment: the enclosing labels it may jump
/// to, and whether control definitely leaves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchResult {
    /// Labels of enclosing blocks this fragment can branch to.
    pub branches: BTreeSet<String>,
    /// Whether control never falls out of the fragment's end.
    pub definitely: bool,
}

impl BranchResult {
    /// A fragment control never leaves sideways.
    pub fn fall_through() -> BranchResult {
        BranchResult {
            branches: BTreeSet::new(),
            definitely: false,
        }
    }

    /// A fragment that always leaves (return, unreachable, unconditional
    /// branch).
    pub fn leaves(branch: Option<String>) -> BranchResult {
        BranchResult {
            branches: branch.into_iter().collect(),
            definitely: true,
        }
    }

    /// A fragment that may take the given branch but can also fall through.
    pub fn may_leave(branch: Option<String>) -> BranchResult {
        BranchResult {
            branches: branch.into_iter().collect(),
            definitely: false,
        }
    }
}

fn block_result(block_type: BlockType) -> Option<ValueType> {
    match block_type {
        BlockType::Value(value_type) => Some(value_type),
        BlockType::NoResult => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Terminator {
    End,
    Else,
}

/// Lowers a full function body. The body must be terminated by exactly one
/// trailing `end`.
pub(crate) fn compile_body(
    code: &[WasmInstruction],
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    let mut position = 0;
    let (result, terminator) = compile_sequence(code, &mut position, module, ctx, out)?;
    if terminator != Terminator::End || position != code.len() {
        return Err(Error::Module(
            "function body is not terminated by a single end".into(),
        ));
    }
    Ok(result)
}

/// Consumes instructions up to the matching `end` (or `else`), lowering
/// each. Once an instruction definitely leaves, the rest of the sequence is
/// unreachable and is skipped without emission.
fn compile_sequence(
    code: &[WasmInstruction],
    position: &mut usize,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(BranchResult, Terminator), Error> {
    let mut branches = BTreeSet::new();
    loop {
        let instruction = code
            .get(*position)
            .ok_or_else(|| Error::Module("unterminated instruction sequence".into()))?;
        *position += 1;

        let result = match instruction {
            WasmInstruction::End => {
                return Ok((
                    BranchResult {
                        branches,
                        definitely: false,
                    },
                    Terminator::End,
                ))
            }
            WasmInstruction::Else => {
                return Ok((
                    BranchResult {
                        branches,
                        definitely: false,
                    },
                    Terminator::Else,
                ))
            }
            WasmInstruction::Block(block_type) => {
                compile_block(*block_type, code, position, module, ctx, out)?
            }
            WasmInstruction::Loop(block_type) => {
                compile_loop(*block_type, code, position, module, ctx, out)?
            }
            WasmInstruction::If(block_type) => {
                compile_if(*block_type, code, position, module, ctx, out)?
            }
            other => compile_instruction(other, module, ctx, out)?,
        };

        branches.extend(result.branches);
        if result.definitely {
            let terminator = skip_unreachable(code, position)?;
            return Ok((
                BranchResult {
                    branches,
                    definitely: true,
                },
                terminator,
            ));
        }
    }
}

/// Consumes the dead tail after an instruction that definitely left,
/// balancing nested structures, up to the sequence's own `end` or `else`.
fn skip_unreachable(code: &[WasmInstruction], position: &mut usize) -> Result<Terminator, Error> {
    let mut depth = 0usize;
    loop {
        let instruction = code
            .get(*position)
            .ok_or_else(|| Error::Module("unterminated instruction sequence".into()))?;
        *position += 1;
        match instruction {
            WasmInstruction::Block(_) | WasmInstruction::Loop(_) | WasmInstruction::If(_) => {
                depth += 1
            }
            WasmInstruction::Else if depth == 0 => return Ok(Terminator::Else),
            WasmInstruction::End => {
                if depth == 0 {
                    return Ok(Terminator::End);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
}

fn compile_block(
    block_type: BlockType,
    code: &[WasmInstruction],
    position: &mut usize,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    let result_type = block_result(block_type);
    let label = ctx.new_label();
    ctx.push_label(false, label.clone(), result_type);
    let snapshot = ctx.stack_state();
    let (body, terminator) = compile_sequence(code, position, module, ctx, out)?;
    if terminator != Terminator::End {
        return Err(Error::Module("else outside an if".into()));
    }
    ctx.pop_label()?;
    out.push(Instruction::Label(label.clone()));

    if body.definitely && !body.branches.contains(&label) {
        return Ok(body);
    }
    ctx.restore_stack_state(&snapshot);
    if let Some(value_type) = result_type {
        ctx.resolve_push(is_float(value_type));
    }
    let mut branches = body.branches;
    branches.remove(&label);
    Ok(BranchResult {
        branches,
        definitely: false,
    })
}

fn compile_loop(
    block_type: BlockType,
    code: &[WasmInstruction],
    position: &mut usize,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    let result_type = block_result(block_type);
    let label = ctx.new_label();
    out.push(Instruction::Label(label.clone()));
    ctx.push_label(true, label.clone(), result_type);
    let snapshot = ctx.stack_state();
    let (body, terminator) = compile_sequence(code, position, module, ctx, out)?;
    if terminator != Terminator::End {
        return Err(Error::Module("else outside an if".into()));
    }
    ctx.pop_label()?;

    let mut branches = body.branches;
    branches.remove(&label);
    if body.definitely {
        // Control can only re-enter the loop or leave through an outer
        // label; with no outer labels this is an infinite loop.
        return Ok(BranchResult {
            branches,
            definitely: true,
        });
    }
    ctx.restore_stack_state(&snapshot);
    if let Some(value_type) = result_type {
        ctx.resolve_push(is_float(value_type));
    }
    Ok(BranchResult {
        branches,
        definitely: false,
    })
}

fn compile_if(
    block_type: BlockType,
    code: &[WasmInstruction],
    position: &mut usize,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    let result_type = block_result(block_type);
    let condition = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(Instruction::Test {
        src: Datum::reg(condition),
        dest: Datum::reg(condition),
        width: Width::L,
    });

    // `if_not` is where control lands when the condition is false: the else
    // branch when there is one, the end of the if otherwise.
    let if_not = ctx.new_label();
    let end_label = ctx.new_label();
    out.push(Instruction::Jmp {
        cond: Some(Cond::E),
        target: Datum::Label(if_not.clone()),
    });

    let snapshot = ctx.stack_state();
    ctx.push_label(false, end_label.clone(), result_type);
    let (true_result, terminator) = compile_sequence(code, position, module, ctx, out)?;

    let merged = match terminator {
        Terminator::Else => {
            if !true_result.definitely {
                out.push(Instruction::Jmp {
                    cond: None,
                    target: Datum::Label(end_label.clone()),
                });
            }
            out.push(Instruction::Label(if_not));
            ctx.restore_stack_state(&snapshot);
            let (false_result, terminator) = compile_sequence(code, position, module, ctx, out)?;
            if terminator != Terminator::End {
                return Err(Error::Module("if with two else branches".into()));
            }
            let mut branches = true_result.branches;
            branches.extend(false_result.branches);
            BranchResult {
                branches,
                definitely: true_result.definitely && false_result.definitely,
            }
        }
        Terminator::End => {
            // No else: the false case skips straight to the end.
            out.push(Instruction::Label(if_not));
            BranchResult {
                branches: true_result.branches,
                definitely: false,
            }
        }
    };
    ctx.pop_label()?;
    out.push(Instruction::Label(end_label.clone()));

    if merged.definitely && !merged.branches.contains(&end_label) {
        return Ok(merged);
    }
    ctx.restore_stack_state(&snapshot);
    if let Some(value_type) = result_type {
        ctx.resolve_push(is_float(value_type));
    }
    let mut branches = merged.branches;
    branches.remove(&end_label);
    Ok(BranchResult {
        branches,
        definitely: false,
    })
}

/// Pops the top (int) value into a register, using `fallback` when it was
/// spilled to the machine stack.
pub(crate) fn pop_int_operand(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
    fallback: Gpr,
) -> Result<Gpr, Error> {
    match ctx.resolve_pop()? {
        (_, Some(Reg::Int(gpr))) => Ok(gpr),
        (_, Some(Reg::Float(_))) => Err(Error::Allocation(
            "int operand expected on the virtual stack".into(),
        )),
        (_, None) => {
            out.push(Instruction::Pop(Datum::reg(fallback)));
            Ok(fallback)
        }
    }
}

/// Pops the top (float) value into an SSE register, using `fallback` when
/// it was spilled to the machine stack.
fn pop_float_operand(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
    fallback: Xmm,
) -> Result<Xmm, Error> {
    match ctx.resolve_pop()? {
        (_, Some(Reg::Float(xmm))) => Ok(xmm),
        (_, Some(Reg::Int(_))) => Err(Error::Allocation(
            "float operand expected on the virtual stack".into(),
        )),
        (_, None) => {
            out.push(Instruction::Mov {
                src: Datum::mem(Gpr::Rsp, 0),
                dest: Datum::reg(fallback),
                width: Width::Q,
            });
            shrink_stack(1, out);
            Ok(fallback)
        }
    }
}

/// Pushes an int value held in `src`. The caller guarantees the register
/// holds a well-formed 64-bit value (i32 values zero-extended).
fn push_int_result(ctx: &mut CompilationContext, out: &mut Vec<Instruction>, src: Gpr) {
    match ctx.resolve_push(false) {
        Some(Reg::Int(dest)) => {
            if dest != src {
                out.push(Instruction::Mov {
                    src: Datum::reg(src),
                    dest: Datum::reg(dest),
                    width: Width::Q,
                });
            }
        }
        Some(Reg::Float(_)) => unreachable!("int pushes resolve to the int pool"),
        None => out.push(Instruction::Push(Datum::reg(src))),
    }
}

/// Pushes a float value held in `src`.
fn push_float_result(ctx: &mut CompilationContext, out: &mut Vec<Instruction>, src: Xmm) {
    match ctx.resolve_push(true) {
        Some(Reg::Float(dest)) => {
            if dest != src {
                out.push(Instruction::Mov {
                    src: Datum::reg(src),
                    dest: Datum::reg(dest),
                    width: Width::Q,
                });
            }
        }
        Some(Reg::Int(_)) => unreachable!("float pushes resolve to the float pool"),
        None => {
            grow_stack(1, out);
            out.push(Instruction::Mov {
                src: Datum::reg(src),
                dest: Datum::mem(Gpr::Rsp, 0),
                width: Width::Q,
            });
        }
    }
}

/// How a load accesses memory.
enum LoadAccess {
    /// A plain move of the given width.
    Plain(Width),
    /// A sign- or zero-extending move.
    Extend {
        sign: bool,
        from: Width,
        to: Width,
    },
}

/// The datum a parameter or local resolves to at the current spill depth.
fn local_datum(ctx: &CompilationContext, value: LocalValue) -> Datum {
    match value {
        LocalValue::Register(register) => Datum::Register(register, None),
        LocalValue::Stack(slot) => {
            Datum::mem(Gpr::Rsp, 8 * (ctx.machine_values() + slot) as i32)
        }
    }
}

fn compile_get_local(
    index: u32,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (float, home) = ctx.resolve_local(index)?;
    let source = local_datum(ctx, home);
    match ctx.resolve_push(float) {
        Some(dest) => out.push(Instruction::Mov {
            src: source,
            dest: Datum::Register(dest, None),
            width: Width::Q,
        }),
        None => match home {
            LocalValue::Register(Reg::Int(gpr)) => {
                out.push(Instruction::Push(Datum::reg(gpr)))
            }
            LocalValue::Register(Reg::Float(xmm)) => {
                // push takes a GPR, so float registers hop through rax.
                out.push(Instruction::Mov {
                    src: Datum::reg(xmm),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
            }
            LocalValue::Stack(_) => out.push(Instruction::Push(source)),
        },
    }
    Ok(())
}

fn compile_set_local(
    index: u32,
    tee: bool,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (_, home) = ctx.resolve_local(index)?;
    let source: Reg = if tee {
        match ctx.top_location()? {
            (_, Some(register)) => register,
            (_, None) => {
                out.push(Instruction::Mov {
                    src: Datum::mem(Gpr::Rsp, 0),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                Reg::Int(Gpr::Rax)
            }
        }
    } else {
        match ctx.resolve_pop()? {
            (_, Some(register)) => register,
            (_, None) => {
                out.push(Instruction::Pop(Datum::reg(Gpr::Rax)));
                Reg::Int(Gpr::Rax)
            }
        }
    };
    let dest = local_datum(ctx, home);
    out.push(Instruction::Mov {
        src: Datum::Register(source, None),
        dest,
        width: Width::Q,
    });
    Ok(())
}

/// The width a global access uses: s/d straight into an SSE register, l/q
/// when the value transits a general register.
fn memory_move_width(value_type: ValueType, via_intermediate: bool) -> Width {
    if via_intermediate {
        match value_type {
            ValueType::I32 | ValueType::F32 => Width::L,
            ValueType::I64 | ValueType::F64 => Width::Q,
        }
    } else {
        Width::of(value_type)
    }
}

fn compile_get_global(
    index: u32,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (value_type, _) = module.global_info(index)?;
    let label = module.global_label(index)?;
    match ctx.resolve_push(is_float(value_type)) {
        Some(register) => out.push(Instruction::Mov {
            src: Datum::Label(label),
            dest: Datum::Register(register, None),
            width: memory_move_width(value_type, !register.is_float()),
        }),
        None => {
            out.push(Instruction::Mov {
                src: Datum::Label(label),
                dest: Datum::reg(Gpr::Rax),
                width: memory_move_width(value_type, true),
            });
            out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
        }
    }
    Ok(())
}

fn compile_set_global(
    index: u32,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (value_type, _) = module.global_info(index)?;
    let label = module.global_label(index)?;
    match ctx.resolve_pop()? {
        (_, Some(register)) => out.push(Instruction::Mov {
            src: Datum::Register(register, None),
            dest: Datum::Label(label),
            width: memory_move_width(value_type, !register.is_float()),
        }),
        (_, None) => {
            out.push(Instruction::Pop(Datum::reg(Gpr::Rax)));
            out.push(Instruction::Mov {
                src: Datum::reg(Gpr::Rax),
                dest: Datum::Label(label),
                width: memory_move_width(value_type, true),
            });
        }
    }
    Ok(())
}

/// Pops the dynamic index and materializes the 64-bit region base into rax,
/// returning the effective-address datum.
fn memory_address(
    offset: u32,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
    base_register: Gpr,
) -> Result<Datum, Error> {
    let index = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let base = module.memory_start()? + u64::from(offset);
    out.push(Instruction::Mov {
        src: Datum::imm(base as i64),
        dest: Datum::reg(base_register),
        width: Width::Q,
    });
    Ok(Datum::mem_index(base_register, 0, index, 1))
}

fn compile_load(
    offset: u32,
    float: bool,
    access: LoadAccess,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let address = memory_address(offset, module, ctx, out, Gpr::Rax)?;
    match ctx.resolve_push(float) {
        Some(register) => match access {
            LoadAccess::Plain(width) => out.push(Instruction::Mov {
                src: address,
                dest: Datum::Register(register, None),
                width,
            }),
            LoadAccess::Extend { sign, from, to } => out.push(Instruction::MovExtend {
                sign,
                src: address,
                dest: Datum::Register(register, None),
                src_width: from,
                dest_width: to,
            }),
        },
        None => match access {
            // A full-width value can be pushed straight from memory;
            // anything narrower is widened through rdx first.
            LoadAccess::Plain(Width::Q) | LoadAccess::Plain(Width::D) => {
                out.push(Instruction::Push(address))
            }
            LoadAccess::Plain(width) => {
                out.push(Instruction::Mov {
                    src: address,
                    dest: Datum::reg(Gpr::Rdx),
                    width: if width == Width::S { Width::L } else { width },
                });
                out.push(Instruction::Push(Datum::reg(Gpr::Rdx)));
            }
            LoadAccess::Extend { sign, from, to } => {
                out.push(Instruction::MovExtend {
                    sign,
                    src: address,
                    dest: Datum::reg(Gpr::Rdx),
                    src_width: from,
                    dest_width: to,
                });
                out.push(Instruction::Push(Datum::reg(Gpr::Rdx)));
            }
        },
    }
    Ok(())
}

fn compile_store(
    offset: u32,
    width: Width,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let value = match ctx.resolve_pop()? {
        (_, Some(register)) => register,
        (_, None) => {
            out.push(Instruction::Pop(Datum::reg(Gpr::Rax)));
            Reg::Int(Gpr::Rax)
        }
    };
    let address = memory_address(offset, module, ctx, out, Gpr::Rdx)?;
    let width = match value {
        // A float that was spilled carries its bits in rax; store with the
        // matching integer width.
        Reg::Int(_) if width.is_float() => {
            if width == Width::S {
                Width::L
            } else {
                Width::Q
            }
        }
        _ => width,
    };
    out.push(Instruction::Mov {
        src: Datum::Register(value, None),
        dest: address,
        width,
    });
    Ok(())
}

fn compile_memory_size(
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let memsize = Datum::Label(module.memsize_label()?);
    match ctx.resolve_push(false) {
        Some(register) => out.push(Instruction::Mov {
            src: memsize,
            dest: Datum::Register(register, None),
            width: Width::L,
        }),
        None => {
            out.push(Instruction::Mov {
                src: memsize,
                dest: Datum::reg(Gpr::Rax),
                width: Width::L,
            });
            out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
        }
    }
    Ok(())
}

const PROT_READ_WRITE: i64 = 0x3;
const MAP_SHARED_FIXED_ANONYMOUS: i64 = 0x31;
const SYSCALL_MMAP: i64 = 9;
const SYSCALL_EXIT: i64 = 60;
/// log2 of the wasm page size.
const PAGE_SHIFT: i64 = 16;

fn compile_memory_grow(
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let delta = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let memsize = Datum::Label(module.memsize_label()?);
    let max_pages = module.max_pages()?.0 as i64;
    let base = module.memory_start()?;

    let zero_label = ctx.new_label();
    let grown_label = ctx.new_label();
    let fail_label = ctx.new_label();
    let done_label = ctx.new_label();

    // Fast path: growing by zero pages just reads the current size.
    out.push(Instruction::Test {
        src: Datum::reg(delta),
        dest: Datum::reg(delta),
        width: Width::L,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::E),
        target: Datum::Label(zero_label.clone()),
    });

    // Reject growth past the declared maximum before touching the kernel.
    out.push(Instruction::Mov {
        src: memsize.clone(),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Add {
        src: Datum::reg(delta),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Cmp {
        src: Datum::imm(max_pages),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::A),
        target: Datum::Label(fail_label.clone()),
    });

    let spills: Vec<Gpr> = ctx
        .registers_used(false)
        .into_iter()
        .filter_map(|register| match register {
            Reg::Int(gpr) if regs::MMAP_GENERAL_CLOBBERS.contains(&gpr) => Some(gpr),
            _ => None,
        })
        .collect();
    for &gpr in &spills {
        out.push(Instruction::Push(Datum::reg(gpr)));
    }

    // length = delta << 16
    if delta != Gpr::Rsi {
        out.push(Instruction::Mov {
            src: Datum::reg(delta),
            dest: Datum::reg(Gpr::Rsi),
            width: Width::L,
        });
    }
    out.push(Instruction::Shl {
        count: Datum::imm(PAGE_SHIFT),
        dest: Datum::reg(Gpr::Rsi),
        width: Width::Q,
    });
    // addr = memory_start + (MEMSIZE << 16)
    out.push(Instruction::Mov {
        src: memsize.clone(),
        dest: Datum::reg(Gpr::Rdi),
        width: Width::L,
    });
    out.push(Instruction::Shl {
        count: Datum::imm(PAGE_SHIFT),
        dest: Datum::reg(Gpr::Rdi),
        width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(base as i64),
        dest: Datum::reg(Gpr::Rax),
        width: Width::Q,
    });
    out.push(Instruction::Add {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rdi),
        width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(PROT_READ_WRITE),
        dest: Datum::reg(Gpr::Rdx),
        width: Width::L,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(MAP_SHARED_FIXED_ANONYMOUS),
        dest: Datum::reg(Gpr::R10),
        width: Width::L,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(-1),
        dest: Datum::reg(Gpr::R8),
        width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(0),
        dest: Datum::reg(Gpr::R9),
        width: Width::L,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(SYSCALL_MMAP),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Syscall);

    out.push(Instruction::Test {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rax),
        width: Width::Q,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::Ns),
        target: Datum::Label(grown_label.clone()),
    });
    for &gpr in spills.iter().rev() {
        out.push(Instruction::Pop(Datum::reg(gpr)));
    }
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(fail_label.clone()),
    });

    // Success: result is the previous size, MEMSIZE moves up by delta
    // (recovered from the still-live length argument).
    out.push(Instruction::Label(grown_label));
    out.push(Instruction::Shr {
        count: Datum::imm(PAGE_SHIFT),
        dest: Datum::reg(Gpr::Rsi),
        width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: memsize.clone(),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Add {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rsi),
        width: Width::L,
    });
    out.push(Instruction::Mov {
        src: Datum::reg(Gpr::Rsi),
        dest: memsize.clone(),
        width: Width::L,
    });
    for &gpr in spills.iter().rev() {
        out.push(Instruction::Pop(Datum::reg(gpr)));
    }
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(done_label.clone()),
    });

    out.push(Instruction::Label(zero_label));
    out.push(Instruction::Mov {
        src: memsize,
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(done_label.clone()),
    });

    out.push(Instruction::Label(fail_label));
    out.push(Instruction::Mov {
        src: Datum::imm(-1),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });

    out.push(Instruction::Label(done_label));
    push_int_result(ctx, out, Gpr::Rax);
    Ok(())
}

fn compile_select(ctx: &mut CompilationContext, out: &mut Vec<Instruction>) -> Result<(), Error> {
    let condition = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let float = ctx.peek()?;
    if !float {
        let if_zero = pop_int_operand(ctx, out, Gpr::Rdx)?;
        let if_nonzero = pop_int_operand(ctx, out, Gpr::Rax)?;
        out.push(Instruction::Test {
            src: Datum::reg(condition),
            dest: Datum::reg(condition),
            width: Width::L,
        });
        out.push(Instruction::CMov {
            cond: Cond::E,
            src: Datum::reg(if_zero),
            dest: Datum::reg(if_nonzero),
            width: Width::Q,
        });
        push_int_result(ctx, out, if_nonzero);
        return Ok(());
    }
    // cmov wants GPR operands, so float values are staged through rdx/rax
    // around the conditional move and the winner goes back out as bits.
    match ctx.resolve_pop()? {
        (_, Some(Reg::Float(xmm))) => out.push(Instruction::Mov {
            src: Datum::reg(xmm),
            dest: Datum::reg(Gpr::Rdx),
            width: Width::Q,
        }),
        (_, None) => out.push(Instruction::Pop(Datum::reg(Gpr::Rdx))),
        (_, Some(Reg::Int(_))) => {
            return Err(Error::Allocation(
                "float operand expected on the virtual stack".into(),
            ))
        }
    }
    match ctx.resolve_pop()? {
        (_, Some(Reg::Float(xmm))) => out.push(Instruction::Mov {
            src: Datum::reg(xmm),
            dest: Datum::reg(Gpr::Rax),
            width: Width::Q,
        }),
        (_, None) => out.push(Instruction::Pop(Datum::reg(Gpr::Rax))),
        (_, Some(Reg::Int(_))) => {
            return Err(Error::Allocation(
                "float operand expected on the virtual stack".into(),
            ))
        }
    }
    out.push(Instruction::Test {
        src: Datum::reg(condition),
        dest: Datum::reg(condition),
        width: Width::L,
    });
    out.push(Instruction::CMov {
        cond: Cond::E,
        src: Datum::reg(Gpr::Rdx),
        dest: Datum::reg(Gpr::Rax),
        width: Width::Q,
    });
    match ctx.resolve_push(true) {
        Some(register) => out.push(Instruction::Mov {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::Register(register, None),
            width: Width::Q,
        }),
        None => out.push(Instruction::Push(Datum::reg(Gpr::Rax))),
    }
    Ok(())
}

fn compile_i32_const(value: i32, ctx: &mut CompilationContext, out: &mut Vec<Instruction>) {
    match ctx.resolve_push(false) {
        Some(register) => out.push(Instruction::Mov {
            src: Datum::imm(i64::from(value)),
            dest: Datum::Register(register, None),
            width: Width::L,
        }),
        None => {
            // Keep the upper half zero on the machine stack too; a push of
            // a sign-extending immediate would break i64.extend_u's no-op.
            out.push(Instruction::Mov {
                src: Datum::imm(i64::from(value)),
                dest: Datum::reg(Gpr::Rax),
                width: Width::L,
            });
            out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
        }
    }
}

fn compile_i64_const(value: i64, ctx: &mut CompilationContext, out: &mut Vec<Instruction>) {
    match ctx.resolve_push(false) {
        Some(register) => out.push(Instruction::Mov {
            src: Datum::imm(value),
            dest: Datum::Register(register, None),
            width: Width::Q,
        }),
        None => {
            if i32::try_from(value).is_ok() {
                out.push(Instruction::Push(Datum::imm(value)));
            } else {
                out.push(Instruction::Mov {
                    src: Datum::imm(value),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
            }
        }
    }
}

/// Loads float constant bits through a general register: immediates cannot
/// move into an SSE register directly. Bit patterns are preserved exactly.
fn compile_float_const(
    bits: i64,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) {
    let int_width = if width == Width::S { Width::L } else { Width::Q };
    out.push(Instruction::Mov {
        src: Datum::imm(bits),
        dest: Datum::reg(Gpr::Rax),
        width: int_width,
    });
    match ctx.resolve_push(true) {
        Some(register) => out.push(Instruction::Mov {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::Register(register, None),
            width: int_width,
        }),
        None => out.push(Instruction::Push(Datum::reg(Gpr::Rax))),
    }
}

fn compile_eqz(
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(Instruction::Cmp {
        src: Datum::imm(0),
        dest: Datum::reg(operand),
        width,
    });
    finish_compare(Cond::E, None, ctx, out);
    Ok(())
}

fn compile_int_compare(
    cond: Cond,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let rhs = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let lhs = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(Instruction::Cmp {
        src: Datum::reg(rhs),
        dest: Datum::reg(lhs),
        width,
    });
    finish_compare(cond, None, ctx, out);
    Ok(())
}

fn compile_float_compare(
    cond: Cond,
    parity_or: bool,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let rhs = pop_float_operand(ctx, out, Xmm::Xmm1)?;
    let lhs = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    out.push(Instruction::Ucomi {
        src: Datum::reg(rhs),
        dest: Datum::reg(lhs),
        width,
    });
    finish_compare(cond, Some(parity_or), ctx, out);
    Ok(())
}

/// Materializes a flags-register comparison into a 0/1 i32 and pushes it.
/// For floats the parity flag (set on NaN) is merged in: ordered compares
/// AND with `setnp`, not-equal ORs with `setp`.
fn finish_compare(
    cond: Cond,
    parity: Option<bool>,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) {
    out.push(Instruction::SetCc {
        cond,
        dest: Datum::reg(Gpr::Rax),
    });
    if let Some(parity_or) = parity {
        out.push(Instruction::SetCc {
            cond: if parity_or { Cond::P } else { Cond::Np },
            dest: Datum::reg(Gpr::Rcx),
        });
        if parity_or {
            out.push(Instruction::Or {
                src: Datum::reg(Gpr::Rcx),
                dest: Datum::reg(Gpr::Rax),
                width: Width::B,
            });
        } else {
            out.push(Instruction::And {
                src: Datum::reg(Gpr::Rcx),
                dest: Datum::reg(Gpr::Rax),
                width: Width::B,
            });
        }
    }
    out.push(Instruction::MovExtend {
        sign: false,
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rax),
        src_width: Width::B,
        dest_width: Width::L,
    });
    push_int_result(ctx, out, Gpr::Rax);
}

type BinaryOp = fn(Datum, Datum, Width) -> Instruction;

fn compile_int_binary(
    make: BinaryOp,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let rhs = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let lhs = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(make(Datum::reg(rhs), Datum::reg(lhs), width));
    push_int_result(ctx, out, lhs);
    Ok(())
}

fn compile_shift(
    make: BinaryOp,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let amount = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let value = pop_int_operand(ctx, out, Gpr::Rax)?;
    if amount != regs::SHIFT_REGISTER {
        out.push(Instruction::Mov {
            src: Datum::reg(amount),
            dest: Datum::reg(regs::SHIFT_REGISTER),
            width: Width::L,
        });
    }
    out.push(make(
        Datum::reg_width(regs::SHIFT_REGISTER, Width::B),
        Datum::reg(value),
        width,
    ));
    push_int_result(ctx, out, value);
    Ok(())
}

fn compile_div(
    signed: bool,
    remainder: bool,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let divisor = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let dividend = pop_int_operand(ctx, out, Gpr::Rax)?;
    if dividend != regs::DIV_LOW_REGISTER {
        out.push(Instruction::Mov {
            src: Datum::reg(dividend),
            dest: Datum::reg(regs::DIV_LOW_REGISTER),
            width,
        });
    }
    if signed && remainder {
        // INT_MIN % -1 would trap in hardware even though the result is 0;
        // a -1 divisor is coerced to 1 (same remainder for every dividend).
        out.push(Instruction::Mov {
            src: Datum::imm(1),
            dest: Datum::reg(Gpr::Rdx),
            width: Width::L,
        });
        out.push(Instruction::Cmp {
            src: Datum::imm(-1),
            dest: Datum::reg(divisor),
            width,
        });
        out.push(Instruction::CMov {
            cond: Cond::E,
            src: Datum::reg(Gpr::Rdx),
            dest: Datum::reg(divisor),
            width,
        });
    }
    if signed {
        out.push(Instruction::ConvertWord(width));
    } else {
        out.push(Instruction::Xor {
            src: Datum::reg(Gpr::Rdx),
            dest: Datum::reg(Gpr::Rdx),
            width: Width::L,
        });
    }
    out.push(Instruction::Div {
        signed,
        divisor: Datum::reg(divisor),
        width,
    });
    let result = if remainder {
        regs::DIV_HIGH_REGISTER
    } else {
        regs::DIV_LOW_REGISTER
    };
    push_int_result(ctx, out, result);
    Ok(())
}

fn compile_bit_count(
    make: BinaryOp,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(make(Datum::reg(operand), Datum::reg(operand), width));
    push_int_result(ctx, out, operand);
    Ok(())
}

fn compile_float_binary(
    make: BinaryOp,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let rhs = pop_float_operand(ctx, out, Xmm::Xmm1)?;
    let lhs = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    out.push(make(Datum::reg(rhs), Datum::reg(lhs), width));
    push_float_result(ctx, out, lhs);
    Ok(())
}

fn compile_float_unary(
    make: BinaryOp,
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    out.push(make(Datum::reg(operand), Datum::reg(operand), width));
    push_float_result(ctx, out, operand);
    Ok(())
}

/// Materializes the sign-bit mask (or its complement) of the given float
/// width into xmm15.
fn load_sign_mask(complement: bool, width: Width, out: &mut Vec<Instruction>) {
    let (bits, int_width) = match width {
        Width::S => {
            let mask: u32 = 0x8000_0000;
            let mask = if complement { !mask } else { mask };
            (i64::from(mask), Width::L)
        }
        _ => {
            let mask: u64 = 0x8000_0000_0000_0000;
            let mask = if complement { !mask } else { mask };
            (mask as i64, Width::Q)
        }
    };
    out.push(Instruction::Mov {
        src: Datum::imm(bits),
        dest: Datum::reg(Gpr::Rax),
        width: int_width,
    });
    out.push(Instruction::Mov {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Xmm::Xmm15),
        width: int_width,
    });
}

fn compile_float_neg(
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    load_sign_mask(false, width, out);
    out.push(Instruction::XorPacked {
        src: Datum::reg(Xmm::Xmm15),
        dest: Datum::reg(operand),
        width,
    });
    push_float_result(ctx, out, operand);
    Ok(())
}

fn compile_float_abs(
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    load_sign_mask(true, width, out);
    out.push(Instruction::AndPacked {
        src: Datum::reg(Xmm::Xmm15),
        dest: Datum::reg(operand),
        width,
    });
    push_float_result(ctx, out, operand);
    Ok(())
}

fn compile_float_copysign(
    width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let sign_source = pop_float_operand(ctx, out, Xmm::Xmm1)?;
    let magnitude = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    load_sign_mask(false, width, out);
    // x ^ ((x ^ y) & sign_mask) keeps x's magnitude and y's sign.
    out.push(Instruction::XorPacked {
        src: Datum::reg(magnitude),
        dest: Datum::reg(sign_source),
        width,
    });
    out.push(Instruction::AndPacked {
        src: Datum::reg(Xmm::Xmm15),
        dest: Datum::reg(sign_source),
        width,
    });
    out.push(Instruction::XorPacked {
        src: Datum::reg(sign_source),
        dest: Datum::reg(magnitude),
        width,
    });
    push_float_result(ctx, out, magnitude);
    Ok(())
}

fn compile_trunc_signed(
    float_width: Width,
    int_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    out.push(Instruction::TruncFloatToInt {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rax),
        float_width,
        int_width,
    });
    push_int_result(ctx, out, Gpr::Rax);
    Ok(())
}

fn compile_trunc_unsigned_i32(
    float_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    // Truncate through i64 and keep the low half, matching wasm's modulo
    // semantics for in-range values.
    out.push(Instruction::TruncFloatToInt {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rax),
        float_width,
        int_width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rax),
        width: Width::L,
    });
    push_int_result(ctx, out, Gpr::Rax);
    Ok(())
}

fn compile_trunc_unsigned_i64(
    float_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
    let big_label = ctx.new_label();
    let done_label = ctx.new_label();

    // 2^63 in the operand's format.
    let (threshold, int_width) = match float_width {
        Width::S => (i64::from(0x5F00_0000u32), Width::L),
        _ => (0x43E0_0000_0000_0000i64, Width::Q),
    };
    out.push(Instruction::Mov {
        src: Datum::imm(threshold),
        dest: Datum::reg(Gpr::Rax),
        width: int_width,
    });
    out.push(Instruction::Mov {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Xmm::Xmm15),
        width: int_width,
    });
    out.push(Instruction::Ucomi {
        src: Datum::reg(Xmm::Xmm15),
        dest: Datum::reg(operand),
        width: float_width,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::Ae),
        target: Datum::Label(big_label.clone()),
    });
    out.push(Instruction::TruncFloatToInt {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rax),
        float_width,
        int_width: Width::Q,
    });
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(done_label.clone()),
    });
    // Values at or above 2^63 lose the sign bit in the conversion; shift
    // the range down, convert, and add the bit back.
    out.push(Instruction::Label(big_label));
    out.push(Instruction::Sub {
        src: Datum::reg(Xmm::Xmm15),
        dest: Datum::reg(operand),
        width: float_width,
    });
    out.push(Instruction::TruncFloatToInt {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rax),
        float_width,
        int_width: Width::Q,
    });
    out.push(Instruction::Mov {
        src: Datum::imm(i64::MIN),
        dest: Datum::reg(Gpr::Rcx),
        width: Width::Q,
    });
    out.push(Instruction::Add {
        src: Datum::reg(Gpr::Rcx),
        dest: Datum::reg(Gpr::Rax),
        width: Width::Q,
    });
    out.push(Instruction::Label(done_label));
    push_int_result(ctx, out, Gpr::Rax);
    Ok(())
}

fn compile_convert_signed(
    int_width: Width,
    float_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
    out.push(Instruction::IntToFloat {
        src: Datum::reg(operand),
        dest: Datum::reg(Xmm::Xmm0),
        int_width,
        float_width,
    });
    push_float_result(ctx, out, Xmm::Xmm0);
    Ok(())
}

fn compile_convert_unsigned_i32(
    float_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    // i32 values are stored zero-extended, so the 64-bit convert sees the
    // unsigned value directly.
    compile_convert_signed(Width::Q, float_width, ctx, out)
}

fn compile_convert_unsigned_i64(
    float_width: Width,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
    let big_label = ctx.new_label();
    let done_label = ctx.new_label();
    out.push(Instruction::Test {
        src: Datum::reg(operand),
        dest: Datum::reg(operand),
        width: Width::Q,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::S),
        target: Datum::Label(big_label.clone()),
    });
    out.push(Instruction::IntToFloat {
        src: Datum::reg(operand),
        dest: Datum::reg(Xmm::Xmm0),
        int_width: Width::Q,
        float_width,
    });
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(done_label.clone()),
    });
    // Top-bit set: halve with the low bit folded in, convert, and double.
    out.push(Instruction::Label(big_label));
    out.push(Instruction::Mov {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rcx),
        width: Width::Q,
    });
    out.push(Instruction::Shr {
        count: Datum::imm(1),
        dest: Datum::reg(Gpr::Rcx),
        width: Width::Q,
    });
    out.push(Instruction::And {
        src: Datum::imm(1),
        dest: Datum::reg(operand),
        width: Width::Q,
    });
    out.push(Instruction::Or {
        src: Datum::reg(operand),
        dest: Datum::reg(Gpr::Rcx),
        width: Width::Q,
    });
    out.push(Instruction::IntToFloat {
        src: Datum::reg(Gpr::Rcx),
        dest: Datum::reg(Xmm::Xmm0),
        int_width: Width::Q,
        float_width,
    });
    out.push(Instruction::Add {
        src: Datum::reg(Xmm::Xmm0),
        dest: Datum::reg(Xmm::Xmm0),
        width: float_width,
    });
    out.push(Instruction::Label(done_label));
    push_float_result(ctx, out, Xmm::Xmm0);
    Ok(())
}

fn compile_reinterpret_float_to_int(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (_, source) = ctx.resolve_pop()?;
    match source {
        Some(Reg::Float(xmm)) => match ctx.resolve_push(false) {
            Some(register) => out.push(Instruction::Mov {
                src: Datum::reg(xmm),
                dest: Datum::Register(register, None),
                width: Width::Q,
            }),
            None => {
                out.push(Instruction::Mov {
                    src: Datum::reg(xmm),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
            }
        },
        None => match ctx.resolve_push(false) {
            Some(register) => out.push(Instruction::Pop(Datum::Register(register, None))),
            // Both sides live on the machine stack: the bits stay put.
            None => {}
        },
        Some(Reg::Int(_)) => {
            return Err(Error::Allocation(
                "float operand expected on the virtual stack".into(),
            ))
        }
    }
    Ok(())
}

fn compile_reinterpret_int_to_float(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let (_, source) = ctx.resolve_pop()?;
    match source {
        Some(Reg::Int(gpr)) => match ctx.resolve_push(true) {
            Some(register) => out.push(Instruction::Mov {
                src: Datum::reg(gpr),
                dest: Datum::Register(register, None),
                width: Width::Q,
            }),
            None => out.push(Instruction::Push(Datum::reg(gpr))),
        },
        None => match ctx.resolve_push(true) {
            Some(register) => {
                out.push(Instruction::Pop(Datum::reg(Gpr::Rax)));
                out.push(Instruction::Mov {
                    src: Datum::reg(Gpr::Rax),
                    dest: Datum::Register(register, None),
                    width: Width::Q,
                });
            }
            None => {}
        },
        Some(Reg::Float(_)) => {
            return Err(Error::Allocation(
                "int operand expected on the virtual stack".into(),
            ))
        }
    }
    Ok(())
}

/// What a `call` jumps through.
pub(crate) enum CallTarget {
    /// A direct call to a label.
    Direct(String),
    /// An indirect call through the jump table with the given label.
    Indirect(String),
}

pub(crate) fn compile_call(
    stats: &FunctionStats,
    target: CallTarget,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    let callee = CompilationContext::new(stats, String::new(), String::new())?;

    let mut index_register = None;
    if let CallTarget::Indirect(_) = target {
        // rax is the relocation temporary, so the function index stays
        // clear of it.
        index_register = Some(match ctx.resolve_pop()? {
            (_, Some(Reg::Int(gpr))) => gpr,
            (_, Some(Reg::Float(_))) => {
                return Err(Error::Allocation(
                    "int operand expected on the virtual stack".into(),
                ))
            }
            (_, None) => {
                out.push(Instruction::Pop(Datum::reg(Gpr::Rcx)));
                Gpr::Rcx
            }
        });
    }

    // Pop arguments last-to-first; spilled arguments stay on the machine
    // stack and are read in place by the relocation.
    let mut moves = Vec::new();
    let mut stack_args = Vec::new();
    let mut machine_count = 0u32;
    for param in (0..stats.params().len()).rev() {
        let dest = callee.resolve_param(param as u32)?;
        match ctx.resolve_pop()? {
            (_, Some(source)) => moves.push((source, dest)),
            (_, None) => {
                stack_args.push((
                    Datum::mem(Gpr::Rsp, 8 * machine_count as i32),
                    Datum::Register(dest, None),
                ));
                machine_count += 1;
            }
        }
    }

    if let Some(index) = index_register {
        let clobbered = moves.iter().any(|&(_, dest)| dest == Reg::Int(index))
            || stack_args
                .iter()
                .any(|(_, dest)| *dest == Datum::Register(Reg::Int(index), None));
        if clobbered && index != Gpr::Rcx {
            out.push(Instruction::Mov {
                src: Datum::reg(index),
                dest: Datum::reg(Gpr::Rcx),
                width: Width::Q,
            });
            index_register = Some(Gpr::Rcx);
        }
    }

    let save_set = ctx.registers_used(false);
    let relocated = relocate_arguments(moves, stack_args, &save_set);
    for &register in &relocated.to_restore {
        save_register(register, out);
    }
    out.extend(relocated.instructions);

    match target {
        CallTarget::Direct(label) => out.push(Instruction::Call(Datum::Label(label))),
        CallTarget::Indirect(table_label) => {
            let index = index_register.expect("indirect calls pop their index first");
            out.push(Instruction::Lea {
                src: Datum::Label(table_label),
                dest: Datum::reg(Gpr::Rax),
            });
            out.push(Instruction::Call(Datum::mem_index(Gpr::Rax, 0, index, 8)));
        }
    }

    for &register in relocated.to_restore.iter().rev() {
        restore_register(register, out);
    }
    shrink_stack(machine_count, out);

    if let Some(result_type) = stats.result() {
        let float = is_float(result_type);
        if float {
            push_float_result(ctx, out, regs::FLOAT_RESULT_REGISTER);
        } else {
            push_int_result(ctx, out, regs::INT_RESULT_REGISTER);
        }
    }
    Ok(BranchResult::fall_through())
}

fn compile_br_table(
    table: &[u32],
    default: u32,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    if table.is_empty() {
        // Nothing to select over; the selector is discarded and control
        // goes straight to the default.
        if let (_, None) = ctx.resolve_pop()? {
            shrink_stack(1, out);
        }
        let label = compile_branch(default, ctx, out)?;
        return Ok(BranchResult::leaves(label));
    }

    let selector = pop_int_operand(ctx, out, Gpr::Rcx)?;
    let table_label = ctx.new_label();

    // One code path per distinct nesting, shared by every case that
    // targets it.
    let mut case_paths: Vec<(u32, String)> = Vec::new();
    for &nesting in table.iter().chain(core::iter::once(&default)) {
        if !case_paths.iter().any(|&(depth, _)| depth == nesting) {
            let label = ctx.new_label();
            case_paths.push((nesting, label));
        }
    }
    let case_label = |nesting: u32| -> String {
        case_paths
            .iter()
            .find(|&&(depth, _)| depth == nesting)
            .expect("every nesting was assigned a path above")
            .1
            .clone()
    };

    out.push(Instruction::Cmp {
        src: Datum::imm(table.len() as i64),
        dest: Datum::reg(selector),
        width: Width::L,
    });
    out.push(Instruction::Jmp {
        cond: Some(Cond::Ae),
        target: Datum::Label(case_label(default)),
    });
    out.push(Instruction::Lea {
        src: Datum::Label(table_label.clone()),
        dest: Datum::reg(Gpr::Rax),
    });
    out.push(Instruction::Mov {
        src: Datum::mem_index(Gpr::Rax, 0, selector, 8),
        dest: Datum::reg(Gpr::Rdx),
        width: Width::Q,
    });
    out.push(Instruction::Add {
        src: Datum::reg(Gpr::Rax),
        dest: Datum::reg(Gpr::Rdx),
        width: Width::Q,
    });
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::reg(Gpr::Rdx),
    });

    let snapshot = ctx.stack_state();
    let mut branches = BTreeSet::new();
    for (nesting, path_label) in &case_paths {
        ctx.restore_stack_state(&snapshot);
        out.push(Instruction::Label(path_label.clone()));
        if let Some(label) = compile_branch(*nesting, ctx, out)? {
            branches.insert(label);
        }
    }

    out.push(Instruction::Directive(Directive::Rodata));
    out.push(Instruction::Directive(Directive::Balign(8)));
    out.push(Instruction::Label(table_label.clone()));
    for &nesting in table {
        out.push(Instruction::Directive(Directive::Quad(
            QuadValue::Difference(case_label(nesting), table_label.clone()),
        )));
    }
    out.push(Instruction::Directive(Directive::Text));

    Ok(BranchResult {
        branches,
        definitely: true,
    })
}

/// Lowers one non-structured instruction.
///
/// Structured instructions (`block`, `loop`, `if`, `else`, `end`) never
/// reach this function; [`compile_sequence`] handles them.
#[allow(unreachable_patterns)]
pub(crate) fn compile_instruction(
    instruction: &WasmInstruction,
    module: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<BranchResult, Error> {
    use self::WasmInstruction::*;

    match *instruction {
        Unreachable => {
            out.push(Instruction::Mov {
                src: Datum::imm(SYSCALL_EXIT),
                dest: Datum::reg(Gpr::Rax),
                width: Width::L,
            });
            out.push(Instruction::Mov {
                src: Datum::imm(0xFF),
                dest: Datum::reg(Gpr::Rdi),
                width: Width::L,
            });
            out.push(Instruction::Syscall);
            return Ok(BranchResult::leaves(None));
        }
        Nop => {}

        Br(depth) => {
            let label = compile_branch(depth, ctx, out)?;
            return Ok(BranchResult::leaves(label));
        }
        BrIf(depth) => {
            let condition = pop_int_operand(ctx, out, Gpr::Rax)?;
            out.push(Instruction::Test {
                src: Datum::reg(condition),
                dest: Datum::reg(condition),
                width: Width::L,
            });
            let skip_label = ctx.new_label();
            out.push(Instruction::Jmp {
                cond: Some(Cond::E),
                target: Datum::Label(skip_label.clone()),
            });
            let snapshot = ctx.stack_state();
            let label = compile_branch(depth, ctx, out)?;
            ctx.restore_stack_state(&snapshot);
            out.push(Instruction::Label(skip_label));
            return Ok(BranchResult::may_leave(label));
        }
        BrTable(ref data) => return compile_br_table(&data.table, data.default, ctx, out),
        Return => {
            compile_return(ctx, out)?;
            return Ok(BranchResult::leaves(None));
        }

        Call(function) => {
            let stats = module.function_stats(function)?.clone();
            let label = module.function_label(function)?;
            return compile_call(&stats, CallTarget::Direct(label), ctx, out);
        }
        CallIndirect(type_index, _) => {
            let stats = module.type_stats(type_index)?.clone();
            let table = module.table_label(0)?;
            return compile_call(&stats, CallTarget::Indirect(table), ctx, out);
        }

        Drop => {
            if let (_, None) = ctx.resolve_pop()? {
                shrink_stack(1, out);
            }
        }
        Select => compile_select(ctx, out)?,

        GetLocal(index) => compile_get_local(index, ctx, out)?,
        SetLocal(index) => compile_set_local(index, false, ctx, out)?,
        TeeLocal(index) => compile_set_local(index, true, ctx, out)?,
        GetGlobal(index) => compile_get_global(index, module, ctx, out)?,
        SetGlobal(index) => compile_set_global(index, module, ctx, out)?,

        I32Load(_, offset) => {
            compile_load(offset, false, LoadAccess::Plain(Width::L), module, ctx, out)?
        }
        I64Load(_, offset) => {
            compile_load(offset, false, LoadAccess::Plain(Width::Q), module, ctx, out)?
        }
        F32Load(_, offset) => {
            compile_load(offset, true, LoadAccess::Plain(Width::S), module, ctx, out)?
        }
        F64Load(_, offset) => {
            compile_load(offset, true, LoadAccess::Plain(Width::D), module, ctx, out)?
        }
        I32Load8S(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: true,
                from: Width::B,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I32Load8U(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: false,
                from: Width::B,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I32Load16S(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: true,
                from: Width::W,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I32Load16U(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: false,
                from: Width::W,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I64Load8S(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: true,
                from: Width::B,
                to: Width::Q,
            },
            module,
            ctx,
            out,
        )?,
        I64Load8U(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: false,
                from: Width::B,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I64Load16S(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: true,
                from: Width::W,
                to: Width::Q,
            },
            module,
            ctx,
            out,
        )?,
        I64Load16U(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: false,
                from: Width::W,
                to: Width::L,
            },
            module,
            ctx,
            out,
        )?,
        I64Load32S(_, offset) => compile_load(
            offset,
            false,
            LoadAccess::Extend {
                sign: true,
                from: Width::L,
                to: Width::Q,
            },
            module,
            ctx,
            out,
        )?,
        I64Load32U(_, offset) => {
            compile_load(offset, false, LoadAccess::Plain(Width::L), module, ctx, out)?
        }

        I32Store(_, offset) => compile_store(offset, Width::L, module, ctx, out)?,
        I64Store(_, offset) => compile_store(offset, Width::Q, module, ctx, out)?,
        F32Store(_, offset) => compile_store(offset, Width::S, module, ctx, out)?,
        F64Store(_, offset) => compile_store(offset, Width::D, module, ctx, out)?,
        I32Store8(_, offset) => compile_store(offset, Width::B, module, ctx, out)?,
        I32Store16(_, offset) => compile_store(offset, Width::W, module, ctx, out)?,
        I64Store8(_, offset) => compile_store(offset, Width::B, module, ctx, out)?,
        I64Store16(_, offset) => compile_store(offset, Width::W, module, ctx, out)?,
        I64Store32(_, offset) => compile_store(offset, Width::L, module, ctx, out)?,

        CurrentMemory(_) => compile_memory_size(module, ctx, out)?,
        GrowMemory(_) => compile_memory_grow(module, ctx, out)?,

        I32Const(value) => compile_i32_const(value, ctx, out),
        I64Const(value) => compile_i64_const(value, ctx, out),
        F32Const(bits) => compile_float_const(i64::from(bits), Width::S, ctx, out),
        F64Const(bits) => compile_float_const(bits as i64, Width::D, ctx, out),

        I32Eqz => compile_eqz(Width::L, ctx, out)?,
        I32Eq => compile_int_compare(Cond::E, Width::L, ctx, out)?,
        I32Ne => compile_int_compare(Cond::Ne, Width::L, ctx, out)?,
        I32LtS => compile_int_compare(Cond::L, Width::L, ctx, out)?,
        I32LtU => compile_int_compare(Cond::B, Width::L, ctx, out)?,
        I32GtS => compile_int_compare(Cond::G, Width::L, ctx, out)?,
        I32GtU => compile_int_compare(Cond::A, Width::L, ctx, out)?,
        I32LeS => compile_int_compare(Cond::Le, Width::L, ctx, out)?,
        I32LeU => compile_int_compare(Cond::Be, Width::L, ctx, out)?,
        I32GeS => compile_int_compare(Cond::Ge, Width::L, ctx, out)?,
        I32GeU => compile_int_compare(Cond::Ae, Width::L, ctx, out)?,

        I64Eqz => compile_eqz(Width::Q, ctx, out)?,
        I64Eq => compile_int_compare(Cond::E, Width::Q, ctx, out)?,
        I64Ne => compile_int_compare(Cond::Ne, Width::Q, ctx, out)?,
        I64LtS => compile_int_compare(Cond::L, Width::Q, ctx, out)?,
        I64LtU => compile_int_compare(Cond::B, Width::Q, ctx, out)?,
        I64GtS => compile_int_compare(Cond::G, Width::Q, ctx, out)?,
        I64GtU => compile_int_compare(Cond::A, Width::Q, ctx, out)?,
        I64LeS => compile_int_compare(Cond::Le, Width::Q, ctx, out)?,
        I64LeU => compile_int_compare(Cond::Be, Width::Q, ctx, out)?,
        I64GeS => compile_int_compare(Cond::Ge, Width::Q, ctx, out)?,
        I64GeU => compile_int_compare(Cond::Ae, Width::Q, ctx, out)?,

        F32Eq => compile_float_compare(Cond::E, false, Width::S, ctx, out)?,
        F32Ne => compile_float_compare(Cond::Ne, true, Width::S, ctx, out)?,
        F32Lt => compile_float_compare(Cond::B, false, Width::S, ctx, out)?,
        F32Gt => compile_float_compare(Cond::A, false, Width::S, ctx, out)?,
        F32Le => compile_float_compare(Cond::Be, false, Width::S, ctx, out)?,
        F32Ge => compile_float_compare(Cond::Ae, false, Width::S, ctx, out)?,

        F64Eq => compile_float_compare(Cond::E, false, Width::D, ctx, out)?,
        F64Ne => compile_float_compare(Cond::Ne, true, Width::D, ctx, out)?,
        F64Lt => compile_float_compare(Cond::B, false, Width::D, ctx, out)?,
        F64Gt => compile_float_compare(Cond::A, false, Width::D, ctx, out)?,
        F64Le => compile_float_compare(Cond::Be, false, Width::D, ctx, out)?,
        F64Ge => compile_float_compare(Cond::Ae, false, Width::D, ctx, out)?,

        I32Clz => compile_bit_count(
            |src, dest, width| Instruction::Lzcnt { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Ctz => compile_bit_count(
            |src, dest, width| Instruction::Tzcnt { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Popcnt => compile_bit_count(
            |src, dest, width| Instruction::Popcnt { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Add => compile_int_binary(
            |src, dest, width| Instruction::Add { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Sub => compile_int_binary(
            |src, dest, width| Instruction::Sub { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Mul => compile_int_binary(
            |src, dest, width| Instruction::IMul { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32DivS => compile_div(true, false, Width::L, ctx, out)?,
        I32DivU => compile_div(false, false, Width::L, ctx, out)?,
        I32RemS => compile_div(true, true, Width::L, ctx, out)?,
        I32RemU => compile_div(false, true, Width::L, ctx, out)?,
        I32And => compile_int_binary(
            |src, dest, width| Instruction::And { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Or => compile_int_binary(
            |src, dest, width| Instruction::Or { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Xor => compile_int_binary(
            |src, dest, width| Instruction::Xor { src, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Shl => compile_shift(
            |count, dest, width| Instruction::Shl { count, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32ShrS => compile_shift(
            |count, dest, width| Instruction::Sar { count, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32ShrU => compile_shift(
            |count, dest, width| Instruction::Shr { count, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Rotl => compile_shift(
            |count, dest, width| Instruction::Rol { count, dest, width },
            Width::L,
            ctx,
            out,
        )?,
        I32Rotr => compile_shift(
            |count, dest, width| Instruction::Ror { count, dest, width },
            Width::L,
            ctx,
            out,
        )?,

        I64Clz => compile_bit_count(
            |src, dest, width| Instruction::Lzcnt { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Ctz => compile_bit_count(
            |src, dest, width| Instruction::Tzcnt { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Popcnt => compile_bit_count(
            |src, dest, width| Instruction::Popcnt { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Add => compile_int_binary(
            |src, dest, width| Instruction::Add { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Sub => compile_int_binary(
            |src, dest, width| Instruction::Sub { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Mul => compile_int_binary(
            |src, dest, width| Instruction::IMul { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64DivS => compile_div(true, false, Width::Q, ctx, out)?,
        I64DivU => compile_div(false, false, Width::Q, ctx, out)?,
        I64RemS => compile_div(true, true, Width::Q, ctx, out)?,
        I64RemU => compile_div(false, true, Width::Q, ctx, out)?,
        I64And => compile_int_binary(
            |src, dest, width| Instruction::And { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Or => compile_int_binary(
            |src, dest, width| Instruction::Or { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Xor => compile_int_binary(
            |src, dest, width| Instruction::Xor { src, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Shl => compile_shift(
            |count, dest, width| Instruction::Shl { count, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64ShrS => compile_shift(
            |count, dest, width| Instruction::Sar { count, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64ShrU => compile_shift(
            |count, dest, width| Instruction::Shr { count, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Rotl => compile_shift(
            |count, dest, width| Instruction::Rol { count, dest, width },
            Width::Q,
            ctx,
            out,
        )?,
        I64Rotr => compile_shift(
            |count, dest, width| Instruction::Ror { count, dest, width },
            Width::Q,
            ctx,
            out,
        )?,

        F32Abs => compile_float_abs(Width::S, ctx, out)?,
        F32Neg => compile_float_neg(Width::S, ctx, out)?,
        F32Ceil => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Up,
                src,
                dest,
                width,
            },
            Width::S,
            ctx,
            out,
        )?,
        F32Floor => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Down,
                src,
                dest,
                width,
            },
            Width::S,
            ctx,
            out,
        )?,
        F32Trunc => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Truncate,
                src,
                dest,
                width,
            },
            Width::S,
            ctx,
            out,
        )?,
        F32Nearest => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Nearest,
                src,
                dest,
                width,
            },
            Width::S,
            ctx,
            out,
        )?,
        F32Sqrt => compile_float_unary(
            |src, dest, width| Instruction::Sqrt { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Add => compile_float_binary(
            |src, dest, width| Instruction::Add { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Sub => compile_float_binary(
            |src, dest, width| Instruction::Sub { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Mul => compile_float_binary(
            |src, dest, width| Instruction::FMul { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Div => compile_float_binary(
            |src, dest, width| Instruction::FDiv { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Min => compile_float_binary(
            |src, dest, width| Instruction::FMin { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Max => compile_float_binary(
            |src, dest, width| Instruction::FMax { src, dest, width },
            Width::S,
            ctx,
            out,
        )?,
        F32Copysign => compile_float_copysign(Width::S, ctx, out)?,

        F64Abs => compile_float_abs(Width::D, ctx, out)?,
        F64Neg => compile_float_neg(Width::D, ctx, out)?,
        F64Ceil => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Up,
                src,
                dest,
                width,
            },
            Width::D,
            ctx,
            out,
        )?,
        F64Floor => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Down,
                src,
                dest,
                width,
            },
            Width::D,
            ctx,
            out,
        )?,
        F64Trunc => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Truncate,
                src,
                dest,
                width,
            },
            Width::D,
            ctx,
            out,
        )?,
        F64Nearest => compile_float_unary(
            |src, dest, width| Instruction::Round {
                mode: RoundMode::Nearest,
                src,
                dest,
                width,
            },
            Width::D,
            ctx,
            out,
        )?,
        F64Sqrt => compile_float_unary(
            |src, dest, width| Instruction::Sqrt { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Add => compile_float_binary(
            |src, dest, width| Instruction::Add { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Sub => compile_float_binary(
            |src, dest, width| Instruction::Sub { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Mul => compile_float_binary(
            |src, dest, width| Instruction::FMul { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Div => compile_float_binary(
            |src, dest, width| Instruction::FDiv { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Min => compile_float_binary(
            |src, dest, width| Instruction::FMin { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Max => compile_float_binary(
            |src, dest, width| Instruction::FMax { src, dest, width },
            Width::D,
            ctx,
            out,
        )?,
        F64Copysign => compile_float_copysign(Width::D, ctx, out)?,

        I32WrapI64 => {
            let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
            out.push(Instruction::Mov {
                src: Datum::reg(operand),
                dest: Datum::reg(operand),
                width: Width::L,
            });
            push_int_result(ctx, out, operand);
        }
        I32TruncSF32 => compile_trunc_signed(Width::S, Width::L, ctx, out)?,
        I32TruncUF32 => compile_trunc_unsigned_i32(Width::S, ctx, out)?,
        I32TruncSF64 => compile_trunc_signed(Width::D, Width::L, ctx, out)?,
        I32TruncUF64 => compile_trunc_unsigned_i32(Width::D, ctx, out)?,
        I64ExtendSI32 => {
            let operand = pop_int_operand(ctx, out, Gpr::Rax)?;
            out.push(Instruction::MovExtend {
                sign: true,
                src: Datum::reg(operand),
                dest: Datum::reg(operand),
                src_width: Width::L,
                dest_width: Width::Q,
            });
            push_int_result(ctx, out, operand);
        }
        // i32 values are kept zero-extended, so the unsigned widening is
        // already done.
        I64ExtendUI32 => {}
        I64TruncSF32 => compile_trunc_signed(Width::S, Width::Q, ctx, out)?,
        I64TruncUF32 => compile_trunc_unsigned_i64(Width::S, ctx, out)?,
        I64TruncSF64 => compile_trunc_signed(Width::D, Width::Q, ctx, out)?,
        I64TruncUF64 => compile_trunc_unsigned_i64(Width::D, ctx, out)?,
        F32ConvertSI32 => compile_convert_signed(Width::L, Width::S, ctx, out)?,
        F32ConvertUI32 => compile_convert_unsigned_i32(Width::S, ctx, out)?,
        F32ConvertSI64 => compile_convert_signed(Width::Q, Width::S, ctx, out)?,
        F32ConvertUI64 => compile_convert_unsigned_i64(Width::S, ctx, out)?,
        F32DemoteF64 => {
            let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
            out.push(Instruction::FloatToFloat {
                src: Datum::reg(operand),
                dest: Datum::reg(operand),
                from: Width::D,
            });
            push_float_result(ctx, out, operand);
        }
        F64ConvertSI32 => compile_convert_signed(Width::L, Width::D, ctx, out)?,
        F64ConvertUI32 => compile_convert_unsigned_i32(Width::D, ctx, out)?,
        F64ConvertSI64 => compile_convert_signed(Width::Q, Width::D, ctx, out)?,
        F64ConvertUI64 => compile_convert_unsigned_i64(Width::D, ctx, out)?,
        F64PromoteF32 => {
            let operand = pop_float_operand(ctx, out, Xmm::Xmm0)?;
            out.push(Instruction::FloatToFloat {
                src: Datum::reg(operand),
                dest: Datum::reg(operand),
                from: Width::S,
            });
            push_float_result(ctx, out, operand);
        }

        I32ReinterpretF32 | I64ReinterpretF64 => compile_reinterpret_float_to_int(ctx, out)?,
        F32ReinterpretI32 | F64ReinterpretI64 => compile_reinterpret_int_to_float(ctx, out)?,

        Block(_) | Loop(_) | If(_) | Else | End => {
            return Err(Error::Allocation(
                "structured instruction reached the leaf dispatcher".into(),
            ))
        }
        ref other => {
            return Err(Error::Unsupported(format!(
                "instruction {:?} is not supported",
                other
            )))
        }
    }
    Ok(BranchResult::fall_through())
}
