//! Shared lowering helpers: machine-stack adjustment, virtual-stack
//! unwinding, result marshaling, branch compilation and the System V
//! argument relocation solver.

use alloc::string::String;
use alloc::vec::Vec;

use crate::asm::{Datum, Instruction, Width};
use crate::context::{is_float, CompilationContext};
use crate::regs::{Gpr, Reg, Xmm};
use crate::Error;

/// Reserves `count` 8-byte slots on the machine stack.
pub(crate) fn grow_stack(count: u32, out: &mut Vec<Instruction>) {
    if count > 0 {
        out.push(Instruction::Sub {
            src: Datum::imm(8 * count as i64),
            dest: Datum::reg(Gpr::Rsp),
            width: Width::Q,
        });
    }
}

/// Releases `count` 8-byte slots from the machine stack.
pub(crate) fn shrink_stack(count: u32, out: &mut Vec<Instruction>) {
    if count > 0 {
        out.push(Instruction::Add {
            src: Datum::imm(8 * count as i64),
            dest: Datum::reg(Gpr::Rsp),
            width: Width::Q,
        });
    }
}

/// Saves a register across a call. Pushes are the natural fit for general
/// registers; SSE registers go through an explicit slot since `push` only
/// takes GPRs.
pub(crate) fn save_register(register: Reg, out: &mut Vec<Instruction>) {
    match register {
        Reg::Int(gpr) => out.push(Instruction::Push(Datum::reg(gpr))),
        Reg::Float(xmm) => {
            grow_stack(1, out);
            out.push(Instruction::Mov {
                src: Datum::reg(xmm),
                dest: Datum::mem(Gpr::Rsp, 0),
                width: Width::Q,
            });
        }
    }
}

/// Undoes [`save_register`].
pub(crate) fn restore_register(register: Reg, out: &mut Vec<Instruction>) {
    match register {
        Reg::Int(gpr) => out.push(Instruction::Pop(Datum::reg(gpr))),
        Reg::Float(xmm) => {
            out.push(Instruction::Mov {
                src: Datum::mem(Gpr::Rsp, 0),
                dest: Datum::reg(xmm),
                width: Width::Q,
            });
            shrink_stack(1, out);
        }
    }
}

/// Pops the top virtual value into the ABI result register of its kind
/// (rax or xmm0).
pub(crate) fn pop_into_result(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<bool, Error> {
    let (float, location) = ctx.resolve_pop()?;
    match location {
        Some(register) => {
            let result: Reg = if float {
                Reg::Float(Xmm::Xmm0)
            } else {
                Reg::Int(Gpr::Rax)
            };
            out.push(Instruction::Mov {
                src: Datum::Register(register, None),
                dest: Datum::Register(result, None),
                width: Width::Q,
            });
        }
        None if float => {
            out.push(Instruction::Pop(Datum::reg(Gpr::Rax)));
            out.push(Instruction::Mov {
                src: Datum::reg(Gpr::Rax),
                dest: Datum::reg(Xmm::Xmm0),
                width: Width::Q,
            });
        }
        None => out.push(Instruction::Pop(Datum::reg(Gpr::Rax))),
    }
    Ok(float)
}

/// Pushes a value of the given kind from its ABI result register onto the
/// virtual stack.
pub(crate) fn push_from_result(
    float: bool,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) {
    match ctx.resolve_push(float) {
        Some(register) => {
            let result: Reg = if float {
                Reg::Float(Xmm::Xmm0)
            } else {
                Reg::Int(Gpr::Rax)
            };
            out.push(Instruction::Mov {
                src: Datum::Register(result, None),
                dest: Datum::Register(register, None),
                width: Width::Q,
            });
        }
        None => {
            if float {
                out.push(Instruction::Mov {
                    src: Datum::reg(Xmm::Xmm0),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
            }
            out.push(Instruction::Push(Datum::reg(Gpr::Rax)));
        }
    }
}

/// Pops virtual values until the heights match the targets, merging all the
/// machine-stack releases into a single rsp adjustment.
pub(crate) fn unwind_stack(
    target_int: u32,
    target_float: u32,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let mut machine = 0;
    while ctx.int_stack_height() > target_int || ctx.float_stack_height() > target_float {
        let (_, location) = ctx.resolve_pop()?;
        if location.is_none() {
            machine += 1;
        }
    }
    if ctx.int_stack_height() != target_int || ctx.float_stack_height() != target_float {
        return Err(Error::Allocation(format!(
            "unwound past the target heights ({}, {})",
            target_int, target_float
        )));
    }
    shrink_stack(machine, out);
    Ok(())
}

/// Moves the function result (if any) into its ABI register and unwinds the
/// whole virtual stack.
pub(crate) fn pop_result_and_unwind(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    if ctx.result().is_some() {
        pop_into_result(ctx, out)?;
    }
    unwind_stack(0, 0, ctx, out)
}

/// Lowers an explicit or implicit return: marshal the result, unwind, and
/// jump to the epilogue.
pub(crate) fn compile_return(
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    pop_result_and_unwind(ctx, out)?;
    let label = String::from(ctx.return_label());
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(label),
    });
    Ok(())
}

/// Lowers a branch to the block `nesting` levels out.
///
/// For a loop the stack is unwound to the recorded heights and control
/// jumps to the header. For a block with a result the top value is carried
/// to the landing slot: if it is not already there it is staged through the
/// result register of its kind around the unwind. A branch that resolves to
/// the function's own frame lowers as a return and yields no label.
pub(crate) fn compile_branch(
    nesting: u32,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<Option<String>, Error> {
    if ctx.is_function_frame(nesting) {
        compile_return(ctx, out)?;
        return Ok(None);
    }
    let frame = ctx.nested_label(nesting)?.clone();
    if frame.is_loop {
        unwind_stack(frame.int_height, frame.float_height, ctx, out)?;
    } else if let Some(result_type) = frame.result {
        let float = is_float(result_type);
        let want_int = frame.int_height + u32::from(!float);
        let want_float = frame.float_height + u32::from(float);
        if ctx.int_stack_height() != want_int || ctx.float_stack_height() != want_float {
            pop_into_result(ctx, out)?;
            unwind_stack(frame.int_height, frame.float_height, ctx, out)?;
            push_from_result(float, ctx, out);
        }
    } else {
        unwind_stack(frame.int_height, frame.float_height, ctx, out)?;
    }
    out.push(Instruction::Jmp {
        cond: None,
        target: Datum::Label(frame.label.clone()),
    });
    Ok(Some(frame.label))
}

/// The outcome of [`relocate_arguments`].
pub(crate) struct RelocatedArguments {
    /// Save-set registers the moves clobber; the caller pushes them before
    /// the returned instructions and pops them after the call.
    pub to_restore: Vec<Reg>,
    /// The move sequence.
    pub instructions: Vec<Instruction>,
}

/// Solves a register permutation with one temporary per kind.
///
/// `moves` are register-to-register transfers. A destination no pending
/// move still reads is written immediately, which unblocks the move feeding
/// it; when no such destination exists the remaining moves form closed
/// cycles, and one cycle is broken by parking a destination in the kind's
/// temporary (rax for ints, xmm15 for floats, neither of them ever a
/// System V argument register). The parked value drains only after the
/// rest of its cycle, and since nothing writes the temporaries a second
/// eviction cannot land on one that is still occupied. `stack_params` are
/// memory-sourced transfers resolved after all register moves, with an rax
/// hop when the target is itself memory. rsp-relative sources are shifted
/// by the room the `to_restore` pushes will take.
pub(crate) fn relocate_arguments(
    moves: Vec<(Reg, Reg)>,
    stack_params: Vec<(Datum, Datum)>,
    save_set: &[Reg],
) -> RelocatedArguments {
    const INT_TEMP: Reg = Reg::Int(Gpr::Rax);
    const FLOAT_TEMP: Reg = Reg::Float(Xmm::Xmm15);

    let mut targets: Vec<Reg> = moves.iter().map(|&(_, dest)| dest).collect();
    for (_, dest) in &stack_params {
        if let Datum::Register(register, _) = dest {
            targets.push(*register);
        }
    }
    let to_restore: Vec<Reg> = save_set
        .iter()
        .filter(|register| targets.contains(register))
        .copied()
        .collect();
    let shift = 8 * to_restore.len() as i32;

    let mut instructions = Vec::new();
    let mut pending = moves;
    pending.retain(|&(src, dest)| src != dest);
    while !pending.is_empty() {
        if let Some(position) = pending
            .iter()
            .position(|&(_, dest)| !pending.iter().any(|&(src, _)| src == dest))
        {
            // This destination is not read anymore; writing it frees its
            // source for the move that feeds it.
            let (src, dest) = pending.remove(position);
            instructions.push(Instruction::Mov {
                src: Datum::Register(src, None),
                dest: Datum::Register(dest, None),
                width: Width::Q,
            });
            continue;
        }
        // Every remaining destination is still read: closed cycles only.
        // Park one destination in the temporary; the register it vacates
        // unblocks the rest of its cycle and the parked value goes out
        // last.
        let dest = pending[0].1;
        let temp = if dest.is_float() { FLOAT_TEMP } else { INT_TEMP };
        instructions.push(Instruction::Mov {
            src: Datum::Register(dest, None),
            dest: Datum::Register(temp, None),
            width: Width::Q,
        });
        for pair in pending.iter_mut() {
            if pair.0 == dest {
                pair.0 = temp;
            }
        }
    }

    for (src, dest) in stack_params {
        let src = match src {
            Datum::Indirect {
                base: Gpr::Rsp,
                displacement,
                index,
            } => Datum::Indirect {
                base: Gpr::Rsp,
                displacement: displacement + shift,
                index,
            },
            other => other,
        };
        match dest {
            Datum::Register(..) => instructions.push(Instruction::Mov {
                src,
                dest,
                width: Width::Q,
            }),
            memory => {
                instructions.push(Instruction::Mov {
                    src,
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                instructions.push(Instruction::Mov {
                    src: Datum::reg(Gpr::Rax),
                    dest: memory,
                    width: Width::Q,
                });
            }
        }
    }

    RelocatedArguments {
        to_restore,
        instructions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn relocation_handles_identity() {
        let relocated = relocate_arguments(
            vec![(Reg::Int(Gpr::Rdi), Reg::Int(Gpr::Rdi))],
            Vec::new(),
            &[],
        );
        assert!(relocated.instructions.is_empty());
        assert!(relocated.to_restore.is_empty());
    }

    #[test]
    fn relocation_breaks_cycles_with_the_temporary() {
        // rdi and rsi swap; one of them must bounce through rax.
        let relocated = relocate_arguments(
            vec![
                (Reg::Int(Gpr::Rdi), Reg::Int(Gpr::Rsi)),
                (Reg::Int(Gpr::Rsi), Reg::Int(Gpr::Rdi)),
            ],
            Vec::new(),
            &[],
        );
        let text: Vec<String> = relocated
            .instructions
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(
            text,
            vec![
                "\tmovq %rsi, %rax",
                "\tmovq %rdi, %rsi",
                "\tmovq %rax, %rdi",
            ]
        );
    }

    #[test]
    fn relocation_rotates_three_registers_through_one_temporary() {
        // rdi -> rsi -> rdx -> rdi; only one value may sit in rax and it
        // must drain before anything else is parked there.
        let relocated = relocate_arguments(
            vec![
                (Reg::Int(Gpr::Rdi), Reg::Int(Gpr::Rsi)),
                (Reg::Int(Gpr::Rsi), Reg::Int(Gpr::Rdx)),
                (Reg::Int(Gpr::Rdx), Reg::Int(Gpr::Rdi)),
            ],
            Vec::new(),
            &[],
        );
        let text: Vec<String> = relocated
            .instructions
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(
            text,
            vec![
                "\tmovq %rsi, %rax",
                "\tmovq %rdi, %rsi",
                "\tmovq %rdx, %rdi",
                "\tmovq %rax, %rdx",
            ]
        );
    }

    #[test]
    fn relocation_drains_chains_without_the_temporary() {
        // rdi -> rsi -> rdx is a chain, not a cycle; the tail is written
        // first and no eviction happens.
        let relocated = relocate_arguments(
            vec![
                (Reg::Int(Gpr::Rdi), Reg::Int(Gpr::Rsi)),
                (Reg::Int(Gpr::Rsi), Reg::Int(Gpr::Rdx)),
            ],
            Vec::new(),
            &[],
        );
        let text: Vec<String> = relocated
            .instructions
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(text, vec!["\tmovq %rsi, %rdx", "\tmovq %rdi, %rsi"]);
    }

    #[test]
    fn relocation_shifts_stack_sources_for_saves() {
        let relocated = relocate_arguments(
            vec![(Reg::Int(Gpr::Rdi), Reg::Int(Gpr::R12))],
            vec![(Datum::mem(Gpr::Rsp, 8), Datum::reg(Gpr::R13))],
            &[Reg::Int(Gpr::R12), Reg::Int(Gpr::R13), Reg::Int(Gpr::R14)],
        );
        assert_eq!(
            relocated.to_restore,
            vec![Reg::Int(Gpr::R12), Reg::Int(Gpr::R13)]
        );
        let text: Vec<String> = relocated
            .instructions
            .iter()
            .map(|i| i.to_string())
            .collect();
        // Two saves get pushed first, so the stack source moved down 16.
        assert_eq!(text, vec!["\tmovq %rdi, %r12", "\tmovq 24(%rsp), %r13"]);
    }

    #[test]
    fn float_chains_use_xmm15() {
        let relocated = relocate_arguments(
            vec![
                (Reg::Float(Xmm::Xmm0), Reg::Float(Xmm::Xmm1)),
                (Reg::Float(Xmm::Xmm1), Reg::Float(Xmm::Xmm0)),
            ],
            Vec::new(),
            &[],
        );
        let text: Vec<String> = relocated
            .instructions
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(
            text,
            vec![
                "\tmovq %xmm1, %xmm15",
                "\tmovq %xmm0, %xmm1",
                "\tmovq %xmm15, %xmm0",
            ]
        );
    }
}
