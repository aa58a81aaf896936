//! The module assembler: walks a parsed module's sections and emits its
//! data cells, init function, function bodies, System V adapters and C
//! header declarations.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use parity_wasm::elements::{FuncBody, InitExpr, Instruction as WasmInstruction, Module, ValueType};

use crate::asm::{Datum, Directive, Instruction, QuadValue, Width};
use crate::context::{
    is_float, CompilationContext, ExportKind, FunctionStats, LocalValue, ModuleContext,
};
use crate::header::{CType, HeaderDeclaration};
use crate::regs::{self, Gpr, Reg};
use crate::Error;

pub(crate) mod body;
pub(crate) mod helpers;
#[cfg(test)]
mod tests;

use self::body::{compile_body, compile_instruction, pop_int_operand};
use self::helpers::{
    grow_stack, pop_result_and_unwind, relocate_arguments, restore_register, save_register,
    shrink_stack,
};

/// Compiles one parsed module into its assembly stream and header
/// declarations.
///
/// `module_indices` maps every linked module's name to its index; a module
/// compiled on its own passes a map containing just itself.
pub fn compile_module(
    index: usize,
    name: &str,
    module: &Module,
    module_indices: &BTreeMap<String, usize>,
) -> Result<(Vec<Instruction>, Vec<HeaderDeclaration>), Error> {
    let context = ModuleContext::new(index, name, module, module_indices)?;
    let mut out = Vec::new();
    let mut declarations = Vec::new();

    emit_data_section(&context, module, &mut out, &mut declarations)?;
    out.push(Instruction::Directive(Directive::Text));
    compile_init_function(&context, module, &mut out, &mut declarations)?;

    // Re-exports of imported functions get an adapter that tail-jumps into
    // the exporting module.
    for export in context.exports() {
        if let ExportKind::Function(function_index) = export.kind {
            if (function_index as usize) < context.imported_function_count() {
                let stats = context.function_stats(function_index)?.clone();
                let target = context.function_label(function_index)?;
                let export_label = context.export_label("FUNC", &export.field);
                out.push(Instruction::Directive(Directive::Globl(export_label.clone())));
                out.push(Instruction::Label(export_label));
                let c_name = context.sysv_name(&export.field);
                out.push(Instruction::Directive(Directive::Globl(c_name.clone())));
                out.push(Instruction::Label(c_name.clone()));
                declarations.push(HeaderDeclaration::Function {
                    result: CType::of_result(stats.result()),
                    name: c_name,
                    params: stats.params().iter().copied().map(CType::of).collect(),
                });
                compile_adapter(&stats, &target, false, &mut out)?;
            }
        }
    }

    let bodies = module.code_section().map(|cs| cs.bodies()).unwrap_or(&[]);
    for (body_index, body) in bodies.iter().enumerate() {
        let function_index = (context.imported_function_count() + body_index) as u32;
        compile_function(&context, function_index, body, &mut out, &mut declarations)?;
    }

    Ok((out, declarations))
}

/// Emits tables, the memory pointer/size cells and globals into `.data`.
fn emit_data_section(
    context: &ModuleContext,
    module: &Module,
    out: &mut Vec<Instruction>,
    declarations: &mut Vec<HeaderDeclaration>,
) -> Result<(), Error> {
    out.push(Instruction::Directive(Directive::Data));

    for (table_index, label, min) in context.own_tables() {
        out.push(Instruction::Directive(Directive::Balign(8)));
        for field in context.export_fields(ExportKind::Table(table_index)) {
            let export_label = context.export_label("TABLE", field);
            out.push(Instruction::Directive(Directive::Globl(export_label.clone())));
            out.push(Instruction::Label(export_label));
        }
        out.push(Instruction::Label(String::from(label)));
        for _ in 0..min {
            out.push(Instruction::Directive(Directive::Quad(QuadValue::Constant(0))));
        }
    }

    if let Some(memory) = context.memory() {
        if !memory.imported {
            let fields = context.export_fields(ExportKind::Memory(0));
            if !fields.is_empty() {
                // An exported memory surfaces as a pointer constant and a
                // size cell; the size labels alias the live MEMSIZE cell so
                // memory.grow stays visible from C.
                out.push(Instruction::Directive(Directive::Balign(8)));
                for &field in &fields {
                    let export_label = context.export_label("MEMORY", field);
                    out.push(Instruction::Directive(Directive::Globl(export_label.clone())));
                    out.push(Instruction::Label(export_label));
                    let pointer_name = format!("{}_memory", context.sysv_name(field));
                    out.push(Instruction::Directive(Directive::Globl(pointer_name.clone())));
                    out.push(Instruction::Label(pointer_name.clone()));
                    declarations.push(HeaderDeclaration::Global {
                        ctype: CType::Void,
                        pointer: true,
                        constant: true,
                        name: pointer_name,
                    });
                }
                out.push(Instruction::Directive(Directive::Quad(QuadValue::Constant(
                    context.memory_start()? as i64,
                ))));
            }
            out.push(Instruction::Directive(Directive::Balign(4)));
            for &field in &fields {
                let size_name = format!("{}_size", context.sysv_name(field));
                out.push(Instruction::Directive(Directive::Globl(size_name.clone())));
                out.push(Instruction::Label(size_name.clone()));
                declarations.push(HeaderDeclaration::Global {
                    ctype: CType::Int,
                    pointer: false,
                    constant: true,
                    name: size_name,
                });
            }
            out.push(Instruction::Label(context.memsize_label()?));
            out.push(Instruction::Directive(Directive::Long(0)));
        }
    }

    let imported_globals = context.imported_global_count();
    let entries = module
        .global_section()
        .map(|gs| gs.entries())
        .unwrap_or(&[]);
    for (entry_index, entry) in entries.iter().enumerate() {
        let global_index = (imported_globals + entry_index) as u32;
        let value_type = entry.global_type().content_type();
        let mutable = entry.global_type().is_mutable();
        let wide = matches!(value_type, ValueType::I64 | ValueType::F64);
        out.push(Instruction::Directive(Directive::Balign(if wide { 8 } else { 4 })));
        for field in context.export_fields(ExportKind::Global(global_index)) {
            let export_label = context.export_label("GLOBAL", field);
            out.push(Instruction::Directive(Directive::Globl(export_label.clone())));
            out.push(Instruction::Label(export_label));
            let c_name = context.sysv_name(field);
            out.push(Instruction::Directive(Directive::Globl(c_name.clone())));
            out.push(Instruction::Label(c_name.clone()));
            declarations.push(HeaderDeclaration::Global {
                ctype: CType::of(value_type),
                pointer: false,
                constant: !mutable,
                name: c_name,
            });
        }
        out.push(Instruction::Label(context.global_label(global_index)?));
        out.push(Instruction::Directive(if wide {
            Directive::Quad(QuadValue::Constant(0))
        } else {
            Directive::Long(0)
        }));
    }

    Ok(())
}

/// Lowers a constant expression (everything up to its trailing `end`),
/// leaving one value on the virtual stack.
fn compile_init_expr(
    expr: &InitExpr,
    context: &ModuleContext,
    ctx: &mut CompilationContext,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let code = expr.code();
    let (last, rest) = code
        .split_last()
        .ok_or_else(|| Error::Module("empty initializer expression".into()))?;
    if *last != WasmInstruction::End {
        return Err(Error::Module(
            "initializer expression is not terminated by end".into(),
        ));
    }
    for instruction in rest {
        compile_instruction(instruction, context, ctx, out)?;
    }
    Ok(())
}

/// Synthesizes `wasm_{module}_init_module` when the module has anything to
/// set up: it grows the memory to its declared minimum, stores the data
/// segments, runs global initializers, fills tables and finally calls the
/// start function.
fn compile_init_function(
    context: &ModuleContext,
    module: &Module,
    out: &mut Vec<Instruction>,
    declarations: &mut Vec<HeaderDeclaration>,
) -> Result<(), Error> {
    let data_segments = module.data_section().map(|ds| ds.entries()).unwrap_or(&[]);
    let global_entries = module
        .global_section()
        .map(|gs| gs.entries())
        .unwrap_or(&[]);
    let element_segments = module
        .elements_section()
        .map(|es| es.entries())
        .unwrap_or(&[]);
    let grows_memory = context.memory().map_or(false, |memory| !memory.imported);

    if !grows_memory
        && data_segments.is_empty()
        && global_entries.is_empty()
        && element_segments.is_empty()
        && context.start_function().is_none()
    {
        return Ok(());
    }

    let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
    let label_base = format!("MODULE{}_INIT", context.index());
    let mut ctx = CompilationContext::new(&stats, label_base.clone(), label_base)?;
    let mut body_out = Vec::new();

    if grows_memory {
        let min = context
            .memory()
            .expect("grows_memory implies a memory")
            .initial
            .0 as i32;
        compile_instruction(&WasmInstruction::I32Const(min), context, &mut ctx, &mut body_out)?;
        compile_instruction(&WasmInstruction::GrowMemory(0), context, &mut ctx, &mut body_out)?;
        compile_instruction(&WasmInstruction::Drop, context, &mut ctx, &mut body_out)?;
    }

    for segment in data_segments {
        let offset = segment
            .offset()
            .as_ref()
            .ok_or_else(|| Error::Module("passive data segments are not supported".into()))?;
        compile_init_expr(offset, context, &mut ctx, &mut body_out)?;
        let dest = pop_int_operand(&mut ctx, &mut body_out, Gpr::Rcx)?;
        body_out.push(Instruction::Mov {
            src: Datum::imm(context.memory_start()? as i64),
            dest: Datum::reg(Gpr::Rax),
            width: Width::Q,
        });
        body_out.push(Instruction::Add {
            src: Datum::reg(Gpr::Rax),
            dest: Datum::reg(dest),
            width: Width::Q,
        });
        // Bytes go out in 8-byte immediate chunks, with byte stores for the
        // tail.
        let bytes = segment.value();
        let mut position = 0usize;
        while position + 8 <= bytes.len() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[position..position + 8]);
            body_out.push(Instruction::Mov {
                src: Datum::imm(u64::from_le_bytes(chunk) as i64),
                dest: Datum::reg(Gpr::Rax),
                width: Width::Q,
            });
            body_out.push(Instruction::Mov {
                src: Datum::reg(Gpr::Rax),
                dest: Datum::mem(dest, position as i32),
                width: Width::Q,
            });
            position += 8;
        }
        while position < bytes.len() {
            body_out.push(Instruction::Mov {
                src: Datum::imm(i64::from(bytes[position])),
                dest: Datum::mem(dest, position as i32),
                width: Width::B,
            });
            position += 1;
        }
    }

    let imported_globals = context.imported_global_count();
    for (entry_index, entry) in global_entries.iter().enumerate() {
        let global_index = (imported_globals + entry_index) as u32;
        compile_init_expr(entry.init_expr(), context, &mut ctx, &mut body_out)?;
        compile_instruction(
            &WasmInstruction::SetGlobal(global_index),
            context,
            &mut ctx,
            &mut body_out,
        )?;
    }

    for segment in element_segments {
        if segment.index() != 0 {
            return Err(Error::Module(format!(
                "element segment references table {}, only table 0 exists",
                segment.index()
            )));
        }
        let offset = segment
            .offset()
            .as_ref()
            .ok_or_else(|| Error::Module("passive element segments are not supported".into()))?;
        compile_init_expr(offset, context, &mut ctx, &mut body_out)?;
        let offset_register = pop_int_operand(&mut ctx, &mut body_out, Gpr::Rcx)?;
        body_out.push(Instruction::Lea {
            src: Datum::Label(context.table_label(0)?),
            dest: Datum::reg(Gpr::Rax),
        });
        for (member_index, function_index) in segment.members().iter().enumerate() {
            body_out.push(Instruction::Lea {
                src: Datum::Label(context.function_label(*function_index)?),
                dest: Datum::reg(Gpr::Rdx),
            });
            body_out.push(Instruction::Mov {
                src: Datum::reg(Gpr::Rdx),
                dest: Datum::mem_index(Gpr::Rax, 8 * member_index as i32, offset_register, 8),
                width: Width::Q,
            });
        }
    }

    if let Some(start) = context.start_function() {
        body_out.push(Instruction::Call(Datum::Label(
            context.function_label(start)?,
        )));
    }

    // The init function is entered from C, so only the System V callee-save
    // registers it touches need preserving.
    let saves: Vec<Gpr> = ctx
        .registers_used(true)
        .into_iter()
        .filter_map(|register| match register {
            Reg::Int(gpr) if regs::SYSV_CALLEE_SAVE.contains(&gpr) => Some(gpr),
            _ => None,
        })
        .collect();

    let init_label = context.init_label();
    out.push(Instruction::Directive(Directive::Globl(init_label.clone())));
    out.push(Instruction::Label(init_label.clone()));
    for &gpr in &saves {
        out.push(Instruction::Push(Datum::reg(gpr)));
    }
    out.extend(body_out);
    for &gpr in saves.iter().rev() {
        out.push(Instruction::Pop(Datum::reg(gpr)));
    }
    out.push(Instruction::Ret);

    declarations.push(HeaderDeclaration::Function {
        result: CType::Void,
        name: init_label,
        params: Vec::new(),
    });
    Ok(())
}

/// Emits one function: export labels and adapter, internal label, prologue,
/// lowered body, and epilogue.
fn compile_function(
    context: &ModuleContext,
    function_index: u32,
    body: &FuncBody,
    out: &mut Vec<Instruction>,
    declarations: &mut Vec<HeaderDeclaration>,
) -> Result<(), Error> {
    let stats = context.function_stats(function_index)?.clone();
    let internal_label = context.function_label(function_index)?;
    let return_label = context.return_label(function_index);
    let mut ctx = CompilationContext::new(&stats, internal_label.clone(), return_label.clone())?;
    ctx.push_label(false, return_label.clone(), stats.result());

    let mut body_out = Vec::new();
    let result = compile_body(body.code().elements(), context, &mut ctx, &mut body_out)?;
    if !result.definitely {
        pop_result_and_unwind(&mut ctx, &mut body_out)?;
    }
    ctx.pop_label()?;

    let used = ctx.registers_used(true);
    let stack_locals = ctx.stack_locals();

    let fields = context.export_fields(ExportKind::Function(function_index));
    if !fields.is_empty() {
        for &field in &fields {
            let export_label = context.export_label("FUNC", field);
            out.push(Instruction::Directive(Directive::Globl(export_label.clone())));
            out.push(Instruction::Label(export_label));
            let c_name = context.sysv_name(field);
            out.push(Instruction::Directive(Directive::Globl(c_name.clone())));
            out.push(Instruction::Label(c_name.clone()));
            declarations.push(HeaderDeclaration::Function {
                result: CType::of_result(stats.result()),
                name: c_name,
                params: stats.params().iter().copied().map(CType::of).collect(),
            });
        }
        compile_adapter(&stats, &internal_label, true, out)?;
    }

    out.push(Instruction::Label(internal_label));
    for &register in &used {
        save_register(register, out);
    }
    grow_stack(stack_locals, out);
    zero_locals(&ctx, &stats, out)?;
    out.extend(body_out);
    out.push(Instruction::Label(return_label));
    shrink_stack(stack_locals, out);
    for &register in used.iter().rev() {
        restore_register(register, out);
    }
    out.push(Instruction::Ret);
    Ok(())
}

/// Zero-initializes the function's declared locals. Spilled locals are
/// cleared in place; float registers stage through rax since an immediate
/// cannot move into an SSE register.
fn zero_locals(
    ctx: &CompilationContext,
    stats: &FunctionStats,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let first_local = stats.params().len() as u32;
    for local in 0..stats.locals().len() as u32 {
        let (_, home) = ctx.resolve_local(first_local + local)?;
        match home {
            LocalValue::Register(Reg::Int(gpr)) => out.push(Instruction::Mov {
                src: Datum::imm(0),
                dest: Datum::reg(gpr),
                width: Width::Q,
            }),
            LocalValue::Register(Reg::Float(xmm)) => {
                out.push(Instruction::Mov {
                    src: Datum::imm(0),
                    dest: Datum::reg(Gpr::Rax),
                    width: Width::Q,
                });
                out.push(Instruction::Mov {
                    src: Datum::reg(Gpr::Rax),
                    dest: Datum::reg(xmm),
                    width: Width::Q,
                });
            }
            LocalValue::Stack(slot) => out.push(Instruction::Mov {
                src: Datum::imm(0),
                dest: Datum::mem(Gpr::Rsp, 8 * slot as i32),
                width: Width::Q,
            }),
        }
    }
    Ok(())
}

/// Emits the System V adapter for an exported function: move the incoming
/// SysV arguments into the internal parameter registers, preserving any
/// SysV callee-save register the internal function treats as a parameter.
/// With nothing to preserve the adapter ends in tail position: it falls
/// through when the internal label is emitted right after it
/// (`fall_through`), and tail-jumps otherwise.
fn compile_adapter(
    stats: &FunctionStats,
    internal_label: &str,
    fall_through: bool,
    out: &mut Vec<Instruction>,
) -> Result<(), Error> {
    let callee = CompilationContext::new(stats, String::new(), String::new())?;
    let mut moves = Vec::new();
    let mut stack_params = Vec::new();
    let mut int_seen = 0usize;
    let mut float_seen = 0usize;
    let mut stack_seen = 0i32;
    for (param_index, &param) in stats.params().iter().enumerate() {
        let dest = callee.resolve_param(param_index as u32)?;
        if is_float(param) {
            if float_seen < regs::SYSV_FLOAT_PARAMS.len() {
                moves.push((Reg::Float(regs::SYSV_FLOAT_PARAMS[float_seen]), dest));
                float_seen += 1;
                continue;
            }
        } else if int_seen < regs::SYSV_INT_PARAMS.len() {
            moves.push((Reg::Int(regs::SYSV_INT_PARAMS[int_seen]), dest));
            int_seen += 1;
            continue;
        }
        // Past the register file the SysV caller passed the argument on
        // its stack, just above the return address.
        stack_params.push((
            Datum::mem(Gpr::Rsp, 8 + 8 * stack_seen),
            Datum::Register(dest, None),
        ));
        stack_seen += 1;
    }

    let save_set: Vec<Reg> = regs::SYSV_CALLEE_SAVE.iter().copied().map(Reg::Int).collect();
    let relocated = relocate_arguments(moves, stack_params, &save_set);
    if relocated.to_restore.is_empty() {
        out.extend(relocated.instructions);
        if !fall_through {
            out.push(Instruction::Jmp {
                cond: None,
                target: Datum::label(internal_label),
            });
        }
        return Ok(());
    }
    for &register in &relocated.to_restore {
        save_register(register, out);
    }
    out.extend(relocated.instructions);
    out.push(Instruction::Call(Datum::label(internal_label)));
    for &register in relocated.to_restore.iter().rev() {
        restore_register(register, out);
    }
    out.push(Instruction::Ret);
    Ok(())
}
