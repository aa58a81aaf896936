use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use assert_matches::assert_matches;
use parity_wasm::{deserialize_buffer, elements::Module};

use super::compile_module;
use crate::asm::{render, Instruction};
use crate::header::HeaderDeclaration;
use crate::linker::link;
use crate::Error;

fn parse(wat: &str) -> Module {
    let wasm = wat::parse_str(wat).unwrap();
    deserialize_buffer::<Module>(&wasm).unwrap()
}

fn compile(wat: &str) -> (Vec<Instruction>, Vec<HeaderDeclaration>) {
    let module = parse(wat);
    let mut indices = BTreeMap::new();
    indices.insert("m".to_string(), 0);
    compile_module(0, "m", &module, &indices).unwrap()
}

fn compile_text(wat: &str) -> String {
    render(&compile(wat).0)
}

fn declaration_text(wat: &str) -> Vec<String> {
    compile(wat)
        .1
        .iter()
        .map(|declaration| declaration.to_string())
        .collect()
}

#[test]
fn empty_function_is_a_bare_ret() {
    let text = compile_text(
        r#"
        (module
            (func)
        )
    "#,
    );
    assert_eq!(
        text,
        "\t.data\n\t.text\nMODULE0_FUNC0:\nMODULE0_RETURN0:\n\tret\n"
    );
}

#[test]
fn parameters_flow_through_the_general_pool() {
    let text = compile_text(
        r#"
        (module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add
            )
        )
    "#,
    );
    assert!(text.contains(
        "MODULE0_FUNC0:\n\
         \tpushq %r8\n\
         \tpushq %r9\n\
         \tmovq %rdi, %r8\n\
         \tmovq %rsi, %r9\n\
         \taddl %r9d, %r8d\n\
         \tmovq %r8, %rax\n\
         MODULE0_RETURN0:\n\
         \tpopq %r9\n\
         \tpopq %r8\n\
         \tret\n"
    ));
    // The System V adapter needs no moves for two int parameters and falls
    // through to the internal label.
    assert!(text.contains(
        "\t.globl MODULE0_EXPORT_FUNC_add\n\
         MODULE0_EXPORT_FUNC_add:\n\
         \t.globl wasm_m_add\n\
         wasm_m_add:\n\
         MODULE0_FUNC0:\n"
    ));
}

#[test]
fn exported_function_declares_its_c_signature() {
    let declarations = declaration_text(
        r#"
        (module
            (func (export "fib") (param i32) (result i64)
                local.get 0
                i64.extend_i32_u
            )
        )
    "#,
    );
    assert_eq!(declarations, vec!["long wasm_m_fib(int);".to_string()]);
}

#[test]
fn extend_unsigned_is_a_no_op() {
    let text = compile_text(
        r#"
        (module
            (func (param i32) (result i64)
                local.get 0
                i64.extend_i32_u
            )
        )
    "#,
    );
    assert!(text.contains(
        "MODULE0_FUNC0:\n\
         \tpushq %rsi\n\
         \tmovq %rdi, %rsi\n\
         \tmovq %rsi, %rax\n\
         MODULE0_RETURN0:\n\
         \tpopq %rsi\n\
         \tret\n"
    ));
}

#[test]
fn unreachable_exits_the_process() {
    let text = compile_text(
        r#"
        (module
            (func (export "trap")
                unreachable
            )
        )
    "#,
    );
    assert!(text.contains(
        "MODULE0_FUNC0:\n\
         \tmovl $60, %eax\n\
         \tmovl $255, %edi\n\
         \tsyscall\n\
         MODULE0_RETURN0:\n\
         \tret\n"
    ));
}

#[test]
fn shifts_route_the_count_through_cl() {
    let text = compile_text(
        r#"
        (module
            (func (export "shl_sum") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.const 31
                i32.and
                i32.shl
                local.get 0
                i32.add
            )
        )
    "#,
    );
    assert!(text.contains("\tandl %r10d, %r9d"));
    assert!(text.contains("\tmovl %r9d, %ecx\n\tshll %cl, %r8d"));
}

#[test]
fn division_sets_up_the_rdx_rax_pair() {
    let text = compile_text(
        r#"
        (module
            (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.div_s
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl %r8d, %eax\n\tcdq\n\tidivl %r9d"));

    let text = compile_text(
        r#"
        (module
            (func (param i64 i64) (result i64)
                local.get 0
                local.get 1
                i64.rem_u
            )
        )
    "#,
    );
    assert!(text.contains("\txorl %edx, %edx\n\tdivq %r9\n\tmovq %rdx, %r8"));
}

#[test]
fn signed_remainder_coerces_a_minus_one_divisor() {
    let text = compile_text(
        r#"
        (module
            (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.rem_s
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl $1, %edx\n\tcmpl $-1, %r9d\n\tcmove %edx, %r9d"));
}

#[test]
fn select_stages_through_cmov() {
    let text = compile_text(
        r#"
        (module
            (func (param i32 i32 i32) (result i32)
                local.get 0
                local.get 1
                local.get 2
                select
            )
        )
    "#,
    );
    assert!(text.contains("\ttestl %r11d, %r11d\n\tcmove %r10, %r9"));
}

#[test]
fn float_constants_keep_their_bits() {
    let text = compile_text(
        r#"
        (module
            (func (result f32)
                f32.const 1.5
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl $1069547520, %eax\n\tmovd %eax, %xmm2"));
    assert!(text.contains("\tmovq %xmm2, %xmm0"));
}

#[test]
fn float_compares_merge_the_parity_flag() {
    let text = compile_text(
        r#"
        (module
            (func (param f64 f64) (result i32)
                local.get 0
                local.get 1
                f64.eq
            )
        )
    "#,
    );
    assert!(text.contains(
        "\tucomisd %xmm5, %xmm4\n\
         \tsete %al\n\
         \tsetnp %cl\n\
         \tandb %cl, %al\n\
         \tmovzbl %al, %eax"
    ));

    let text = compile_text(
        r#"
        (module
            (func (param f32 f32) (result i32)
                local.get 0
                local.get 1
                f32.ne
            )
        )
    "#,
    );
    assert!(text.contains("\tsetne %al\n\tsetp %cl\n\torb %cl, %al"));
}

#[test]
fn float_negation_flips_the_sign_bit() {
    let text = compile_text(
        r#"
        (module
            (func (param f64) (result f64)
                local.get 0
                f64.neg
            )
        )
    "#,
    );
    assert!(text.contains("\tmovabsq $-9223372036854775808, %rax"));
    assert!(text.contains("\tmovq %rax, %xmm15\n\txorpd %xmm15, %xmm3"));
}

#[test]
fn if_else_joins_at_the_end_label() {
    let text = compile_text(
        r#"
        (module
            (func (param i32) (result i32)
                local.get 0
                (if (result i32)
                    (then (i32.const 1))
                    (else (i32.const 2))
                )
            )
        )
    "#,
    );
    assert!(text.contains(
        "\tmovq %rdi, %rsi\n\
         \ttestl %esi, %esi\n\
         \tje MODULE0_FUNC0_L0\n\
         \tmovl $1, %esi\n\
         \tjmp MODULE0_FUNC0_L1\n\
         MODULE0_FUNC0_L0:\n\
         \tmovl $2, %esi\n\
         MODULE0_FUNC0_L1:\n\
         \tmovq %rsi, %rax\n"
    ));
}

#[test]
fn iterative_fib_compiles_to_a_loop() {
    let (instructions, declarations) = compile(
        r#"
        (module
            (func (export "fib") (param i32) (result i64)
                (local i64 i64)
                i64.const 1
                local.set 1
                i64.const 1
                local.set 2
                block
                    loop
                        local.get 0
                        i32.eqz
                        br_if 1
                        local.get 1
                        local.get 2
                        i64.add
                        local.get 2
                        local.set 1
                        local.set 2
                        local.get 0
                        i32.const 1
                        i32.sub
                        local.set 0
                        br 0
                    end
                end
                local.get 1
            )
        )
    "#,
    );
    let text = render(&instructions);
    // The loop header is emitted before its body and the back edge jumps
    // to it.
    let header = text.find("MODULE0_FUNC0_L1:").unwrap();
    let back_edge = text.find("\tjmp MODULE0_FUNC0_L1").unwrap();
    assert!(header < back_edge);
    assert!(text.contains("\tjmp MODULE0_FUNC0_L0"));
    assert_eq!(
        declarations
            .iter()
            .map(|declaration| declaration.to_string())
            .collect::<Vec<_>>(),
        vec!["long wasm_m_fib(int);".to_string()]
    );
}

#[test]
fn br_table_builds_a_relative_jump_table() {
    let text = compile_text(
        r#"
        (module
            (func (export "classify") (param i32) (result i32)
                (block
                    (block
                        local.get 0
                        br_table 1 0
                    )
                    i32.const 20
                    return
                )
                i32.const 10
            )
        )
    "#,
    );
    assert!(text.contains("\tcmpl $1, %esi"));
    assert!(text.contains("\tjae MODULE0_FUNC0_L4"));
    assert!(text.contains("\tleaq MODULE0_FUNC0_L2(%rip), %rax"));
    assert!(text.contains("\tmovq (%rax,%rsi,8), %rdx\n\taddq %rax, %rdx\n\tjmp *%rdx"));
    assert!(text.contains(
        "\t.section .rodata\n\
         \t.balign 8\n\
         MODULE0_FUNC0_L2:\n\
         \t.quad MODULE0_FUNC0_L3-MODULE0_FUNC0_L2\n\
         \t.text\n"
    ));
}

#[test]
fn memory_loads_and_stores_use_the_region_base() {
    let text = compile_text(
        r#"
        (module
            (memory 1)
            (func (export "roundtrip_at") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.store
                local.get 0
                i32.load
            )
        )
    "#,
    );
    // Stores pop the value then the index; the 4 GiB region base is
    // materialized as a 64-bit immediate.
    assert!(text.contains("\tmovabsq $4294967296, %rdx\n\tmovl %r9d, (%rdx,%r8,1)"));
    assert!(text.contains("\tmovabsq $4294967296, %rax\n\tmovl (%rax,%r8,1), %r8d"));
}

#[test]
fn widening_loads_extend_in_registers() {
    let text = compile_text(
        r#"
        (module
            (memory 1)
            (func (param i32) (result i64)
                local.get 0
                i64.load8_s
            )
        )
    "#,
    );
    assert!(text.contains("\tmovsbq (%rax,%rsi,1), %rsi"));
}

#[test]
fn memory_grow_guards_and_calls_mmap() {
    let text = compile_text(
        r#"
        (module
            (memory 1)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow
            )
        )
    "#,
    );
    // Zero delta takes the fast path; overflow of the default maximum
    // fails before the syscall.
    assert!(text.contains("\ttestl %esi, %esi\n\tje MODULE0_FUNC0_L0"));
    assert!(text.contains("\tcmpl $65536, %eax\n\tja MODULE0_FUNC0_L2"));
    // The live parameter register rdi is an mmap argument and gets spilled
    // across the syscall.
    assert!(text.contains("\tpushq %rdi"));
    assert!(text.contains("\tmovl $9, %eax\n\tsyscall"));
    assert!(text.contains("\tmovl $-1, %eax"));
    // MEMSIZE holds the page count and the result is the pre-grow size.
    assert!(text.contains("MODULE0_MEMSIZE(%rip)"));
}

#[test]
fn memory_size_reads_the_memsize_cell() {
    let text = compile_text(
        r#"
        (module
            (memory 3)
            (func (result i32)
                memory.size
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl MODULE0_MEMSIZE(%rip), %edi"));
}

#[test]
fn exported_memory_emits_pointer_and_size_cells() {
    let (instructions, declarations) = compile(
        r#"
        (module
            (memory (export "mem") 1)
        )
    "#,
    );
    let text = render(&instructions);
    assert!(text.contains(
        "\t.balign 8\n\
         \t.globl MODULE0_EXPORT_MEMORY_mem\n\
         MODULE0_EXPORT_MEMORY_mem:\n\
         \t.globl wasm_m_mem_memory\n\
         wasm_m_mem_memory:\n\
         \t.quad 4294967296\n"
    ));
    assert!(text.contains(
        "\t.globl wasm_m_mem_size\n\
         wasm_m_mem_size:\n\
         MODULE0_MEMSIZE:\n\
         \t.long 0\n"
    ));
    let declarations: Vec<String> = declarations
        .iter()
        .map(|declaration| declaration.to_string())
        .collect();
    assert_eq!(
        declarations,
        vec![
            "const void *wasm_m_mem_memory;".to_string(),
            "const int wasm_m_mem_size;".to_string(),
            "void wasm_m_init_module(void);".to_string(),
        ]
    );
}

#[test]
fn exported_mutable_global_is_writable_from_c() {
    let (instructions, declarations) = compile(
        r#"
        (module
            (global (export "counter") (mut i32) (i32.const 7))
        )
    "#,
    );
    let text = render(&instructions);
    assert!(text.contains(
        "\t.balign 4\n\
         \t.globl MODULE0_EXPORT_GLOBAL_counter\n\
         MODULE0_EXPORT_GLOBAL_counter:\n\
         \t.globl wasm_m_counter\n\
         wasm_m_counter:\n\
         MODULE0_GLOBAL0:\n\
         \t.long 0\n"
    ));
    // The init function stores the initializer value.
    assert!(text.contains("\tmovl $7, %edi\n\tmovl %edi, MODULE0_GLOBAL0(%rip)"));
    let declarations: Vec<String> = declarations
        .iter()
        .map(|declaration| declaration.to_string())
        .collect();
    assert_eq!(
        declarations,
        vec![
            "int wasm_m_counter;".to_string(),
            "void wasm_m_init_module(void);".to_string(),
        ]
    );
}

#[test]
fn immutable_global_declares_const() {
    let declarations = declaration_text(
        r#"
        (module
            (global (export "limit") i64 (i64.const 9))
        )
    "#,
    );
    assert_eq!(declarations[0], "const long wasm_m_limit;");
}

#[test]
fn calls_relocate_arguments_and_spill_live_parameters() {
    let text = compile_text(
        r#"
        (module
            (func $callee (param i32 i32) (result i32)
                local.get 0
            )
            (func (export "caller") (param i32 i32) (result i32)
                local.get 1
                local.get 0
                call $callee
            )
        )
    "#,
    );
    assert!(text.contains(
        "\tpushq %rdi\n\
         \tpushq %rsi\n\
         \tmovq %r9, %rsi\n\
         \tmovq %r8, %rdi\n\
         \tcall MODULE0_FUNC0\n\
         \tpopq %rsi\n\
         \tpopq %rdi\n\
         \tmovq %rax, %r8\n"
    ));
}

#[test]
fn call_indirect_jumps_through_the_table() {
    let text = compile_text(
        r#"
        (module
            (type $t (func (result i32)))
            (table 1 funcref)
            (func $f (result i32)
                i32.const 5
            )
            (elem (i32.const 0) $f)
            (func (export "dispatch") (param i32) (result i32)
                local.get 0
                call_indirect (type $t)
            )
        )
    "#,
    );
    assert!(text.contains("\tleaq MODULE0_TABLE0(%rip), %rax\n\tcall *(%rax,%rsi,8)"));
    // The table itself is one zeroed slot filled by the init function.
    assert!(text.contains("MODULE0_TABLE0:\n\t.quad 0\n"));
    assert!(text.contains("\tleaq MODULE0_FUNC0(%rip), %rdx\n\tmovq %rdx, (%rax,%rdi,8)"));
}

#[test]
fn data_segments_store_through_the_init_function() {
    let text = compile_text(
        r#"
        (module
            (memory 1)
            (data (i32.const 16) "hello wasm!")
        )
    "#,
    );
    // 8-byte chunk of "hello wa" followed by byte stores for "sm!".
    assert!(text.contains("\tmovabsq $7023117806840079720, %rax"));
    assert!(text.contains("\tmovb $115, 8(%rdi)"));
    assert!(text.contains("\tmovb $109, 9(%rdi)"));
    assert!(text.contains("\tmovb $33, 10(%rdi)"));
}

#[test]
fn start_function_runs_last_in_init() {
    let text = compile_text(
        r#"
        (module
            (global $g (mut i32) (i32.const 1))
            (func $main
                i32.const 2
                global.set $g
            )
            (start $main)
        )
    "#,
    );
    let store = text.find("movl %edi, MODULE0_GLOBAL0(%rip)").unwrap();
    let start_call = text.find("\tcall MODULE0_FUNC0").unwrap();
    assert!(store < start_call);
}

#[test]
fn locals_past_the_pool_live_in_the_frame() {
    let text = compile_text(
        r#"
        (module
            (func
                (local i64 i64 i64 i64 i64 i64 i64 i64 i64 i64 i64 i64 i64 i64 i64)
            )
        )
    "#,
    );
    assert!(text.contains("\tsubq $24, %rsp"));
    assert!(text.contains("\tmovq $0, (%rsp)"));
    assert!(text.contains("\tmovq $0, 8(%rsp)"));
    assert!(text.contains("\tmovq $0, 16(%rsp)"));
    assert!(text.contains("\taddq $24, %rsp"));
    // Register locals are cleared too.
    assert!(text.contains("\tmovq $0, %rdi"));
    assert!(text.contains("\tmovq $0, %rbp"));
}

#[test]
fn deep_stacks_spill_to_the_machine_stack() {
    let text = compile_text(
        r#"
        (module
            (func (result i32)
                i32.const 0
                i32.const 1
                i32.const 2
                i32.const 3
                i32.const 4
                i32.const 5
                i32.const 6
                i32.const 7
                i32.const 8
                i32.const 9
                i32.const 10
                i32.const 11
                i32.const 12
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
                i32.add
            )
        )
    "#,
    );
    // The thirteenth value overflows the twelve int generals.
    assert!(text.contains("\tmovl $12, %eax\n\tpushq %rax"));
    // The first add reloads it from the machine stack.
    assert!(text.contains("\tpopq %rcx\n\taddl %ecx, %ebp"));
}

#[test]
fn imports_resolve_to_the_exporting_module() {
    let first = parse(
        r#"
        (module
            (func (export "f") (result i32)
                i32.const 3
            )
        )
    "#,
    );
    let second = parse(
        r#"
        (module
            (import "m0" "f" (func (result i32)))
            (func (export "g") (result i32)
                call 0
            )
        )
    "#,
    );
    let linked = link(&[("m0".to_string(), first), ("m1".to_string(), second)]).unwrap();
    assert_eq!(linked.len(), 2);
    let first_text = render(&linked[0].assembly);
    let second_text = render(&linked[1].assembly);
    assert!(first_text.contains("MODULE0_EXPORT_FUNC_f:"));
    assert!(second_text.contains("\tcall MODULE0_EXPORT_FUNC_f"));
    // The importing module's own function sits after the import in the
    // index space.
    assert!(second_text.contains("MODULE1_FUNC1:"));
}

#[test]
fn tee_keeps_the_value_on_the_stack() {
    let text = compile_text(
        r#"
        (module
            (func (param i32) (result i32)
                (local i32)
                local.get 0
                local.tee 1
            )
        )
    "#,
    );
    assert!(text.contains("\tmovq %rdi, %r8\n\tmovq %r8, %rsi\n\tmovq %r8, %rax"));
}

#[test]
fn bit_counts_use_the_dedicated_instructions() {
    let text = compile_text(
        r#"
        (module
            (func (param i32) (result i32)
                local.get 0
                i32.popcnt
            )
        )
    "#,
    );
    assert!(text.contains("\tpopcntl %esi, %esi"));

    let text = compile_text(
        r#"
        (module
            (func (param i64) (result i64)
                local.get 0
                i64.clz
            )
        )
    "#,
    );
    assert!(text.contains("\tlzcntq %rsi, %rsi"));
}

#[test]
fn rotates_go_through_cl() {
    let text = compile_text(
        r#"
        (module
            (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.rotl
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl %r9d, %ecx\n\troll %cl, %r8d"));
}

#[test]
fn eqz_compares_against_zero() {
    let text = compile_text(
        r#"
        (module
            (func (param i64) (result i32)
                local.get 0
                i64.eqz
            )
        )
    "#,
    );
    assert!(text.contains("\tcmpq $0, %rsi\n\tsete %al\n\tmovzbl %al, %eax"));
}

#[test]
fn unsigned_truncation_splits_on_the_sign_threshold() {
    let text = compile_text(
        r#"
        (module
            (func (param f64) (result i64)
                local.get 0
                i64.trunc_f64_u
            )
        )
    "#,
    );
    // 2^63 as an f64 bit pattern.
    assert!(text.contains("\tmovabsq $4890909195324358656, %rax"));
    assert!(text.contains("\tucomisd %xmm15, %xmm3"));
    assert!(text.contains("\tsubsd %xmm15, %xmm3"));
    assert!(text.contains("\tcvttsd2si %xmm3, %rax"));
    assert!(text.contains("\tmovabsq $-9223372036854775808, %rcx\n\taddq %rcx, %rax"));
}

#[test]
fn unsigned_conversion_halves_and_doubles() {
    let text = compile_text(
        r#"
        (module
            (func (param i64) (result f64)
                local.get 0
                f64.convert_i64_u
            )
        )
    "#,
    );
    assert!(text.contains("\tshrq $1, %rcx"));
    assert!(text.contains("\tcvtsi2sdq %rcx, %xmm0\n\taddsd %xmm0, %xmm0"));
}

#[test]
fn promote_and_demote_are_scalar_conversions() {
    let text = compile_text(
        r#"
        (module
            (func (param f32) (result f64)
                local.get 0
                f64.promote_f32
            )
        )
    "#,
    );
    assert!(text.contains("\tcvtss2sd %xmm3, %xmm3"));

    let text = compile_text(
        r#"
        (module
            (func (param f64) (result f32)
                local.get 0
                f32.demote_f64
            )
        )
    "#,
    );
    assert!(text.contains("\tcvtsd2ss %xmm3, %xmm3"));
}

#[test]
fn reinterpret_moves_across_register_files() {
    let text = compile_text(
        r#"
        (module
            (func (param f64) (result i64)
                local.get 0
                i64.reinterpret_f64
            )
        )
    "#,
    );
    assert!(text.contains("\tmovq %xmm3, %rdi"));
}

#[test]
fn float_unaries_round_and_take_roots() {
    let text = compile_text(
        r#"
        (module
            (func (param f64) (result f64)
                local.get 0
                f64.sqrt
            )
        )
    "#,
    );
    assert!(text.contains("\tsqrtsd %xmm3, %xmm3"));

    let text = compile_text(
        r#"
        (module
            (func (param f32) (result f32)
                local.get 0
                f32.ceil
            )
        )
    "#,
    );
    assert!(text.contains("\troundss $2, %xmm3, %xmm3"));
}

#[test]
fn copysign_splices_the_sign_bit() {
    let text = compile_text(
        r#"
        (module
            (func (param f64 f64) (result f64)
                local.get 0
                local.get 1
                f64.copysign
            )
        )
    "#,
    );
    assert!(text.contains(
        "\txorpd %xmm4, %xmm5\n\
         \tandpd %xmm15, %xmm5\n\
         \txorpd %xmm5, %xmm4"
    ));
}

#[test]
fn abs_clears_the_sign_bit() {
    let text = compile_text(
        r#"
        (module
            (func (param f32) (result f32)
                local.get 0
                f32.abs
            )
        )
    "#,
    );
    assert!(text.contains("\tmovl $2147483647, %eax"));
    assert!(text.contains("\tandps %xmm15, %xmm3"));
}

#[test]
fn reexported_imports_tail_jump() {
    let first = parse(
        r#"
        (module
            (func (export "f") (param i32) (result i32)
                local.get 0
            )
        )
    "#,
    );
    let second = parse(
        r#"
        (module
            (import "m0" "f" (func $f (param i32) (result i32)))
            (export "f2" (func $f))
        )
    "#,
    );
    let linked = link(&[("m0".to_string(), first), ("m1".to_string(), second)]).unwrap();
    let text = render(&linked[1].assembly);
    assert!(text.contains(
        "\t.globl wasm_m1_f2\n\
         wasm_m1_f2:\n\
         \tjmp MODULE0_EXPORT_FUNC_f\n"
    ));
    assert_eq!(
        linked[1].declarations[0].to_string(),
        "int wasm_m1_f2(int);"
    );
}

#[test]
fn unknown_import_module_is_rejected() {
    let module = parse(
        r#"
        (module
            (import "nowhere" "f" (func))
        )
    "#,
    );
    assert_matches!(
        link(&[("m".to_string(), module)]),
        Err(Error::Module(_))
    );
}

#[test]
fn too_many_parameters_are_unsupported() {
    let module = parse(
        r#"
        (module
            (func (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32 i32 i32 i32))
        )
    "#,
    );
    let mut indices = BTreeMap::new();
    indices.insert("m".to_string(), 0);
    assert_matches!(
        compile_module(0, "m", &module, &indices),
        Err(Error::Unsupported(_))
    );
}

#[test]
fn duplicate_module_names_are_rejected() {
    let module = parse("(module)");
    let other = parse("(module)");
    assert_matches!(
        link(&[("m".to_string(), module), ("m".to_string(), other)]),
        Err(Error::Module(_))
    );
}
