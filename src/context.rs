//! Per-module and per-function compilation state.
//!
//! [`ModuleContext`] is built once per source module by walking its sections:
//! it owns the index spaces (types, functions, globals, tables, memory,
//! exports) and manufactures every label the emitted assembly uses.
//!
//! [`CompilationContext`] is the virtual-stack allocator. It models the wasm
//! operand stack at compile time: each value is either parked in a general
//! register or spilled to the machine stack, decided purely by its position.
//! Parameters and locals of a kind occupy the general pool of that kind from
//! index 0 and the evaluation stack continues after them, so resolving any
//! value is a bounds check against the pool. Spilled values are pushed and
//! popped in LIFO order, which keeps the top spilled value at `[rsp]` at
//! every point.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use memory_units::Pages;
use parity_wasm::elements::{External, Internal, Module, Type, ValueType};

use crate::regs::{self, Reg};
use crate::Error;

/// Number of pages a memory without a declared maximum may grow to.
pub const DEFAULT_MAX_PAGES: Pages = Pages(65536);

/// Returns whether values of this type live in the float register file.
pub fn is_float(value_type: ValueType) -> bool {
    matches!(value_type, ValueType::F32 | ValueType::F64)
}

/// Maps an export or module name into the label character set: anything
/// outside `[A-Za-z0-9_]` becomes `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Parameter, local and result types of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStats {
    params: Vec<ValueType>,
    locals: Vec<ValueType>,
    result: Option<ValueType>,
}

impl FunctionStats {
    /// Creates stats from explicit parts.
    pub fn new(params: Vec<ValueType>, locals: Vec<ValueType>, result: Option<ValueType>) -> Self {
        FunctionStats {
            params,
            locals,
            result,
        }
    }

    /// Parameter types, in declaration order.
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Declared local types, expanded from their run-length encoding.
    pub fn locals(&self) -> &[ValueType] {
        &self.locals
    }

    /// The result type, if the function returns a value.
    pub fn result(&self) -> Option<ValueType> {
        self.result
    }
}

/// Where one parameter or local lives: its kind and its index among values
/// of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLocation {
    /// Whether the value is in the float domain.
    pub float: bool,
    /// Index among params-then-locals of the same kind.
    pub index: u32,
}

/// The resolved physical home of a parameter or local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalValue {
    /// Lives in this register for the whole function.
    Register(Reg),
    /// Lives in the given slot of the reserved stack-locals area.
    Stack(u32),
}

/// Everything the compiler knows about one module's memory.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Index of the module whose address region backs this memory (the
    /// module itself, or the exporter for an imported memory).
    pub module_index: usize,
    /// Whether the memory is imported.
    pub imported: bool,
    /// Declared initial size.
    pub initial: Pages,
    /// Declared maximum size, if any.
    pub maximum: Option<Pages>,
}

/// What an export entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// An exported function.
    Function(u32),
    /// An exported table.
    Table(u32),
    /// An exported memory.
    Memory(u32),
    /// An exported global.
    Global(u32),
}

/// One export entry.
#[derive(Debug, Clone)]
pub struct Export {
    /// The export's field name as written in the module.
    pub field: String,
    /// The exported item.
    pub kind: ExportKind,
}

#[derive(Debug, Clone)]
struct GlobalInfo {
    value_type: ValueType,
    mutable: bool,
    /// Label of the backing cell; imported globals point into the exporting
    /// module.
    label: String,
}

#[derive(Debug, Clone)]
struct TableInfo {
    label: String,
    min: u32,
    imported: bool,
}

/// Index spaces and the label plan of one module.
#[derive(Debug)]
pub struct ModuleContext {
    index: usize,
    name: String,
    types: Vec<FunctionStats>,
    /// Labels of imported functions, in import order.
    imported_functions: Vec<String>,
    /// Stats for the whole function index space, imports first.
    function_stats: Vec<FunctionStats>,
    imported_global_count: usize,
    globals: Vec<GlobalInfo>,
    tables: Vec<TableInfo>,
    memory: Option<MemoryInfo>,
    exports: Vec<Export>,
    start: Option<u32>,
}

impl ModuleContext {
    /// Walks the module's sections and builds its context.
    ///
    /// `module_indices` maps linked module names to their assigned indices
    /// and resolves the labels of imported items.
    pub fn new(
        index: usize,
        name: &str,
        module: &Module,
        module_indices: &BTreeMap<String, usize>,
    ) -> Result<ModuleContext, Error> {
        let mut context = ModuleContext {
            index,
            name: sanitize(name),
            types: Vec::new(),
            imported_functions: Vec::new(),
            function_stats: Vec::new(),
            imported_global_count: 0,
            globals: Vec::new(),
            tables: Vec::new(),
            memory: None,
            exports: Vec::new(),
            start: module.start_section(),
        };

        for &Type::Function(ref func_type) in
            module.type_section().map(|ts| ts.types()).unwrap_or(&[])
        {
            context.types.push(FunctionStats::new(
                func_type.params().to_vec(),
                Vec::new(),
                func_type.results().first().copied(),
            ));
        }

        for import in module.import_section().map(|is| is.entries()).unwrap_or(&[]) {
            let exporter = *module_indices.get(import.module()).ok_or_else(|| {
                Error::Module(format!(
                    "import of {}.{} references unknown module {}",
                    import.module(),
                    import.field(),
                    import.module()
                ))
            })?;
            let field = sanitize(import.field());
            match import.external() {
                External::Function(type_index) => {
                    let stats = context.type_stats(*type_index)?.clone();
                    context
                        .imported_functions
                        .push(format!("MODULE{}_EXPORT_FUNC_{}", exporter, field));
                    context.function_stats.push(stats);
                }
                External::Global(global_type) => {
                    context.globals.push(GlobalInfo {
                        value_type: global_type.content_type(),
                        mutable: global_type.is_mutable(),
                        label: format!("MODULE{}_EXPORT_GLOBAL_{}", exporter, field),
                    });
                    context.imported_global_count += 1;
                }
                External::Memory(memory_type) => {
                    if context.memory.is_some() {
                        return Err(Error::Module(
                            "at most one memory may be declared or imported".into(),
                        ));
                    }
                    context.memory = Some(MemoryInfo {
                        module_index: exporter,
                        imported: true,
                        initial: Pages(memory_type.limits().initial() as usize),
                        maximum: memory_type.limits().maximum().map(|m| Pages(m as usize)),
                    });
                }
                External::Table(table_type) => {
                    context.tables.push(TableInfo {
                        label: format!("MODULE{}_EXPORT_TABLE_{}", exporter, field),
                        min: table_type.limits().initial(),
                        imported: true,
                    });
                }
            }
        }

        let functions = module
            .function_section()
            .map(|fs| fs.entries())
            .unwrap_or(&[]);
        let bodies = module.code_section().map(|cs| cs.bodies()).unwrap_or(&[]);
        if functions.len() != bodies.len() {
            return Err(Error::Module(format!(
                "function section declares {} functions but the code section has {} bodies",
                functions.len(),
                bodies.len()
            )));
        }
        for (func, body) in functions.iter().zip(bodies.iter()) {
            let signature = context.type_stats(func.type_ref())?.clone();
            let mut locals = Vec::new();
            for local in body.locals() {
                for _ in 0..local.count() {
                    locals.push(local.value_type());
                }
            }
            context.function_stats.push(FunctionStats::new(
                signature.params().to_vec(),
                locals,
                signature.result(),
            ));
        }

        for table_type in module.table_section().map(|ts| ts.entries()).unwrap_or(&[]) {
            let table_index = context.tables.len();
            context.tables.push(TableInfo {
                label: format!("MODULE{}_TABLE{}", index, table_index),
                min: table_type.limits().initial(),
                imported: false,
            });
        }

        for memory_type in module
            .memory_section()
            .map(|ms| ms.entries())
            .unwrap_or(&[])
        {
            if context.memory.is_some() {
                return Err(Error::Module(
                    "at most one memory may be declared or imported".into(),
                ));
            }
            context.memory = Some(MemoryInfo {
                module_index: index,
                imported: false,
                initial: Pages(memory_type.limits().initial() as usize),
                maximum: memory_type.limits().maximum().map(|m| Pages(m as usize)),
            });
        }

        for entry in module
            .global_section()
            .map(|gs| gs.entries())
            .unwrap_or(&[])
        {
            let global_index = context.globals.len();
            context.globals.push(GlobalInfo {
                value_type: entry.global_type().content_type(),
                mutable: entry.global_type().is_mutable(),
                label: format!("MODULE{}_GLOBAL{}", index, global_index),
            });
        }

        for export in module
            .export_section()
            .map(|es| es.entries())
            .unwrap_or(&[])
        {
            let kind = match *export.internal() {
                Internal::Function(idx) => ExportKind::Function(idx),
                Internal::Table(idx) => ExportKind::Table(idx),
                Internal::Memory(idx) => {
                    if idx != 0 {
                        return Err(Error::Module(format!(
                            "export {} references memory {}, only memory 0 exists",
                            export.field(),
                            idx
                        )));
                    }
                    ExportKind::Memory(idx)
                }
                Internal::Global(idx) => ExportKind::Global(idx),
            };
            context.exports.push(Export {
                field: export.field().into(),
                kind,
            });
        }

        for segment in module.data_section().map(|ds| ds.entries()).unwrap_or(&[]) {
            if segment.index() != 0 {
                return Err(Error::Module(format!(
                    "data segment references memory {}, only memory 0 exists",
                    segment.index()
                )));
            }
        }

        Ok(context)
    }

    /// The module's index in the link order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The module's sanitized name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stats for the function type at the given type index.
    pub fn type_stats(&self, type_index: u32) -> Result<&FunctionStats, Error> {
        self.types.get(type_index as usize).ok_or_else(|| {
            Error::Module(format!("reference to unknown type index {}", type_index))
        })
    }

    /// Number of imported functions; the first own function has this index.
    pub fn imported_function_count(&self) -> usize {
        self.imported_functions.len()
    }

    /// Number of functions in the full index space.
    pub fn function_count(&self) -> usize {
        self.function_stats.len()
    }

    /// Stats of the function at the given index in the full index space.
    pub fn function_stats(&self, index: u32) -> Result<&FunctionStats, Error> {
        self.function_stats
            .get(index as usize)
            .ok_or_else(|| Error::Module(format!("reference to unknown function {}", index)))
    }

    /// The label a `call` of the given function index targets.
    pub fn function_label(&self, index: u32) -> Result<String, Error> {
        if let Some(label) = self.imported_functions.get(index as usize) {
            return Ok(label.clone());
        }
        if (index as usize) < self.function_stats.len() {
            Ok(format!("MODULE{}_FUNC{}", self.index, index))
        } else {
            Err(Error::Module(format!(
                "reference to unknown function {}",
                index
            )))
        }
    }

    /// The per-function label its epilogue carries.
    pub fn return_label(&self, index: u32) -> String {
        format!("MODULE{}_RETURN{}", self.index, index)
    }

    /// Type and mutability of the global at the given index.
    pub fn global_info(&self, index: u32) -> Result<(ValueType, bool), Error> {
        self.globals
            .get(index as usize)
            .map(|info| (info.value_type, info.mutable))
            .ok_or_else(|| Error::Module(format!("reference to unknown global {}", index)))
    }

    /// The label of the global's backing cell.
    pub fn global_label(&self, index: u32) -> Result<String, Error> {
        self.globals
            .get(index as usize)
            .map(|info| info.label.clone())
            .ok_or_else(|| Error::Module(format!("reference to unknown global {}", index)))
    }

    /// Number of imported globals; own globals start at this index.
    pub fn imported_global_count(&self) -> usize {
        self.imported_global_count
    }

    /// The label of the given table.
    pub fn table_label(&self, index: u32) -> Result<String, Error> {
        self.tables
            .get(index as usize)
            .map(|table| table.label.clone())
            .ok_or_else(|| Error::Module(format!("reference to unknown table {}", index)))
    }

    /// The module's own tables: index, label and minimum entry count.
    pub fn own_tables(&self) -> impl Iterator<Item = (u32, &str, u32)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, table)| !table.imported)
            .map(|(index, table)| (index as u32, table.label.as_str(), table.min))
    }

    /// The module's memory, if it declares or imports one.
    pub fn memory(&self) -> Option<&MemoryInfo> {
        self.memory.as_ref()
    }

    fn require_memory(&self) -> Result<&MemoryInfo, Error> {
        self.memory
            .as_ref()
            .ok_or_else(|| Error::Module("memory instruction without a memory".into()))
    }

    /// First byte of the 4 GiB region backing this module's memory.
    pub fn memory_start(&self) -> Result<u64, Error> {
        let memory = self.require_memory()?;
        Ok(0x1_0000_0000 * (memory.module_index as u64 + 1))
    }

    /// The label of the cell holding the current page count.
    pub fn memsize_label(&self) -> Result<String, Error> {
        let memory = self.require_memory()?;
        Ok(format!("MODULE{}_MEMSIZE", memory.module_index))
    }

    /// The page count `memory.grow` must never exceed.
    pub fn max_pages(&self) -> Result<Pages, Error> {
        let memory = self.require_memory()?;
        Ok(memory.maximum.unwrap_or(DEFAULT_MAX_PAGES))
    }

    /// All export entries, in section order.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Field names under which the given item is exported.
    pub fn export_fields(&self, kind: ExportKind) -> Vec<&str> {
        self.exports
            .iter()
            .filter(|export| export.kind == kind)
            .map(|export| export.field.as_str())
            .collect()
    }

    /// The module-prefixed, linker-visible label of an export.
    pub fn export_label(&self, kind: &str, field: &str) -> String {
        format!("MODULE{}_EXPORT_{}_{}", self.index, kind, sanitize(field))
    }

    /// The C-visible name of an export.
    pub fn sysv_name(&self, field: &str) -> String {
        format!("wasm_{}_{}", self.name, sanitize(field))
    }

    /// The C-visible name of the init function.
    pub fn init_label(&self) -> String {
        format!("wasm_{}_init_module", self.name)
    }

    /// The start function's index, if declared.
    pub fn start_function(&self) -> Option<u32> {
        self.start
    }
}

/// A snapshot of the virtual stack, used to rewind after lowering one arm of
/// a branch. Restoring is bookkeeping only; no instruction is emitted.
#[derive(Debug, Clone)]
pub struct StackState {
    int_stack_height: u32,
    float_stack_height: u32,
    stack_floats: Vec<bool>,
}

/// The record pushed when entering a block, loop or if; `br` instructions
/// unwind to the heights captured here.
#[derive(Debug, Clone)]
pub struct BlockReference {
    /// Whether branches to this frame jump backwards to a loop header.
    pub is_loop: bool,
    /// The branch target label.
    pub label: String,
    /// Int stack height on entry.
    pub int_height: u32,
    /// Float stack height on entry.
    pub float_height: u32,
    /// The block's declared result type.
    pub result: Option<ValueType>,
}

/// Per-function allocator state.
#[derive(Debug)]
pub struct CompilationContext {
    params: Vec<LocalLocation>,
    locals: Vec<LocalLocation>,
    int_param_count: u32,
    float_param_count: u32,
    int_local_count: u32,
    float_local_count: u32,
    int_stack_height: u32,
    float_stack_height: u32,
    max_int_stack_height: u32,
    max_float_stack_height: u32,
    stack_floats: Vec<bool>,
    containing_labels: Vec<BlockReference>,
    label_count: u32,
    label_base: String,
    return_label: String,
    result: Option<ValueType>,
}

impl CompilationContext {
    /// Assigns parameter and local locations for a function with the given
    /// stats. Fails if the parameters overflow the general pool of their
    /// kind: the internal calling convention passes parameters only in
    /// registers.
    pub fn new(
        stats: &FunctionStats,
        label_base: String,
        return_label: String,
    ) -> Result<CompilationContext, Error> {
        let mut context = CompilationContext {
            params: Vec::with_capacity(stats.params().len()),
            locals: Vec::with_capacity(stats.locals().len()),
            int_param_count: 0,
            float_param_count: 0,
            int_local_count: 0,
            float_local_count: 0,
            int_stack_height: 0,
            float_stack_height: 0,
            max_int_stack_height: 0,
            max_float_stack_height: 0,
            stack_floats: Vec::new(),
            containing_labels: Vec::new(),
            label_count: 0,
            label_base,
            return_label,
            result: stats.result(),
        };
        for &param in stats.params() {
            let location = context.assign_local(param);
            context.params.push(location);
        }
        context.int_param_count = context.int_local_count;
        context.float_param_count = context.float_local_count;
        if context.int_param_count as usize > regs::general_count(false)
            || context.float_param_count as usize > regs::general_count(true)
        {
            return Err(Error::Unsupported(format!(
                "{} parameters overflow the register file",
                stats.params().len()
            )));
        }
        for &local in stats.locals() {
            let location = context.assign_local(local);
            context.locals.push(location);
        }
        Ok(context)
    }

    fn assign_local(&mut self, value_type: ValueType) -> LocalLocation {
        let float = is_float(value_type);
        let counter = if float {
            &mut self.float_local_count
        } else {
            &mut self.int_local_count
        };
        let location = LocalLocation {
            float,
            index: *counter,
        };
        *counter += 1;
        location
    }

    /// The function's result type.
    pub fn result(&self) -> Option<ValueType> {
        self.result
    }

    /// The label the function's epilogue carries.
    pub fn return_label(&self) -> &str {
        &self.return_label
    }

    /// Mints a function-unique label.
    pub fn new_label(&mut self) -> String {
        let label = format!("{}_L{}", self.label_base, self.label_count);
        self.label_count += 1;
        label
    }

    fn kind_locals(&self, float: bool) -> u32 {
        if float {
            self.float_local_count
        } else {
            self.int_local_count
        }
    }

    fn kind_params(&self, float: bool) -> u32 {
        if float {
            self.float_param_count
        } else {
            self.int_param_count
        }
    }

    /// Current int stack height.
    pub fn int_stack_height(&self) -> u32 {
        self.int_stack_height
    }

    /// Current float stack height.
    pub fn float_stack_height(&self) -> u32 {
        self.float_stack_height
    }

    /// Highest int stack height seen so far.
    pub fn max_int_stack_height(&self) -> u32 {
        self.max_int_stack_height
    }

    /// Highest float stack height seen so far.
    pub fn max_float_stack_height(&self) -> u32 {
        self.max_float_stack_height
    }

    fn height(&mut self, float: bool) -> &mut u32 {
        if float {
            &mut self.float_stack_height
        } else {
            &mut self.int_stack_height
        }
    }

    /// Pushes a value of the given kind and resolves where it lives:
    /// `Some(register)`, or `None` when the value goes to the machine stack
    /// (the caller emits the push, which lands the value at `[rsp]`).
    pub fn resolve_push(&mut self, float: bool) -> Option<Reg> {
        let slot = self.kind_locals(float) + *self.height(float);
        *self.height(float) += 1;
        if float {
            self.max_float_stack_height = self.max_float_stack_height.max(self.float_stack_height);
        } else {
            self.max_int_stack_height = self.max_int_stack_height.max(self.int_stack_height);
        }
        self.stack_floats.push(float);
        regs::general(float, slot as usize)
    }

    /// Pops the top value, returning its kind and where it lived. A `None`
    /// register means the value is at `[rsp]` and the caller pops it.
    pub fn resolve_pop(&mut self) -> Result<(bool, Option<Reg>), Error> {
        let float = self
            .stack_floats
            .pop()
            .ok_or_else(|| Error::Allocation("pop from an empty virtual stack".into()))?;
        *self.height(float) -= 1;
        let slot = self.kind_locals(float) + *self.height(float);
        Ok((float, regs::general(float, slot as usize)))
    }

    /// The kind of the top value.
    pub fn peek(&self) -> Result<bool, Error> {
        self.stack_floats
            .last()
            .copied()
            .ok_or_else(|| Error::Allocation("peek at an empty virtual stack".into()))
    }

    /// Kind and location of the top value, without popping it.
    pub fn top_location(&self) -> Result<(bool, Option<Reg>), Error> {
        let float = self.peek()?;
        let height = if float {
            self.float_stack_height
        } else {
            self.int_stack_height
        };
        let slot = self.kind_locals(float) + height - 1;
        Ok((float, regs::general(float, slot as usize)))
    }

    fn param_or_local(&self, index: u32) -> Result<LocalLocation, Error> {
        self.params
            .get(index as usize)
            .or_else(|| self.locals.get(index as usize - self.params.len()))
            .copied()
            .ok_or_else(|| Error::Module(format!("reference to unknown local {}", index)))
    }

    /// Resolves a parameter or local (joint numbering, params first) to its
    /// kind and physical home.
    pub fn resolve_local(&self, index: u32) -> Result<(bool, LocalValue), Error> {
        let location = self.param_or_local(index)?;
        let pool = regs::general_count(location.float) as u32;
        let value = if location.index < pool {
            LocalValue::Register(regs::general(location.float, location.index as usize).expect(
                "index is below the pool size; general always succeeds there",
            ))
        } else {
            // Spilled int locals occupy the low slots of the stack-locals
            // area; spilled float locals follow them.
            let slot = if location.float {
                self.int_local_count.saturating_sub(regs::general_count(false) as u32)
                    + (location.index - pool)
            } else {
                location.index - pool
            };
            LocalValue::Stack(slot)
        };
        Ok((location.float, value))
    }

    /// Resolves the `index`-th parameter; parameters never spill.
    pub fn resolve_param(&self, index: u32) -> Result<Reg, Error> {
        let location = self
            .params
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::Module(format!("reference to unknown parameter {}", index)))?;
        regs::general(location.float, location.index as usize).ok_or_else(|| {
            Error::Unsupported("parameter overflows the register file".into())
        })
    }

    /// Number of 8-byte slots the prologue reserves for spilled locals.
    pub fn stack_locals(&self) -> u32 {
        let int_spill = self
            .int_local_count
            .saturating_sub(regs::general_count(false) as u32);
        let float_spill = self
            .float_local_count
            .saturating_sub(regs::general_count(true) as u32);
        int_spill + float_spill
    }

    /// Number of virtual-stack values currently resident on the machine
    /// stack.
    pub fn machine_values(&self) -> u32 {
        let free_int =
            (regs::general_count(false) as u32).saturating_sub(self.int_local_count);
        let free_float =
            (regs::general_count(true) as u32).saturating_sub(self.float_local_count);
        self.int_stack_height.saturating_sub(free_int)
            + self.float_stack_height.saturating_sub(free_float)
    }

    /// Every register currently holding a live value: parameters (unless
    /// `whole_function`), locals, and virtual-stack values up to the current
    /// heights (or the watermarks when `whole_function`). Returned in pool
    /// order, ints first.
    pub fn registers_used(&self, whole_function: bool) -> Vec<Reg> {
        let mut used = Vec::new();
        for float in [false, true] {
            let pool = regs::general_count(float) as u32;
            let start = if whole_function {
                self.kind_params(float)
            } else {
                0
            };
            let height = if whole_function {
                if float {
                    self.max_float_stack_height
                } else {
                    self.max_int_stack_height
                }
            } else if float {
                self.float_stack_height
            } else {
                self.int_stack_height
            };
            let end = pool.min(self.kind_locals(float) + height);
            for index in start..end {
                used.push(
                    regs::general(float, index as usize)
                        .expect("index is below the pool size; general always succeeds there"),
                );
            }
        }
        used
    }

    /// Snapshots the virtual stack.
    pub fn stack_state(&self) -> StackState {
        StackState {
            int_stack_height: self.int_stack_height,
            float_stack_height: self.float_stack_height,
            stack_floats: self.stack_floats.clone(),
        }
    }

    /// Rewinds the virtual stack to a snapshot. Logical state only.
    pub fn restore_stack_state(&mut self, state: &StackState) {
        self.int_stack_height = state.int_stack_height;
        self.float_stack_height = state.float_stack_height;
        self.stack_floats = state.stack_floats.clone();
    }

    /// Enters a block, capturing the current heights.
    pub fn push_label(&mut self, is_loop: bool, label: String, result: Option<ValueType>) {
        self.containing_labels.push(BlockReference {
            is_loop,
            label,
            int_height: self.int_stack_height,
            float_height: self.float_stack_height,
            result,
        });
    }

    /// Leaves the innermost block.
    pub fn pop_label(&mut self) -> Result<(), Error> {
        self.containing_labels
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::Allocation("pop from an empty block stack".into()))
    }

    /// The block reference `nesting` levels above the innermost frame
    /// (wasm's relative branch labels).
    pub fn nested_label(&self, nesting: u32) -> Result<&BlockReference, Error> {
        let depth = self.containing_labels.len();
        depth
            .checked_sub(1 + nesting as usize)
            .and_then(|index| self.containing_labels.get(index))
            .ok_or_else(|| {
                Error::Allocation(format!("branch to nonexistent nesting {}", nesting))
            })
    }

    /// Whether the given nesting resolves to the function's own frame.
    pub fn is_function_frame(&self, nesting: u32) -> bool {
        nesting as usize + 1 == self.containing_labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{Gpr, Xmm};
    use assert_matches::assert_matches;

    fn empty_context(stats: &FunctionStats) -> CompilationContext {
        CompilationContext::new(stats, "MODULE0_FUNC0".into(), "MODULE0_RETURN0".into())
            .expect("stats fit the register file")
    }

    #[test]
    fn pushes_prefer_registers() {
        let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
        let mut context = empty_context(&stats);

        assert_eq!(context.resolve_push(false), Some(Reg::Int(Gpr::Rdi)));
        assert_eq!(context.resolve_push(false), Some(Reg::Int(Gpr::Rsi)));
        assert_eq!(context.resolve_push(true), Some(Reg::Float(Xmm::Xmm2)));
        assert_eq!(context.int_stack_height(), 2);
        assert_eq!(context.float_stack_height(), 1);

        assert_eq!(context.resolve_pop().unwrap(), (true, Some(Reg::Float(Xmm::Xmm2))));
        assert_eq!(context.resolve_pop().unwrap(), (false, Some(Reg::Int(Gpr::Rsi))));
        assert_eq!(context.resolve_pop().unwrap(), (false, Some(Reg::Int(Gpr::Rdi))));
        assert_matches!(context.resolve_pop(), Err(Error::Allocation(_)));
    }

    #[test]
    fn pushes_spill_after_the_pool() {
        let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
        let mut context = empty_context(&stats);

        for _ in 0..12 {
            assert!(context.resolve_push(false).is_some());
        }
        assert_eq!(context.resolve_push(false), None);
        assert_eq!(context.machine_values(), 1);
        assert_eq!(context.resolve_pop().unwrap(), (false, None));
        assert_eq!(context.machine_values(), 0);
    }

    #[test]
    fn locals_shift_the_stack_base() {
        let stats = FunctionStats::new(
            vec![ValueType::I32, ValueType::F64],
            vec![ValueType::I64],
            None,
        );
        let mut context = empty_context(&stats);

        // Params rdi / xmm2, local rsi; the int stack then starts at r8.
        assert_eq!(context.resolve_push(false), Some(Reg::Int(Gpr::R8)));
        assert_eq!(context.resolve_push(true), Some(Reg::Float(Xmm::Xmm3)));
    }

    #[test]
    fn local_resolution() {
        let stats = FunctionStats::new(
            vec![ValueType::I32],
            vec![ValueType::F32, ValueType::I64],
            None,
        );
        let context = empty_context(&stats);

        assert_eq!(
            context.resolve_local(0).unwrap().1,
            LocalValue::Register(Reg::Int(Gpr::Rdi))
        );
        assert_eq!(
            context.resolve_local(1).unwrap().1,
            LocalValue::Register(Reg::Float(Xmm::Xmm2))
        );
        assert_eq!(
            context.resolve_local(2).unwrap().1,
            LocalValue::Register(Reg::Int(Gpr::Rsi))
        );
        assert_matches!(context.resolve_local(3), Err(Error::Module(_)));
    }

    #[test]
    fn locals_past_the_pool_get_stack_slots() {
        let locals = vec![ValueType::I64; 14];
        let stats = FunctionStats::new(Vec::new(), locals, None);
        let context = empty_context(&stats);

        assert_eq!(context.stack_locals(), 2);
        assert_eq!(
            context.resolve_local(11).unwrap().1,
            LocalValue::Register(Reg::Int(Gpr::Rbp))
        );
        assert_eq!(context.resolve_local(12).unwrap().1, LocalValue::Stack(0));
        assert_eq!(context.resolve_local(13).unwrap().1, LocalValue::Stack(1));
    }

    #[test]
    fn too_many_params_are_rejected() {
        let params = vec![ValueType::I32; 13];
        let stats = FunctionStats::new(params, Vec::new(), None);
        assert_matches!(
            CompilationContext::new(&stats, "F".into(), "R".into()),
            Err(Error::Unsupported(_))
        );
    }

    #[test]
    fn watermarks_are_monotone() {
        let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
        let mut context = empty_context(&stats);

        context.resolve_push(false);
        context.resolve_push(false);
        context.resolve_pop().unwrap();
        context.resolve_pop().unwrap();
        context.resolve_push(false);
        assert_eq!(context.max_int_stack_height(), 2);
        assert_eq!(context.int_stack_height(), 1);
    }

    #[test]
    fn registers_used_ranges() {
        let stats = FunctionStats::new(
            vec![ValueType::I32, ValueType::I32],
            vec![ValueType::I64],
            None,
        );
        let mut context = empty_context(&stats);
        context.resolve_push(false);

        // Call-site view: params + locals + stack.
        assert_eq!(
            context.registers_used(false),
            vec![
                Reg::Int(Gpr::Rdi),
                Reg::Int(Gpr::Rsi),
                Reg::Int(Gpr::R8),
                Reg::Int(Gpr::R9)
            ]
        );
        // Prologue view: everything but the params.
        assert_eq!(
            context.registers_used(true),
            vec![Reg::Int(Gpr::R8), Reg::Int(Gpr::R9)]
        );
    }

    #[test]
    fn snapshot_restores_the_witness_list() {
        let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
        let mut context = empty_context(&stats);

        context.resolve_push(false);
        let state = context.stack_state();
        context.resolve_push(true);
        context.resolve_push(false);
        context.restore_stack_state(&state);
        assert_eq!(context.int_stack_height(), 1);
        assert_eq!(context.float_stack_height(), 0);
        assert_eq!(context.peek().unwrap(), false);
    }

    #[test]
    fn block_references_record_entry_heights() {
        let stats = FunctionStats::new(Vec::new(), Vec::new(), None);
        let mut context = empty_context(&stats);

        context.resolve_push(false);
        context.push_label(false, "L0".into(), Some(ValueType::I32));
        context.resolve_push(false);
        context.push_label(true, "L1".into(), None);

        let inner = context.nested_label(0).unwrap();
        assert!(inner.is_loop);
        assert_eq!(inner.int_height, 2);
        let outer = context.nested_label(1).unwrap();
        assert_eq!(outer.label, "L0");
        assert_eq!(outer.int_height, 1);
        assert_matches!(context.nested_label(2), Err(Error::Allocation(_)));
    }
}
