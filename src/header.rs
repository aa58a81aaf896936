//! C header declarations for a module's exports.
//!
//! The module assembler collects one of these per export; an embedder
//! renders them into the header file handed to C callers.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use parity_wasm::elements::ValueType;

/// The C type an export surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    /// `void`
    Void,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
}

impl CType {
    /// The C type a wasm value of the given type maps to.
    pub fn of(value_type: ValueType) -> CType {
        match value_type {
            ValueType::I32 => CType::Int,
            ValueType::I64 => CType::Long,
            ValueType::F32 => CType::Float,
            ValueType::F64 => CType::Double,
        }
    }

    /// The C type of an optional result.
    pub fn of_result(result: Option<ValueType>) -> CType {
        result.map(CType::of).unwrap_or(CType::Void)
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CType::Void => "void",
            CType::Int => "int",
            CType::Long => "long",
            CType::Float => "float",
            CType::Double => "double",
        };
        write!(f, "{}", name)
    }
}

/// One line of the generated C header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDeclaration {
    /// `TYPE NAME(ARGS);`
    Function {
        /// Return type.
        result: CType,
        /// The C-visible symbol name.
        name: String,
        /// Parameter types; an empty list renders as `(void)`.
        params: Vec<CType>,
    },
    /// `[const] TYPE [*]NAME;`
    Global {
        /// The cell's or pointee's type.
        ctype: CType,
        /// Whether the symbol is a pointer to the type.
        pointer: bool,
        /// Whether C code must treat the symbol as read-only.
        constant: bool,
        /// The C-visible symbol name.
        name: String,
    },
}

impl fmt::Display for HeaderDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderDeclaration::Function {
                result,
                name,
                params,
            } => {
                write!(f, "{} {}(", result, name)?;
                if params.is_empty() {
                    write!(f, "void")?;
                } else {
                    for (i, param) in params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", param)?;
                    }
                }
                write!(f, ");")
            }
            HeaderDeclaration::Global {
                ctype,
                pointer,
                constant,
                name,
            } => {
                if *constant {
                    write!(f, "const ")?;
                }
                write!(f, "{} ", ctype)?;
                if *pointer {
                    write!(f, "*")?;
                }
                write!(f, "{};", name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn function_declarations() {
        let fib = HeaderDeclaration::Function {
            result: CType::Long,
            name: "wasm_fib_fib".to_string(),
            params: vec![CType::Int],
        };
        assert_eq!(fib.to_string(), "long wasm_fib_fib(int);");

        let init = HeaderDeclaration::Function {
            result: CType::Void,
            name: "wasm_fib_init_module".to_string(),
            params: Vec::new(),
        };
        assert_eq!(init.to_string(), "void wasm_fib_init_module(void);");
    }

    #[test]
    fn global_declarations() {
        let counter = HeaderDeclaration::Global {
            ctype: CType::Int,
            pointer: false,
            constant: false,
            name: "wasm_m_counter".to_string(),
        };
        assert_eq!(counter.to_string(), "int wasm_m_counter;");

        let memory = HeaderDeclaration::Global {
            ctype: CType::Void,
            pointer: true,
            constant: true,
            name: "wasm_m_mem_memory".to_string(),
        };
        assert_eq!(memory.to_string(), "const void *wasm_m_mem_memory;");
    }
}
