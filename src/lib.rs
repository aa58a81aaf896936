//! # wasmc
//!
//! This library compiles WebAssembly modules ahead of time into x86-64
//! assembly (GNU assembler syntax) plus a matching C header, so compiled
//! modules can be linked against ordinary C programs.
//!
//! # Introduction
//!
//! The compiler consumes modules that have already been parsed into
//! [`parity_wasm::elements::Module`] and produces, per module, a stream of
//! structured [assembly instructions][`asm::Instruction`] and a list of
//! [C header declarations][`header::HeaderDeclaration`] for its exports.
//! Serializing the instruction stream (each record renders one line of
//! AT&T-syntax assembly) and invoking an assembler and linker are left to
//! the embedder.
//!
//! ## Compilation model
//!
//! Code generation is a single pass over each function. The wasm operand
//! stack is modeled at compile time by a *virtual stack*: values live in
//! general purpose or SSE registers while the register pools last and spill
//! to the machine stack past that, decided purely by stack position. There
//! is no SSA and no global register allocation.
//!
//! Every module is assigned a 4 GiB region of virtual address space, so a
//! 32-bit wasm memory address combines with the region base in a single
//! 64-bit immediate. Exported functions get a System V adapter thunk and a
//! C declaration; exported globals and memories surface as C symbols.
//!
//! # Examples
//!
//! ```no_run
//! use parity_wasm::elements::Module;
//!
//! let bytes = std::fs::read("module.wasm").unwrap();
//! let module: Module = parity_wasm::deserialize_buffer(&bytes).unwrap();
//!
//! let linked = wasmc::link(&[("module".into(), module)]).unwrap();
//! for module in &linked {
//!     let assembly = wasmc::asm::render(&module.assembly);
//!     for declaration in &module.declarations {
//!         println!("{}", declaration);
//!     }
//!     std::fs::write("module.s", assembly).unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
#[macro_use]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std as alloc;

#[cfg(test)]
extern crate assert_matches;

use alloc::string::String;
use core::fmt;
#[cfg(feature = "std")]
use std::error;

pub mod asm;
pub mod context;
pub mod header;
pub mod linker;
pub mod regs;

mod compile;

pub use crate::compile::compile_module;
pub use crate::linker::{link, LinkedModule};

/// Error type returned by every compilation entry point.
///
/// All errors are fatal to the module being compiled; no recovery is
/// attempted.
#[derive(Debug)]
pub enum Error {
    /// The parsed module's structure is invalid or unsupported at the
    /// module level: more than one memory, a non-zero memory index, a
    /// function/code section mismatch, or a reference to an unknown type,
    /// item or imported module.
    Module(String),
    /// The module uses a construct the code generator cannot lower, such
    /// as an instruction outside the supported set or parameters that
    /// overflow the register file.
    Unsupported(String),
    /// An internal allocator invariant was violated: popping an empty
    /// virtual stack, unwinding past a recorded block height, or branching
    /// to a nesting that does not exist. A valid wasm module never
    /// triggers these.
    Allocation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Module(message) => write!(f, "Module: {}", message),
            Error::Unsupported(message) => write!(f, "Unsupported: {}", message),
            Error::Allocation(message) => write!(f, "Allocation: {}", message),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for Error {}
