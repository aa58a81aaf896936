//! Links a set of named parsed modules onto one address-label plan.
//!
//! Module indices are assigned in bag order; each module's 4 GiB memory
//! region, labels and export symbols derive from its index, and imports
//! resolve against the exporting module's labels. Compilation of one module
//! failing aborts the link.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use parity_wasm::elements::Module;

use crate::asm::Instruction;
use crate::compile::compile_module;
use crate::header::HeaderDeclaration;
use crate::Error;

/// One module's compiled artifacts.
#[derive(Debug)]
pub struct LinkedModule {
    /// The module's name as given to [`link`].
    pub name: String,
    /// The structured assembly stream.
    pub assembly: Vec<Instruction>,
    /// Declarations for the module's C header.
    pub declarations: Vec<HeaderDeclaration>,
}

/// Compiles every module in the bag against a shared label plan.
pub fn link(modules: &[(String, Module)]) -> Result<Vec<LinkedModule>, Error> {
    let mut indices = BTreeMap::new();
    for (index, (name, _)) in modules.iter().enumerate() {
        if indices.insert(name.clone(), index).is_some() {
            return Err(Error::Module(format!("duplicate module name {}", name)));
        }
    }
    modules
        .iter()
        .enumerate()
        .map(|(index, (name, module))| {
            let (assembly, declarations) = compile_module(index, name, module, &indices)?;
            Ok(LinkedModule {
                name: name.clone(),
                assembly,
                declarations,
            })
        })
        .collect()
}
