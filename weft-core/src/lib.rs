pub mod babysitter;
pub mod error;
pub mod extract;
pub mod first_order;
pub mod interp;
pub mod ir;
pub mod verify;

#[cfg(test)]
mod babysitter_tests;
#[cfg(test)]
mod extract_tests;
#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod segmented_tests;
#[cfg(test)]
mod test_programs;

use std::marker::PhantomData;

use indexmap::IndexMap;
use log::info;

use error::Result;
use extract::ExtractConfig;
use ir::{Program, SizeClass};
use verify::Stage;

// =============================================================================
// Generic ID allocation
// =============================================================================

/// Generic counter for generating unique IDs.
///
/// The ID type must implement `From<u32>` to convert the raw counter value.
#[derive(Debug, Clone)]
pub struct IdSource<Id> {
    next_id: u32,
    _phantom: PhantomData<Id>,
}

impl<Id: From<u32>> IdSource<Id> {
    pub fn new() -> Self {
        IdSource {
            next_id: 0,
            _phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> Id {
        let id = Id::from(self.next_id);
        self.next_id += 1;
        id
    }

    /// Never hand out an ID below `id`.
    pub fn skip_to(&mut self, id: u32) {
        self.next_id = self.next_id.max(id);
    }
}

impl<Id: From<u32>> Default for IdSource<Id> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Typestate Compiler Pipeline
// =============================================================================
//
// Each struct represents a stage. Methods consume `self` and return the next
// stage, so passes can only run in order:
//
//   Compiler::load(program)?                      -> Loaded
//     -> .extract_kernels(&config)?               -> Extracted
//       -> .babysit()? / .skip_babysitting()      -> Babysat
//         -> .verify()?                           -> Compiled
//
// `Compiled` carries the final program and the tunable sizes it declares.

/// Entry point for the compiler. Use `Compiler::load()` to start the pipeline.
pub struct Compiler;

impl Compiler {
    /// Accept a SOAC-level program, checking that it is well formed.
    pub fn load(program: Program) -> Result<Loaded> {
        verify::verify_program(&program, Stage::Soacs)?;
        Ok(Loaded { program })
    }

    /// Accept a program that is already kernel-level, e.g. one written out
    /// by an earlier compilation.
    pub fn load_kernels(program: Program) -> Result<Compiled> {
        Babysat { program }.verify()
    }
}

/// A well-formed SOAC-level program.
pub struct Loaded {
    pub program: Program,
}

impl Loaded {
    /// Rewrite every SOAC into kernels.
    pub fn extract_kernels(self, config: &ExtractConfig) -> Result<Extracted> {
        let (program, log) = extract::extract_kernels(self.program, config)?;
        info!("kernel extraction took {} decisions", log.len());
        Ok(Extracted { program, log })
    }
}

/// Kernels have been extracted.
pub struct Extracted {
    pub program: Program,
    /// The decisions taken by extraction, one line each.
    pub log: Vec<String>,
}

impl Extracted {
    /// Rewrite kernel inputs for coalesced memory access.
    pub fn babysit(self) -> Result<Babysat> {
        let program = babysitter::babysit_program(self.program)?;
        Ok(Babysat { program })
    }

    pub fn skip_babysitting(self) -> Babysat {
        Babysat { program: self.program }
    }
}

/// Kernel inputs have been coalesced.
pub struct Babysat {
    pub program: Program,
}

impl Babysat {
    /// Check the kernel-level program and collect its tunable sizes.
    pub fn verify(self) -> Result<Compiled> {
        verify::verify_program(&self.program, Stage::Kernels)?;
        let sizes = extract::collect_sizes(&self.program);
        Ok(Compiled {
            program: self.program,
            sizes,
        })
    }
}

/// The result of compilation.
pub struct Compiled {
    pub program: Program,
    /// Every tunable size, in declaration order.
    pub sizes: IndexMap<String, SizeClass>,
}

/// Run the whole pipeline.
pub fn compile(program: Program, config: &ExtractConfig) -> Result<Compiled> {
    Compiler::load(program)?.extract_kernels(config)?.babysit()?.verify()
}
