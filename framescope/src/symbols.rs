//! The symbol resolution contract and its wire representation.
//!
//! Address-to-symbol mapping is an external concern; the core only asks a
//! [`SymbolEngine`] for the module list and per-address symbols while it
//! serializes a callstack description board.

use framescope_wire::{Encode, OutputStream};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub address: u64,
    pub offset: u64,
    pub module: String,
    pub file: String,
    pub function: String,
    pub line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub path: String,
    pub address: u64,
    pub size: u64,
}

/// Maps instruction addresses to source identity.
pub trait SymbolEngine: Send {
    fn symbol(&mut self, address: u64) -> Option<Symbol>;

    fn modules(&mut self) -> Vec<Module>;
}

impl Encode for Symbol {
    fn encode(&self, out: &mut OutputStream) {
        out.write_u64(self.address);
        out.write_wide_str(&self.module);
        out.write_wide_str(&self.function);
        out.write_wide_str(&self.file);
        out.write_u32(self.line);
    }
}

impl Encode for Module {
    fn encode(&self, out: &mut OutputStream) {
        out.write_str(&self.path);
        out.write_u64(self.address);
        out.write_u64(self.size);
    }
}
