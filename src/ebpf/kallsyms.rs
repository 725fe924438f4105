//! Kernel symbol lookup through `/proc/kallsyms`
//!
//! gtp5g is an out-of-tree module, so its functions only exist while the
//! module is loaded. Checking the symbol table first turns an opaque attach
//! failure into a clear error.

use crate::Result;
use std::collections::HashSet;
use std::path::Path;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, Default)]
pub struct KernelSymbols {
    names: HashSet<String>,
}

impl KernelSymbols {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(KALLSYMS_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Lines are `address type name [module]`. Only text symbols (`t`/`T`)
    /// can carry a kprobe.
    pub fn parse(contents: &str) -> Self {
        let names = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let _address = fields.next()?;
                let kind = fields.next()?;
                let name = fields.next()?;
                matches!(kind, "t" | "T").then(|| name.to_string())
            })
            .collect();
        Self { names }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.names.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
