use std::collections::HashMap;

use crate::value::SymbolId;

/// Interned symbol table. Equal spellings always yield the same `SymbolId`,
/// so symbol comparison anywhere in the runtime is a handle comparison.
pub struct SymbolTable {
    name_to_id: HashMap<String, SymbolId>,
    id_to_name: Vec<String>,
}

/// Symbols the runtime needs to recognise by identity, pre-interned at startup.
/// These must match the order of `PREINTERNED` below.
pub mod sym {
    use crate::value::SymbolId;

    pub const QUOTE: SymbolId = SymbolId(0);
    pub const LAMBDA: SymbolId = SymbolId(1);
    pub const DEFINE: SymbolId = SymbolId(2);
    pub const DEFINE_SYNTAX: SymbolId = SymbolId(3);
    pub const SET: SymbolId = SymbolId(4);
    pub const IF: SymbolId = SymbolId(5);
    pub const BEGIN: SymbolId = SymbolId(6);
    pub const SYNTAX_RULES: SymbolId = SymbolId(7);
    pub const ELLIPSIS: SymbolId = SymbolId(8);
    pub const UNDERSCORE: SymbolId = SymbolId(9);
}

const PREINTERNED: [&str; 10] = [
    "quote",
    "lambda",
    "define",
    "define-syntax",
    "set!",
    "if",
    "begin",
    "syntax-rules",
    "...",
    "_",
];

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            name_to_id: HashMap::new(),
            id_to_name: Vec::new(),
        };
        for name in PREINTERNED {
            table.intern(name);
        }
        table
    }

    /// Intern a symbol name. Returns the existing ID if already interned,
    /// or creates a new one.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = SymbolId(self.id_to_name.len() as u32);
        self.name_to_id.insert(name.to_string(), id);
        self.id_to_name.push(name.to_string());
        id
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.id_to_name[id.0 as usize]
    }

    /// Look up a symbol ID by name, without interning.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.name_to_id.get(name).copied()
    }

    pub fn count(&self) -> usize {
        self.id_to_name.len()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preinterned_ids_match_constants() {
        let table = SymbolTable::new();
        assert_eq!(table.lookup("quote"), Some(sym::QUOTE));
        assert_eq!(table.lookup("set!"), Some(sym::SET));
        assert_eq!(table.lookup("syntax-rules"), Some(sym::SYNTAX_RULES));
        assert_eq!(table.lookup("..."), Some(sym::ELLIPSIS));
        assert_eq!(table.lookup("_"), Some(sym::UNDERSCORE));
    }

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let before = table.count();
        let a = table.intern("fact");
        let b = table.intern("fact");
        assert_eq!(a, b);
        assert_eq!(table.count(), before + 1);
        assert_eq!(table.name(a), "fact");
    }
}
