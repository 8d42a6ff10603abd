use crate::fundamental::FUNDAMENTALS;
use crate::mem::{bytes_to_words, AuxMem};
use crate::value::{sym, SymbolId};

/// Where a symbol's name lives.
enum NameRef {
    /// Compiled into the binary (reserved names, fundamentals, type names).
    Static(&'static str),
    /// Restored from an image or registered by an extension.
    Owned(String),
    /// NUL-terminated bytes in auxiliary memory (user symbols).
    Aux(u32),
}

struct SymEntry {
    id: SymbolId,
    name: NameRef,
}

/// Interned symbols in two tiers: a constant list populated at init (and
/// by image boot) and a runtime list whose name bytes live in auxiliary
/// memory. Lookup in either direction is a linear scan over both tiers.
pub struct SymbolTable {
    constant: Vec<SymEntry>,
    runtime: Vec<SymEntry>,
    next_id: u32,
}

/// Names of the type symbols returned by `type-of`, interned into the
/// constant tier at construction, in this order.
pub const TYPE_NAMES: &[&str] = &[
    "type-symbol",
    "type-char",
    "type-i",
    "type-u",
    "type-i32",
    "type-u32",
    "type-f32",
    "type-i64",
    "type-u64",
    "type-f64",
    "type-cons",
    "type-array",
];

impl SymbolTable {
    /// Build a table with the reserved range, the fundamentals, and the
    /// type names pre-populated.
    pub fn new() -> Self {
        let mut constant = Vec::new();
        for &(name, id) in sym::RESERVED_NAMES {
            constant.push(SymEntry {
                id,
                name: NameRef::Static(name),
            });
        }
        for (i, &(name, _)) in FUNDAMENTALS.iter().enumerate() {
            constant.push(SymEntry {
                id: SymbolId(sym::FUNDAMENTAL_BASE + i as u32),
                name: NameRef::Static(name),
            });
        }
        let mut next_id = sym::RUNTIME_BASE;
        for &name in TYPE_NAMES {
            constant.push(SymEntry {
                id: SymbolId(next_id),
                name: NameRef::Static(name),
            });
            next_id += 1;
        }
        SymbolTable {
            constant,
            runtime: Vec::new(),
            next_id,
        }
    }

    fn entry_name<'a>(&'a self, mem: &AuxMem, e: &'a NameRef) -> std::borrow::Cow<'a, str> {
        match e {
            NameRef::Static(s) => (*s).into(),
            NameRef::Owned(s) => s.as_str().into(),
            NameRef::Aux(ix) => String::from_utf8_lossy(&mem.read_cstr(*ix))
                .into_owned()
                .into(),
        }
    }

    /// Look up an id by name without interning.
    pub fn lookup(&self, mem: &AuxMem, name: &str) -> Option<SymbolId> {
        for e in self.constant.iter().chain(self.runtime.iter()) {
            if self.entry_name(mem, &e.name) == name {
                return Some(e.id);
            }
        }
        None
    }

    /// Look up a name by id.
    pub fn name(&self, mem: &AuxMem, id: SymbolId) -> Option<String> {
        for e in self.constant.iter().chain(self.runtime.iter()) {
            if e.id == id {
                return Some(self.entry_name(mem, &e.name).into_owned());
            }
        }
        None
    }

    /// Intern a name. Idempotent: an existing name (reserved names
    /// included) returns its assigned id. A new name gets its bytes
    /// copied into auxiliary memory; `None` means aux memory was
    /// exhausted and the caller may GC and retry.
    pub fn intern(&mut self, mem: &mut AuxMem, name: &str) -> Option<SymbolId> {
        if let Some(id) = self.lookup(mem, name) {
            return Some(id);
        }
        let nbytes = name.len() + 1;
        let ix = mem.alloc(bytes_to_words(nbytes))?;
        mem.write_bytes(ix, name.as_bytes());
        mem.write_u8(ix, name.len(), 0);
        let id = SymbolId(self.next_id);
        self.next_id += 1;
        self.runtime.push(SymEntry {
            id,
            name: NameRef::Aux(ix),
        });
        Some(id)
    }

    /// Add a symbol with a fixed id to the constant tier. Used by image
    /// boot and by the extension registry. Idempotent for an identical
    /// (id, name) pair; returns false on a conflicting one.
    pub fn add_with_id(&mut self, mem: &AuxMem, name: &str, id: SymbolId) -> bool {
        if let Some(existing) = self.lookup(mem, name) {
            return existing == id;
        }
        if self.name(mem, id).is_some() {
            return false;
        }
        self.constant.push(SymEntry {
            id,
            name: NameRef::Owned(name.to_string()),
        });
        if id.0 >= self.next_id {
            self.next_id = id.0 + 1;
        }
        true
    }

    /// All symbols above the pre-populated range, for image save.
    pub fn user_entries(&self, mem: &AuxMem) -> Vec<(SymbolId, String)> {
        let base = sym::RUNTIME_BASE + TYPE_NAMES.len() as u32;
        self.constant
            .iter()
            .chain(self.runtime.iter())
            .filter(|e| e.id.0 >= base)
            .map(|e| (e.id, self.entry_name(mem, &e.name).into_owned()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.constant.len() + self.runtime.len()
    }
}
