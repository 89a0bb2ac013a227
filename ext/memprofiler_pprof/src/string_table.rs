use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

use crate::util::fatal;

pub const UNKNOWN_LITERAL: &str = "(unknown)";

/// Canonical reference to a string interned in a [`StringTable`].
///
/// Two `InternedStr`s obtained from the same table for the same bytes share
/// one allocation, so identity (not content) is what the serializer keys on.
#[derive(Clone)]
pub struct InternedStr(Arc<str>);

impl InternedStr {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ptr_eq(&self, other: &InternedStr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl Deref for InternedStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[derive(Debug)]
struct Entry {
    string: Arc<str>,
    // Number of outstanding intern() calls not yet matched by release().
    refcount: u64,
}

/// Strings every profile needs regardless of what was sampled. They are
/// interned once when the table is created and never released, so they are
/// always present in a snapshot.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub empty: InternedStr,
    pub allocations: InternedStr,
    pub count: InternedStr,
    pub kind: InternedStr,
    pub allocation: InternedStr,
    pub heap: InternedStr,
    pub bytes: InternedStr,
    pub allocation_size: InternedStr,
    pub current_size: InternedStr,
    pub unknown: InternedStr,
}

/// Refcounted string interning table.
#[derive(Debug)]
pub struct StringTable {
    entries: HashMap<Arc<str>, Entry>,
    vocabulary: Vocabulary,
}

impl StringTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let mut pin = |s: &str| InternedStr(Self::intern_into(&mut entries, s));
        let vocabulary = Vocabulary {
            empty: pin(""),
            allocations: pin("allocations"),
            count: pin("count"),
            kind: pin("kind"),
            allocation: pin("allocation"),
            heap: pin("heap"),
            bytes: pin("bytes"),
            allocation_size: pin("allocation_size"),
            current_size: pin("current_size"),
            unknown: pin(UNKNOWN_LITERAL),
        };
        Self {
            entries,
            vocabulary,
        }
    }

    fn intern_into(entries: &mut HashMap<Arc<str>, Entry>, s: &str) -> Arc<str> {
        if let Some(entry) = entries.get_mut(s) {
            entry.refcount += 1;
            return Arc::clone(&entry.string);
        }
        let string: Arc<str> = Arc::from(s);
        entries.insert(
            Arc::clone(&string),
            Entry {
                string: Arc::clone(&string),
                refcount: 1,
            },
        );
        string
    }

    /// Interns `s`, or bumps the refcount of the already-interned copy.
    pub fn intern(&mut self, s: &str) -> InternedStr {
        InternedStr(Self::intern_into(&mut self.entries, s))
    }

    /// Drops one reference taken by [`StringTable::intern`]. The entry leaves
    /// the table when its refcount reaches zero; snapshots taken earlier keep
    /// their own copy alive.
    pub fn release(&mut self, s: &InternedStr) {
        let remove = match self.entries.get_mut(s.as_str()) {
            Some(entry) if Arc::ptr_eq(&entry.string, &s.0) => {
                entry.refcount -= 1;
                entry.refcount == 0
            }
            _ => fatal!("released string {:?} was not interned in this table", s.as_str()),
        };
        if remove {
            self.entries.remove(s.as_str());
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refcount_of(&self, s: &str) -> Option<u64> {
        self.entries.get(s).map(|entry| entry.refcount)
    }

    /// Approximate heap footprint of the table's entries.
    pub fn memsize(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.string.len() + mem::size_of::<Entry>() + mem::size_of::<Arc<str>>())
            .sum()
    }

    /// Builds a zero-based list of every interned string, as required by the
    /// pprof string table. The empty string is always at position 0.
    ///
    /// The index holds its own reference to every listed string, so it stays
    /// valid after the table is mutated or strings are released.
    pub fn snapshot_index(&self) -> StringIndex {
        let mut strings = Vec::with_capacity(self.entries.len());
        strings.push(self.vocabulary.empty.clone());
        strings.extend(
            self.entries
                .values()
                .filter(|entry| !entry.string.is_empty())
                .map(|entry| InternedStr(Arc::clone(&entry.string))),
        );
        let positions = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.addr(), i as i64))
            .collect();
        StringIndex { strings, positions }
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen, ordered view of a [`StringTable`].
#[derive(Debug)]
pub struct StringIndex {
    strings: Vec<InternedStr>,
    // Canonical pointer -> position in `strings`
    positions: HashMap<usize, i64>,
}

impl StringIndex {
    /// Position of an interned string, or `None` if it was interned after the
    /// snapshot was taken (or in a different table).
    pub fn position_of(&self, s: &InternedStr) -> Option<i64> {
        self.positions.get(&s.addr()).copied()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &InternedStr)> {
        self.strings.iter().enumerate().map(|(i, s)| (i as i64, s))
    }

    pub fn to_string_vec(&self) -> Vec<String> {
        self.strings.iter().map(|s| s.as_str().to_owned()).collect()
    }
}
