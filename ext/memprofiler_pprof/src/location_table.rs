use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

use crate::host::CapturedFrame;
use crate::string_table::{InternedStr, StringTable};
use crate::util::fatal;

/// A method or C function, as it appears in the pprof function table.
#[derive(Debug)]
pub struct Function {
    pub id: u64,
    pub name: InternedStr,
    pub file_name: InternedStr,
    /// The first line number of the definition.
    pub start_line: i64,
}

/// A line within a [`Function`] that was executing when a sample was taken.
#[derive(Debug)]
pub struct Location {
    pub id: u64,
    pub line: i64,
    pub function: Arc<Function>,
}

/// Interned call stack, most recent call LAST.
///
/// Each frame holds one table reference on its location and one on its
/// function; they are returned with [`LocationTable::release_backtrace`].
#[derive(Debug, Default)]
pub struct Backtrace {
    frames: Vec<Arc<Location>>,
}

impl Backtrace {
    pub fn frames(&self) -> &[Arc<Location>] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn memsize(&self) -> usize {
        mem::size_of::<Self>() + self.frames.capacity() * mem::size_of::<Arc<Location>>()
    }
}

#[derive(Debug)]
struct Counted<T> {
    value: Arc<T>,
    refcount: u64,
}

/// Dedups functions and locations across every captured backtrace.
#[derive(Debug, Default)]
pub struct LocationTable {
    // location id -> location
    locations: HashMap<u64, Counted<Location>>,
    // function id -> function
    functions: HashMap<u64, Counted<Function>>,
}

/// Stable function id derived from what identifies a method to a human.
/// Never returns 0, which pprof reserves.
pub fn function_id_for(name: &str, file_name: &str, start_line: i64) -> u64 {
    let mut s = DefaultHasher::new();
    name.hash(&mut s);
    file_name.hash(&mut s);
    start_line.hash(&mut s);
    s.finish().max(1)
}

/// Stable location id for a line inside a function. Never returns 0.
pub fn location_id_for(function_id: u64, line: i64) -> u64 {
    let mut s = DefaultHasher::new();
    function_id.hash(&mut s);
    line.hash(&mut s);
    s.finish().max(1)
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns every frame of a freshly captured stack. Frames must be ordered
    /// most recent call last.
    pub fn intern_backtrace(&mut self, strings: &mut StringTable, frames: &[CapturedFrame]) -> Backtrace {
        Backtrace {
            frames: frames
                .iter()
                .map(|frame| self.intern_frame(strings, frame))
                .collect(),
        }
    }

    fn intern_frame(&mut self, strings: &mut StringTable, frame: &CapturedFrame) -> Arc<Location> {
        let function_id = match frame.function_id {
            0 => function_id_for(&frame.function_name, &frame.file_name, frame.function_line),
            id => id,
        };

        let function = match self.functions.get_mut(&function_id) {
            Some(counted) => {
                counted.refcount += 1;
                Arc::clone(&counted.value)
            }
            None => {
                let function = Arc::new(Function {
                    id: function_id,
                    name: strings.intern(&frame.function_name),
                    file_name: strings.intern(&frame.file_name),
                    start_line: frame.function_line,
                });
                self.functions.insert(
                    function_id,
                    Counted {
                        value: Arc::clone(&function),
                        refcount: 1,
                    },
                );
                function
            }
        };

        let location_id = location_id_for(function_id, frame.line);
        match self.locations.get_mut(&location_id) {
            Some(counted) => {
                counted.refcount += 1;
                Arc::clone(&counted.value)
            }
            None => {
                let location = Arc::new(Location {
                    id: location_id,
                    line: frame.line,
                    function,
                });
                self.locations.insert(
                    location_id,
                    Counted {
                        value: Arc::clone(&location),
                        refcount: 1,
                    },
                );
                location
            }
        }
    }

    /// Returns the references taken by [`LocationTable::intern_backtrace`].
    pub fn release_backtrace(&mut self, strings: &mut StringTable, backtrace: Backtrace) {
        for location in backtrace.frames.into_iter().rev() {
            let function_id = location.function.id;
            self.release_location(location.id);
            self.release_function(strings, function_id);
        }
    }

    fn release_location(&mut self, id: u64) {
        let Some(counted) = self.locations.get_mut(&id) else {
            fatal!("location {} released more often than interned", id);
        };
        counted.refcount -= 1;
        if counted.refcount == 0 {
            self.locations.remove(&id);
        }
    }

    fn release_function(&mut self, strings: &mut StringTable, id: u64) {
        let Some(counted) = self.functions.get_mut(&id) else {
            fatal!("function {} released more often than interned", id);
        };
        counted.refcount -= 1;
        if counted.refcount == 0 {
            if let Some(counted) = self.functions.remove(&id) {
                strings.release(&counted.value.name);
                strings.release(&counted.value.file_name);
            }
        }
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn location_refcount(&self, id: u64) -> Option<u64> {
        self.locations.get(&id).map(|counted| counted.refcount)
    }

    pub fn function_refcount(&self, id: u64) -> Option<u64> {
        self.functions.get(&id).map(|counted| counted.refcount)
    }

    pub fn memsize(&self) -> usize {
        self.locations.len() * (mem::size_of::<Location>() + mem::size_of::<Counted<Location>>())
            + self.functions.len() * (mem::size_of::<Function>() + mem::size_of::<Counted<Function>>())
    }
}
