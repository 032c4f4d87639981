//! An in-memory process image that implements [`Inspector`].
//!
//! A [`Snapshot`] holds typed [`Value`]s reachable from named globals, plus a
//! sparse map of raw 64-bit words for everything read through [`Memory`]
//! (free-list links threaded through free blocks). It is what the tests use,
//! and it is a convenient target for tools that have already dumped the
//! allocator's globals some other way.
//!
//! Hand-assembling a tcmalloc heap out of `Value`s is tedious, so
//! [`TcmallocImage`] lays one out from a list of spans and cache contents.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::inspect::{ArrayBounds, Inspector, Memory};
use crate::{Address, Error};

mod image;

pub use image::{ImageSpan, TcmallocImage};

/// A typed value in a [`Snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// An integer.
    Int(u64),
    /// A pointer; [`Inspector::deref`] looks its target up among the
    /// snapshot's objects.
    Ptr(Address),
    /// A struct, by member name.
    Struct(BTreeMap<String, Value>),
    /// A zero-based array.
    Array(Vec<Value>),
}

impl Value {
    /// Build a struct out of `(member, value)` pairs.
    pub fn structure<'a>(members: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Value::Struct(
            members
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    /// Build an array.
    pub fn array(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(elements.into_iter().collect())
    }
}

/// A sparse process image.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    globals: BTreeMap<String, Value>,
    objects: BTreeMap<Address, Value>,
    words: BTreeMap<Address, u64>,
}

impl Snapshot {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Snapshot::set_global`].
    pub fn with_global(mut self, name: &str, value: Value) -> Self {
        self.set_global(name, value);
        self
    }

    /// Define the global variable `name`.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Place `value` at `addr`, so that dereferencing `Value::Ptr(addr)`
    /// yields it.
    pub fn set_object(&mut self, addr: Address, value: Value) {
        self.objects.insert(addr, value);
    }

    /// Store the little-endian word `value` at `addr`.
    pub fn write_pointer(&mut self, addr: Address, value: Address) {
        self.words.insert(addr, value);
    }
}

impl Memory for Snapshot {
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), Error> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr
                .checked_add(i as u64)
                .ok_or(Error::Unreadable(addr))?;
            let (start, word) = self
                .words
                .range(..=at)
                .next_back()
                .filter(|(start, _)| at - **start < 8)
                .ok_or(Error::Unreadable(at))?;
            *byte = word.to_le_bytes()[(at - start) as usize];
        }
        Ok(())
    }
}

impl Inspector for Snapshot {
    type Value = Value;

    fn global(&self, name: &str) -> Result<Value, Error> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Symbol(name.to_string()))
    }

    fn field(&self, value: &Value, name: &str) -> Result<Value, Error> {
        match value {
            Value::Struct(members) => members.get(name).cloned(),
            _ => None,
        }
        .ok_or_else(|| Error::Field(name.to_string()))
    }

    fn is_array(&self, value: &Value) -> bool {
        matches!(value, Value::Array(_))
    }

    fn array_bounds(&self, value: &Value) -> Option<ArrayBounds> {
        match value {
            Value::Array(elements) => Some(ArrayBounds::with_len(elements.len())),
            _ => None,
        }
    }

    fn element(&self, value: &Value, index: i64) -> Result<Value, Error> {
        let Value::Array(elements) = value else {
            return Err(Error::Other("indexing a non-array".to_string()));
        };
        usize::try_from(index)
            .ok()
            .and_then(|index| elements.get(index))
            .cloned()
            .ok_or_else(|| Error::Other(alloc::format!("array index {index} out of bounds")))
    }

    fn cast(&self, value: &Value, _type_name: &str) -> Result<Value, Error> {
        Ok(value.clone())
    }

    fn deref(&self, value: &Value) -> Result<Value, Error> {
        match *value {
            Value::Ptr(0) => Err(Error::NullPointer),
            Value::Ptr(addr) => self
                .objects
                .get(&addr)
                .cloned()
                .ok_or(Error::Unreadable(addr)),
            _ => Err(Error::NotScalar),
        }
    }

    fn as_u64(&self, value: &Value) -> Result<u64, Error> {
        match *value {
            Value::Int(n) | Value::Ptr(n) => Ok(n),
            _ => Err(Error::NotScalar),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_straddle_words() {
        let mut snapshot = Snapshot::new();
        snapshot.write_pointer(0x1000, 0x1122_3344_5566_7788);
        snapshot.write_pointer(0x1008, 0x99);

        assert_eq!(snapshot.read_pointer(0x1000), Ok(0x1122_3344_5566_7788));
        assert_eq!(snapshot.read_pointer(0x1004), Ok(0x99_1122_3344));
        assert_eq!(snapshot.read_pointer(0x1010), Err(Error::Unreadable(0x1010)));
        assert_eq!(snapshot.read_pointer(0x0FFC), Err(Error::Unreadable(0x0FFC)));
    }

    #[test]
    fn typed_access() {
        let mut snapshot = Snapshot::new().with_global(
            "root",
            Value::structure([("ptr", Value::Ptr(0x10)), ("null", Value::Ptr(0))]),
        );
        snapshot.set_object(0x10, Value::array([Value::Int(7), Value::Int(8)]));

        let root = snapshot.global("root").unwrap();
        let target = snapshot.deref(&snapshot.field(&root, "ptr").unwrap()).unwrap();
        assert!(snapshot.is_array(&target));
        assert_eq!(snapshot.array_bounds(&target), Some(ArrayBounds { low: 0, high: 1 }));
        assert_eq!(snapshot.element(&target, 1), Ok(Value::Int(8)));
        assert!(snapshot.element(&target, 2).is_err());

        let null = snapshot.field(&root, "null").unwrap();
        assert_eq!(snapshot.deref(&null), Err(Error::NullPointer));
        assert_eq!(snapshot.as_u64(&null), Ok(0));
        assert_eq!(snapshot.as_u64(&root), Err(Error::NotScalar));
        assert_eq!(snapshot.field(&root, "nope"), Err(Error::Field("nope".into())));
        assert_eq!(snapshot.global("nope"), Err(Error::Symbol("nope".into())));
    }
}
