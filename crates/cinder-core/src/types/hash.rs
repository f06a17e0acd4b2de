//! Hash values: zipmap below the watermarks, hash table above.
//!
//! A hash starts in the compact [`Zipmap`] encoding and converts —
//! once, irreversibly — to an `AHashMap` when it outgrows either the
//! entry-count or the element-size watermark. Reads work identically
//! on both encodings; only `set` can trigger the conversion.

use ahash::AHashMap;
use bytes::Bytes;

use super::zipmap::Zipmap;

#[derive(Debug, Clone)]
pub enum Hash {
    Zip(Zipmap),
    Table(AHashMap<Bytes, Bytes>),
}

impl Hash {
    /// New hashes always start compact.
    pub fn new() -> Self {
        Hash::Zip(Zipmap::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Hash::Zip(zm) => zm.len(),
            Hash::Table(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoding name as reported by DEBUG OBJECT.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Hash::Zip(_) => "zipmap",
            Hash::Table(_) => "hashtable",
        }
    }

    pub fn get(&self, field: &[u8]) -> Option<Bytes> {
        match self {
            Hash::Zip(zm) => zm.get(field).map(Bytes::copy_from_slice),
            Hash::Table(map) => map.get(field).cloned(),
        }
    }

    pub fn contains(&self, field: &[u8]) -> bool {
        match self {
            Hash::Zip(zm) => zm.contains(field),
            Hash::Table(map) => map.contains_key(field),
        }
    }

    /// Sets a field, converting to the table encoding first when the
    /// write would cross either watermark. Returns `true` when the
    /// field was newly created.
    pub fn set(
        &mut self,
        field: Bytes,
        value: Bytes,
        max_zip_entries: usize,
        max_zip_value: usize,
    ) -> bool {
        if let Hash::Zip(zm) = self {
            let oversized = field.len() > max_zip_value || value.len() > max_zip_value;
            let would_grow = !zm.contains(&field) && zm.len() + 1 > max_zip_entries;
            if oversized || would_grow {
                self.convert();
            }
        }
        match self {
            Hash::Zip(zm) => zm.set(&field, &value),
            Hash::Table(map) => map.insert(field, value).is_none(),
        }
    }

    /// Removes a field. Returns `true` if it existed.
    pub fn remove(&mut self, field: &[u8]) -> bool {
        match self {
            Hash::Zip(zm) => zm.remove(field),
            Hash::Table(map) => map.remove(field).is_some(),
        }
    }

    /// Iterates (field, value) pairs. Order is only meaningful for
    /// the compact encoding.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + '_> {
        match self {
            Hash::Zip(zm) => Box::new(
                zm.iter()
                    .map(|(f, v)| (Bytes::copy_from_slice(f), Bytes::copy_from_slice(v))),
            ),
            Hash::Table(map) => Box::new(map.iter().map(|(f, v)| (f.clone(), v.clone()))),
        }
    }

    /// One-way zipmap → table conversion.
    fn convert(&mut self) {
        if let Hash::Zip(zm) = self {
            let mut map = AHashMap::with_capacity(zm.len() + 1);
            for (field, value) in zm.iter() {
                map.insert(Bytes::copy_from_slice(field), Bytes::copy_from_slice(value));
            }
            *self = Hash::Table(map);
        }
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::new()
    }
}
