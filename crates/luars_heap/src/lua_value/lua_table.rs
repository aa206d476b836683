// Lua table: array part for integer keys [1..n] plus an ordered hash part.
// The table stores counted references; the heap retains what goes in and
// releases what `raw_set` hands back.
use ahash::RandomState;
use indexmap::IndexMap;

use crate::GcId;
use crate::lua_vm::{LuaError, LuaResult};

use super::LuaValue;

/// What a write pushed out of the table, for the caller to release
#[derive(Debug, Default, Clone, Copy)]
pub struct Displaced {
    /// A previously stored value that was replaced or removed
    pub value: Option<LuaValue>,
    /// A key that left the hash part together with its value
    pub key: Option<LuaValue>,
    /// The key was newly stored in the hash part and must be retained
    pub key_inserted: bool,
}

pub struct LuaTable {
    /// Values for integer keys [1..array.len()]
    pub(crate) array: Vec<LuaValue>,

    pub(crate) hash: IndexMap<LuaValue, LuaValue, RandomState>,

    /// Behavior record (metatable), a table id
    pub(crate) metatable: Option<GcId>,
}

impl LuaTable {
    pub fn new(array_size: usize, hash_size: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(array_size),
            hash: IndexMap::with_capacity_and_hasher(hash_size, RandomState::new()),
            metatable: None,
        }
    }

    #[inline(always)]
    pub fn metatable(&self) -> Option<GcId> {
        self.metatable
    }

    #[inline(always)]
    pub fn get_int(&self, key: i64) -> Option<LuaValue> {
        if key > 0 {
            let idx = (key - 1) as usize;
            if let Some(val) = self.array.get(idx) {
                if !val.is_nil() {
                    return Some(*val);
                }
                return None;
            }
        }
        self.hash.get(&LuaValue::integer(key)).copied()
    }

    pub fn raw_get(&self, key: &LuaValue) -> Option<LuaValue> {
        let key = key.normalize_key();
        if let Some(i) = key.as_integer() {
            return self.get_int(i);
        }
        self.hash.get(&key).copied()
    }

    /// Store `value` under `key`. Nothing is retained or released here.
    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> LuaResult<Displaced> {
        if key.is_nil() {
            return Err(LuaError::InvalidKey("index is nil"));
        }
        if key.as_float().is_some_and(f64::is_nan) {
            return Err(LuaError::InvalidKey("index is NaN"));
        }
        let key = key.normalize_key();
        if let Some(i) = key.as_integer() {
            if let Some(displaced) = self.set_in_array(i, value) {
                return Ok(displaced);
            }
        }
        Ok(self.set_in_hash(key, value))
    }

    fn set_in_array(&mut self, key: i64, value: LuaValue) -> Option<Displaced> {
        if key <= 0 {
            return None;
        }
        let idx = (key - 1) as usize;
        let len = self.array.len();
        if idx < len {
            let old = std::mem::replace(&mut self.array[idx], value);
            if value.is_nil() && idx == len - 1 {
                while self.array.last().is_some_and(LuaValue::is_nil) {
                    self.array.pop();
                }
            }
            return Some(Displaced {
                value: (!old.is_nil()).then_some(old),
                ..Default::default()
            });
        }
        if idx == len && !value.is_nil() {
            // The key may still live in the hash part; move it over
            let old = self.hash.swap_remove(&LuaValue::integer(key));
            self.array.push(value);
            self.migrate_from_hash();
            return Some(Displaced {
                value: old,
                ..Default::default()
            });
        }
        None
    }

    /// Pull consecutive integer keys following the array part out of the hash
    fn migrate_from_hash(&mut self) {
        loop {
            let next = LuaValue::integer(self.array.len() as i64 + 1);
            match self.hash.swap_remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    fn set_in_hash(&mut self, key: LuaValue, value: LuaValue) -> Displaced {
        if value.is_nil() {
            match self.hash.swap_remove_entry(&key) {
                Some((k, v)) => Displaced {
                    value: Some(v),
                    key: Some(k),
                    key_inserted: false,
                },
                None => Displaced::default(),
            }
        } else {
            match self.hash.insert(key, value) {
                Some(old) => Displaced {
                    value: Some(old),
                    ..Default::default()
                },
                None => Displaced {
                    key_inserted: true,
                    ..Default::default()
                },
            }
        }
    }

    /// Remove an entry regardless of where it lives. Returns the stored key
    /// (for hash entries) and value.
    pub(crate) fn remove_entry(&mut self, key: &LuaValue) -> Option<(Option<LuaValue>, LuaValue)> {
        if let Some(i) = key.as_integer() {
            if i > 0 && ((i - 1) as usize) < self.array.len() {
                let idx = (i - 1) as usize;
                let old = std::mem::replace(&mut self.array[idx], LuaValue::nil());
                while self.array.last().is_some_and(LuaValue::is_nil) {
                    self.array.pop();
                }
                return (!old.is_nil()).then_some((None, old));
            }
        }
        self.hash.swap_remove_entry(key).map(|(k, v)| (Some(k), v))
    }

    /// Border of the array part
    #[inline]
    pub fn len(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Iteration order: array part, then hash part in insertion order
    pub fn next(&self, key: &LuaValue) -> Option<(LuaValue, LuaValue)> {
        let start = if key.is_nil() {
            0
        } else if let Some(i) = key.as_integer().filter(|i| *i > 0 && (*i as usize) <= self.array.len()) {
            i as usize
        } else {
            let pos = self.hash.get_index_of(key)?;
            return self.hash.get_index(pos + 1).map(|(k, v)| (*k, *v));
        };
        for j in start..self.array.len() {
            if !self.array[j].is_nil() {
                return Some((LuaValue::integer((j + 1) as i64), self.array[j]));
            }
        }
        self.hash.first().map(|(k, v)| (*k, *v))
    }

    /// All key/value pairs, array part first
    pub fn iter_all(&self) -> Vec<(LuaValue, LuaValue)> {
        let mut result = Vec::with_capacity(self.array.len() + self.hash.len());
        for (i, val) in self.array.iter().enumerate() {
            if !val.is_nil() {
                result.push((LuaValue::integer((i + 1) as i64), *val));
            }
        }
        for (k, v) in &self.hash {
            result.push((*k, *v));
        }
        result
    }

    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.capacity() * std::mem::size_of::<LuaValue>()
            + self.hash.capacity() * 2 * std::mem::size_of::<LuaValue>()
    }
}
