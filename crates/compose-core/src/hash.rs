use core::hash::Hash;
use std::hash::Hasher;

use crate::slot_table::Key;

#[cfg(feature = "std-hash")]
pub mod default {
    pub use std::collections::hash_map::DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::new()
    }
}

#[cfg(not(feature = "std-hash"))]
pub mod default {
    pub use ahash::AHasher as DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::default()
    }
}

/// Hash a single value with whichever default hasher is active.
#[inline]
pub fn hash_one<T: Hash + ?Sized>(v: &T) -> u64 {
    let mut h = default::new();
    v.hash(&mut h);
    h.finish()
}

/// Structural key for a call site.
pub fn location_key(file: &str, line: u32, column: u32) -> Key {
    hash_one(&(file, line, column))
}

/// Explicit identity key supplied by the caller, e.g. a list item id.
pub fn data_key<K: Hash + ?Sized>(key: &K) -> Key {
    hash_one(key)
}

/// Structural key of the invocation site.
#[macro_export]
macro_rules! call_site_key {
    () => {
        $crate::hash::location_key(file!(), line!(), column!())
    };
}
