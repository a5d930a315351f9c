use std::hash::BuildHasherDefault;

pub use wyhash::WyHash;

#[inline(always)]
pub fn default_hasher() -> BuildHasherDefault<WyHash> {
    BuildHasherDefault::default()
}

pub type BuildHasher = BuildHasherDefault<WyHash>;

// Versions of HashMap and HashSet from std which use the wyhash hasher
// instead of the default SipHash hasher. Wyhash is faster but less secure;
// that's fine, since this compiler doesn't need cryptographically secure
// hashes, and also is not a server concerned about hash flooding attacks!
//
// Nothing that ends up in emitted IR may be driven by the iteration order of
// these maps; use VecMap / VecSet wherever order is observable.
pub type MutMap<K, V> = std::collections::HashMap<K, V, BuildHasher>;

pub type MutSet<K> = std::collections::HashSet<K, BuildHasher>;
