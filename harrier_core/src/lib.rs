//! Core data structures of harrier: the program model, the target
//! descriptor and the binary exec format shared with the executor.

pub mod arg;
pub mod exec;
pub mod prog;
pub mod syscall;
pub mod target;

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type HashSet<V> = rustc_hash::FxHashSet<V>;
