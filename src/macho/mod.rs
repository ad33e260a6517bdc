//! Mach-O parsing and binary structures.

pub mod constants;
pub mod context;
pub mod fixups;
pub mod structs;
pub mod trie;

pub use constants::*;
pub use context::*;
pub use fixups::*;
pub use structs::*;
pub use trie::*;
