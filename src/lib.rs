//! dylink - a shared library cache link editor.
//!
//! This library merges a set of relocatable dylibs into a single contiguous,
//! prelinked cache image: segments are copied into shared regions, every
//! pointer is rewritten for its new address and tracked for ASLR, GOT slots
//! binding the same symbol are deduplicated cache-wide, and a patch table
//! records every cross-dylib reference so individual dylibs can be
//! overridden later without rebuilding the image.
//!
//! # Pipeline
//!
//! 1. **Placement** - segments and linkedit pieces are copied into regions
//! 2. **Bind resolution** - imports resolve via two-level-namespace lookup
//! 3. **Coalescing** - GOT slots and interned strings deduplicate
//! 4. **Adjustment** - fixups, symbol tables, export tries and load
//!    commands are rewritten for the new layout
//! 5. **Binding** - resolved pointers are written in packed form
//! 6. **Patch table** - the cache-global reverse index is emitted
//!
//! # Example
//!
//! ```no_run
//! use dylink::{BuilderConfig, CacheBuilder};
//!
//! fn main() -> dylink::Result<()> {
//!     let mut builder = CacheBuilder::new(BuilderConfig::default());
//!     builder.add_dylib(std::fs::read("libA.dylib")?)?;
//!     builder.add_dylib(std::fs::read("libB.dylib")?)?;
//!
//!     let cache = builder.build()?;
//!     std::fs::write("cache.bin", cache.serialize())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod macho;
pub mod types;
pub mod util;

// Re-export main types
pub use builder::{BuiltCache, CacheBuilder};
pub use config::{BuilderConfig, PointerFormat};
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use macho::MachImage;
pub use types::{CacheVMAddress, InputVMAddress, VMOffset};
