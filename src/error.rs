//! Error types for the cache link editor.
//!
//! Two kinds of failure exist in the builder. Malformed input in a single
//! dylib is accumulated in a [`crate::diagnostics::Diagnostics`] sink so that
//! one bad image does not abort the whole build. The errors in this module
//! cover everything else: I/O, capacity violations, and precondition failures
//! surfaced to the caller as typed values.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for cache building operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("unsupported Mach-O file type: {0}")]
    UnsupportedMachoType(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("string table offset {offset} out of bounds (size: {size})")]
    StringTableOverflow { offset: u32, size: u32 },

    // ==================== Layout Errors ====================
    #[error("dylib '{name}' has no segments")]
    NoSegments { name: String },

    #[error("segment count mismatch for '{name}': {expected} placed, {actual} in image")]
    SegmentCountMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("chunk at VM address {addr:#x} not contained in any region")]
    ChunkOutsideRegions { addr: u64 },

    // ==================== Capacity Errors ====================
    #[error("patch table too large: need {needed} bytes, reserved {reserved}")]
    PatchTableOverflow { needed: usize, reserved: usize },

    #[error("rebuilt export trie too large for '{name}': need {needed} bytes, reserved {reserved}")]
    ExportTrieOverflow {
        name: String,
        needed: usize,
        reserved: usize,
    },

    // ==================== Precondition Errors ====================
    #[error("mismatched patch info: {dylibs} dylibs but {infos} patch info records")]
    PatchInfoMismatch { dylibs: usize, infos: usize },

    #[error("unknown patch table version: {0}")]
    UnknownPatchTableVersion(u32),

    // ==================== Dylib Adjustment ====================
    /// One or more dylibs failed adjustment; details live in their
    /// diagnostics sinks.
    #[error("adjustment failed for {count} dylib(s); first: {first}")]
    AdjustmentFailed { count: usize, first: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for cache building operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
