//! Mach-O constants.
//!
//! Load command types, section types and attributes, symbol table flags,
//! rebase opcodes, chained fixup formats, and the split-seg reference kinds
//! consumed by the segment adjustor.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian).
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

/// Dylib file type.
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic linker file type.
pub const MH_DYLINKER: u32 = 0x7;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit ABI flag.
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// x86_64.
pub const CPU_TYPE_X86_64: u32 = 7 | CPU_ARCH_ABI64;
/// 32-bit ARM.
pub const CPU_TYPE_ARM: u32 = 12;
/// 64-bit ARM.
pub const CPU_TYPE_ARM64: u32 = 12 | CPU_ARCH_ABI64;
/// arm64e CPU subtype.
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Flag requiring dyld to understand the command.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Symbol table.
pub const LC_SYMTAB: u32 = 0x2;
/// Unix thread state (register values for an executable's entry).
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Dynamic symbol table.
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dylib.
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dylib identification.
pub const LC_ID_DYLIB: u32 = 0xD;
/// Weakly load a dylib.
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment.
pub const LC_SEGMENT_64: u32 = 0x19;
/// 64-bit routines (shared library init).
pub const LC_ROUTINES_64: u32 = 0x1A;
/// UUID.
pub const LC_UUID: u32 = 0x1B;
/// Runpath addition.
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Code signature.
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Split segment info.
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Re-export a dylib.
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Compressed dyld info.
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info (dyld required).
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Upward dylib load.
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Function starts table.
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Data-in-code table.
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Code signing DRs copied from linked dylibs.
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// Exports trie (linkedit_data_command payload).
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups (linkedit_data_command payload).
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Section Types
// =============================================================================

/// Mask for the section type bits.
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Regular section.
pub const S_REGULAR: u32 = 0x0;
/// Zero fill on demand.
pub const S_ZEROFILL: u32 = 0x1;
/// Section with literal C strings.
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// Section with non-lazy symbol pointers (GOT).
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Section with lazy symbol pointers.
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Section with symbol stubs.
pub const S_SYMBOL_STUBS: u32 = 0x8;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry.
pub const N_STAB: u8 = 0xE0;
/// Mask for the type bits.
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit.
pub const N_EXT: u8 = 0x01;
/// Undefined symbol.
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol.
pub const N_ABS: u8 = 0x2;
/// Defined in section number n_sect.
pub const N_SECT: u8 = 0xE;
/// Symbol is not in any section.
pub const NO_SECT: u8 = 0;

// =============================================================================
// VM Protection
// =============================================================================

/// Read permission.
pub const VM_PROT_READ: u32 = 0x1;
/// Write permission.
pub const VM_PROT_WRITE: u32 = 0x2;
/// Execute permission.
pub const VM_PROT_EXECUTE: u32 = 0x4;

// =============================================================================
// Rebase Opcodes
// =============================================================================

/// Rebase type: pointer.
pub const REBASE_TYPE_POINTER: u8 = 1;
/// Rebase type: 32-bit absolute address embedded in text.
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
/// Rebase type: 32-bit PC-relative address embedded in text.
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

/// Mask for the opcode bits.
pub const REBASE_OPCODE_MASK: u8 = 0xF0;
/// Mask for the immediate bits.
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
/// End of the rebase stream.
pub const REBASE_OPCODE_DONE: u8 = 0x00;
/// Set the rebase type from the immediate.
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
/// Set segment index (immediate) and offset (uleb).
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
/// Advance the offset by a uleb delta.
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
/// Advance the offset by immediate * pointer size.
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
/// Rebase immediate-many pointers.
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
/// Rebase uleb-many pointers.
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
/// Rebase one pointer then advance by a uleb delta.
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
/// Rebase uleb-many pointers with a uleb skip between each.
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

// =============================================================================
// Chained Fixup Formats
// =============================================================================

/// arm64e, target is a VM address.
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
/// Generic 64-bit, target is a VM address.
pub const DYLD_CHAINED_PTR_64: u16 = 2;
/// Generic 32-bit.
pub const DYLD_CHAINED_PTR_32: u16 = 3;
/// Generic 64-bit, target is a VM offset from the image base.
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
/// arm64e kernel/firmware, 4-byte stride, target is a VM offset.
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
/// arm64e userland, target is a VM offset.
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
/// arm64e userland with 24-bit bind ordinals.
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Page has no fixups.
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
/// Page has multiple chain starts.
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;

/// Import table entry format: 32-bit entries.
pub const DYLD_CHAINED_IMPORT: u32 = 1;
/// Import table entry format: 64-bit entries with addend.
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
/// Import table entry format: 64-bit entries with 64-bit addend.
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

// =============================================================================
// Bind Opcodes
// =============================================================================

/// Bind type: pointer.
pub const BIND_TYPE_POINTER: u8 = 1;

/// Special ordinal: bind to the containing image.
pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
/// Special ordinal: bind to the main executable.
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
/// Special ordinal: flat namespace lookup.
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
/// Special ordinal: weak lookup.
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;

/// Weak import flag on BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM.
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

/// Mask for the opcode bits.
pub const BIND_OPCODE_MASK: u8 = 0xF0;
/// Mask for the immediate bits.
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
/// End of the bind stream.
pub const BIND_OPCODE_DONE: u8 = 0x00;
/// Set dylib ordinal from the immediate.
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
/// Set dylib ordinal from a uleb.
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
/// Set special dylib ordinal from the immediate.
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
/// Set symbol name (trailing C string) and flags.
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
/// Set bind type from the immediate.
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
/// Set addend from a sleb.
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
/// Set segment index (immediate) and offset (uleb).
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
/// Advance the offset by a uleb delta.
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
/// Bind at the current location.
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
/// Bind then advance by a uleb delta.
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
/// Bind then advance by immediate * pointer size.
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
/// Bind uleb-many times with a uleb skip between each.
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
/// Threaded bind sub-opcodes.
pub const BIND_OPCODE_THREADED: u8 = 0xD0;

// =============================================================================
// Split Seg Info V2
// =============================================================================

/// Leading format byte of a v2 split-seg-info blob.
pub const DYLD_CACHE_ADJ_V2_FORMAT: u8 = 0x7F;

/// 32-bit pointer reference.
pub const DYLD_CACHE_ADJ_V2_POINTER_32: u64 = 0x01;
/// 64-bit pointer reference.
pub const DYLD_CACHE_ADJ_V2_POINTER_64: u64 = 0x02;
/// 32-bit delta between two locations.
pub const DYLD_CACHE_ADJ_V2_DELTA_32: u64 = 0x03;
/// 64-bit delta between two locations.
pub const DYLD_CACHE_ADJ_V2_DELTA_64: u64 = 0x04;
/// ARM64 ADRP page-relative immediate.
pub const DYLD_CACHE_ADJ_V2_ARM64_ADRP: u64 = 0x05;
/// ARM64 scaled 12-bit load/store/add page offset.
pub const DYLD_CACHE_ADJ_V2_ARM64_OFF12: u64 = 0x06;
/// ARM64 26-bit branch immediate.
pub const DYLD_CACHE_ADJ_V2_ARM64_BR26: u64 = 0x07;
/// ARM MOVW/MOVT pair.
pub const DYLD_CACHE_ADJ_V2_ARM_MOVW_MOVT: u64 = 0x08;
/// ARM 24-bit branch.
pub const DYLD_CACHE_ADJ_V2_ARM_BR24: u64 = 0x09;
/// Thumb MOVW/MOVT pair.
pub const DYLD_CACHE_ADJ_V2_THUMB_MOVW_MOVT: u64 = 0x0A;
/// Thumb 22-bit branch.
pub const DYLD_CACHE_ADJ_V2_THUMB_BR22: u64 = 0x0B;
/// 32-bit offset from the image's first segment.
pub const DYLD_CACHE_ADJ_V2_IMAGE_OFF_32: u64 = 0x0C;
/// 64-bit pointer participating in a threaded-rebase chain.
pub const DYLD_CACHE_ADJ_V2_THREADED_POINTER_64: u64 = 0x0D;

/// Highest valid split-seg v2 kind.
pub const DYLD_CACHE_ADJ_V2_MAX_KIND: u64 = 0x0D;

// =============================================================================
// Export Trie Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
/// Regular export.
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags used by the builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references.
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker.
        const DYLDLINK = 0x4;
        /// The file has its read-only and read-write segments split.
        const SPLIT_SEGS = 0x20;
        /// The image is using two-level name space bindings.
        const TWOLEVEL = 0x80;
        /// The final linked image contains external weak symbols.
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols.
        const BINDS_TO_WEAK = 0x10000;
        /// The OS will load the main executable at a random address.
        const PIE = 0x200000;
        /// The dylib is part of the shared cache and has been processed by
        /// the builder.
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
