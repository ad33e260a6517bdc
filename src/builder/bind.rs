//! Bind collection and resolution.
//!
//! Every input dylib declares the external symbols it uses, either as a
//! chained-fixups import table (modern) or a BIND_* opcode stream (older).
//! This module collects each dylib's bind sites, resolves the targets
//! through two-level-namespace lookup in the dependents' export tries, and
//! classifies sites that live in GOT sections so the coalescer can unique
//! them. Writing the resolved pointers happens later, once the adjustor has
//! finished with the copied segments.

use std::collections::HashMap;

use tracing::debug;

use crate::builder::dylib::{BindTarget, BindTargetKind, CacheDylib};
use crate::diagnostics::Diagnostics;
use crate::macho::constants::*;
use crate::macho::context::MachImage;
use crate::macho::fixups::{
    chain_stride, parse_chained_imports, Arm64ePointer, ChainStarts, Generic64Pointer,
};
use crate::macho::trie::parse_export_trie;
use crate::macho::PointerMetaData;
use crate::types::VMOffset;
use crate::util::{read_sleb128, read_u64_le, read_uleb128};

/// Which uniqued GOT section a bind site feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotSectionKind {
    /// __DATA_CONST,__got
    Regular,
    /// __AUTH_CONST,__auth_got
    Auth,
}

/// One bind site: a pointer-sized slot that must receive a resolved target.
#[derive(Debug, Clone)]
pub struct BindSite {
    /// Index into the dylib's bind target array
    pub bind_index: usize,
    /// Segment holding the slot
    pub segment_index: usize,
    /// Offset of the slot within that segment
    pub segment_offset: u64,
    /// Pointer metadata from the fixup encoding
    pub pmd: PointerMetaData,
    /// Total addend (import-table addend plus any in-place addend)
    pub addend: i64,
    /// Set when the slot lives in a GOT section
    pub got: Option<GotSectionKind>,
    /// Offset of the slot within its GOT section, when `got` is set
    pub got_section_offset: u32,
}

/// A dylib's binds: the unique targets plus every site referencing them.
#[derive(Debug, Default)]
pub struct DylibBinds {
    /// Unique bind targets, referenced by site `bind_index`
    pub targets: Vec<BindTarget>,
    /// Load-command ordinal of each target's source dylib, parallel with
    /// `targets`; special ordinals are zero or negative
    pub lib_ordinals: Vec<i32>,
    /// All bind sites
    pub sites: Vec<BindSite>,
}

// =============================================================================
// GOT classification
// =============================================================================

struct GotSection {
    segment_index: usize,
    start_offset: u64,
    size: u64,
    kind: GotSectionKind,
}

fn got_sections(image: &MachImage) -> Vec<GotSection> {
    let mut sections = Vec::new();
    for (segment_index, segment) in image.segments().enumerate() {
        for section in &segment.sections {
            let kind = match (section.section.segment_name(), section.section.name()) {
                ("__DATA_CONST", "__got") => GotSectionKind::Regular,
                ("__AUTH_CONST", "__auth_got") => GotSectionKind::Auth,
                _ => continue,
            };
            sections.push(GotSection {
                segment_index,
                start_offset: section.section.addr - segment.command.vmaddr,
                size: section.section.size,
                kind,
            });
        }
    }
    sections
}

fn classify_got(
    sections: &[GotSection],
    segment_index: usize,
    segment_offset: u64,
) -> (Option<GotSectionKind>, u32) {
    for section in sections {
        if section.segment_index == segment_index
            && segment_offset >= section.start_offset
            && segment_offset < section.start_offset + section.size
        {
            return (
                Some(section.kind),
                (segment_offset - section.start_offset) as u32,
            );
        }
    }
    (None, 0)
}

// =============================================================================
// Collection
// =============================================================================

/// Collects every bind target and site of one input dylib.
pub fn collect_binds(image: &MachImage, diag: &mut Diagnostics, dylib_id: &str) -> DylibBinds {
    if image.linkedit_data(LC_DYLD_CHAINED_FIXUPS).is_some() {
        collect_chained_binds(image, diag, dylib_id)
    } else {
        collect_opcode_binds(image, diag, dylib_id)
    }
}

fn collect_chained_binds(
    image: &MachImage,
    diag: &mut Diagnostics,
    dylib_id: &str,
) -> DylibBinds {
    let blob = image
        .linkedit_data(LC_DYLD_CHAINED_FIXUPS)
        .expect("checked by caller");
    let Some(imports) = parse_chained_imports(blob) else {
        diag.error(format!("malformed chained fixup imports in {dylib_id}"));
        return DylibBinds::default();
    };
    let Some(starts) = ChainStarts::parse(blob) else {
        diag.error(format!("malformed chained fixup starts in {dylib_id}"));
        return DylibBinds::default();
    };

    // One bind target per import entry; sites reference them by ordinal
    let targets: Vec<BindTarget> = imports
        .iter()
        .map(|import| BindTarget {
            kind: BindTargetKind::Absolute { value: 0 }, // resolved later
            addend: import.addend,
            is_weak_import: import.weak_import,
            name: import.symbol_name.clone(),
        })
        .collect();
    let lib_ordinals: Vec<i32> = imports.iter().map(|import| import.lib_ordinal).collect();

    let gots = got_sections(image);
    let segments: Vec<_> = image.segments().collect();
    let mut sites = Vec::new();

    for (segment_index, seg_starts) in starts.segments.iter().enumerate() {
        let Some(seg_starts) = seg_starts else { continue };
        let Some(segment) = segments.get(segment_index) else {
            diag.error(format!("chain starts for missing segment in {dylib_id}"));
            break;
        };
        let stride = chain_stride(seg_starts.pointer_format);
        let seg_file_base = segment.command.fileoff as usize;
        let seg_file_size = segment.command.filesize;

        for (page_index, &page_start) in seg_starts.page_starts.iter().enumerate() {
            if page_start == DYLD_CHAINED_PTR_START_NONE
                || page_start & DYLD_CHAINED_PTR_START_MULTI != 0
            {
                // Multi-start pages are handled by the adjustor's chain
                // walk; binds on such pages are rare enough that we surface
                // them as a diagnostic rather than silently missing them
                if page_start != DYLD_CHAINED_PTR_START_NONE {
                    diag.error(format!(
                        "multi-start chain pages are not supported for binds in {dylib_id}"
                    ));
                    return DylibBinds { targets, lib_ordinals, sites };
                }
                continue;
            }

            let mut offset = page_index as u64 * seg_starts.page_size as u64 + page_start as u64;
            loop {
                if offset + 8 > seg_file_size {
                    diag.error(format!("bind chain runs off segment end in {dylib_id}"));
                    return DylibBinds { targets, lib_ordinals, sites };
                }
                let raw = read_u64_le(&image.data[seg_file_base + offset as usize..]);
                let next = match seg_starts.pointer_format {
                    DYLD_CHAINED_PTR_ARM64E
                    | DYLD_CHAINED_PTR_ARM64E_USERLAND
                    | DYLD_CHAINED_PTR_ARM64E_USERLAND24
                    | DYLD_CHAINED_PTR_ARM64E_KERNEL => {
                        let ptr = Arm64ePointer(raw);
                        if ptr.is_bind() {
                            let ordinal =
                                ptr.bind_ordinal(seg_starts.pointer_format) as usize;
                            if ordinal >= targets.len() {
                                diag.error(format!(
                                    "bind ordinal {ordinal} out of range in {dylib_id}"
                                ));
                                return DylibBinds { targets, lib_ordinals, sites };
                            }
                            let pmd = if ptr.is_auth() {
                                PointerMetaData::auth(
                                    ptr.auth_diversity(),
                                    ptr.auth_addr_div(),
                                    ptr.auth_key(),
                                )
                            } else {
                                PointerMetaData::PLAIN
                            };
                            let (got, got_section_offset) =
                                classify_got(&gots, segment_index, offset);
                            sites.push(BindSite {
                                bind_index: ordinal,
                                segment_index,
                                segment_offset: offset,
                                pmd,
                                addend: targets[ordinal].addend + ptr.bind_addend(),
                                got,
                                got_section_offset,
                            });
                        }
                        ptr.next()
                    }
                    DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                        let ptr = Generic64Pointer(raw);
                        if ptr.is_bind() {
                            let ordinal = ptr.bind_ordinal() as usize;
                            if ordinal >= targets.len() {
                                diag.error(format!(
                                    "bind ordinal {ordinal} out of range in {dylib_id}"
                                ));
                                return DylibBinds { targets, lib_ordinals, sites };
                            }
                            let (got, got_section_offset) =
                                classify_got(&gots, segment_index, offset);
                            sites.push(BindSite {
                                bind_index: ordinal,
                                segment_index,
                                segment_offset: offset,
                                pmd: PointerMetaData::PLAIN,
                                addend: targets[ordinal].addend + ptr.bind_addend(),
                                got,
                                got_section_offset,
                            });
                        }
                        ptr.next()
                    }
                    format => {
                        diag.error(format!(
                            "unknown chained fixup format {format} in {dylib_id}"
                        ));
                        return DylibBinds { targets, lib_ordinals, sites };
                    }
                };
                if next == 0 {
                    break;
                }
                offset += next * stride;
            }
        }
    }

    debug!(
        "collected {} chained bind sites across {} imports in {dylib_id}",
        sites.len(),
        targets.len()
    );
    DylibBinds { targets, lib_ordinals, sites }
}

fn collect_opcode_binds(
    image: &MachImage,
    diag: &mut Diagnostics,
    dylib_id: &str,
) -> DylibBinds {
    let Some(info) = image.dyld_info() else {
        return DylibBinds::default();
    };
    if info.bind_size == 0 {
        return DylibBinds::default();
    }
    let Some(stream) = image
        .data
        .get(info.bind_off as usize..(info.bind_off + info.bind_size) as usize)
    else {
        diag.error(format!("bind opcodes out of bounds in {dylib_id}"));
        return DylibBinds::default();
    };

    let gots = got_sections(image);
    let mut binds = DylibBinds::default();
    // (ordinal, name, addend) -> bind target index
    let mut target_indices: HashMap<(i64, String, i64), usize> = HashMap::new();

    let mut lib_ordinal = 0i64;
    let mut symbol_name = String::new();
    let mut weak_import = false;
    let mut addend = 0i64;
    let mut segment_index = 0usize;
    let mut segment_offset = 0u64;
    let pointer_size = 8u64;

    macro_rules! truncated {
        () => {{
            diag.error(format!("truncated bind opcodes in {dylib_id}"));
            return binds;
        }};
    }

    let do_bind =
        |binds: &mut DylibBinds,
         target_indices: &mut HashMap<(i64, String, i64), usize>,
         lib_ordinal: i64,
         symbol_name: &str,
         weak_import: bool,
         addend: i64,
         segment_index: usize,
         segment_offset: u64| {
            let key = (lib_ordinal, symbol_name.to_string(), addend);
            let bind_index = *target_indices.entry(key).or_insert_with(|| {
                binds.targets.push(BindTarget {
                    kind: BindTargetKind::Absolute { value: 0 }, // resolved later
                    addend,
                    is_weak_import: weak_import,
                    name: symbol_name.to_string(),
                });
                binds.lib_ordinals.push(lib_ordinal as i32);
                binds.targets.len() - 1
            });
            let (got, got_section_offset) = classify_got(&gots, segment_index, segment_offset);
            binds.sites.push(BindSite {
                bind_index,
                segment_index,
                segment_offset,
                pmd: PointerMetaData::PLAIN,
                addend,
                got,
                got_section_offset,
            });
        };

    let mut p = stream;
    loop {
        let Some((&byte, rest)) = p.split_first() else {
            break;
        };
        p = rest;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        let opcode = byte & BIND_OPCODE_MASK;
        match opcode {
            BIND_OPCODE_DONE => break,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => lib_ordinal = immediate as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let Some((value, used)) = read_uleb128(p) else { truncated!() };
                lib_ordinal = value as i64;
                p = &p[used..];
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // Sign-extend the 4-bit immediate for the special ordinals
                lib_ordinal = if immediate == 0 {
                    0
                } else {
                    (immediate as i64) | !0xF
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                weak_import = (immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT) != 0;
                let len = crate::util::memchr_null(p);
                symbol_name = String::from_utf8_lossy(&p[..len]).into_owned();
                p = &p[(len + 1).min(p.len())..];
            }
            BIND_OPCODE_SET_TYPE_IMM => {
                if immediate != BIND_TYPE_POINTER {
                    diag.error(format!(
                        "unsupported bind type {immediate} in {dylib_id}"
                    ));
                    return binds;
                }
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                let Some((value, used)) = read_sleb128(p) else { truncated!() };
                addend = value;
                p = &p[used..];
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = immediate as usize;
                let Some((value, used)) = read_uleb128(p) else { truncated!() };
                segment_offset = value;
                p = &p[used..];
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                let Some((value, used)) = read_uleb128(p) else { truncated!() };
                segment_offset = segment_offset.wrapping_add(value);
                p = &p[used..];
            }
            BIND_OPCODE_DO_BIND => {
                do_bind(
                    &mut binds,
                    &mut target_indices,
                    lib_ordinal,
                    &symbol_name,
                    weak_import,
                    addend,
                    segment_index,
                    segment_offset,
                );
                segment_offset += pointer_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                do_bind(
                    &mut binds,
                    &mut target_indices,
                    lib_ordinal,
                    &symbol_name,
                    weak_import,
                    addend,
                    segment_index,
                    segment_offset,
                );
                let Some((value, used)) = read_uleb128(p) else { truncated!() };
                segment_offset = segment_offset.wrapping_add(value) + pointer_size;
                p = &p[used..];
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                do_bind(
                    &mut binds,
                    &mut target_indices,
                    lib_ordinal,
                    &symbol_name,
                    weak_import,
                    addend,
                    segment_index,
                    segment_offset,
                );
                segment_offset += immediate as u64 * pointer_size + pointer_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let Some((count, used)) = read_uleb128(p) else { truncated!() };
                p = &p[used..];
                let Some((skip, used)) = read_uleb128(p) else { truncated!() };
                p = &p[used..];
                for _ in 0..count {
                    do_bind(
                        &mut binds,
                        &mut target_indices,
                        lib_ordinal,
                        &symbol_name,
                        weak_import,
                        addend,
                        segment_index,
                        segment_offset,
                    );
                    segment_offset += skip + pointer_size;
                }
            }
            BIND_OPCODE_THREADED => {
                diag.error(format!(
                    "threaded bind opcodes are handled via split seg in {dylib_id}"
                ));
                return binds;
            }
            _ => {
                diag.error(format!(
                    "unknown bind opcode {opcode:#04x} in {dylib_id}"
                ));
                return binds;
            }
        }
    }

    debug!(
        "collected {} opcode bind sites across {} targets in {dylib_id}",
        binds.sites.len(),
        binds.targets.len()
    );
    binds
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolves each bind target's symbol through the dependents' export tries.
///
/// `images` holds the parsed inputs, index-parallel with the dylib arena.
/// Unresolvable weak imports become absolute zero; unresolvable strong
/// imports are diagnostics.
pub fn resolve_bind_targets(
    binds: &mut DylibBinds,
    dylib: &CacheDylib,
    images: &[MachImage],
    diag: &mut Diagnostics,
) {
    // Export lookups repeat heavily (every dylib binds _malloc); cache per
    // (target, name)
    let mut lookup_cache: HashMap<(usize, String), Option<u64>> = HashMap::new();

    assert_eq!(binds.targets.len(), binds.lib_ordinals.len());
    for (target, &lib_ordinal) in binds.targets.iter_mut().zip(&binds.lib_ordinals) {
        let name = target.name.clone();
        let resolved = resolve_one(&name, lib_ordinal, dylib, images, &mut lookup_cache);
        match resolved {
            Some((dylib_index, offset)) => {
                target.kind = BindTargetKind::CacheImage {
                    target_runtime_offset: VMOffset::new(offset),
                    dylib_index,
                    is_weak_def: false,
                    is_function_variant: false,
                };
            }
            None if target.is_weak_import => {
                target.kind = BindTargetKind::Absolute { value: 0 };
            }
            None => {
                diag.error(format!(
                    "undefined symbol {name} bound by {}",
                    dylib.install_name
                ));
            }
        }
    }
}

fn lookup_export(
    dependent_index: usize,
    name: &str,
    images: &[MachImage],
    cache: &mut HashMap<(usize, String), Option<u64>>,
) -> Option<u64> {
    let key = (dependent_index, name.to_string());
    *cache.entry(key).or_insert_with(|| {
        let image = &images[dependent_index];
        let trie = image.export_trie()?;
        let exports = parse_export_trie(trie).ok()?;
        exports
            .iter()
            .find(|entry| entry.name == name && !entry.is_reexport())
            .map(|entry| entry.address)
    })
}

fn resolve_one(
    name: &str,
    lib_ordinal: i32,
    dylib: &CacheDylib,
    images: &[MachImage],
    cache: &mut HashMap<(usize, String), Option<u64>>,
) -> Option<(usize, u64)> {
    if lib_ordinal >= 1 {
        // Two-level namespace: the ordinal picks the dependent directly
        let dependent = dylib.dependents.get(lib_ordinal as usize - 1)?;
        let dependent_index = dependent.dylib_index?;
        let offset = lookup_export(dependent_index, name, images, cache)?;
        return Some((dependent_index, offset));
    }

    // Special ordinals (self, flat, weak lookup): fall back to searching
    // the dependents in load order
    for dependent in &dylib.dependents {
        let Some(dependent_index) = dependent.dylib_index else {
            continue;
        };
        if let Some(offset) = lookup_export(dependent_index, name, images, cache) {
            return Some((dependent_index, offset));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::write_uleb128;

    fn opcode_stream(binds: &[(u8, &str, u64, u64)]) -> Vec<u8> {
        // (ordinal, symbol, segment_index, segment_offset)
        let mut out = Vec::new();
        for &(ordinal, symbol, segment_index, segment_offset) in binds {
            out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
            out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
            out.extend_from_slice(symbol.as_bytes());
            out.push(0);
            out.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment_index as u8);
            write_uleb128(segment_offset, &mut out);
            out.push(BIND_OPCODE_DO_BIND);
        }
        out.push(BIND_OPCODE_DONE);
        out
    }

    #[test]
    fn test_opcode_stream_shape() {
        let stream = opcode_stream(&[(1, "_foo", 1, 0x40), (1, "_foo", 1, 0x80)]);
        // SET_DYLIB, SET_SYMBOL + "_foo\0", SET_TYPE, SET_SEGMENT + uleb,
        // DO_BIND, twice, then DONE
        assert_eq!(stream[0], BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
        assert_eq!(*stream.last().unwrap(), BIND_OPCODE_DONE);
    }

    #[test]
    fn test_classify_got() {
        let sections = vec![GotSection {
            segment_index: 1,
            start_offset: 0x100,
            size: 0x40,
            kind: GotSectionKind::Regular,
        }];
        assert_eq!(classify_got(&sections, 1, 0x100), (Some(GotSectionKind::Regular), 0));
        assert_eq!(classify_got(&sections, 1, 0x138), (Some(GotSectionKind::Regular), 0x38));
        assert_eq!(classify_got(&sections, 1, 0x140), (None, 0));
        assert_eq!(classify_got(&sections, 0, 0x100), (None, 0));
    }

    #[test]
    fn test_chained_import_bind_fields() {
        // generic64 bind: bind=1, next=2, addend=5, ordinal=7
        let raw = (1u64 << 63) | (2u64 << 51) | (5u64 << 24) | 7;
        let ptr = Generic64Pointer(raw);
        assert!(ptr.is_bind());
        assert_eq!(ptr.next(), 2);
        assert_eq!(ptr.bind_ordinal(), 7);
        assert_eq!(ptr.bind_addend(), 5);
    }

    #[test]
    fn test_arm64e_auth_bind_fields() {
        // auth bind: auth=1 bind=1 next=1 key=1 addrDiv=1 diversity=0x1234 ordinal=3
        let raw = (1u64 << 63)
            | (1u64 << 62)
            | (1u64 << 51)
            | (1u64 << 49)
            | (1u64 << 48)
            | (0x1234u64 << 32)
            | 3;
        let ptr = Arm64ePointer(raw);
        assert!(ptr.is_auth());
        assert!(ptr.is_bind());
        assert_eq!(ptr.bind_ordinal(DYLD_CHAINED_PTR_ARM64E), 3);
        assert_eq!(ptr.bind_addend(), 0);
        assert_eq!(ptr.auth_diversity(), 0x1234);
    }
}
