//! Segment adjustment.
//!
//! When a dylib's segments are copied into the cache they land at new
//! addresses, usually with different slides per segment. This module rewrites
//! everything inside the copied image that encodes an address: data pointers,
//! instruction-embedded references, the symbol table, the export trie, and
//! finally the load commands themselves.
//!
//! Three generations of fixup encoding exist in input binaries, each with a
//! disjoint patch algorithm:
//!
//! 1. split-seg-info v2 (modern): every cross-section reference is described
//!    explicitly, including instruction fixups
//! 2. chained fixups without split-seg v2 (older images): rebase chains are
//!    walked directly, plus v1 code fixups
//! 3. opcode-based rebases (oldest): the REBASE_* opcode stream is replayed

use zerocopy::{FromBytes, IntoBytes};

use crate::builder::coalescer::{CoalescedSectionKind, DylibSectionCoalescer};
use crate::builder::dylib::{CacheDylib, MovedLinkeditKind};
use crate::builder::region::Region;
use crate::builder::split_seg::{self, SplitSegReference};
use crate::config::BuilderConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::fixups::{chain_stride, Arm64ePointer, ChainStarts, Generic64Pointer};
use crate::macho::structs::*;
use crate::macho::trie::{emit_export_trie, parse_export_trie};
use crate::types::{CacheVMAddress, VMOffset};
use crate::util::{read_u32_le, read_u64_le, read_uleb128, write_u32_le, write_u64_le};

/// Base addresses of the shared coalesced chunks, for redirecting references
/// whose targets were uniqued away from this dylib.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoalescedChunkAddresses {
    /// __objc_classname strings chunk
    pub objc_class_names: Option<CacheVMAddress>,
    /// __objc_methname strings chunk
    pub objc_meth_names: Option<CacheVMAddress>,
    /// __objc_methtype strings chunk
    pub objc_meth_types: Option<CacheVMAddress>,
    /// uniqued GOTs chunk
    pub gots: Option<CacheVMAddress>,
    /// uniqued auth GOTs chunk
    pub auth_gots: Option<CacheVMAddress>,
}

impl CoalescedChunkAddresses {
    fn base_for(&self, kind: CoalescedSectionKind) -> Option<CacheVMAddress> {
        match kind {
            CoalescedSectionKind::ObjcClassNames => self.objc_class_names,
            CoalescedSectionKind::ObjcMethodNames => self.objc_meth_names,
            CoalescedSectionKind::ObjcMethodTypes => self.objc_meth_types,
            CoalescedSectionKind::Gots => self.gots,
            CoalescedSectionKind::AuthGots => self.auth_gots,
        }
    }
}

/// The fixup blobs captured from the input dylib's linkedit before it was
/// dropped from the cache copy.
#[derive(Debug, Default)]
pub struct AdjustorInputs {
    /// LC_DYLD_CHAINED_FIXUPS payload
    pub chained_fixups: Option<Vec<u8>>,
    /// LC_SEGMENT_SPLIT_INFO payload
    pub split_seg_info: Option<Vec<u8>>,
    /// Rebase opcode stream from LC_DYLD_INFO
    pub rebase_opcodes: Option<Vec<u8>>,
}

/// MOVW/MOVT instructions arrive as two consecutive references to the same
/// target; the patcher needs the previous one to stitch the 32-bit value.
#[derive(Default)]
struct PairState {
    last_kind: u64,
    last_to_new_address: u64,
    last_location: Option<(usize, usize)>,
}

/// Per-section data for the split-seg walk: where the section's copy lives,
/// how far it slid, and whether its contents were coalesced away.
#[derive(Debug, Clone, Copy)]
struct SectionMapping {
    region_index: usize,
    region_offset: usize,
    slide: i64,
    new_address: u64,
    original_address: u64,
    coalesced: Option<CoalescedSectionKind>,
    coalesced_removed: bool,
}

/// Rewrites one copied dylib for its new segment locations.
pub struct SegmentAdjustor<'a> {
    diag: &'a mut Diagnostics,
    dylib: &'a CacheDylib,
    cache_base: CacheVMAddress,
    mask_pointers: bool,
    dylib_id: &'a str,

    header: MachHeader64,
    seg_orig_addresses: Vec<u64>,
    seg_orig_sizes: Vec<u64>,
    seg_slides: Vec<i64>,
    chained_fixups_format: u16,
    split_seg_v2: bool,

    inputs: AdjustorInputs,
}

impl<'a> SegmentAdjustor<'a> {
    /// Scans the copied dylib's load commands and relocates the linkedit
    /// load commands to their new placement. The copied image must already
    /// be in its regions.
    pub fn new(
        diag: &'a mut Diagnostics,
        config: &BuilderConfig,
        dylib: &'a CacheDylib,
        inputs: AdjustorInputs,
        regions: &mut [Region],
    ) -> Self {
        let header_bytes = Self::segment_bytes(regions, dylib, 0);
        let header = MachHeader64::read_from_prefix(header_bytes)
            .expect("copied dylib has no header")
            .0;
        assert!(header.is_valid(), "copied dylib has invalid magic");

        let mut adjustor = Self {
            diag,
            dylib,
            cache_base: config.cache_base_address,
            mask_pointers: false,
            dylib_id: &dylib.install_name,
            header,
            seg_orig_addresses: Vec::new(),
            seg_orig_sizes: Vec::new(),
            seg_slides: Vec::new(),
            chained_fixups_format: 0,
            split_seg_v2: false,
            inputs,
        };

        adjustor.mask_pointers = header.is_arm64();
        adjustor.scan_load_commands(regions);

        if let Some(split_seg) = &adjustor.inputs.split_seg_info {
            adjustor.split_seg_v2 = split_seg::is_v2(split_seg);
        } else {
            adjustor
                .diag
                .error(format!("missing LC_SEGMENT_SPLIT_INFO in {}", adjustor.dylib_id));
        }

        // Old arm64e binaries use threaded rebase without LC_DYLD_CHAINED_FIXUPS
        if adjustor.chained_fixups_format == 0 && header.is_arm64e() {
            adjustor.chained_fixups_format = DYLD_CHAINED_PTR_ARM64E;
        }

        adjustor
    }

    // =========================================================================
    // Region access helpers
    // =========================================================================

    fn segment_bytes<'r>(regions: &'r [Region], dylib: &CacheDylib, seg_index: usize) -> &'r [u8] {
        let seg = &dylib.segments[seg_index];
        let start = seg.region_offset;
        let end = start + seg.cache_file_size.raw() as usize;
        &regions[seg.region_index].buffer[start..end]
    }

    fn segment_bytes_mut<'r>(
        regions: &'r mut [Region],
        dylib: &CacheDylib,
        seg_index: usize,
    ) -> &'r mut [u8] {
        let seg = &dylib.segments[seg_index];
        let start = seg.region_offset;
        let end = start + seg.cache_file_size.raw() as usize;
        &mut regions[seg.region_index].buffer[start..end]
    }

    fn linkedit_bytes_mut<'r>(
        regions: &'r mut [Region],
        dylib: &CacheDylib,
        kind: MovedLinkeditKind,
    ) -> &'r mut [u8] {
        let moved = dylib
            .linkedit
            .get(&kind)
            .unwrap_or_else(|| panic!("linkedit piece {kind:?} was not placed"));
        let start = moved.region_offset;
        let end = start + moved.size as usize;
        &mut regions[moved.region_index].buffer[start..end]
    }

    // =========================================================================
    // Load command scan
    // =========================================================================

    fn moved_linkedit_placement(&self, kind: MovedLinkeditKind) -> (u32, u32) {
        let moved = self
            .dylib
            .linkedit
            .get(&kind)
            .unwrap_or_else(|| panic!("linkedit piece {kind:?} was not placed"));
        (moved.cache_file_offset.raw() as u32, moved.size)
    }

    fn scan_load_commands(&mut self, regions: &mut [Region]) {
        let nlist_info = self.dylib.nlist_info;
        let ncmds = self.header.ncmds;

        // Collected first, then patched, so the header slice is only
        // borrowed mutably once
        let mut seg_records: Vec<(u64, u64)> = Vec::new();

        let header_bytes = Self::segment_bytes_mut(regions, self.dylib, 0);
        let mut offset = MachHeader64::SIZE;
        for _ in 0..ncmds {
            let lc = LoadCommand::read_from_prefix(&header_bytes[offset..]).unwrap().0;
            match lc.cmd {
                LC_SYMTAB => {
                    let mut cmd = SymtabCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let (nlist_off, nlist_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::SymbolNlist);
                    assert_eq!(nlist_size as usize % Nlist64::SIZE, 0);
                    cmd.symoff = nlist_off;
                    cmd.nsyms = nlist_size / Nlist64::SIZE as u32;
                    let (str_off, str_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::SymbolStrings);
                    cmd.stroff = str_off;
                    cmd.strsize = str_size;
                    header_bytes[offset..offset + SymtabCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYSYMTAB => {
                    let mut cmd = DysymtabCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    // The nlist was re-partitioned when linkedit was merged
                    cmd.ilocalsym = nlist_info.locals_start_index;
                    cmd.nlocalsym = nlist_info.locals_count;
                    cmd.iextdefsym = nlist_info.globals_start_index;
                    cmd.nextdefsym = nlist_info.globals_count;
                    cmd.iundefsym = nlist_info.undefs_start_index;
                    cmd.nundefsym = nlist_info.undefs_count;

                    if cmd.indirectsymoff != 0 {
                        let (ind_off, ind_size) =
                            self.moved_linkedit_placement(MovedLinkeditKind::IndirectSymbols);
                        assert_eq!(ind_size % 4, 0);
                        cmd.indirectsymoff = ind_off;
                        cmd.nindirectsyms = ind_size / 4;
                    }
                    header_bytes[offset..offset + DysymtabCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let mut cmd = DyldInfoCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    // Rebases and binds are consumed by the build; only the
                    // exports trie survives
                    cmd.rebase_off = 0;
                    cmd.rebase_size = 0;
                    cmd.bind_off = 0;
                    cmd.bind_size = 0;
                    cmd.lazy_bind_off = 0;
                    cmd.lazy_bind_size = 0;
                    cmd.weak_bind_off = 0;
                    cmd.weak_bind_size = 0;
                    let (trie_off, trie_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::ExportTrie);
                    cmd.export_off = trie_off;
                    cmd.export_size = trie_size;
                    header_bytes[offset..offset + DyldInfoCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYLD_EXPORTS_TRIE => {
                    let mut cmd = LinkeditDataCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let (trie_off, trie_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::ExportTrie);
                    cmd.dataoff = trie_off;
                    cmd.datasize = trie_size;
                    header_bytes[offset..offset + LinkeditDataCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_FUNCTION_STARTS => {
                    let mut cmd = LinkeditDataCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let (data_off, data_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::FunctionStarts);
                    cmd.dataoff = data_off;
                    cmd.datasize = data_size;
                    header_bytes[offset..offset + LinkeditDataCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DATA_IN_CODE => {
                    let mut cmd = LinkeditDataCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let (data_off, data_size) =
                        self.moved_linkedit_placement(MovedLinkeditKind::DataInCode);
                    cmd.dataoff = data_off;
                    cmd.datasize = data_size;
                    header_bytes[offset..offset + LinkeditDataCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYLD_CHAINED_FIXUPS => {
                    // The payload was captured before the copy; the command
                    // itself is removed during the rebuild phase
                    assert!(self.inputs.chained_fixups.is_some());
                }
                LC_SEGMENT_SPLIT_INFO => {
                    assert!(self.inputs.split_seg_info.is_some());
                }
                LC_SEGMENT_64 => {
                    let cmd = SegmentCommand64::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    seg_records.push((cmd.vmaddr, cmd.vmsize));
                }
                _ => {}
            }
            offset += lc.cmdsize as usize;
        }

        for (seg_index, (vmaddr, vmsize)) in seg_records.into_iter().enumerate() {
            self.seg_orig_addresses.push(vmaddr);
            self.seg_orig_sizes.push(vmsize);
            self.seg_slides
                .push(self.dylib.segments[seg_index].cache_vm_address.raw() as i64 - vmaddr as i64);
        }

        if let Some(blob) = &self.inputs.chained_fixups {
            if let Some(starts) = ChainStarts::parse(blob) {
                self.chained_fixups_format = starts.pointer_format();
            } else {
                self.diag
                    .error(format!("malformed chained fixups in {}", self.dylib_id));
            }
        }
    }

    // =========================================================================
    // Top level
    // =========================================================================

    /// Runs every adjustment phase. Malformed-input problems land in the
    /// diagnostics sink; the typed error return is reserved for capacity
    /// violations.
    pub fn adjust_image_for_new_segment_locations(
        &mut self,
        regions: &mut [Region],
        coalescer: Option<&DylibSectionCoalescer>,
        chunk_addrs: &CoalescedChunkAddresses,
    ) -> Result<()> {
        if self.diag.has_error() {
            return Ok(());
        }

        if self.split_seg_v2 {
            self.adjust_references_v2(regions, coalescer, chunk_addrs);
        } else if self.inputs.chained_fixups.is_some() {
            self.adjust_rebase_chains(regions);
            self.adjust_code(regions);
        } else {
            self.adjust_data_pointers(regions);
            self.adjust_code(regions);
        }
        if self.diag.has_error() {
            return Ok(());
        }

        self.adjust_symbol_table(regions);
        if self.diag.has_error() {
            return Ok(());
        }

        self.rebuild_linkedit_and_load_commands(regions, coalescer)
    }

    // =========================================================================
    // Slides
    // =========================================================================

    fn slide_for_orig_address(&mut self, addr: u64) -> i64 {
        for (index, &orig) in self.seg_orig_addresses.iter().enumerate() {
            if addr >= orig && addr < orig + self.seg_orig_sizes[index] {
                return self.seg_slides[index];
            }
        }
        // On arm64, the high nibble of a pointer can carry tag bits
        if self.mask_pointers && (addr & 0xF000_0000_0000_0000) != 0 {
            return self.slide_for_orig_address(addr & 0x0FFF_FFFF_FFFF_FFFF);
        }
        self.diag.error(format!(
            "slide not known for dylib address {addr:#x} in {}",
            self.dylib_id
        ));
        0
    }

    // =========================================================================
    // Split-seg v2
    // =========================================================================

    fn build_section_table(
        &self,
        coalescer: Option<&DylibSectionCoalescer>,
        regions: &[Region],
    ) -> (Vec<SectionMapping>, u64, u64) {
        let mut table = Vec::with_capacity(16);

        // Section index 0 refers to the mach header
        let seg0 = &self.dylib.segments[0];
        table.push(SectionMapping {
            region_index: seg0.region_index,
            region_offset: seg0.region_offset,
            slide: self.seg_slides[0],
            new_address: seg0.cache_vm_address.raw(),
            original_address: self.seg_orig_addresses[0],
            coalesced: None,
            coalesced_removed: false,
        });

        let image_start = seg0.cache_vm_address.raw();
        let mut image_end = 0u64;

        let header_bytes = Self::segment_bytes(regions, self.dylib, 0);
        let mut offset = MachHeader64::SIZE;
        let mut seg_index = 0usize;
        for _ in 0..self.header.ncmds {
            let lc = LoadCommand::read_from_prefix(&header_bytes[offset..]).unwrap().0;
            if lc.cmd == LC_SEGMENT_64 {
                let cmd = SegmentCommand64::read_from_prefix(&header_bytes[offset..])
                    .unwrap()
                    .0;
                let moved = &self.dylib.segments[seg_index];
                for sect_index in 0..cmd.nsects as usize {
                    let sect_offset =
                        offset + SegmentCommand64::SIZE + sect_index * Section64::SIZE;
                    let sect = Section64::read_from_prefix(&header_bytes[sect_offset..])
                        .unwrap()
                        .0;

                    let section_delta = sect.addr - cmd.vmaddr;
                    let mut mapping = SectionMapping {
                        region_index: moved.region_index,
                        region_offset: moved.region_offset + section_delta as usize,
                        slide: self.seg_slides[seg_index],
                        new_address: moved.cache_vm_address.raw() + section_delta,
                        original_address: sect.addr,
                        coalesced: None,
                        coalesced_removed: false,
                    };

                    let mut removed = false;
                    if let Some(coalescer) = coalescer {
                        if coalescer.section_was_optimized(sect.segment_name(), sect.name()) {
                            let optimized = coalescer
                                .section(sect.segment_name(), sect.name())
                                .unwrap();
                            mapping.coalesced = Some(optimized.kind);
                            mapping.coalesced_removed = optimized.section_will_be_removed;
                        }
                        removed =
                            coalescer.section_was_removed(sect.segment_name(), sect.name());
                    }
                    if !removed {
                        image_end = image_end.max(mapping.new_address);
                    }
                    table.push(mapping);
                }
                seg_index += 1;
            }
            offset += lc.cmdsize as usize;
        }

        (table, image_start, image_end)
    }

    fn adjust_references_v2(
        &mut self,
        regions: &mut [Region],
        coalescer: Option<&DylibSectionCoalescer>,
        chunk_addrs: &CoalescedChunkAddresses,
    ) {
        let blob = self
            .inputs
            .split_seg_info
            .take()
            .expect("v2 adjustment without split seg info");

        let (table, image_start, image_end) = self.build_section_table(coalescer, regions);

        let mut pair_state = PairState::default();
        let mut current_pair = u64::MAX;
        let result = split_seg::for_each_reference_v2(&blob, |reference| {
            if self.diag.has_error() {
                return false;
            }
            if reference.pair_index != current_pair {
                current_pair = reference.pair_index;
                pair_state = PairState::default();
            }
            self.apply_v2_reference(
                regions,
                coalescer,
                chunk_addrs,
                &table,
                image_start,
                image_end,
                reference,
                &mut pair_state,
            );
            true
        });

        if let Err(error) = result {
            self.diag.error(format!("{error} in {}", self.dylib_id));
        }
        self.inputs.split_seg_info = Some(blob);
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_v2_reference(
        &mut self,
        regions: &mut [Region],
        coalescer: Option<&DylibSectionCoalescer>,
        chunk_addrs: &CoalescedChunkAddresses,
        table: &[SectionMapping],
        image_start: u64,
        image_end: u64,
        reference: &SplitSegReference,
        pair_state: &mut PairState,
    ) {
        let Some(from) = table.get(reference.from_section as usize).copied() else {
            self.diag.error(format!(
                "split seg from-section {} out of range in {}",
                reference.from_section, self.dylib_id
            ));
            return;
        };
        let Some(to) = table.get(reference.to_section as usize).copied() else {
            self.diag.error(format!(
                "split seg to-section {} out of range in {}",
                reference.to_section, self.dylib_id
            ));
            return;
        };

        // A reference FROM a removed section would be something like
        // CFStrings; the categorization pass never produces those today.
        assert!(
            !(from.coalesced.is_some() && from.coalesced_removed),
            "reference from a coalesced-away section"
        );

        let from_location = (from.region_index, from.region_offset + reference.from_offset as usize);
        let from_new_address = from.new_address + reference.from_offset;
        let from_slide = from.slide;

        // The 'to' side may have been redirected into a shared chunk; the
        // slide is then per-atom, not per-section
        let (to_new_address, to_slide) = match (to.coalesced, coalescer) {
            (Some(kind), Some(coalescer)) => {
                let optimized = match kind {
                    CoalescedSectionKind::ObjcClassNames => &coalescer.objc_class_names,
                    CoalescedSectionKind::ObjcMethodNames => &coalescer.objc_meth_names,
                    CoalescedSectionKind::ObjcMethodTypes => &coalescer.objc_meth_types,
                    CoalescedSectionKind::Gots => &coalescer.gots,
                    CoalescedSectionKind::AuthGots => &coalescer.auth_gots,
                };
                match optimized.offset_map.get(&(reference.to_offset as u32)) {
                    Some(&cache_offset) => {
                        let base = chunk_addrs
                            .base_for(kind)
                            .expect("coalesced chunk has no address");
                        let to_new = base.raw() + cache_offset as u64;
                        let to_atom_original = to.original_address + reference.to_offset;
                        (to_new, to_new as i64 - to_atom_original as i64)
                    }
                    None => {
                        // Completeness: every offset must be known, either
                        // optimized or deliberately skipped
                        assert!(
                            !optimized.section_will_be_removed,
                            "no coalesced entry for offset {:#x} of removed section {}",
                            reference.to_offset, optimized.name
                        );
                        assert!(
                            optimized
                                .unoptimized_offsets
                                .contains(&(reference.to_offset as u32)),
                            "offset {:#x} of {} neither optimized nor tracked",
                            reference.to_offset,
                            optimized.name
                        );
                        (to.new_address + reference.to_offset, to.slide)
                    }
                }
            }
            _ => (to.new_address + reference.to_offset, to.slide),
        };

        let adjust = to_slide - from_slide;
        self.adjust_reference(
            regions,
            reference.kind,
            from_location,
            from_new_address,
            to_new_address,
            adjust,
            to_slide,
            image_start,
            image_end,
            pair_state,
        );
    }

    // =========================================================================
    // One reference
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn adjust_reference(
        &mut self,
        regions: &mut [Region],
        kind: u64,
        location: (usize, usize),
        from_new_address: u64,
        to_new_address: u64,
        adjust: i64,
        target_slide: i64,
        image_start: u64,
        image_end: u64,
        pair_state: &mut PairState,
    ) {
        let mut recorded_kind = kind;
        let (region_index, region_offset) = location;
        let loc_vmaddr =
            regions[region_index].vm_address + VMOffset::new(region_offset as u64);

        match kind {
            DYLD_CACHE_ADJ_V2_DELTA_32 => {
                let buffer = &mut regions[region_index].buffer;
                let value = read_u32_le(&buffer[region_offset..]) as i32 as i64;
                let delta = value + adjust;
                if delta > i32::MAX as i64 || delta < i32::MIN as i64 {
                    self.diag.error(format!(
                        "DYLD_CACHE_ADJ_V2_DELTA_32 can't be adjusted by {adjust:#x} in {}",
                        self.dylib_id
                    ));
                    return;
                }
                write_u32_le(&mut buffer[region_offset..], delta as i32 as u32);
            }
            DYLD_CACHE_ADJ_V2_POINTER_32 => {
                if self.inputs.chained_fixups.is_some() {
                    match self.chained_fixups_format {
                        DYLD_CHAINED_PTR_32 => {
                            let (buffer, tracker) = regions[region_index].buffer_and_tracker();
                            let raw = read_u32_le(&buffer[region_offset..]);
                            let mut ptr = crate::macho::fixups::Generic32Pointer(raw);
                            if !ptr.is_bind() {
                                // A 26-bit target cannot hold a cache address;
                                // the real target always goes out of band
                                tracker.add(loc_vmaddr);
                                let target =
                                    (ptr.rebase_target() as i64 + target_slide) as u32;
                                tracker.set_rebase_target32(loc_vmaddr, target);
                                ptr.clear_rebase_target();
                                write_u32_le(&mut buffer[region_offset..], ptr.0);
                            }
                        }
                        format => {
                            self.diag.error(format!(
                                "unknown 32-bit chained fixup format {format} in {}",
                                self.dylib_id
                            ));
                        }
                    }
                } else {
                    let (buffer, tracker) = regions[region_index].buffer_and_tracker();
                    let value = read_u32_le(&buffer[region_offset..]);
                    if to_new_address != (value as i64 + target_slide) as u64 {
                        self.diag.error(format!(
                            "bad DYLD_CACHE_ADJ_V2_POINTER_32 value not as expected at address {from_new_address:#x} in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    write_u32_le(&mut buffer[region_offset..], to_new_address as u32);
                    tracker.add(loc_vmaddr);
                }
            }
            DYLD_CACHE_ADJ_V2_POINTER_64 => {
                if self.inputs.chained_fixups.is_some() {
                    match self.chained_fixups_format {
                        DYLD_CHAINED_PTR_ARM64E
                        | DYLD_CHAINED_PTR_ARM64E_USERLAND
                        | DYLD_CHAINED_PTR_ARM64E_USERLAND24
                        | DYLD_CHAINED_PTR_ARM64E_KERNEL => {
                            self.convert_arm64e_rebase_at(
                                regions,
                                region_index,
                                region_offset,
                                loc_vmaddr,
                                target_slide,
                            );
                        }
                        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                            self.convert_generic64_rebase_at(
                                regions,
                                region_index,
                                region_offset,
                                loc_vmaddr,
                                target_slide,
                            );
                        }
                        format => {
                            self.diag.error(format!(
                                "unknown 64-bit chained fixup format {format} in {}",
                                self.dylib_id
                            ));
                        }
                    }
                } else {
                    let (buffer, tracker) = regions[region_index].buffer_and_tracker();
                    let value = read_u64_le(&buffer[region_offset..]);
                    if to_new_address != (value as i64 + target_slide) as u64 {
                        self.diag.error(format!(
                            "bad DYLD_CACHE_ADJ_V2_POINTER_64 value not as expected at address {from_new_address:#x} in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    write_u64_le(&mut buffer[region_offset..], to_new_address);
                    tracker.add(loc_vmaddr);
                }
            }
            DYLD_CACHE_ADJ_V2_THREADED_POINTER_64 => {
                // Old style arm64e binary; binds are processed later
                self.convert_arm64e_rebase_at(
                    regions,
                    region_index,
                    region_offset,
                    loc_vmaddr,
                    target_slide,
                );
            }
            DYLD_CACHE_ADJ_V2_DELTA_64 => {
                let buffer = &mut regions[region_index].buffer;
                let value = read_u64_le(&buffer[region_offset..]);
                write_u64_le(&mut buffer[region_offset..], value.wrapping_add_signed(adjust));
            }
            DYLD_CACHE_ADJ_V2_IMAGE_OFF_32 => {
                if adjust == 0 {
                    // fall through to pair bookkeeping below
                } else {
                    let offset = to_new_address - image_start;
                    if to_new_address > image_end || offset > u32::MAX as u64 {
                        self.diag.error(format!(
                            "DYLD_CACHE_ADJ_V2_IMAGE_OFF_32 can't be adjusted to {to_new_address:#x} in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    let buffer = &mut regions[region_index].buffer;
                    write_u32_le(&mut buffer[region_offset..], offset as u32);
                }
            }
            DYLD_CACHE_ADJ_V2_ARM64_ADRP => {
                let buffer = &mut regions[region_index].buffer;
                let instruction = read_u32_le(&buffer[region_offset..]);
                if crate::arm64::is_adrp(instruction) {
                    let page_distance =
                        (to_new_address & !0xFFF) as i64 - (from_new_address & !0xFFF) as i64;
                    let new_page21 = page_distance >> 12;
                    if !(-2_097_151..=2_097_151).contains(&new_page21) {
                        self.diag.error(format!(
                            "DYLD_CACHE_ADJ_V2_ARM64_ADRP can't be adjusted that far in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    let patched = crate::arm64::set_adrp_imm21(instruction, new_page21);
                    write_u32_le(&mut buffer[region_offset..], patched);
                }
                // ADRP is sometimes optimized to ADR after split-seg-info is
                // generated; leave those alone
            }
            DYLD_CACHE_ADJ_V2_ARM64_OFF12 => {
                self.adjust_off12(regions, region_index, region_offset, to_new_address);
            }
            DYLD_CACHE_ADJ_V2_THUMB_MOVW_MOVT => {
                if pair_state.last_kind == kind {
                    if pair_state.last_to_new_address == to_new_address {
                        let Some(last_location) = pair_state.last_location else {
                            return;
                        };
                        let first = {
                            let buffer = &regions[last_location.0].buffer;
                            read_u32_le(&buffer[last_location.1..])
                        };
                        let second = {
                            let buffer = &regions[region_index].buffer;
                            read_u32_le(&buffer[region_offset..])
                        };
                        use crate::arm64::{is_thumb_movt, is_thumb_movw, set_thumb_word, thumb_word};
                        let (new_first, new_second) = if is_thumb_movw(first)
                            && is_thumb_movt(second)
                        {
                            let full = ((thumb_word(second) as u32) << 16)
                                | thumb_word(first) as u32;
                            let full = full.wrapping_add_signed(adjust as i32);
                            (
                                set_thumb_word(first, full as u16),
                                set_thumb_word(second, (full >> 16) as u16),
                            )
                        } else if is_thumb_movt(first) && is_thumb_movw(second) {
                            let full = ((thumb_word(first) as u32) << 16)
                                | thumb_word(second) as u32;
                            let full = full.wrapping_add_signed(adjust as i32);
                            (
                                set_thumb_word(first, (full >> 16) as u16),
                                set_thumb_word(second, full as u16),
                            )
                        } else {
                            self.diag.error(format!(
                                "two DYLD_CACHE_ADJ_V2_THUMB_MOVW_MOVT in a row but not paired in {}",
                                self.dylib_id
                            ));
                            return;
                        };
                        write_u32_le(
                            &mut regions[last_location.0].buffer[last_location.1..],
                            new_first,
                        );
                        write_u32_le(&mut regions[region_index].buffer[region_offset..], new_second);
                        recorded_kind = 0;
                    } else {
                        self.diag.error(format!(
                            "two DYLD_CACHE_ADJ_V2_THUMB_MOVW_MOVT in a row but target different addresses in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                }
            }
            DYLD_CACHE_ADJ_V2_ARM_MOVW_MOVT => {
                if pair_state.last_kind == kind {
                    if pair_state.last_to_new_address == to_new_address {
                        let Some(last_location) = pair_state.last_location else {
                            return;
                        };
                        let first = {
                            let buffer = &regions[last_location.0].buffer;
                            read_u32_le(&buffer[last_location.1..])
                        };
                        let second = {
                            let buffer = &regions[region_index].buffer;
                            read_u32_le(&buffer[region_offset..])
                        };
                        use crate::arm64::{arm_word, is_arm_movt, is_arm_movw, set_arm_word};
                        let (new_first, new_second) = if is_arm_movw(first) && is_arm_movt(second)
                        {
                            let full =
                                ((arm_word(second) as u32) << 16) | arm_word(first) as u32;
                            let full = full.wrapping_add_signed(adjust as i32);
                            (
                                set_arm_word(first, full as u16),
                                set_arm_word(second, (full >> 16) as u16),
                            )
                        } else if is_arm_movt(first) && is_arm_movw(second) {
                            let full =
                                ((arm_word(first) as u32) << 16) | arm_word(second) as u32;
                            let full = full.wrapping_add_signed(adjust as i32);
                            (
                                set_arm_word(first, (full >> 16) as u16),
                                set_arm_word(second, full as u16),
                            )
                        } else {
                            self.diag.error(format!(
                                "two DYLD_CACHE_ADJ_V2_ARM_MOVW_MOVT in a row but not paired in {}",
                                self.dylib_id
                            ));
                            return;
                        };
                        write_u32_le(
                            &mut regions[last_location.0].buffer[last_location.1..],
                            new_first,
                        );
                        write_u32_le(&mut regions[region_index].buffer[region_offset..], new_second);
                        recorded_kind = 0;
                    } else {
                        self.diag.error(format!(
                            "two DYLD_CACHE_ADJ_V2_ARM_MOVW_MOVT in a row but target different addresses in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                }
            }
            DYLD_CACHE_ADJ_V2_ARM64_BR26 => {
                if adjust != 0 {
                    let buffer = &mut regions[region_index].buffer;
                    let instruction = read_u32_le(&buffer[region_offset..]);
                    let delta = to_new_address as i64 - from_new_address as i64;
                    const B128_MEG_LIMIT: i64 = 0x07FF_FFFF;
                    if delta > -B128_MEG_LIMIT && delta < B128_MEG_LIMIT {
                        let patched = crate::arm64::set_branch26_delta(instruction, delta);
                        write_u32_le(&mut buffer[region_offset..], patched);
                    } else {
                        self.diag.error(format!(
                            "br26 instruction exceeds maximum range at address {from_new_address:#x} in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                }
            }
            DYLD_CACHE_ADJ_V2_THUMB_BR22 | DYLD_CACHE_ADJ_V2_ARM_BR24 => {
                // Calls to stubs need no adjustment
            }
            _ => {
                self.diag.error(format!(
                    "unknown split seg kind={kind} in {}",
                    self.dylib_id
                ));
                return;
            }
        }

        pair_state.last_kind = recorded_kind;
        pair_state.last_to_new_address = to_new_address;
        pair_state.last_location = Some(location);
    }

    fn adjust_off12(
        &mut self,
        regions: &mut [Region],
        region_index: usize,
        region_offset: usize,
        to_new_address: u64,
    ) {
        let buffer = &mut regions[region_index].buffer;
        let instruction = read_u32_le(&buffer[region_offset..]);

        // This is a page offset; regardless of where the load/store slid, we
        // want the target's offset within its own page
        let new_page_offset = (to_new_address & 0xFFF) as u32;

        if (instruction & 0x3B00_0000) == 0x3900_0000 {
            // LDR/STR imm12
            let encoded_addend = (instruction & 0x003F_FC00) >> 10;
            let new_addend;
            match instruction & 0xC000_0000 {
                0x0000_0000 => {
                    if (instruction & 0x0480_0000) == 0x0480_0000 {
                        // 128-bit vector load/store
                        if new_page_offset & 0xF != 0 {
                            self.diag.error(format!(
                                "can't adjust off12 scale=16 instruction to {new_page_offset} bytes in {}",
                                self.dylib_id
                            ));
                            return;
                        }
                        if encoded_addend * 16 >= 4096 {
                            self.diag.error(format!(
                                "off12 scale=16 instruction points outside its page in {}",
                                self.dylib_id
                            ));
                            return;
                        }
                        new_addend = new_page_offset / 16;
                    } else {
                        // scale=1
                        new_addend = new_page_offset;
                    }
                }
                0x4000_0000 => {
                    if new_page_offset & 1 != 0 {
                        self.diag.error(format!(
                            "can't adjust off12 scale=2 instruction to {new_page_offset} bytes in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    if encoded_addend * 2 >= 4096 {
                        self.diag.error(format!(
                            "off12 scale=2 instruction points outside its page in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    new_addend = new_page_offset / 2;
                }
                0x8000_0000 => {
                    if new_page_offset & 3 != 0 {
                        self.diag.error(format!(
                            "can't adjust off12 scale=4 instruction to {new_page_offset} bytes in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    if encoded_addend * 4 >= 4096 {
                        self.diag.error(format!(
                            "off12 scale=4 instruction points outside its page in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    new_addend = new_page_offset / 4;
                }
                _ => {
                    if new_page_offset & 7 != 0 {
                        self.diag.error(format!(
                            "can't adjust off12 scale=8 instruction to {new_page_offset} bytes in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    if encoded_addend * 8 >= 4096 {
                        self.diag.error(format!(
                            "off12 scale=8 instruction points outside its page in {}",
                            self.dylib_id
                        ));
                        return;
                    }
                    new_addend = new_page_offset / 8;
                }
            }
            let patched = (instruction & 0xFFC0_03FF) | (new_addend << 10);
            write_u32_le(&mut buffer[region_offset..], patched);
        } else if (instruction & 0xFFC0_0000) == 0x9100_0000 {
            // ADD imm12
            if instruction & 0x00C0_0000 != 0 {
                self.diag.error(format!(
                    "ADD off12 uses shift in {}",
                    self.dylib_id
                ));
                return;
            }
            let patched = (instruction & 0xFFC0_03FF) | (new_page_offset << 10);
            write_u32_le(&mut buffer[region_offset..], patched);
        } else if !crate::arm64::is_nop(instruction) {
            // imm12 instructions optimized into a NOP are fine; anything
            // else is unexpected
            self.diag.error(format!(
                "unknown off12 instruction {instruction:#010x} in {}",
                self.dylib_id
            ));
        }
    }

    // =========================================================================
    // Chained-fixup conversion
    // =========================================================================

    fn convert_arm64e_rebase_at(
        &mut self,
        regions: &mut [Region],
        region_index: usize,
        region_offset: usize,
        loc_vmaddr: CacheVMAddress,
        target_slide: i64,
    ) {
        let (buffer, tracker) = regions[region_index].buffer_and_tracker();
        let raw = read_u64_le(&buffer[region_offset..]);
        let mut ptr = Arm64ePointer(raw);
        if ptr.is_bind() {
            return;
        }

        if ptr.is_auth() {
            let target_vmaddr = match self.chained_fixups_format {
                DYLD_CHAINED_PTR_ARM64E_USERLAND | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
                    // The encoded target is a VM offset from the image base;
                    // the packed field can't hold a cache address, so track
                    // the real target out of line
                    let target = (ptr.auth_target() + self.seg_orig_addresses[0])
                        .wrapping_add_signed(target_slide);
                    tracker.set_rebase_target64(loc_vmaddr, target);
                    let _ = ptr.set_auth_target(0);
                    write_u64_le(&mut buffer[region_offset..], ptr.0);
                    tracker.add(loc_vmaddr);
                    return;
                }
                _ => ptr.auth_target().wrapping_add_signed(target_slide),
            };

            if ptr.set_auth_target(target_vmaddr) {
                write_u64_le(&mut buffer[region_offset..], ptr.0);
            } else {
                // Target cannot fit the in-place field
                tracker.set_rebase_target64(loc_vmaddr, target_vmaddr);
                let _ = ptr.set_auth_target(0);
                write_u64_le(&mut buffer[region_offset..], ptr.0);
            }
            tracker.add(loc_vmaddr);
            return;
        }

        let target_vmaddr = match self.chained_fixups_format {
            DYLD_CHAINED_PTR_ARM64E => {
                ptr.rebase_target().wrapping_add_signed(target_slide)
            }
            DYLD_CHAINED_PTR_ARM64E_USERLAND | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
                let target = (ptr.rebase_target() + self.seg_orig_addresses[0])
                    .wrapping_add_signed(target_slide);
                tracker.set_rebase_target64(loc_vmaddr, target);
                let _ = ptr.set_rebase_target(0);
                write_u64_le(&mut buffer[region_offset..], ptr.0);
                tracker.add(loc_vmaddr);
                return;
            }
            DYLD_CHAINED_PTR_ARM64E_KERNEL => (ptr.rebase_target()
                + self.seg_orig_addresses[0])
                .wrapping_add_signed(target_slide),
            _ => {
                self.diag.error("unknown chain format".to_string());
                return;
            }
        };

        if ptr.set_rebase_target(target_vmaddr) {
            write_u64_le(&mut buffer[region_offset..], ptr.0);
        } else {
            tracker.set_rebase_target64(loc_vmaddr, target_vmaddr);
            let _ = ptr.set_rebase_target(0);
            write_u64_le(&mut buffer[region_offset..], ptr.0);
        }
        tracker.add(loc_vmaddr);
    }

    fn convert_generic64_rebase_at(
        &mut self,
        regions: &mut [Region],
        region_index: usize,
        region_offset: usize,
        loc_vmaddr: CacheVMAddress,
        target_slide: i64,
    ) {
        let (buffer, tracker) = regions[region_index].buffer_and_tracker();
        let raw = read_u64_le(&buffer[region_offset..]);
        let mut ptr = Generic64Pointer(raw);
        if ptr.is_bind() {
            return;
        }

        match self.chained_fixups_format {
            DYLD_CHAINED_PTR_64 => {
                let target_vmaddr = ptr.rebase_target().wrapping_add_signed(target_slide);
                if ptr.set_rebase_target(target_vmaddr) {
                    write_u64_le(&mut buffer[region_offset..], ptr.0);
                } else {
                    tracker.set_rebase_target64(loc_vmaddr, target_vmaddr);
                    let _ = ptr.set_rebase_target(0);
                    write_u64_le(&mut buffer[region_offset..], ptr.0);
                }
            }
            DYLD_CHAINED_PTR_64_OFFSET => {
                // The encoded target is a VM offset from the image base, so
                // the true cache address always goes out of line
                let target_vmaddr = (ptr.rebase_target() + self.seg_orig_addresses[0])
                    .wrapping_add_signed(target_slide);
                tracker.set_rebase_target64(loc_vmaddr, target_vmaddr);
                let _ = ptr.set_rebase_target(0);
                write_u64_le(&mut buffer[region_offset..], ptr.0);
            }
            _ => {
                self.diag.error("unknown chain format".to_string());
                return;
            }
        }
        tracker.add(loc_vmaddr);
    }

    // =========================================================================
    // Chain walking (older images without split-seg v2)
    // =========================================================================

    fn adjust_rebase_chains(&mut self, regions: &mut [Region]) {
        let blob = self.inputs.chained_fixups.take().expect("no chained fixups");
        let Some(starts) = ChainStarts::parse(&blob) else {
            self.diag
                .error(format!("malformed chained fixups in {}", self.dylib_id));
            self.inputs.chained_fixups = Some(blob);
            return;
        };

        for (seg_index, seg_starts) in starts.segments.iter().enumerate() {
            let Some(seg_starts) = seg_starts else { continue };
            if self.diag.has_error() {
                break;
            }
            let stride = chain_stride(seg_starts.pointer_format);

            for (page_index, &page_start) in seg_starts.page_starts.iter().enumerate() {
                if page_start == DYLD_CHAINED_PTR_START_NONE {
                    continue;
                }
                let page_offset = page_index as u64 * seg_starts.page_size as u64;
                if page_start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                    // Overflow area: chain starts continue until one has the
                    // last-bit set
                    let mut overflow_index =
                        (page_start & !DYLD_CHAINED_PTR_START_MULTI) as usize;
                    loop {
                        let entry = seg_starts.page_starts[overflow_index];
                        let start = entry & !DYLD_CHAINED_PTR_START_MULTI;
                        self.walk_chain(
                            regions,
                            seg_index,
                            seg_starts.pointer_format,
                            page_offset + start as u64,
                            stride,
                        );
                        if entry & DYLD_CHAINED_PTR_START_MULTI != 0 {
                            break;
                        }
                        overflow_index += 1;
                    }
                } else {
                    self.walk_chain(
                        regions,
                        seg_index,
                        seg_starts.pointer_format,
                        page_offset + page_start as u64,
                        stride,
                    );
                }
            }
        }

        self.inputs.chained_fixups = Some(blob);
    }

    fn walk_chain(
        &mut self,
        regions: &mut [Region],
        seg_index: usize,
        pointer_format: u16,
        mut offset_in_segment: u64,
        stride: u64,
    ) {
        let seg = &self.dylib.segments[seg_index];
        let region_index = seg.region_index;
        let seg_region_offset = seg.region_offset;
        let seg_size = seg.cache_file_size.raw();

        loop {
            if offset_in_segment + 8 > seg_size {
                self.diag.error(format!(
                    "rebase chain runs off segment end in {}",
                    self.dylib_id
                ));
                return;
            }
            let region_offset = seg_region_offset + offset_in_segment as usize;
            let loc_vmaddr =
                regions[region_index].vm_address + VMOffset::new(region_offset as u64);

            let raw = read_u64_le(&regions[region_index].buffer[region_offset..]);
            let next = match pointer_format {
                DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                    let ptr = Generic64Pointer(raw);
                    if !ptr.is_bind() {
                        // The rebase target is relative to the original link
                        // address; resolve its slide and convert
                        let target_in_dylib = match pointer_format {
                            DYLD_CHAINED_PTR_64 => ptr.rebase_target(),
                            _ => ptr.rebase_target() + self.seg_orig_addresses[0],
                        };
                        let slide = self.slide_for_orig_address(target_in_dylib);
                        if self.diag.has_error() {
                            return;
                        }
                        self.convert_generic64_rebase_at(
                            regions,
                            region_index,
                            region_offset,
                            loc_vmaddr,
                            slide,
                        );
                    }
                    ptr.next()
                }
                _ => {
                    self.diag.error(format!(
                        "unsupported chained fixup format {pointer_format} in {}",
                        self.dylib_id
                    ));
                    return;
                }
            };

            if self.diag.has_error() {
                return;
            }
            if next == 0 {
                break;
            }
            offset_in_segment += next * stride;
        }
    }

    // =========================================================================
    // Rebase opcodes (oldest images)
    // =========================================================================

    fn slide_pointer(&mut self, regions: &mut [Region], seg_index: usize, seg_offset: u64, rebase_type: u8) {
        let seg = &self.dylib.segments[seg_index];
        let region_index = seg.region_index;
        let region_offset = seg.region_offset + seg_offset as usize;
        let loc_vmaddr = regions[region_index].vm_address + VMOffset::new(region_offset as u64);

        match rebase_type {
            REBASE_TYPE_POINTER => {
                let value = read_u64_le(&regions[region_index].buffer[region_offset..]);
                let slide = self.slide_for_orig_address(value);
                if self.diag.has_error() {
                    return;
                }
                let (buffer, tracker) = regions[region_index].buffer_and_tracker();
                write_u64_le(&mut buffer[region_offset..], value.wrapping_add_signed(slide));
                tracker.add(loc_vmaddr);
            }
            REBASE_TYPE_TEXT_ABSOLUTE32 => {
                let value = read_u32_le(&regions[region_index].buffer[region_offset..]);
                let slide = self.slide_for_orig_address(value as u64);
                if self.diag.has_error() {
                    return;
                }
                let buffer = &mut regions[region_index].buffer;
                write_u32_le(
                    &mut buffer[region_offset..],
                    value.wrapping_add(slide as u32),
                );
            }
            _ => {
                // REBASE_TYPE_TEXT_PCREL32 and the rest are not supported
                self.diag.error(format!(
                    "unknown rebase type {rebase_type:#04x} in {}",
                    self.dylib_id
                ));
            }
        }
    }

    fn adjust_data_pointers(&mut self, regions: &mut [Region]) {
        let Some(opcodes) = self.inputs.rebase_opcodes.take() else {
            return;
        };

        let mut rebase_type = 0u8;
        let mut seg_index = 0usize;
        let mut seg_offset = 0u64;
        let pointer_size = 8u64;

        let mut p = &opcodes[..];
        let mut done = false;
        while !done && !p.is_empty() && !self.diag.has_error() {
            let immediate = p[0] & REBASE_IMMEDIATE_MASK;
            let opcode = p[0] & REBASE_OPCODE_MASK;
            p = &p[1..];
            match opcode {
                REBASE_OPCODE_DONE => done = true,
                REBASE_OPCODE_SET_TYPE_IMM => rebase_type = immediate,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    seg_index = immediate as usize;
                    let Some((value, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    seg_offset = value;
                    p = &p[used..];
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => {
                    let Some((value, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    seg_offset = seg_offset.wrapping_add(value);
                    p = &p[used..];
                }
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    seg_offset += immediate as u64 * pointer_size;
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    for _ in 0..immediate {
                        self.slide_pointer(regions, seg_index, seg_offset, rebase_type);
                        seg_offset += pointer_size;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let Some((count, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    p = &p[used..];
                    for _ in 0..count {
                        self.slide_pointer(regions, seg_index, seg_offset, rebase_type);
                        seg_offset += pointer_size;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    self.slide_pointer(regions, seg_index, seg_offset, rebase_type);
                    let Some((value, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    seg_offset = seg_offset.wrapping_add(value) + pointer_size;
                    p = &p[used..];
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let Some((count, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    p = &p[used..];
                    let Some((skip, used)) = read_uleb128(p) else {
                        self.diag
                            .error(format!("truncated rebase opcodes in {}", self.dylib_id));
                        return;
                    };
                    p = &p[used..];
                    for _ in 0..count {
                        self.slide_pointer(regions, seg_index, seg_offset, rebase_type);
                        seg_offset += skip + pointer_size;
                    }
                }
                _ => {
                    self.diag.error(format!(
                        "unknown rebase opcode {opcode:#04x} in {}",
                        self.dylib_id
                    ));
                    done = true;
                }
            }
        }

        self.inputs.rebase_opcodes = Some(opcodes);
    }

    // =========================================================================
    // Code fixups (v1 split-seg)
    // =========================================================================

    fn adjust_code(&mut self, regions: &mut [Region]) {
        let Some(info) = self.inputs.split_seg_info.take() else {
            return;
        };

        // v1 encoding only works when every data segment slides by the same
        // amount relative to text
        if self.seg_slides.len() < 2 {
            self.inputs.split_seg_info = Some(info);
            return;
        }
        let code_to_data_delta = self.seg_slides[1] - self.seg_slides[0];

        // compressed data is: [ <kind> [uleb128-delta]+ <0> ]+ <0>
        let mut p = &info[..];
        while let Some((&kind, rest)) = p.split_first() {
            if kind == 0 {
                break;
            }
            p = rest;
            let mut text_offset = 0u64;
            loop {
                let Some((delta, used)) = read_uleb128(p) else {
                    self.diag
                        .error(format!("truncated split seg info in {}", self.dylib_id));
                    self.inputs.split_seg_info = Some(info);
                    return;
                };
                p = &p[used..];
                if delta == 0 {
                    break;
                }
                text_offset += delta;
                self.adjust_instruction(regions, kind, text_offset, code_to_data_delta);
            }
        }

        self.inputs.split_seg_info = Some(info);
    }

    fn adjust_instruction(
        &mut self,
        regions: &mut [Region],
        kind: u8,
        text_offset: u64,
        code_to_data_delta: i64,
    ) {
        let seg = &self.dylib.segments[0];
        let region_index = seg.region_index;
        let region_offset = seg.region_offset + text_offset as usize;
        let buffer = &mut regions[region_index].buffer;

        match kind {
            1 => {
                // 32-bit pointer (including x86_64 RIP-rel)
                let value = read_u32_le(&buffer[region_offset..]);
                write_u32_le(
                    &mut buffer[region_offset..],
                    value.wrapping_add_signed(code_to_data_delta as i32),
                );
            }
            2 => {
                // 64-bit pointer
                let value = read_u64_le(&buffer[region_offset..]);
                write_u64_le(
                    &mut buffer[region_offset..],
                    value.wrapping_add_signed(code_to_data_delta),
                );
            }
            3 => {
                // arm64 ADRP
                let instruction = read_u32_le(&buffer[region_offset..]);
                if crate::arm64::is_adrp(instruction) {
                    // The delta is always a multiple of 4096, so only the
                    // page immediate changes
                    let pages = crate::arm64::adrp_imm21(instruction)
                        + (code_to_data_delta >> 12);
                    let patched = crate::arm64::set_adrp_imm21(instruction, pages);
                    write_u32_le(&mut buffer[region_offset..], patched);
                }
            }
            5 => {
                // thumb2 movw: the delta is a multiple of 4096, so only the
                // top 4 bits of the low 16 change
                let instruction = read_u32_le(&buffer[region_offset..]);
                let value = (instruction & 0x0000_000F)
                    .wrapping_add((code_to_data_delta as u32) >> 12);
                let patched = (instruction & 0xFFFF_FFF0) | (value & 0x0000_000F);
                write_u32_le(&mut buffer[region_offset..], patched);
            }
            6 => {
                // ARM movw
                let instruction = read_u32_le(&buffer[region_offset..]);
                let value = ((instruction & 0x000F_0000) >> 16)
                    .wrapping_add((code_to_data_delta as u32) >> 12);
                let patched = (instruction & 0xFFF0_FFFF) | ((value << 16) & 0x000F_0000);
                write_u32_le(&mut buffer[region_offset..], patched);
            }
            0x10..=0x1F => {
                // thumb2 movt; the low nibble of kind holds the high 4 bits
                // of the paired movw
                let instruction = read_u32_le(&buffer[region_offset..]);
                let imm16 = crate::arm64::thumb_word(instruction) as u32;
                let target = (imm16 << 16) | (((kind & 0xF) as u32) << 12);
                let new_target = target.wrapping_add_signed(code_to_data_delta as i32);
                let patched =
                    crate::arm64::set_thumb_word(instruction, (new_target >> 16) as u16);
                write_u32_le(&mut buffer[region_offset..], patched);
            }
            0x20..=0x2F => {
                // ARM movt
                let instruction = read_u32_le(&buffer[region_offset..]);
                let imm16 = crate::arm64::arm_word(instruction) as u32;
                let target = (imm16 << 16) | (((kind & 0xF) as u32) << 12);
                let new_target = target.wrapping_add_signed(code_to_data_delta as i32);
                let patched =
                    crate::arm64::set_arm_word(instruction, (new_target >> 16) as u16);
                write_u32_le(&mut buffer[region_offset..], patched);
            }
            4 => {
                // i386 IMPORT segment reference; nothing to adjust
            }
            _ => {}
        }
    }

    // =========================================================================
    // Symbol table
    // =========================================================================

    fn adjust_symbol_table(&mut self, regions: &mut [Region]) {
        if !self.dylib.linkedit.contains_key(&MovedLinkeditKind::SymbolNlist) {
            return;
        }
        let info = self.dylib.nlist_info;

        // Collect the slides first; the nlist bytes and the slide scan both
        // need self
        let ranges = [
            (info.globals_start_index, info.globals_count, true),
            (info.locals_start_index, info.locals_count, false),
        ];

        for (start, count, globals) in ranges {
            for index in start..start + count {
                let entry_offset = index as usize * Nlist64::SIZE;
                let mut entry = {
                    let nlist =
                        Self::linkedit_bytes_mut(regions, self.dylib, MovedLinkeditKind::SymbolNlist);
                    Nlist64::read_from_prefix(&nlist[entry_offset..]).unwrap().0
                };

                let adjustable = if globals {
                    entry.is_defined_in_section()
                } else {
                    entry.n_sect != NO_SECT && !entry.is_stab()
                };
                if !adjustable {
                    continue;
                }

                let slide = self.slide_for_orig_address(entry.n_value);
                if self.diag.has_error() {
                    return;
                }
                entry.n_value = entry.n_value.wrapping_add_signed(slide);

                let nlist =
                    Self::linkedit_bytes_mut(regions, self.dylib, MovedLinkeditKind::SymbolNlist);
                nlist[entry_offset..entry_offset + Nlist64::SIZE]
                    .copy_from_slice(entry.as_bytes());
            }
        }
    }

    // =========================================================================
    // Export trie
    // =========================================================================

    fn adjust_exports_trie(&mut self, regions: &mut [Region]) -> Result<Vec<u8>> {
        let Some(moved) = self.dylib.linkedit.get(&MovedLinkeditKind::ExportTrie) else {
            return Ok(Vec::new());
        };
        if moved.size == 0 {
            return Ok(Vec::new());
        }

        let trie_bytes =
            Self::linkedit_bytes_mut(regions, self.dylib, MovedLinkeditKind::ExportTrie).to_vec();
        let original_exports = match parse_export_trie(&trie_bytes) {
            Ok(exports) => exports,
            Err(_) => {
                self.diag
                    .error(format!("malformed exports trie in {}", self.dylib_id));
                return Ok(Vec::new());
            }
        };

        let base_address = self.seg_orig_addresses[0];
        let base_slide = self.slide_for_orig_address(base_address);

        let mut new_exports = Vec::with_capacity(original_exports.len());
        for mut entry in original_exports {
            // Symbols used only by the static linker are dropped
            if entry.name.starts_with("$ld$")
                || entry.name.starts_with(".objc_class_name")
                || entry.name.starts_with(".objc_category_name")
            {
                continue;
            }
            // Export addresses are offsets from the mach header; only
            // entries whose section slid differently from the header move
            if !entry.is_absolute() && !entry.is_reexport() {
                let slide = self.slide_for_orig_address(entry.address + base_address);
                if self.diag.has_error() {
                    return Ok(Vec::new());
                }
                entry.address = entry
                    .address
                    .wrapping_add_signed(slide - base_slide);
            }
            new_exports.push(entry);
        }

        let mut new_trie = emit_export_trie(&new_exports);
        while new_trie.len() % 8 != 0 {
            new_trie.push(0);
        }

        if new_trie.len() > moved.size as usize {
            return Err(Error::ExportTrieOverflow {
                name: self.dylib_id.to_string(),
                needed: new_trie.len(),
                reserved: moved.size as usize,
            });
        }
        Ok(new_trie)
    }

    // =========================================================================
    // Load command rebuild
    // =========================================================================

    fn rebuild_linkedit_and_load_commands(
        &mut self,
        regions: &mut [Region],
        coalescer: Option<&DylibSectionCoalescer>,
    ) -> Result<()> {
        // The exports trie is the only linkedit structure that is re-encoded
        let new_trie = self.adjust_exports_trie(regions)?;
        if self.diag.has_error() {
            return Ok(());
        }

        // Write the new trie over the old one (it can shrink, never grow)
        if let Some(moved) = self.dylib.linkedit.get(&MovedLinkeditKind::ExportTrie) {
            if moved.size != 0 {
                let trie_bytes =
                    Self::linkedit_bytes_mut(regions, self.dylib, MovedLinkeditKind::ExportTrie);
                trie_bytes.fill(0);
                trie_bytes[..new_trie.len()].copy_from_slice(&new_trie);
            }
        }
        let new_trie_size = new_trie.len() as u32;

        let segments = self.dylib.segments.clone();
        let seg_slides = self.seg_slides.clone();
        let header_entry_slide = segments[0].cache_vm_address.raw();
        let is_x86_64 = self.header.is_x86_64();
        let trie_file_offset = self
            .dylib
            .linkedit
            .get(&MovedLinkeditKind::ExportTrie)
            .map(|moved| moved.cache_file_offset.raw() as u32)
            .unwrap_or(0);

        let header_bytes = Self::segment_bytes_mut(regions, self.dylib, 0);

        // Pass 1: update surviving commands in place
        let mut offset = MachHeader64::SIZE;
        let mut seg_index = 0usize;
        for _ in 0..self.header.ncmds {
            let lc = LoadCommand::read_from_prefix(&header_bytes[offset..]).unwrap().0;
            match lc.cmd {
                LC_ID_DYLIB => {
                    // Match what the static linker sets in LC_LOAD_DYLIB
                    let mut cmd = DylibCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    cmd.dylib.timestamp = 2;
                    header_bytes[offset..offset + DylibCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let mut cmd = DyldInfoCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    if new_trie_size == 0 {
                        cmd.export_off = 0;
                        cmd.export_size = 0;
                    } else {
                        cmd.export_off = trie_file_offset;
                        cmd.export_size = new_trie_size;
                    }
                    header_bytes[offset..offset + DyldInfoCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_DYLD_EXPORTS_TRIE => {
                    let mut cmd = LinkeditDataCommand::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    if new_trie_size == 0 {
                        cmd.dataoff = 0;
                        cmd.datasize = 0;
                    } else {
                        cmd.dataoff = trie_file_offset;
                        cmd.datasize = new_trie_size;
                    }
                    header_bytes[offset..offset + LinkeditDataCommand::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_ROUTINES_64 => {
                    let mut cmd = RoutinesCommand64::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let slide = {
                        // init_address is always inside a known segment
                        let addr = cmd.init_address;
                        let mut found = 0i64;
                        for (index, &orig) in self.seg_orig_addresses.iter().enumerate() {
                            if addr >= orig && addr < orig + self.seg_orig_sizes[index] {
                                found = seg_slides[index];
                                break;
                            }
                        }
                        found
                    };
                    cmd.init_address = cmd.init_address.wrapping_add_signed(slide);
                    header_bytes[offset..offset + RoutinesCommand64::SIZE]
                        .copy_from_slice(cmd.as_bytes());
                }
                LC_UNIXTHREAD => {
                    // Entry point of a copied main executable (dyld itself).
                    // Registers follow flavor/count: pc is register 32 on
                    // arm64, rip is register 16 on x86_64.
                    let register_index = if is_x86_64 { 16 } else { 32 };
                    let reg_offset = offset + 16 + register_index * 8;
                    let value = read_u64_le(&header_bytes[reg_offset..]);
                    write_u64_le(
                        &mut header_bytes[reg_offset..],
                        value.wrapping_add(header_entry_slide),
                    );
                }
                LC_SEGMENT_64 => {
                    let mut cmd = SegmentCommand64::read_from_prefix(&header_bytes[offset..])
                        .unwrap()
                        .0;
                    let moved = &segments[seg_index];
                    let seg_file_offset_delta =
                        moved.cache_file_offset.raw() as i64 - cmd.fileoff as i64;
                    cmd.vmaddr = moved.cache_vm_address.raw();
                    cmd.vmsize = moved.cache_vm_size.raw();
                    cmd.fileoff = moved.cache_file_offset.raw();
                    cmd.filesize = moved.cache_file_size.raw();
                    header_bytes[offset..offset + SegmentCommand64::SIZE]
                        .copy_from_slice(cmd.as_bytes());

                    for sect_index in 0..cmd.nsects as usize {
                        let sect_offset =
                            offset + SegmentCommand64::SIZE + sect_index * Section64::SIZE;
                        let mut sect = Section64::read_from_prefix(&header_bytes[sect_offset..])
                            .unwrap()
                            .0;

                        let coalesced_away = coalescer
                            .map(|c| c.section_was_removed(sect.segment_name(), sect.name()))
                            .unwrap_or(false);
                        let optimized = coalescer
                            .map(|c| c.section_was_optimized(sect.segment_name(), sect.name()))
                            .unwrap_or(false);

                        if coalesced_away {
                            // Keep the entry but park it, empty, at the end
                            // of the segment
                            sect.addr = cmd.vmaddr + cmd.filesize;
                            sect.offset = 0;
                            sect.size = 0;
                        } else {
                            sect.addr = sect.addr.wrapping_add_signed(seg_slides[seg_index]);
                            if sect.offset != 0 {
                                sect.offset =
                                    (sect.offset as i64 + seg_file_offset_delta) as u32;
                            }
                            // An optimized-but-kept section is GOTs; its
                            // non-lazy-pointer semantics no longer apply
                            if optimized && sect.section_type() == S_NON_LAZY_SYMBOL_POINTERS {
                                sect.flags = (sect.flags & !SECTION_TYPE) | S_REGULAR;
                            }
                        }
                        header_bytes[sect_offset..sect_offset + Section64::SIZE]
                            .copy_from_slice(sect.as_bytes());
                    }
                    seg_index += 1;
                }
                _ => {}
            }
            offset += lc.cmdsize as usize;
        }

        // Pass 2: remove commands that have no meaning inside the cache
        let mut read_offset = MachHeader64::SIZE;
        let mut write_offset = MachHeader64::SIZE;
        let cmds_end = MachHeader64::SIZE + self.header.sizeofcmds as usize;
        let mut removed = 0u32;
        for _ in 0..self.header.ncmds {
            let lc = LoadCommand::read_from_prefix(&header_bytes[read_offset..]).unwrap().0;
            let remove = match lc.cmd {
                LC_RPATH => {
                    self.diag.warning(format!(
                        "shared cache does not support LC_RPATH found in {}",
                        self.dylib_id
                    ));
                    true
                }
                LC_CODE_SIGNATURE
                | LC_DYLIB_CODE_SIGN_DRS
                | LC_DYLD_CHAINED_FIXUPS
                | LC_SEGMENT_SPLIT_INFO => true,
                _ => false,
            };

            if remove {
                removed += 1;
            } else {
                if write_offset != read_offset {
                    header_bytes.copy_within(
                        read_offset..read_offset + lc.cmdsize as usize,
                        write_offset,
                    );
                }
                write_offset += lc.cmdsize as usize;
            }
            read_offset += lc.cmdsize as usize;
        }
        header_bytes[write_offset..cmds_end].fill(0);

        // Update the header: new command count/size, and the processed bit
        let mut header = self.header;
        header.ncmds -= removed;
        header.sizeofcmds = (write_offset - MachHeader64::SIZE) as u32;
        header.flags |= MachOFlags::DYLIB_IN_CACHE.bits();
        header_bytes[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        self.header = header;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::dylib::{MovedLinkeditMap, MovedSegment, NListInfo};
    use crate::builder::region::{ChunkKind, Region, RegionKind};
    use crate::builder::split_seg::encode_v2;
    use crate::types::{
        CacheFileOffset, CacheFileSize, CacheVMSize, InputVMAddress, InputVMSize,
    };

    const TEXT_BASE: u64 = 0x1_8000_0000;
    const DATA_BASE: u64 = 0x1_9000_0000;
    const ORIG_TEXT: u64 = 0x0;
    const ORIG_DATA: u64 = 0x8000;

    /// Builds a synthetic two-segment dylib placed into two regions:
    /// __TEXT (header + one __text section) and __DATA (one __data section).
    fn build_test_image(split_seg: Vec<u8>) -> (Vec<Region>, CacheDylib, AdjustorInputs) {
        let text_size = 0x4000u64;
        let data_size = 0x4000u64;

        let text_seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: *b"__TEXT\0\0\0\0\0\0\0\0\0\0",
            vmaddr: ORIG_TEXT,
            vmsize: text_size,
            fileoff: 0,
            filesize: text_size,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        let mut text_sect = Section64::read_from_bytes(&[0u8; Section64::SIZE]).unwrap();
        text_sect.sectname[..7].copy_from_slice(b"__text\0");
        text_sect.segname[..7].copy_from_slice(b"__TEXT\0");
        text_sect.addr = ORIG_TEXT + 0x1000;
        text_sect.size = 0x1000;
        text_sect.offset = 0x1000;

        let data_seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: *b"__DATA\0\0\0\0\0\0\0\0\0\0",
            vmaddr: ORIG_DATA,
            vmsize: data_size,
            fileoff: text_size,
            filesize: data_size,
            maxprot: 3,
            initprot: 3,
            nsects: 1,
            flags: 0,
        };
        let mut data_sect = Section64::read_from_bytes(&[0u8; Section64::SIZE]).unwrap();
        data_sect.sectname[..7].copy_from_slice(b"__data\0");
        data_sect.segname[..7].copy_from_slice(b"__DATA\0");
        data_sect.addr = ORIG_DATA;
        data_sect.size = 0x1000;
        data_sect.offset = text_size as u32;

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 2,
            sizeofcmds: text_seg.cmdsize + data_seg.cmdsize,
            flags: 0,
            reserved: 0,
        };

        let mut text_bytes = Vec::new();
        text_bytes.extend_from_slice(header.as_bytes());
        text_bytes.extend_from_slice(text_seg.as_bytes());
        text_bytes.extend_from_slice(text_sect.as_bytes());
        text_bytes.extend_from_slice(data_seg.as_bytes());
        text_bytes.extend_from_slice(data_sect.as_bytes());
        text_bytes.resize(text_size as usize, 0);

        let mut text_region = Region::new(
            RegionKind::Text,
            CacheVMAddress::new(TEXT_BASE),
            CacheFileOffset::new(0),
        );
        let text_chunk = text_region.allocate_chunk(
            ChunkKind::DylibSegment {
                dylib_index: 0,
                segment_index: 0,
            },
            text_size,
            0x4000,
        );
        text_region.chunk_bytes_mut(text_chunk).copy_from_slice(&text_bytes);

        let mut data_region = Region::new(
            RegionKind::Data,
            CacheVMAddress::new(DATA_BASE),
            CacheFileOffset::new(text_size),
        );
        data_region.allocate_chunk(
            ChunkKind::DylibSegment {
                dylib_index: 0,
                segment_index: 1,
            },
            data_size,
            0x4000,
        );

        text_region.seal();
        data_region.seal();

        let dylib = CacheDylib {
            cache_index: 0,
            install_name: "/usr/lib/libtest.dylib".to_string(),
            cache_load_address: CacheVMAddress::new(TEXT_BASE),
            segments: vec![
                MovedSegment {
                    name: "__TEXT".to_string(),
                    input_vm_address: InputVMAddress::new(ORIG_TEXT),
                    input_vm_size: InputVMSize::new(text_size),
                    cache_vm_address: CacheVMAddress::new(TEXT_BASE),
                    cache_vm_size: CacheVMSize::new(text_size),
                    cache_file_offset: CacheFileOffset::new(0),
                    cache_file_size: CacheFileSize::new(text_size),
                    region_index: 0,
                    region_offset: 0,
                },
                MovedSegment {
                    name: "__DATA".to_string(),
                    input_vm_address: InputVMAddress::new(ORIG_DATA),
                    input_vm_size: InputVMSize::new(data_size),
                    cache_vm_address: CacheVMAddress::new(DATA_BASE),
                    cache_vm_size: CacheVMSize::new(data_size),
                    cache_file_offset: CacheFileOffset::new(text_size),
                    cache_file_size: CacheFileSize::new(data_size),
                    region_index: 1,
                    region_offset: 0,
                },
            ],
            linkedit: MovedLinkeditMap::new(),
            nlist_info: NListInfo::default(),
            dependents: Vec::new(),
            bind_targets: Vec::new(),
        };

        let inputs = AdjustorInputs {
            chained_fixups: None,
            split_seg_info: Some(split_seg),
            rebase_opcodes: None,
        };

        (vec![text_region, data_region], dylib, inputs)
    }

    /// Section indices in the split-seg table for the test image:
    /// 0 = mach header, 1 = __text, 2 = __data.
    fn pointer64_ref(from_offset: u64, to_offset: u64) -> SplitSegReference {
        SplitSegReference {
            pair_index: 0,
            kind: DYLD_CACHE_ADJ_V2_POINTER_64,
            from_section: 2,
            from_offset,
            to_section: 1,
            to_offset,
        }
    }

    #[test]
    fn test_pointer64_cross_segment_adjustment() {
        // One pointer in __data pointing at __text+0x40
        let target_orig = ORIG_TEXT + 0x1000 + 0x40;
        let blob = encode_v2(&[pointer64_ref(0x10, 0x40)]);
        let (mut regions, dylib, inputs) = build_test_image(blob);

        // Write the original pointer value into the copied data segment
        write_u64_le(&mut regions[1].buffer[0x10..], target_orig);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(!diag.has_error(), "{:?}", diag.errors());

        // The pointer now holds the target's cache address: section __text
        // begins at TEXT_BASE + 0x1000
        let text_slide = TEXT_BASE as i64 - ORIG_TEXT as i64;
        let expected = target_orig.wrapping_add_signed(text_slide);
        assert_eq!(read_u64_le(&regions[1].buffer[0x10..]), expected);

        // And the data region's tracker recorded the location
        assert!(regions[1]
            .tracker
            .has(CacheVMAddress::new(DATA_BASE + 0x10)));
    }

    #[test]
    fn test_pointer64_value_mismatch_is_diagnosed() {
        let blob = encode_v2(&[pointer64_ref(0x10, 0x40)]);
        let (mut regions, dylib, inputs) = build_test_image(blob);
        // Pointer bytes disagree with what split-seg claims they target
        write_u64_le(&mut regions[1].buffer[0x10..], 0xDEAD);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(diag.has_error());
        assert!(diag.first_error().unwrap().contains("POINTER_64"));
    }

    #[test]
    fn test_adrp_out_of_range_is_diagnosed() {
        // __text instruction at offset 0x8 referencing __data; the segments
        // are placed 256 MiB apart in this image, so use regions much
        // farther apart to exceed ±2 GiB
        let reference = SplitSegReference {
            pair_index: 0,
            kind: DYLD_CACHE_ADJ_V2_ARM64_ADRP,
            from_section: 1,
            from_offset: 0x8,
            to_section: 2,
            to_offset: 0x0,
        };
        let blob = encode_v2(&[reference]);
        let (mut regions, mut dylib, inputs) = build_test_image(blob);

        // Move the data segment out of ADRP range
        let far = TEXT_BASE + 0x1_0000_0000;
        regions[1].vm_address = CacheVMAddress::new(far);
        regions[1].seal();
        dylib.segments[1].cache_vm_address = CacheVMAddress::new(far);

        // A real ADRP instruction at __text+0x8 (file offset 0x1008)
        write_u32_le(&mut regions[0].buffer[0x1008..], 0x9000_0010);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(diag.has_error());
        assert!(diag.first_error().unwrap().contains("ADRP"));
        // The instruction was not modified
        assert_eq!(read_u32_le(&regions[0].buffer[0x1008..]), 0x9000_0010);
    }

    #[test]
    fn test_off12_misaligned_scale_is_diagnosed() {
        let reference = SplitSegReference {
            pair_index: 0,
            kind: DYLD_CACHE_ADJ_V2_ARM64_OFF12,
            from_section: 1,
            from_offset: 0xC,
            to_section: 2,
            // After placement, __data slides to DATA_BASE which is 16k
            // aligned; to_offset 0x3 makes the page offset 0x3, not a
            // multiple of the 8-byte scale
            to_offset: 0x3,
        };
        let blob = encode_v2(&[reference]);
        let (mut regions, dylib, inputs) = build_test_image(blob);

        // LDR x1, [x0, #8]: 64-bit load (size=0b11), imm12=1
        write_u32_le(&mut regions[0].buffer[0x100C..], 0xF940_0401);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(diag.has_error());
        assert!(diag.first_error().unwrap().contains("scale=8"));
    }

    #[test]
    fn test_delta64_adjusted_by_slide_difference() {
        // Both segments slide by different amounts; a 64-bit delta from
        // __data to __text must change by (text slide - data slide)
        let reference = SplitSegReference {
            pair_index: 0,
            kind: DYLD_CACHE_ADJ_V2_DELTA_64,
            from_section: 2,
            from_offset: 0x20,
            to_section: 1,
            to_offset: 0x0,
        };
        let blob = encode_v2(&[reference]);
        let (mut regions, dylib, inputs) = build_test_image(blob);

        let original_delta = (ORIG_TEXT + 0x1000) as i64 - (ORIG_DATA + 0x20) as i64;
        write_u64_le(&mut regions[1].buffer[0x20..], original_delta as u64);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(!diag.has_error(), "{:?}", diag.errors());

        let text_slide = TEXT_BASE as i64 - ORIG_TEXT as i64;
        let data_slide = DATA_BASE as i64 - ORIG_DATA as i64;
        let expected = original_delta + (text_slide - data_slide);
        assert_eq!(read_u64_le(&regions[1].buffer[0x20..]) as i64, expected);
    }

    #[test]
    fn test_load_commands_rebuilt() {
        let blob = encode_v2(&[]);
        let (mut regions, dylib, inputs) = build_test_image(blob);

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let mut adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        adjustor
            .adjust_image_for_new_segment_locations(
                &mut regions,
                None,
                &CoalescedChunkAddresses::default(),
            )
            .unwrap();
        assert!(!diag.has_error(), "{:?}", diag.errors());

        let header = MachHeader64::read_from_prefix(&regions[0].buffer).unwrap().0;
        assert_ne!(header.flags & MachOFlags::DYLIB_IN_CACHE.bits(), 0);

        // Segment commands now carry the cache placement
        let seg = SegmentCommand64::read_from_prefix(&regions[0].buffer[MachHeader64::SIZE..])
            .unwrap()
            .0;
        assert_eq!(seg.vmaddr, TEXT_BASE);
        let sect_offset = MachHeader64::SIZE + SegmentCommand64::SIZE;
        let sect = Section64::read_from_prefix(&regions[0].buffer[sect_offset..])
            .unwrap()
            .0;
        assert_eq!(sect.addr, TEXT_BASE + 0x1000);
    }

    #[test]
    fn test_missing_split_seg_is_diagnosed() {
        let (mut regions, dylib, _) = build_test_image(Vec::new());
        let inputs = AdjustorInputs::default();

        let mut diag = Diagnostics::new();
        let config = BuilderConfig::default();
        let _adjustor = SegmentAdjustor::new(&mut diag, &config, &dylib, inputs, &mut regions);
        assert!(diag.has_error());
        assert!(diag
            .first_error()
            .unwrap()
            .contains("missing LC_SEGMENT_SPLIT_INFO"));
    }
}
