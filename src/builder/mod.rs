//! The cache build pipeline.
//!
//! Building an image is a fixed sequence of passes over the dylib arena:
//!
//! 1. **Place**: lay out regions, copy every dylib's segments and linkedit
//!    pieces into their chunks
//! 2. **Bind targets**: collect each dylib's imports and resolve them via
//!    two-level-namespace lookup; categorize GOT slots for uniquing
//! 3. **Coalesce**: assign final uniqued-GOT layout and distribute the
//!    remap to every contributing dylib
//! 4. **Adjust**: rewrite each copied dylib for its new addresses (fixups,
//!    symbol table, export trie, load commands)
//! 5. **Flatten**: convert surviving rebase chains to packed pointers
//! 6. **Bind**: write resolved pointers into every bind site and the
//!    uniqued GOTs, recording patch locations
//! 7. **Patch table**: merge all use lists into the cache-global table
//!
//! Passes 4 and onward require exclusive access to the region buffers;
//! passes over independent dylibs share no per-dylib state but are run in
//! sequence here since they all write the same regions.

pub mod adjustor;
pub mod bind;
pub mod coalescer;
pub mod dylib;
pub mod patch;
pub mod pointer;
pub mod region;
pub mod split_seg;
pub mod tracker;

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::config::{BuilderConfig, PointerFormat};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::context::MachImage;
use crate::macho::fixups::{Arm64ePointer, ChainStarts, Generic64Pointer};
use crate::macho::PointerMetaData;
use crate::types::{
    CacheFileOffset, CacheFileSize, CacheVMAddress, CacheVMSize, InputVMAddress, InputVMSize,
    VMOffset,
};
use crate::util::{align_up, read_u64_le};

use adjustor::{AdjustorInputs, CoalescedChunkAddresses, SegmentAdjustor};
use bind::{DylibBinds, GotSectionKind};
use coalescer::{CoalescedGOTSection, DylibSectionCoalescer, GotKey};
use dylib::{
    CacheDylib, DependentDylib, DependentKind, MovedLinkedit, MovedLinkeditKind,
    MovedLinkeditMap, MovedSegment, NListInfo,
};
use patch::{GotUse, PatchInfo, PatchTableBuilder, PatchableLocation};
use pointer::{Cache32, Cache64};
use region::{Chunk, ChunkKind, Region, RegionKind};

const REGION_ALIGN: u64 = 0x4000;
const SEGMENT_ALIGN: u64 = 0x4000;

/// The assembled cache image.
#[derive(Debug)]
pub struct BuiltCache {
    /// Output regions in address order
    pub regions: Vec<Region>,
    /// The dylib arena
    pub dylibs: Vec<CacheDylib>,
    /// VM address of the patch table
    pub patch_table_addr: CacheVMAddress,
    /// Accumulated warnings per dylib
    pub warnings: Vec<String>,
}

impl BuiltCache {
    /// Serializes the regions at their assigned file offsets.
    pub fn serialize(&self) -> Vec<u8> {
        let total = self
            .regions
            .iter()
            .map(|region| region.file_offset.raw() as usize + region.buffer.len())
            .max()
            .unwrap_or(0);
        let mut out = vec![0u8; total];
        for region in &self.regions {
            let start = region.file_offset.raw() as usize;
            out[start..start + region.buffer.len()].copy_from_slice(&region.buffer);
        }
        out
    }

    /// Total number of tracked fixup locations across all regions.
    pub fn fixup_count(&self) -> usize {
        self.regions.iter().map(|r| r.tracker.fixup_count()).sum()
    }
}

/// Drives one cache build over a set of input dylibs.
pub struct CacheBuilder {
    config: BuilderConfig,
    images: Vec<MachImage>,
}

impl CacheBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            images: Vec::new(),
        }
    }

    /// Parses and queues one input dylib.
    pub fn add_dylib(&mut self, data: Vec<u8>) -> Result<()> {
        let image = MachImage::parse(data)?;
        if !image.header.is_dylib() && image.header.filetype != MH_DYLINKER {
            return Err(Error::UnsupportedMachoType(image.header.filetype));
        }
        self.images.push(image);
        Ok(())
    }

    /// Queues an already-parsed input dylib.
    pub fn add_parsed_dylib(&mut self, image: MachImage) {
        self.images.push(image);
    }

    /// Runs the whole pipeline.
    pub fn build(self) -> Result<BuiltCache> {
        let pointer_size = match self.config.pointer_format {
            PointerFormat::Cache32 => 4,
            PointerFormat::Cache64 => 8,
        };

        // Pass 1: placement
        let (mut regions, mut dylibs, mut next_addr) = self.place()?;

        // Pass 2: bind targets and GOT categorization
        let mut all_binds = Vec::with_capacity(dylibs.len());
        let mut dylib_coalescers: Vec<DylibSectionCoalescer> =
            (0..dylibs.len()).map(|_| DylibSectionCoalescer::new()).collect();
        let mut gots = CoalescedGOTSection::new(pointer_size);
        let mut auth_gots = CoalescedGOTSection::new(pointer_size);
        let mut diagnostics: Vec<Diagnostics> =
            (0..dylibs.len()).map(|_| Diagnostics::new()).collect();

        for index in 0..dylibs.len() {
            let diag = &mut diagnostics[index];
            let install_name = dylibs[index].install_name.clone();
            let mut binds = bind::collect_binds(&self.images[index], diag, &install_name);
            bind::resolve_bind_targets(&mut binds, &dylibs[index], &self.images, diag);

            // Categorize GOT slots for uniquing
            for site in &binds.sites {
                let Some(got_kind) = site.got else { continue };
                let target = &binds.targets[site.bind_index];
                let dylib::BindTargetKind::CacheImage { dylib_index, .. } = target.kind else {
                    continue;
                };
                let key = GotKey {
                    target_symbol_name: target.name.clone(),
                    target_dylib_name: dylibs[dylib_index].install_name.clone(),
                    pmd: site.pmd,
                    is_function_variant: false,
                };
                match got_kind {
                    GotSectionKind::Regular => {
                        let offset = gots.add_target(key);
                        dylib_coalescers[index]
                            .gots
                            .add_optimized_offset(site.got_section_offset, offset);
                    }
                    GotSectionKind::Auth => {
                        let offset = auth_gots.add_target(key);
                        dylib_coalescers[index]
                            .auth_gots
                            .add_optimized_offset(site.got_section_offset, offset);
                    }
                }
            }

            dylibs[index].bind_targets = binds.targets.clone();
            all_binds.push(binds);
        }

        // Pass 3: final GOT layout
        let got_remap = gots.sort();
        let auth_got_remap = auth_gots.sort();
        for dylib_coalescer in &mut dylib_coalescers {
            apply_remap(&mut dylib_coalescer.gots.offset_map, &got_remap);
            apply_remap(&mut dylib_coalescer.auth_gots.offset_map, &auth_got_remap);
        }

        let chunk_addrs = if !gots.is_empty() || !auth_gots.is_empty() {
            let mut got_region = Region::new(
                RegionKind::DataConst,
                CacheVMAddress::new(next_addr),
                CacheFileOffset::new(next_addr - self.config.cache_base_address.raw()),
            );
            let mut addrs = CoalescedChunkAddresses::default();
            if !gots.is_empty() {
                let chunk = got_region.allocate_chunk(
                    ChunkKind::UniquedGots,
                    gots.regular_size().raw(),
                    pointer_size as u64,
                );
                gots.regular_chunk_address = Some(got_region.chunks[chunk].vm_address);
                addrs.gots = gots.regular_chunk_address;
                if gots.function_variant_size().raw() != 0 {
                    let chunk = got_region.allocate_chunk(
                        ChunkKind::FunctionVariantGots,
                        gots.function_variant_size().raw(),
                        pointer_size as u64,
                    );
                    gots.function_variant_chunk_address =
                        Some(got_region.chunks[chunk].vm_address);
                }
            }
            if !auth_gots.is_empty() {
                let chunk = got_region.allocate_chunk(
                    ChunkKind::UniquedAuthGots,
                    auth_gots.regular_size().raw(),
                    pointer_size as u64,
                );
                auth_gots.regular_chunk_address = Some(got_region.chunks[chunk].vm_address);
                addrs.auth_gots = auth_gots.regular_chunk_address;
            }
            got_region.seal();
            next_addr = align_up(
                got_region.vm_address.raw() + got_region.buffer.len() as u64,
                REGION_ALIGN,
            );
            regions.push(got_region);
            addrs
        } else {
            CoalescedChunkAddresses::default()
        };

        // Pass 4: per-dylib adjustment
        for index in 0..dylibs.len() {
            if diagnostics[index].has_error() {
                continue;
            }
            let inputs = AdjustorInputs {
                chained_fixups: self.images[index]
                    .linkedit_data(LC_DYLD_CHAINED_FIXUPS)
                    .map(<[u8]>::to_vec),
                split_seg_info: self.images[index]
                    .linkedit_data(LC_SEGMENT_SPLIT_INFO)
                    .map(<[u8]>::to_vec),
                rebase_opcodes: self.images[index].rebase_opcodes().map(<[u8]>::to_vec),
            };
            let mut adjustor = SegmentAdjustor::new(
                &mut diagnostics[index],
                &self.config,
                &dylibs[index],
                inputs,
                &mut regions,
            );
            adjustor.adjust_image_for_new_segment_locations(
                &mut regions,
                Some(&dylib_coalescers[index]),
                &chunk_addrs,
            )?;
        }

        // Pass 5: flatten rebase chains into packed pointers
        for index in 0..dylibs.len() {
            if diagnostics[index].has_error() {
                continue;
            }
            self.flatten_fixups(&mut regions, &dylibs[index], index);
        }

        // Pass 6: write resolved binds and uniqued GOT slots
        let mut patch_infos: Vec<PatchInfo> = dylibs
            .iter()
            .map(|d| PatchInfo::with_bind_count(d.bind_targets.len()))
            .collect();
        let mut written_gots: HashSet<GotKey> = HashSet::new();
        for index in 0..dylibs.len() {
            if diagnostics[index].has_error() {
                continue;
            }
            self.apply_binds(
                &mut regions,
                &dylibs,
                index,
                &all_binds[index],
                &gots,
                &auth_gots,
                &mut patch_infos[index],
                &mut written_gots,
            );
        }

        // A malformed dylib must never produce a partially patched image
        let failed: Vec<&Diagnostics> =
            diagnostics.iter().filter(|diag| diag.has_error()).collect();
        if !failed.is_empty() {
            return Err(Error::AdjustmentFailed {
                count: failed.len(),
                first: failed[0].first_error().unwrap_or("unknown").to_string(),
            });
        }

        // Pass 7: patch table
        let mut patch_builder = PatchTableBuilder::new();
        patch_builder.build(
            &dylibs,
            &patch_infos,
            &patch::PatchableClassesSet::new(),
            &patch::PatchableSingletonsSet::new(),
            self.config.cache_base_address,
        )?;

        let mut patch_region = Region::new(
            RegionKind::ReadOnly,
            CacheVMAddress::new(next_addr),
            CacheFileOffset::new(next_addr - self.config.cache_base_address.raw()),
        );
        let table_size = patch_builder.patch_table_size();
        let chunk = patch_region.allocate_chunk(ChunkKind::PatchTable, table_size as u64, 8);
        let patch_table_addr = patch_region.chunks[chunk].vm_address;
        patch_builder.write(patch_region.chunk_bytes_mut(chunk), patch_table_addr)?;
        patch_region.seal();
        regions.push(patch_region);

        let warnings = diagnostics
            .iter()
            .flat_map(|diag| diag.warnings().iter().cloned())
            .collect();

        info!(
            "built cache: {} dylibs, {} regions, {} byte patch table",
            dylibs.len(),
            regions.len(),
            table_size
        );

        Ok(BuiltCache {
            regions,
            dylibs,
            patch_table_addr,
            warnings,
        })
    }

    // =========================================================================
    // Placement
    // =========================================================================

    fn region_kind_for_segment(name: &str, writable: bool) -> RegionKind {
        match name {
            "__TEXT" => RegionKind::Text,
            "__DATA_CONST" => RegionKind::DataConst,
            "__AUTH_CONST" => RegionKind::AuthConst,
            "__AUTH" => RegionKind::Auth,
            _ if writable => RegionKind::Data,
            _ => RegionKind::Text,
        }
    }

    fn place(&self) -> Result<(Vec<Region>, Vec<CacheDylib>, u64)> {
        const ORDER: [RegionKind; 6] = [
            RegionKind::Text,
            RegionKind::DataConst,
            RegionKind::Data,
            RegionKind::AuthConst,
            RegionKind::Auth,
            RegionKind::LinkEdit,
        ];

        // First pass: how much space each region needs
        let mut sizes: HashMap<usize, u64> = HashMap::new();
        for image in &self.images {
            for segment in image.segments() {
                if segment.command.is_linkedit() {
                    continue;
                }
                let kind =
                    Self::region_kind_for_segment(segment.name(), segment.command.is_writable());
                let slot = ORDER.iter().position(|k| *k == kind).unwrap();
                let size = sizes.entry(slot).or_insert(0);
                *size = align_up(*size, SEGMENT_ALIGN) + segment.command.vmsize;
            }
            // Linkedit pieces land in one chunk per dylib
            let linkedit_slot = ORDER.len() - 1;
            let size = sizes.entry(linkedit_slot).or_insert(0);
            *size = align_up(*size, SEGMENT_ALIGN) + self.linkedit_sizes(image).total;
        }

        // Create the regions at their final addresses
        let base = self.config.cache_base_address.raw();
        let mut next_addr = base;
        let mut regions = Vec::new();
        let mut region_index_by_slot: HashMap<usize, usize> = HashMap::new();
        for (slot, kind) in ORDER.iter().enumerate() {
            let size = sizes.get(&slot).copied().unwrap_or(0);
            // Linkedit always exists so every dylib has somewhere to put
            // its relocated pieces
            if size == 0 && *kind != RegionKind::LinkEdit {
                continue;
            }
            region_index_by_slot.insert(slot, regions.len());
            regions.push(Region::new(
                *kind,
                CacheVMAddress::new(next_addr),
                CacheFileOffset::new(next_addr - base),
            ));
            next_addr = align_up(next_addr + size + REGION_ALIGN, REGION_ALIGN);
        }

        // Second pass: copy content into chunks and build the arena
        let install_names: HashMap<String, usize> = self
            .images
            .iter()
            .enumerate()
            .filter_map(|(index, image)| {
                image
                    .install_name()
                    .map(|name| (name.to_string(), index))
            })
            .collect();

        let mut dylibs = Vec::with_capacity(self.images.len());
        for (dylib_index, image) in self.images.iter().enumerate() {
            let install_name = image
                .install_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("<dylib {dylib_index}>"));

            let mut segments = Vec::new();
            for (segment_index, segment) in image.segments().enumerate() {
                let cmd = &segment.command;
                if cmd.is_linkedit() {
                    // Placeholder; fixed up below once the linkedit chunk
                    // is placed
                    segments.push(MovedSegment {
                        name: segment.name().to_string(),
                        input_vm_address: InputVMAddress::new(cmd.vmaddr),
                        input_vm_size: InputVMSize::new(cmd.vmsize),
                        cache_vm_address: CacheVMAddress::new(0),
                        cache_vm_size: CacheVMSize::new(0),
                        cache_file_offset: CacheFileOffset::new(0),
                        cache_file_size: CacheFileSize::new(0),
                        region_index: 0,
                        region_offset: 0,
                    });
                    continue;
                }

                let kind = Self::region_kind_for_segment(segment.name(), cmd.is_writable());
                let slot = ORDER.iter().position(|k| *k == kind).unwrap();
                let region_index = region_index_by_slot[&slot];
                let region = &mut regions[region_index];
                let chunk_index = region.allocate_chunk(
                    ChunkKind::DylibSegment {
                        dylib_index,
                        segment_index,
                    },
                    cmd.vmsize,
                    SEGMENT_ALIGN,
                );
                let chunk: &Chunk = &region.chunks[chunk_index];
                let (vm_address, file_offset, region_offset) =
                    (chunk.vm_address, chunk.file_offset, chunk.region_offset);

                // Copy the file-backed part; any zerofill tail stays zero
                let src_start = cmd.fileoff as usize;
                let src_end = src_start + cmd.filesize as usize;
                let dst = &mut region.buffer[region_offset..region_offset + cmd.filesize as usize];
                dst.copy_from_slice(&image.data[src_start..src_end]);

                segments.push(MovedSegment {
                    name: segment.name().to_string(),
                    input_vm_address: InputVMAddress::new(cmd.vmaddr),
                    input_vm_size: InputVMSize::new(cmd.vmsize),
                    cache_vm_address: vm_address,
                    cache_vm_size: CacheVMSize::new(cmd.vmsize),
                    cache_file_offset: file_offset,
                    cache_file_size: CacheFileSize::new(cmd.vmsize),
                    region_index,
                    region_offset,
                });
            }

            // Linkedit pieces: one chunk holding them back to back
            let linkedit_slot = ORDER.len() - 1;
            let linkedit_region_index = region_index_by_slot[&linkedit_slot];
            let (linkedit, linkedit_chunk) = self.place_linkedit(
                image,
                dylib_index,
                &mut regions[linkedit_region_index],
                linkedit_region_index,
            );

            // Point the __LINKEDIT segment at the dylib's linkedit chunk
            if let Some(linkedit_segment) = segments
                .iter_mut()
                .find(|segment| segment.name == "__LINKEDIT")
            {
                let region = &regions[linkedit_region_index];
                let chunk = &region.chunks[linkedit_chunk];
                linkedit_segment.cache_vm_address = chunk.vm_address;
                linkedit_segment.cache_vm_size = chunk.vm_size;
                linkedit_segment.cache_file_offset = chunk.file_offset;
                linkedit_segment.cache_file_size = chunk.file_size;
                linkedit_segment.region_index = linkedit_region_index;
                linkedit_segment.region_offset = chunk.region_offset;
            }

            let nlist_info = image
                .dysymtab()
                .map(|cmd| NListInfo {
                    locals_start_index: cmd.ilocalsym,
                    locals_count: cmd.nlocalsym,
                    globals_start_index: cmd.iextdefsym,
                    globals_count: cmd.nextdefsym,
                    undefs_start_index: cmd.iundefsym,
                    undefs_count: cmd.nundefsym,
                })
                .unwrap_or_default();

            let dependents = image
                .linked_dylibs()
                .map(|linked| DependentDylib {
                    kind: match linked.cmd {
                        LC_LOAD_WEAK_DYLIB => DependentKind::WeakLink,
                        LC_REEXPORT_DYLIB => DependentKind::Reexport,
                        LC_LOAD_UPWARD_DYLIB => DependentKind::Upward,
                        _ => DependentKind::Normal,
                    },
                    dylib_index: install_names.get(&linked.install_name).copied(),
                    install_name: linked.install_name,
                })
                .collect();

            let cache_load_address = segments
                .first()
                .map(|segment| segment.cache_vm_address)
                .ok_or_else(|| Error::NoSegments {
                    name: install_name.clone(),
                })?;

            debug!(
                "placed {} at {:#x} ({} segments)",
                install_name,
                cache_load_address.raw(),
                segments.len()
            );

            dylibs.push(CacheDylib {
                cache_index: dylib_index,
                install_name,
                cache_load_address,
                segments,
                linkedit,
                nlist_info,
                dependents,
                bind_targets: Vec::new(),
            });
        }

        for region in &mut regions {
            region.seal();
        }

        Ok((regions, dylibs, next_addr))
    }

    fn linkedit_sizes(&self, image: &MachImage) -> LinkeditSizes {
        let mut sizes = LinkeditSizes::default();
        if let Some(symtab) = image.symtab() {
            sizes.nlist = symtab.nsyms as u64 * 16;
            sizes.strings = symtab.strsize as u64;
        }
        if let Some(dysymtab) = image.dysymtab() {
            sizes.indirect = dysymtab.nindirectsyms as u64 * 4;
        }
        sizes.export_trie = align_up(
            image.export_trie().map(|trie| trie.len() as u64).unwrap_or(0),
            8,
        );
        sizes.function_starts = image
            .linkedit_data(LC_FUNCTION_STARTS)
            .map(|data| data.len() as u64)
            .unwrap_or(0);
        sizes.data_in_code = image
            .linkedit_data(LC_DATA_IN_CODE)
            .map(|data| data.len() as u64)
            .unwrap_or(0);
        sizes.total = align_up(sizes.nlist, 8)
            + align_up(sizes.strings, 8)
            + align_up(sizes.indirect, 8)
            + sizes.export_trie
            + align_up(sizes.function_starts, 8)
            + align_up(sizes.data_in_code, 8);
        sizes
    }

    fn place_linkedit(
        &self,
        image: &MachImage,
        dylib_index: usize,
        region: &mut Region,
        region_index: usize,
    ) -> (MovedLinkeditMap, usize) {
        let sizes = self.linkedit_sizes(image);
        let chunk_index = region.allocate_chunk(
            ChunkKind::DylibLinkedit { dylib_index },
            sizes.total,
            SEGMENT_ALIGN,
        );
        let chunk_region_offset = region.chunks[chunk_index].region_offset;
        let chunk_file_offset = region.chunks[chunk_index].file_offset;

        let mut map = MovedLinkeditMap::new();
        let mut cursor = 0u64;
        let mut push_piece = |kind: MovedLinkeditKind,
                              bytes: Option<&[u8]>,
                              size: u64,
                              region: &mut Region,
                              cursor: &mut u64| {
            let offset = chunk_region_offset + *cursor as usize;
            if let Some(bytes) = bytes {
                region.buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            map.insert(
                kind,
                MovedLinkedit {
                    cache_file_offset: chunk_file_offset + CacheFileSize::new(*cursor),
                    size: size as u32,
                    region_index,
                    region_offset: offset,
                },
            );
            *cursor = align_up(*cursor + size, 8);
        };

        if let Some(symtab) = image.symtab() {
            let nlist_bytes = image
                .data
                .get(symtab.symoff as usize..symtab.symoff as usize + sizes.nlist as usize);
            push_piece(
                MovedLinkeditKind::SymbolNlist,
                nlist_bytes,
                sizes.nlist,
                region,
                &mut cursor,
            );
            let string_bytes = image
                .data
                .get(symtab.stroff as usize..(symtab.stroff + symtab.strsize) as usize);
            push_piece(
                MovedLinkeditKind::SymbolStrings,
                string_bytes,
                sizes.strings,
                region,
                &mut cursor,
            );
        }
        if let Some(dysymtab) = image.dysymtab() {
            if dysymtab.nindirectsyms != 0 {
                let bytes = image.data.get(
                    dysymtab.indirectsymoff as usize
                        ..dysymtab.indirectsymoff as usize + sizes.indirect as usize,
                );
                push_piece(
                    MovedLinkeditKind::IndirectSymbols,
                    bytes,
                    sizes.indirect,
                    region,
                    &mut cursor,
                );
            }
        }
        if image.dyld_info().is_some() || image.linkedit_data_command(LC_DYLD_EXPORTS_TRIE).is_some()
        {
            push_piece(
                MovedLinkeditKind::ExportTrie,
                image.export_trie(),
                sizes.export_trie,
                region,
                &mut cursor,
            );
        }
        if let Some(bytes) = image.linkedit_data(LC_FUNCTION_STARTS) {
            push_piece(
                MovedLinkeditKind::FunctionStarts,
                Some(bytes),
                sizes.function_starts,
                region,
                &mut cursor,
            );
        }
        if let Some(bytes) = image.linkedit_data(LC_DATA_IN_CODE) {
            push_piece(
                MovedLinkeditKind::DataInCode,
                Some(bytes),
                sizes.data_in_code,
                region,
                &mut cursor,
            );
        }

        (map, chunk_index)
    }

    // =========================================================================
    // Flattening
    // =========================================================================

    /// Converts every tracked rebase in the dylib's segments to the packed
    /// pointer form, resolving out-of-band targets along the way. Bind
    /// entries keep their chain form; they are overwritten next.
    fn flatten_fixups(&self, regions: &mut [Region], dylib: &CacheDylib, image_index: usize) {
        let chain_format = self.images[image_index]
            .linkedit_data(LC_DYLD_CHAINED_FIXUPS)
            .and_then(ChainStarts::parse)
            .map(|starts| starts.pointer_format());
        let cache_base = self.config.cache_base_address;

        for segment in &dylib.segments {
            let region = &mut regions[segment.region_index];
            if !region.kind.holds_fixups() {
                continue;
            }

            let seg_start = segment.cache_vm_address;
            let seg_end = seg_start + VMOffset::new(segment.cache_vm_size.raw());

            let mut locations = Vec::new();
            region.tracker.for_each_fixup(|loc| {
                if loc >= seg_start && loc < seg_end {
                    locations.push(loc);
                }
                true
            });

            for loc in locations {
                let region_offset = (loc - region.vm_address).raw() as usize;
                let raw = read_u64_le(&region.buffer[region_offset..]);

                let (target, pmd, is_bind) = match chain_format {
                    Some(
                        DYLD_CHAINED_PTR_ARM64E
                        | DYLD_CHAINED_PTR_ARM64E_USERLAND
                        | DYLD_CHAINED_PTR_ARM64E_USERLAND24
                        | DYLD_CHAINED_PTR_ARM64E_KERNEL,
                    ) => {
                        let ptr = Arm64ePointer(raw);
                        if ptr.is_bind() {
                            (0, PointerMetaData::PLAIN, true)
                        } else if ptr.is_auth() {
                            let target = region
                                .tracker
                                .rebase_target64(loc)
                                .unwrap_or_else(|| ptr.auth_target());
                            (
                                target,
                                PointerMetaData::auth(
                                    ptr.auth_diversity(),
                                    ptr.auth_addr_div(),
                                    ptr.auth_key(),
                                ),
                                false,
                            )
                        } else {
                            let target = region
                                .tracker
                                .rebase_target64(loc)
                                .unwrap_or_else(|| ptr.rebase_target());
                            let pmd = PointerMetaData {
                                high8: ptr.rebase_high8(),
                                ..PointerMetaData::PLAIN
                            };
                            (target, pmd, false)
                        }
                    }
                    Some(_) => {
                        let ptr = Generic64Pointer(raw);
                        if ptr.is_bind() {
                            (0, PointerMetaData::PLAIN, true)
                        } else {
                            let target = region
                                .tracker
                                .rebase_target64(loc)
                                .unwrap_or_else(|| ptr.rebase_target());
                            let pmd = PointerMetaData {
                                high8: ptr.rebase_high8(),
                                ..PointerMetaData::PLAIN
                            };
                            (target, pmd, false)
                        }
                    }
                    None => {
                        // Opcode rebases wrote the raw slid address; the tag
                        // byte travels in the pointer's top byte
                        let target = region.tracker.rebase_target64(loc).unwrap_or(raw);
                        let high8 = (target >> 56) as u8;
                        let pmd = PointerMetaData {
                            high8,
                            ..PointerMetaData::PLAIN
                        };
                        (target & 0x00FF_FFFF_FFFF_FFFF, pmd, false)
                    }
                };
                if is_bind {
                    continue;
                }

                let (buffer, tracker) = region.buffer_and_tracker();
                let slot = &mut buffer[region_offset..region_offset + 8];
                if !Cache64::set_location(cache_base, slot, CacheVMAddress::new(target), pmd) {
                    // Keep the true target out of band; the packed slot
                    // stays zero
                    tracker.set_rebase_target64(loc, target);
                }
            }
        }
    }

    // =========================================================================
    // Bind application
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn apply_binds(
        &self,
        regions: &mut [Region],
        dylibs: &[CacheDylib],
        index: usize,
        binds: &DylibBinds,
        gots: &CoalescedGOTSection,
        auth_gots: &CoalescedGOTSection,
        patch_info: &mut PatchInfo,
        written_gots: &mut HashSet<GotKey>,
    ) {
        let cache_base = self.config.cache_base_address;
        let dylib = &dylibs[index];

        for (bind_index, target) in dylib.bind_targets.iter().enumerate() {
            patch_info.bind_target_names[bind_index] = target.name.clone();
        }

        for site in &binds.sites {
            let target = &dylib.bind_targets[site.bind_index];
            let Some(target_addr) = target.cache_vm_address(dylibs) else {
                // Absolute (including missing weak imports): write the raw
                // value, untracked
                let dylib::BindTargetKind::Absolute { value } = target.kind else {
                    continue;
                };
                let segment = &dylib.segments[site.segment_index];
                let region = &mut regions[segment.region_index];
                let offset = segment.region_offset + site.segment_offset as usize;
                crate::util::write_u64_le(&mut region.buffer[offset..], value);
                continue;
            };
            let target_with_addend =
                CacheVMAddress::new(target_addr.raw().wrapping_add_signed(site.addend));

            // The in-dylib slot is always bound, GOT or not
            let segment = &dylib.segments[site.segment_index];
            let loc = segment.cache_vm_address + VMOffset::new(site.segment_offset);
            self.write_bound_pointer(
                &mut regions[segment.region_index],
                loc,
                target_with_addend,
                site.pmd,
            );

            match site.got {
                None => {
                    patch_info.bind_uses[site.bind_index].push(PatchableLocation::new(
                        loc,
                        site.pmd,
                        site.addend as u64,
                    ));
                }
                Some(kind) => {
                    let section = match kind {
                        GotSectionKind::Regular => gots,
                        GotSectionKind::Auth => auth_gots,
                    };
                    let key = GotKey {
                        target_symbol_name: target.name.clone(),
                        target_dylib_name: match target.kind {
                            dylib::BindTargetKind::CacheImage { dylib_index, .. } => {
                                dylibs[dylib_index].install_name.clone()
                            }
                            _ => unreachable!("GOT bind without cache target"),
                        },
                        pmd: site.pmd,
                        is_function_variant: false,
                    };
                    let slot_addr = section
                        .entry_cache_address(&key)
                        .expect("uniqued GOT slot was not placed");

                    // Each uniqued slot is written once, on first use
                    if written_gots.insert(key) && section.should_emit_got(slot_addr)
                    {
                        let got_region_index = regions
                            .iter()
                            .position(|region| region.contains(slot_addr))
                            .expect("uniqued GOT chunk outside every region");
                        self.write_bound_pointer(
                            &mut regions[got_region_index],
                            slot_addr,
                            target_with_addend,
                            site.pmd,
                        );
                    }

                    let use_location = PatchableLocation::new(
                        slot_addr,
                        site.pmd,
                        site.addend as u64,
                    );
                    let got_use = GotUse {
                        location: use_location,
                        target_value: target_with_addend - cache_base,
                    };
                    match kind {
                        GotSectionKind::Regular => {
                            patch_info.bind_got_uses[site.bind_index].push(got_use)
                        }
                        GotSectionKind::Auth => {
                            patch_info.bind_auth_got_uses[site.bind_index].push(got_use)
                        }
                    }
                }
            }
        }
    }

    fn write_bound_pointer(
        &self,
        region: &mut Region,
        loc: CacheVMAddress,
        target: CacheVMAddress,
        pmd: PointerMetaData,
    ) {
        let cache_base = self.config.cache_base_address;
        let region_offset = (loc - region.vm_address).raw() as usize;
        let (buffer, tracker) = region.buffer_and_tracker();

        match self.config.pointer_format {
            PointerFormat::Cache64 => {
                let slot = &mut buffer[region_offset..region_offset + 8];
                if !Cache64::set_location(cache_base, slot, target, pmd) {
                    tracker.set_rebase_target64(loc, target.raw());
                }
            }
            PointerFormat::Cache32 => {
                let slot = &mut buffer[region_offset..region_offset + 4];
                if !Cache32::set_location(cache_base, slot, target) {
                    tracker.set_rebase_target32(loc, target.raw() as u32);
                }
            }
        }
        tracker.add(loc);
    }
}

/// Rewrites an offset map's values through a remap table.
fn apply_remap(map: &mut HashMap<u32, u32>, remap: &HashMap<u32, u32>) {
    for value in map.values_mut() {
        if let Some(&new_value) = remap.get(value) {
            *value = new_value;
        }
    }
}

/// Internal linkedit layout for one dylib.
#[derive(Debug, Default)]
struct LinkeditSizes {
    nlist: u64,
    strings: u64,
    indirect: u64,
    export_trie: u64,
    function_starts: u64,
    data_in_code: u64,
    total: u64,
}

#[cfg(test)]
mod tests;
