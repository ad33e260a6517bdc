//! End-to-end pipeline tests over synthesized dylibs.

use zerocopy::{FromBytes, IntoBytes};

use super::*;
use crate::builder::patch::PatchTable;
use crate::builder::region::ChunkKind;
use crate::macho::structs::*;
use crate::macho::trie::{emit_export_trie, ExportEntry};
use crate::util::write_uleb128;

const TEXT_SIZE: u64 = 0x4000;
const LINKEDIT_FILEOFF: u64 = 0xC000;

struct SynthDylib {
    install_name: &'static str,
    deps: Vec<&'static str>,
    exports: Vec<(&'static str, u64)>,
    /// (segment_index, segment_offset) pairs binding `_foo` from dep 1
    bind_sites: Vec<(u8, u64)>,
}

impl SynthDylib {
    fn new(install_name: &'static str) -> Self {
        Self {
            install_name,
            deps: Vec::new(),
            exports: Vec::new(),
            bind_sites: Vec::new(),
        }
    }

    fn build(&self) -> Vec<u8> {
        let export_trie = if self.exports.is_empty() {
            Vec::new()
        } else {
            let entries: Vec<ExportEntry> = self
                .exports
                .iter()
                .map(|(name, address)| ExportEntry {
                    name: name.to_string(),
                    flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR,
                    address: *address,
                    other: 0,
                    import_name: None,
                })
                .collect();
            emit_export_trie(&entries)
        };

        let bind_opcodes = if self.bind_sites.is_empty() {
            Vec::new()
        } else {
            let mut stream = Vec::new();
            stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
            stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
            stream.extend_from_slice(b"_foo\0");
            stream.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
            for &(segment_index, segment_offset) in &self.bind_sites {
                stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment_index);
                write_uleb128(segment_offset, &mut stream);
                stream.push(BIND_OPCODE_DO_BIND);
            }
            stream.push(BIND_OPCODE_DONE);
            stream
        };

        // Linkedit layout: split-seg blob, bind opcodes, export trie, strings
        let split_seg_off = LINKEDIT_FILEOFF;
        let split_seg = [DYLD_CACHE_ADJ_V2_FORMAT, 0x00];
        let bind_off = LINKEDIT_FILEOFF + 0x10;
        let export_off = LINKEDIT_FILEOFF + 0x100;
        let str_off = LINKEDIT_FILEOFF + 0x400;

        let mut segments: Vec<(SegmentCommand64, Vec<Section64>)> = Vec::new();

        let text = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: seg_name("__TEXT"),
            vmaddr: 0,
            vmsize: TEXT_SIZE,
            fileoff: 0,
            filesize: TEXT_SIZE,
            maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
            initprot: VM_PROT_READ | VM_PROT_EXECUTE,
            nsects: 0,
            flags: 0,
        };
        segments.push((text, Vec::new()));

        let data_const = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: seg_name("__DATA_CONST"),
            vmaddr: 0x4000,
            vmsize: 0x4000,
            fileoff: 0x4000,
            filesize: 0x4000,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            nsects: 1,
            flags: 0,
        };
        let mut got_section = Section64::read_from_bytes(&[0u8; Section64::SIZE]).unwrap();
        got_section.sectname[..5].copy_from_slice(b"__got");
        got_section.segname = seg_name("__DATA_CONST");
        got_section.addr = 0x4000;
        got_section.size = 0x10;
        got_section.offset = 0x4000;
        got_section.align = 3;
        got_section.flags = S_NON_LAZY_SYMBOL_POINTERS;
        segments.push((data_const, vec![got_section]));

        let data = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: seg_name("__DATA"),
            vmaddr: 0x8000,
            vmsize: 0x4000,
            fileoff: 0x8000,
            filesize: 0x4000,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            nsects: 0,
            flags: 0,
        };
        segments.push((data, Vec::new()));

        let linkedit = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: seg_name("__LINKEDIT"),
            vmaddr: 0xC000,
            vmsize: 0x4000,
            fileoff: LINKEDIT_FILEOFF,
            filesize: 0x1000,
            maxprot: VM_PROT_READ,
            initprot: VM_PROT_READ,
            nsects: 0,
            flags: 0,
        };
        segments.push((linkedit, Vec::new()));

        // Non-segment load commands
        let mut commands: Vec<Vec<u8>> = Vec::new();
        commands.push(dylib_command(LC_ID_DYLIB, self.install_name));
        for dep in &self.deps {
            commands.push(dylib_command(LC_LOAD_DYLIB, dep));
        }

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: str_off as u32,
            nsyms: 0,
            stroff: str_off as u32,
            strsize: 8,
        };
        commands.push(symtab.as_bytes().to_vec());

        let mut dysymtab_bytes = vec![0u8; DysymtabCommand::SIZE];
        dysymtab_bytes[..4].copy_from_slice(&LC_DYSYMTAB.to_le_bytes());
        dysymtab_bytes[4..8].copy_from_slice(&(DysymtabCommand::SIZE as u32).to_le_bytes());
        commands.push(dysymtab_bytes);

        let dyld_info = DyldInfoCommand {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: DyldInfoCommand::SIZE as u32,
            rebase_off: 0,
            rebase_size: 0,
            bind_off: if bind_opcodes.is_empty() { 0 } else { bind_off as u32 },
            bind_size: bind_opcodes.len() as u32,
            weak_bind_off: 0,
            weak_bind_size: 0,
            lazy_bind_off: 0,
            lazy_bind_size: 0,
            export_off: if export_trie.is_empty() { 0 } else { export_off as u32 },
            export_size: export_trie.len() as u32,
        };
        commands.push(dyld_info.as_bytes().to_vec());

        let split_seg_cmd = LinkeditDataCommand {
            cmd: LC_SEGMENT_SPLIT_INFO,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: split_seg_off as u32,
            datasize: split_seg.len() as u32,
        };
        commands.push(split_seg_cmd.as_bytes().to_vec());

        // Assemble
        let sizeofcmds: usize = segments
            .iter()
            .map(|(cmd, _)| cmd.cmdsize as usize)
            .sum::<usize>()
            + commands.iter().map(Vec::len).sum::<usize>();
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: (segments.len() + commands.len()) as u32,
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        };

        let mut file = Vec::new();
        file.extend_from_slice(header.as_bytes());
        for (cmd, sections) in &segments {
            file.extend_from_slice(cmd.as_bytes());
            for section in sections {
                file.extend_from_slice(section.as_bytes());
            }
        }
        for command in &commands {
            file.extend_from_slice(command);
        }
        file.resize((LINKEDIT_FILEOFF + 0x1000) as usize, 0);

        // Linkedit payloads
        file[split_seg_off as usize..split_seg_off as usize + split_seg.len()]
            .copy_from_slice(&split_seg);
        file[bind_off as usize..bind_off as usize + bind_opcodes.len()]
            .copy_from_slice(&bind_opcodes);
        file[export_off as usize..export_off as usize + export_trie.len()]
            .copy_from_slice(&export_trie);

        file
    }
}

fn seg_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn dylib_command(cmd: u32, install_name: &str) -> Vec<u8> {
    let name_bytes = install_name.len() + 1;
    let cmdsize = crate::util::align_up((DylibCommand::SIZE + name_bytes) as u64, 8) as u32;
    let command = DylibCommand {
        cmd,
        cmdsize,
        dylib: Dylib {
            name_offset: DylibCommand::SIZE as u32,
            timestamp: 1,
            current_version: 0x1_0000,
            compatibility_version: 0x1_0000,
        },
    };
    let mut out = command.as_bytes().to_vec();
    out.extend_from_slice(install_name.as_bytes());
    out.resize(cmdsize as usize, 0);
    out
}

fn exporter() -> SynthDylib {
    let mut dylib = SynthDylib::new("/usr/lib/libA.dylib");
    dylib.exports.push(("_foo", 0x100));
    dylib
}

fn importer(name: &'static str) -> SynthDylib {
    let mut dylib = SynthDylib::new(name);
    dylib.deps.push("/usr/lib/libA.dylib");
    // One regular use in __DATA (segment 2) and one GOT slot (segment 1)
    dylib.bind_sites.push((2, 0x40));
    dylib.bind_sites.push((1, 0x0));
    dylib
}

fn build_cache(synths: &[&SynthDylib]) -> BuiltCache {
    let mut builder = CacheBuilder::new(BuilderConfig::default());
    for synth in synths {
        builder.add_dylib(synth.build()).unwrap();
    }
    builder.build().unwrap()
}

fn patch_table(cache: &BuiltCache) -> PatchTable<'_> {
    let region = cache
        .regions
        .iter()
        .find(|region| {
            region
                .chunks
                .iter()
                .any(|chunk| chunk.kind == ChunkKind::PatchTable)
        })
        .expect("no patch table region");
    PatchTable::new(region.chunk_bytes(0), cache.patch_table_addr)
}

#[test]
fn test_example_scenario() {
    let a = exporter();
    let b = importer("/usr/lib/libB.dylib");
    let cache = build_cache(&[&a, &b]);
    let config = BuilderConfig::default();

    let a_load = cache.dylibs[0].cache_load_address;
    let b_load = cache.dylibs[1].cache_load_address;
    let foo_addr = CacheVMAddress::new(a_load.raw() + 0x100);

    // B's regular bind slot holds a packed pointer to A's _foo
    let b_data = cache.dylibs[1]
        .segments
        .iter()
        .find(|segment| segment.name == "__DATA")
        .unwrap();
    let data_region = &cache.regions[b_data.region_index];
    let slot = &data_region.buffer[b_data.region_offset + 0x40..b_data.region_offset + 0x48];
    assert_eq!(
        Cache64::cache_vm_address(config.cache_base_address, slot),
        foo_addr
    );
    let slot_addr = b_data.cache_vm_address + VMOffset::new(0x40);
    assert!(data_region.tracker.has(slot_addr));

    // Exactly one uniqued GOT slot, resolved to _foo
    let got_region = cache
        .regions
        .iter()
        .find(|region| {
            region
                .chunks
                .iter()
                .any(|chunk| chunk.kind == ChunkKind::UniquedGots)
        })
        .expect("no uniqued GOT region");
    let got_chunk = got_region
        .chunks
        .iter()
        .find(|chunk| chunk.kind == ChunkKind::UniquedGots)
        .unwrap();
    assert_eq!(got_chunk.vm_size.raw(), 8, "exactly one uniqued slot");
    let got_slot = &got_region.buffer[got_chunk.region_offset..got_chunk.region_offset + 8];
    assert_eq!(
        Cache64::cache_vm_address(config.cache_base_address, got_slot),
        foo_addr
    );
    assert!(got_region.tracker.has(got_chunk.vm_address));

    // The patch table records exactly one regular use and one GOT use
    let table = patch_table(&cache);
    assert_eq!(table.version(), 3);
    assert_eq!(table.num_images(), 2);

    let mut exports = Vec::new();
    table.for_each_patchable_export(0, |impl_offset, name, _| {
        exports.push((impl_offset, name.to_string()));
        true
    });
    assert_eq!(exports, vec![(0x100, "_foo".to_string())]);

    let mut uses = Vec::new();
    table.for_each_patchable_use_of_export(0, 0x100, |client, offset, _, addend| {
        uses.push((client, offset, addend));
        true
    });
    let expected_use_offset =
        (b_data.cache_vm_address.raw() + 0x40 - b_load.raw()) as u32;
    assert_eq!(uses, vec![(1, expected_use_offset, 0)]);

    let mut got_uses = Vec::new();
    table.for_each_patchable_got_use_of_export(0, 0x100, |offset, _, _| {
        got_uses.push(offset);
        true
    });
    assert_eq!(
        got_uses,
        vec![got_chunk.vm_address.raw() - config.cache_base_address.raw()]
    );
}

#[test]
fn test_got_uniquing_across_clients() {
    let a = exporter();
    let b = importer("/usr/lib/libB.dylib");
    let c = importer("/usr/lib/libC.dylib");
    let cache = build_cache(&[&a, &b, &c]);

    // B and C bind the same symbol with the same metadata: one shared slot
    let got_chunk = cache
        .regions
        .iter()
        .flat_map(|region| &region.chunks)
        .find(|chunk| chunk.kind == ChunkKind::UniquedGots)
        .expect("no uniqued GOT chunk");
    assert_eq!(got_chunk.vm_size.raw(), 8);

    // Identical GOT uses from different clients collapse to one record
    let table = patch_table(&cache);
    let mut got_uses = 0;
    table.for_each_patchable_got_use_of_export(0, 0x100, |_, _, _| {
        got_uses += 1;
        true
    });
    assert_eq!(got_uses, 1);

    // But each client keeps its own regular use
    let mut regular_clients = Vec::new();
    table.for_each_patchable_use_of_export(0, 0x100, |client, _, _, _| {
        regular_clients.push(client);
        true
    });
    regular_clients.sort_unstable();
    assert_eq!(regular_clients, vec![1, 2]);
    assert!(table.image_has_client(0, 1));
    assert!(table.image_has_client(0, 2));
    assert!(!table.image_has_client(0, 0));
}

#[test]
fn test_adjusted_headers_marked_and_stripped() {
    let a = exporter();
    let b = importer("/usr/lib/libB.dylib");
    let cache = build_cache(&[&a, &b]);

    for dylib in &cache.dylibs {
        let text = &dylib.segments[0];
        let region = &cache.regions[text.region_index];
        let header_bytes = &region.buffer[text.region_offset..];
        let header = MachHeader64::read_from_prefix(header_bytes).unwrap().0;
        assert_ne!(
            header.flags & MachOFlags::DYLIB_IN_CACHE.bits(),
            0,
            "{} not marked as cache-processed",
            dylib.install_name
        );

        // Split-seg info is dropped from cache copies
        let mut offset = MachHeader64::SIZE;
        for _ in 0..header.ncmds {
            let lc = LoadCommand::read_from_prefix(&header_bytes[offset..]).unwrap().0;
            assert_ne!(lc.cmd, LC_SEGMENT_SPLIT_INFO);
            offset += lc.cmdsize as usize;
        }

        // Segment commands carry cache placement
        let seg = SegmentCommand64::read_from_prefix(&header_bytes[MachHeader64::SIZE..])
            .unwrap()
            .0;
        assert_eq!(seg.vmaddr, dylib.cache_load_address.raw());
    }
}

#[test]
fn test_missing_strong_symbol_fails_build() {
    let a = exporter();
    let mut b = importer("/usr/lib/libB.dylib");
    b.deps.clear();
    b.deps.push("/usr/lib/libMissing.dylib");

    let mut builder = CacheBuilder::new(BuilderConfig::default());
    builder.add_dylib(a.build()).unwrap();
    builder.add_dylib(b.build()).unwrap();
    let result = builder.build();
    assert!(matches!(result, Err(Error::AdjustmentFailed { .. })));
}

#[test]
fn test_serialize_covers_all_regions() {
    let a = exporter();
    let b = importer("/usr/lib/libB.dylib");
    let cache = build_cache(&[&a, &b]);
    let bytes = cache.serialize();

    for region in &cache.regions {
        let start = region.file_offset.raw() as usize;
        assert!(start + region.buffer.len() <= bytes.len());
        assert_eq!(&bytes[start..start + region.buffer.len()], &region.buffer[..]);
    }
    assert!(cache.fixup_count() >= 3);
}
