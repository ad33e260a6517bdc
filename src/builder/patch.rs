//! Patch table construction.
//!
//! The cache resolves every inter-dylib reference to a direct pointer at
//! build time, which would make it impossible to override ("root") one
//! dylib later. The patch table is the escape hatch: a cache-wide reverse
//! index from each exported symbol to every location that references it, so
//! a consumer can re-patch just those uses.
//!
//! The on-disk format is versioned; the builder emits v3, which is v2 plus
//! parallel tables for uses coming from the uniqued GOTs (a GOT slot is
//! shared by the whole cache, so its use records are cache-relative rather
//! than client-relative).

use std::collections::{BTreeMap, HashMap};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::builder::dylib::{BindTargetKind, CacheDylib};
use crate::error::{Error, Result};
use crate::macho::PointerMetaData;
use crate::types::{CacheVMAddress, VMOffset};

// =============================================================================
// On-Disk Structures
// =============================================================================

/// Leading field of every patch table version.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchInfoHeader {
    /// 2 or 3
    pub patch_table_version: u32,
}

/// Version 2/3 header. Array addresses are unslid cache VM addresses.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchInfoV2 {
    /// == 2 or 3
    pub patch_table_version: u32,
    /// == 0 for now
    pub patch_location_version: u32,
    /// Address of the per-image array
    pub patch_table_array_addr: u64,
    /// Count of per-image entries
    pub patch_table_array_count: u64,
    /// Address of the image-export array
    pub patch_image_exports_array_addr: u64,
    /// Count of image-export entries
    pub patch_image_exports_array_count: u64,
    /// Address of the client array
    pub patch_clients_array_addr: u64,
    /// Count of client entries
    pub patch_clients_array_count: u64,
    /// Address of the client-export array
    pub patch_client_exports_array_addr: u64,
    /// Count of client-export entries
    pub patch_client_exports_array_count: u64,
    /// Address of the patch-location array
    pub patch_location_array_addr: u64,
    /// Count of patch-location entries
    pub patch_location_array_count: u64,
    /// Address of the export-name pool
    pub patch_export_names_addr: u64,
    /// Size of the export-name pool
    pub patch_export_names_size: u64,
}

/// Version 3 header: the v2 header plus the GOT tables.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchInfoV3 {
    /// The v2 fields, with patch_table_version == 3
    pub v2: PatchInfoV2,
    /// Address of the per-image GOT-client array
    pub got_clients_array_addr: u64,
    /// Count of GOT-client entries (always the image count)
    pub got_clients_array_count: u64,
    /// Address of the GOT client-export array
    pub got_client_exports_array_addr: u64,
    /// Count of GOT client-export entries
    pub got_client_exports_array_count: u64,
    /// Address of the GOT patch-location array
    pub got_location_array_addr: u64,
    /// Count of GOT patch-location entries
    pub got_location_array_count: u64,
}

/// Per-image entry: which clients and exports belong to this image.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ImagePatchesV2 {
    /// First client entry for this image
    pub patch_clients_start_index: u32,
    /// Number of client entries
    pub patch_clients_count: u32,
    /// First image-export entry for this image
    pub patch_exports_start_index: u32,
    /// Number of image-export entries
    pub patch_exports_count: u32,
}

/// What a patched export is, beyond a plain symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// An ordinary symbol.
    Regular,
    /// A two-word CF object (`{ void* isa, uintptr_t }`).
    CfObj2,
    /// An ObjC class. Predates this enum; occupies the high bit of the
    /// 4-bit field.
    ObjcClass,
}

impl PatchKind {
    fn to_bits(self) -> u32 {
        match self {
            PatchKind::Regular => 0x0,
            PatchKind::CfObj2 => 0x1,
            PatchKind::ObjcClass => 0x8,
        }
    }

    fn from_bits(bits: u32) -> PatchKind {
        match bits {
            0x1 => PatchKind::CfObj2,
            0x8 => PatchKind::ObjcClass,
            _ => PatchKind::Regular,
        }
    }
}

/// One export of an image that has at least one recorded use.
///
/// The second word packs `exportNameOffset:28, patchKind:4`.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ImageExportV2 {
    /// Offset of the implementation from the exporting dylib's base
    pub dylib_offset_of_impl: u32,
    /// Packed name offset and patch kind
    pub name_offset_and_kind: u32,
}

impl ImageExportV2 {
    fn new(dylib_offset_of_impl: u32, name_offset: u32, kind: PatchKind) -> Self {
        assert!(name_offset < (1 << 28), "export name pool exceeds 28 bits");
        Self {
            dylib_offset_of_impl,
            name_offset_and_kind: (name_offset & 0x0FFF_FFFF) | (kind.to_bits() << 28),
        }
    }

    /// Offset of the export's name in the name pool.
    pub fn export_name_offset(&self) -> u32 {
        self.name_offset_and_kind & 0x0FFF_FFFF
    }

    /// The export's patch kind.
    pub fn patch_kind(&self) -> PatchKind {
        PatchKind::from_bits(self.name_offset_and_kind >> 28)
    }
}

/// One client of an image: a dylib that uses some of its exports.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ImageClientsV2 {
    /// Cache index of the client dylib
    pub client_dylib_index: u32,
    /// First client-export entry for this client
    pub patch_exports_start_index: u32,
    /// Number of client-export entries
    pub patch_exports_count: u32,
}

/// One export used by one client, pointing at its use locations.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchableExportV2 {
    /// Index into the image-export array
    pub image_export_index: u32,
    /// First location entry
    pub patch_locations_start_index: u32,
    /// Number of location entries
    pub patch_locations_count: u32,
}

/// One use site, relative to the client dylib.
///
/// The second word packs `high7:7, addend:5, authenticated:1,
/// usesAddressDiversity:1, key:2, discriminator:16` from bit 0 up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchableLocationV2 {
    /// Offset of the use from the client dylib's base
    pub dylib_offset_of_use: u32,
    /// Packed pointer metadata and addend
    pub packed: u32,
}

/// Per-image entry for GOT uses.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct GotClientsV3 {
    /// First GOT client-export entry for this image
    pub patch_exports_start_index: u32,
    /// Number of GOT client-export entries
    pub patch_exports_count: u32,
}

/// One export with GOT uses. Sorted by implementation offset so lookups can
/// binary search.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchableExportV3 {
    /// Index into the image-export array
    pub image_export_index: u32,
    /// First GOT location entry
    pub patch_locations_start_index: u32,
    /// Number of GOT location entries
    pub patch_locations_count: u32,
}

/// One GOT use site, relative to the whole cache (a uniqued GOT slot does
/// not belong to any one client).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PatchableLocationV3 {
    /// Offset of the use from the cache base
    pub cache_offset_of_use: u64,
    /// Packed pointer metadata and addend, as in v2
    pub packed: u32,
    /// Explicit tail padding; the C struct rounds up to 16 bytes
    pub padding: u32,
}

fn pack_location_bits(location: &PatchableLocation) -> u32 {
    (location.high7 as u32)
        | ((location.addend as u32 & 0x1F) << 7)
        | ((location.authenticated as u32) << 12)
        | ((location.uses_address_diversity as u32) << 13)
        | (((location.key & 0x3) as u32) << 14)
        | ((location.discriminator as u32) << 16)
}

fn unpack_location_bits(packed: u32) -> (PointerMetaData, u64) {
    let high7 = (packed & 0x7F) as u8;
    let addend5 = ((packed >> 7) & 0x1F) as u8;
    let pmd = PointerMetaData {
        high8: high7 << 1,
        diversity: (packed >> 16) as u16,
        uses_addr_diversity: (packed >> 13) & 1 != 0,
        key: ((packed >> 14) & 0x3) as u8,
        authenticated: (packed >> 12) & 1 != 0,
    };
    (pmd, sign_extend_addend(addend5))
}

/// The addend field is 5 bits, sign-extended from bit 4.
fn sign_extend_addend(addend5: u8) -> u64 {
    (((addend5 as i64) << 59) >> 59) as u64
}

// =============================================================================
// Builder-Side Records
// =============================================================================

/// One recorded use site, before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchableLocation {
    /// Cache address of the use
    pub cache_vm_addr: CacheVMAddress,
    /// Top 7 bits of a tagged pointer's high byte
    pub high7: u8,
    /// 5-bit addend
    pub addend: u8,
    /// Authenticated pointer
    pub authenticated: bool,
    /// Address diversity
    pub uses_address_diversity: bool,
    /// Signing key
    pub key: u8,
    /// PAC discriminator
    pub discriminator: u16,
}

impl PatchableLocation {
    /// Builds a location record, packing the metadata fields.
    ///
    /// # Panics
    ///
    /// Panics if the addend does not fit the 5-bit field or the high byte's
    /// low bit is set; both would truncate silently otherwise.
    pub fn new(cache_vm_addr: CacheVMAddress, pmd: PointerMetaData, addend: u64) -> Self {
        let location = Self {
            cache_vm_addr,
            high7: pmd.high8 >> 1,
            addend: (addend & 0x1F) as u8,
            authenticated: pmd.authenticated,
            uses_address_diversity: pmd.uses_addr_diversity,
            key: pmd.key,
            discriminator: pmd.diversity,
        };
        assert_eq!(
            sign_extend_addend(location.addend),
            addend,
            "addend {addend:#x} does not fit the 5-bit patch field"
        );
        assert_eq!(
            (location.high7 << 1),
            pmd.high8,
            "high8 {:#x} does not fit the 7-bit patch field",
            pmd.high8
        );
        location
    }
}

/// One GOT use: the location plus the slot's target value, kept so the GOT
/// emitter and the patch table agree on what the slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotUse {
    /// The use location
    pub location: PatchableLocation,
    /// VM offset of the target within the cache
    pub target_value: VMOffset,
}

/// Per-dylib patch input: one list per bind target, parallel to the dylib's
/// `bind_targets` array.
#[derive(Debug, Default)]
pub struct PatchInfo {
    /// Non-GOT uses of each bind target
    pub bind_uses: Vec<Vec<PatchableLocation>>,
    /// Uses coming from the uniqued GOTs
    pub bind_got_uses: Vec<Vec<GotUse>>,
    /// Uses coming from the uniqued auth GOTs
    pub bind_auth_got_uses: Vec<Vec<GotUse>>,
    /// Symbol name of each bind target
    pub bind_target_names: Vec<String>,
}

impl PatchInfo {
    /// Creates empty lists sized for `bind_count` targets.
    pub fn with_bind_count(bind_count: usize) -> Self {
        Self {
            bind_uses: vec![Vec::new(); bind_count],
            bind_got_uses: vec![Vec::new(); bind_count],
            bind_auth_got_uses: vec![Vec::new(); bind_count],
            bind_target_names: vec![String::new(); bind_count],
        }
    }
}

/// One client dylib's uses of another dylib's exports, keyed by export
/// address. Ordered so table emission is deterministic.
#[derive(Debug, Default)]
struct DylibClient {
    client_index: usize,
    uses: BTreeMap<CacheVMAddress, Vec<PatchableLocation>>,
}

/// The complete reverse index for one defining dylib.
#[derive(Debug, Default)]
struct DylibClients {
    clients: Vec<DylibClient>,
    /// Uses via uniqued GOTs; not attributed to any specific client
    got_client: DylibClient,
    /// Every export of this dylib with at least one use, sorted
    used_exports: Vec<CacheVMAddress>,
}

impl DylibClients {
    fn set_used_exports(&mut self, mut exports: Vec<CacheVMAddress>) {
        assert!(self.used_exports.is_empty(), "used exports set twice");
        exports.sort_unstable();
        exports.dedup();
        self.used_exports = exports;
    }

    fn export_index(&self, addr: CacheVMAddress) -> Option<u32> {
        self.used_exports
            .binary_search(&addr)
            .ok()
            .map(|index| index as u32)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Exports needing ObjC-class patch semantics.
pub type PatchableClassesSet = std::collections::HashSet<CacheVMAddress>;
/// Exports needing CF-object patch semantics.
pub type PatchableSingletonsSet = std::collections::HashSet<CacheVMAddress>;

/// Builds the cache-wide patch table from every dylib's bind records.
#[derive(Debug, Default)]
pub struct PatchTableBuilder {
    dylib_clients: Vec<DylibClients>,
    exports_to_name: HashMap<CacheVMAddress, String>,

    patch_images: Vec<ImagePatchesV2>,
    image_exports: Vec<ImageExportV2>,
    patch_clients: Vec<ImageClientsV2>,
    client_exports: Vec<PatchableExportV2>,
    patch_locations: Vec<PatchableLocationV2>,
    patch_export_names: Vec<u8>,
    got_clients: Vec<GotClientsV3>,
    got_client_exports: Vec<PatchableExportV3>,
    got_patch_locations: Vec<PatchableLocationV3>,
}

impl PatchTableBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges every dylib's use lists and assembles the on-disk arrays.
    ///
    /// `patch_infos` must be index-parallel with `dylibs`; a mismatch is a
    /// precondition violation reported as a typed error.
    pub fn build(
        &mut self,
        dylibs: &[CacheDylib],
        patch_infos: &[PatchInfo],
        patchable_objc_classes: &PatchableClassesSet,
        patchable_cf_obj2: &PatchableSingletonsSet,
        cache_base_address: CacheVMAddress,
    ) -> Result<()> {
        if dylibs.len() != patch_infos.len() {
            return Err(Error::PatchInfoMismatch {
                dylibs: dylibs.len(),
                infos: patch_infos.len(),
            });
        }

        self.dylib_clients = (0..dylibs.len()).map(|_| DylibClients::default()).collect();
        self.merge_patch_infos(dylibs, patch_infos);
        self.calculate_required_space(dylibs);
        self.calculate_patch_table(
            dylibs,
            patchable_objc_classes,
            patchable_cf_obj2,
            cache_base_address,
        );
        Ok(())
    }

    fn merge_patch_infos(&mut self, dylibs: &[CacheDylib], patch_infos: &[PatchInfo]) {
        for dylib in dylibs {
            let info = &patch_infos[dylib.cache_index];
            assert_eq!(
                dylib.bind_targets.len(),
                info.bind_uses.len(),
                "bind uses not parallel with bind targets for {}",
                dylib.install_name
            );
            assert_eq!(
                dylib.bind_targets.len(),
                info.bind_target_names.len(),
                "bind names not parallel with bind targets for {}",
                dylib.install_name
            );

            for (bind_index, bind_target) in dylib.bind_targets.iter().enumerate() {
                let client_uses = &info.bind_uses[bind_index];
                if client_uses.is_empty() {
                    continue;
                }

                // Absolute binds cannot be re-patched; the information that
                // bound them is gone
                if matches!(bind_target.kind, BindTargetKind::Absolute { .. }) {
                    continue;
                }
                let BindTargetKind::CacheImage {
                    target_runtime_offset,
                    dylib_index,
                    ..
                } = bind_target.kind
                else {
                    panic!(
                        "unplaced bind target survived to patch table construction in {}",
                        dylib.install_name
                    );
                };

                let target_vm_addr =
                    dylibs[dylib_index].cache_load_address + target_runtime_offset;
                let target_clients = &mut self.dylib_clients[dylib_index];

                // Append to this dylib's client record, creating it on first
                // touch; dylibs are processed one at a time so the last
                // client is ours if it exists
                if target_clients
                    .clients
                    .last()
                    .map(|client| client.client_index != dylib.cache_index)
                    .unwrap_or(true)
                {
                    target_clients.clients.push(DylibClient {
                        client_index: dylib.cache_index,
                        uses: BTreeMap::new(),
                    });
                }
                let client = target_clients.clients.last_mut().unwrap();
                client
                    .uses
                    .entry(target_vm_addr)
                    .or_default()
                    .extend(client_uses.iter().copied());

                self.exports_to_name
                    .entry(target_vm_addr)
                    .or_insert_with(|| info.bind_target_names[bind_index].clone());
            }

            // GOT uses all go into the shared per-target GOT bucket
            for got_uses in [&info.bind_got_uses, &info.bind_auth_got_uses] {
                assert_eq!(
                    dylib.bind_targets.len(),
                    got_uses.len(),
                    "GOT uses not parallel with bind targets for {}",
                    dylib.install_name
                );
                for (bind_index, bind_target) in dylib.bind_targets.iter().enumerate() {
                    let client_uses = &got_uses[bind_index];
                    if client_uses.is_empty() {
                        continue;
                    }
                    if matches!(bind_target.kind, BindTargetKind::Absolute { .. }) {
                        continue;
                    }
                    let BindTargetKind::CacheImage {
                        target_runtime_offset,
                        dylib_index,
                        ..
                    } = bind_target.kind
                    else {
                        panic!(
                            "unplaced bind target survived to patch table construction in {}",
                            dylib.install_name
                        );
                    };

                    let target_vm_addr =
                        dylibs[dylib_index].cache_load_address + target_runtime_offset;
                    let got_client = &mut self.dylib_clients[dylib_index].got_client;
                    got_client
                        .uses
                        .entry(target_vm_addr)
                        .or_default()
                        .extend(got_uses[bind_index].iter().map(|got| got.location));

                    self.exports_to_name
                        .entry(target_vm_addr)
                        .or_insert_with(|| info.bind_target_names[bind_index].clone());
                }
            }
        }
    }

    /// First pass: exact counts for every output array, so the assembly
    /// pass never reallocates.
    fn calculate_required_space(&mut self, dylibs: &[CacheDylib]) {
        let mut num_image_exports = 0usize;
        let mut num_patch_clients = 0usize;
        let mut num_client_exports = 0usize;
        let mut num_patch_locations = 0usize;
        let mut num_export_name_bytes = 0usize;
        let mut num_got_client_exports = 0usize;
        let mut num_got_patch_locations = 0usize;

        let mut export_name_offsets: HashMap<CacheVMAddress, usize> = HashMap::new();

        for dylib_index in 0..dylibs.len() {
            let clients_data = &mut self.dylib_clients[dylib_index];
            let mut used_exports = Vec::new();

            for client in &clients_data.clients {
                let mut client_used = false;
                for (&export_addr, uses) in &client.uses {
                    if uses.is_empty() {
                        continue;
                    }
                    client_used = true;
                    num_client_exports += 1;
                    num_patch_locations += uses.len();
                    used_exports.push(export_addr);

                    if let std::collections::hash_map::Entry::Vacant(entry) =
                        export_name_offsets.entry(export_addr)
                    {
                        entry.insert(num_export_name_bytes);
                        let name = self
                            .exports_to_name
                            .get(&export_addr)
                            .expect("export address with no recorded name");
                        num_export_name_bytes += name.len() + 1;
                    }
                }
                if client_used {
                    num_patch_clients += 1;
                }
            }

            // Many dylibs record the same GOT use; collapse duplicates now
            // so the counts match the assembly pass
            for (&export_addr, uses) in &mut clients_data.got_client.uses {
                uses.dedup();
                if uses.is_empty() {
                    continue;
                }
                num_got_client_exports += 1;
                num_got_patch_locations += uses.len();
                used_exports.push(export_addr);

                if let std::collections::hash_map::Entry::Vacant(entry) =
                    export_name_offsets.entry(export_addr)
                {
                    entry.insert(num_export_name_bytes);
                    let name = self
                        .exports_to_name
                        .get(&export_addr)
                        .expect("export address with no recorded name");
                    num_export_name_bytes += name.len() + 1;
                }
            }

            clients_data.set_used_exports(used_exports);
            num_image_exports += clients_data.used_exports.len();
        }

        self.patch_images.reserve(dylibs.len());
        self.image_exports.reserve(num_image_exports);
        self.patch_clients.reserve(num_patch_clients);
        self.client_exports.reserve(num_client_exports);
        self.patch_locations.reserve(num_patch_locations);
        self.patch_export_names.reserve(num_export_name_bytes);
        self.got_clients.reserve(dylibs.len());
        self.got_client_exports.reserve(num_got_client_exports);
        self.got_patch_locations.reserve(num_got_patch_locations);
    }

    /// Second pass: assembles every array, forward references only.
    fn calculate_patch_table(
        &mut self,
        dylibs: &[CacheDylib],
        patchable_objc_classes: &PatchableClassesSet,
        patchable_cf_obj2: &PatchableSingletonsSet,
        cache_base_address: CacheVMAddress,
    ) {
        let mut export_name_offsets: HashMap<CacheVMAddress, u32> = HashMap::new();

        for (dylib_index, dylib) in dylibs.iter().enumerate() {
            let clients_data = &self.dylib_clients[dylib_index];

            // Every dylib gets a patch image entry, even an unused one
            let mut patch_image = ImagePatchesV2 {
                patch_clients_start_index: self.patch_clients.len() as u32,
                patch_clients_count: 0,
                patch_exports_start_index: self.image_exports.len() as u32,
                patch_exports_count: clients_data.used_exports.len() as u32,
            };

            // Regular clients
            for client in &clients_data.clients {
                let mut client_image = ImageClientsV2 {
                    client_dylib_index: client.client_index as u32,
                    patch_exports_start_index: self.client_exports.len() as u32,
                    patch_exports_count: 0,
                };
                let client_base = dylibs[client.client_index].cache_load_address;
                let mut client_used = false;

                for (&export_addr, uses) in &client.uses {
                    if uses.is_empty() {
                        continue;
                    }
                    client_used = true;

                    let image_export_index = clients_data
                        .export_index(export_addr)
                        .expect("export missing from sizing pass");
                    self.client_exports.push(PatchableExportV2 {
                        image_export_index: patch_image.patch_exports_start_index
                            + image_export_index,
                        patch_locations_start_index: self.patch_locations.len() as u32,
                        patch_locations_count: uses.len() as u32,
                    });
                    client_image.patch_exports_count += 1;

                    for use_location in uses {
                        self.patch_locations.push(PatchableLocationV2 {
                            dylib_offset_of_use: (use_location.cache_vm_addr - client_base)
                                .raw() as u32,
                            packed: pack_location_bits(use_location),
                        });
                    }
                }

                if client_used {
                    patch_image.patch_clients_count += 1;
                    self.patch_clients.push(client_image);
                }
            }

            // GOT client, present for every image even when empty
            {
                let mut got_client = GotClientsV3 {
                    patch_exports_start_index: self.got_client_exports.len() as u32,
                    patch_exports_count: 0,
                };
                for (&export_addr, uses) in &clients_data.got_client.uses {
                    if uses.is_empty() {
                        continue;
                    }
                    let image_export_index = clients_data
                        .export_index(export_addr)
                        .expect("export missing from sizing pass");
                    self.got_client_exports.push(PatchableExportV3 {
                        image_export_index: patch_image.patch_exports_start_index
                            + image_export_index,
                        patch_locations_start_index: self.got_patch_locations.len() as u32,
                        patch_locations_count: uses.len() as u32,
                    });
                    got_client.patch_exports_count += 1;

                    for use_location in uses {
                        self.got_patch_locations.push(PatchableLocationV3 {
                            cache_offset_of_use: (use_location.cache_vm_addr
                                - cache_base_address)
                                .raw(),
                            packed: pack_location_bits(use_location),
                            padding: 0,
                        });
                    }
                }
                self.got_clients.push(got_client);
            }

            // Image exports, with names interned into the shared pool
            let image_base = dylib.cache_load_address;
            for &export_addr in &clients_data.used_exports {
                let name_offset = match export_name_offsets.entry(export_addr) {
                    std::collections::hash_map::Entry::Occupied(entry) => *entry.get(),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let offset = self.patch_export_names.len() as u32;
                        let name = &self.exports_to_name[&export_addr];
                        self.patch_export_names.extend_from_slice(name.as_bytes());
                        self.patch_export_names.push(0);
                        *entry.insert(offset)
                    }
                };

                let patch_kind = if patchable_objc_classes.contains(&export_addr) {
                    PatchKind::ObjcClass
                } else if patchable_cf_obj2.contains(&export_addr) {
                    PatchKind::CfObj2
                } else {
                    PatchKind::Regular
                };

                self.image_exports.push(ImageExportV2::new(
                    (export_addr - image_base).raw() as u32,
                    name_offset,
                    patch_kind,
                ));
            }

            self.patch_images.push(patch_image);
        }

        while self.patch_export_names.len() % 4 != 0 {
            self.patch_export_names.push(0);
        }
    }

    /// Total byte size of the emitted table.
    pub fn patch_table_size(&self) -> usize {
        std::mem::size_of::<PatchInfoV3>()
            + self.patch_images.len() * std::mem::size_of::<ImagePatchesV2>()
            + self.image_exports.len() * std::mem::size_of::<ImageExportV2>()
            + self.patch_clients.len() * std::mem::size_of::<ImageClientsV2>()
            + self.client_exports.len() * std::mem::size_of::<PatchableExportV2>()
            + self.patch_locations.len() * std::mem::size_of::<PatchableLocationV2>()
            + self.got_clients.len() * std::mem::size_of::<GotClientsV3>()
            + self.got_client_exports.len() * std::mem::size_of::<PatchableExportV3>()
            + self.got_patch_locations.len() * std::mem::size_of::<PatchableLocationV3>()
            + self.patch_export_names.len()
    }

    /// Serializes the v3 table into `buffer`, which will be mapped at
    /// `patch_info_addr`.
    pub fn write(&self, buffer: &mut [u8], patch_info_addr: CacheVMAddress) -> Result<()> {
        let total = self.patch_table_size();
        if total > buffer.len() {
            return Err(Error::PatchTableOverflow {
                needed: total,
                reserved: buffer.len(),
            });
        }

        let base = patch_info_addr.raw();
        let mut info = PatchInfoV3::default();
        info.v2.patch_table_version = 3;
        info.v2.patch_location_version = 0;
        info.v2.patch_table_array_addr = base + std::mem::size_of::<PatchInfoV3>() as u64;
        info.v2.patch_table_array_count = self.patch_images.len() as u64;
        info.v2.patch_image_exports_array_addr = info.v2.patch_table_array_addr
            + info.v2.patch_table_array_count * std::mem::size_of::<ImagePatchesV2>() as u64;
        info.v2.patch_image_exports_array_count = self.image_exports.len() as u64;
        info.v2.patch_clients_array_addr = info.v2.patch_image_exports_array_addr
            + info.v2.patch_image_exports_array_count * std::mem::size_of::<ImageExportV2>() as u64;
        info.v2.patch_clients_array_count = self.patch_clients.len() as u64;
        info.v2.patch_client_exports_array_addr = info.v2.patch_clients_array_addr
            + info.v2.patch_clients_array_count * std::mem::size_of::<ImageClientsV2>() as u64;
        info.v2.patch_client_exports_array_count = self.client_exports.len() as u64;
        info.v2.patch_location_array_addr = info.v2.patch_client_exports_array_addr
            + info.v2.patch_client_exports_array_count
                * std::mem::size_of::<PatchableExportV2>() as u64;
        info.v2.patch_location_array_count = self.patch_locations.len() as u64;
        info.got_clients_array_addr = info.v2.patch_location_array_addr
            + info.v2.patch_location_array_count
                * std::mem::size_of::<PatchableLocationV2>() as u64;
        info.got_clients_array_count = self.got_clients.len() as u64;
        info.got_client_exports_array_addr = info.got_clients_array_addr
            + info.got_clients_array_count * std::mem::size_of::<GotClientsV3>() as u64;
        info.got_client_exports_array_count = self.got_client_exports.len() as u64;
        info.got_location_array_addr = info.got_client_exports_array_addr
            + info.got_client_exports_array_count
                * std::mem::size_of::<PatchableExportV3>() as u64;
        info.got_location_array_count = self.got_patch_locations.len() as u64;
        info.v2.patch_export_names_addr = info.got_location_array_addr
            + info.got_location_array_count * std::mem::size_of::<PatchableLocationV3>() as u64;
        info.v2.patch_export_names_size = self.patch_export_names.len() as u64;

        let mut write_at = |addr: u64, bytes: &[u8]| {
            let offset = (addr - base) as usize;
            buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        };

        write_at(base, info.as_bytes());
        write_at(info.v2.patch_table_array_addr, self.patch_images.as_bytes());
        write_at(
            info.v2.patch_image_exports_array_addr,
            self.image_exports.as_bytes(),
        );
        write_at(info.v2.patch_clients_array_addr, self.patch_clients.as_bytes());
        write_at(
            info.v2.patch_client_exports_array_addr,
            self.client_exports.as_bytes(),
        );
        write_at(
            info.v2.patch_location_array_addr,
            self.patch_locations.as_bytes(),
        );
        write_at(info.got_clients_array_addr, self.got_clients.as_bytes());
        write_at(
            info.got_client_exports_array_addr,
            self.got_client_exports.as_bytes(),
        );
        write_at(
            info.got_location_array_addr,
            self.got_patch_locations.as_bytes(),
        );
        write_at(info.v2.patch_export_names_addr, &self.patch_export_names);

        Ok(())
    }
}

// =============================================================================
// Reader
// =============================================================================

/// A read-only view over an emitted patch table, dispatching on the version
/// word. Used by tests and by consumers that re-patch a rooted dylib.
pub struct PatchTable<'a> {
    data: &'a [u8],
    table_vm_addr: u64,
}

impl<'a> PatchTable<'a> {
    /// Wraps table bytes mapped at `table_vm_addr`.
    pub fn new(data: &'a [u8], table_vm_addr: CacheVMAddress) -> Self {
        Self {
            data,
            table_vm_addr: table_vm_addr.raw(),
        }
    }

    /// The version word.
    pub fn version(&self) -> u32 {
        PatchInfoHeader::read_from_prefix(self.data)
            .map(|(header, _)| header.patch_table_version)
            .unwrap_or(0)
    }

    fn info(&self) -> Result<PatchInfoV2> {
        match self.version() {
            2 | 3 => Ok(PatchInfoV2::read_from_prefix(self.data).unwrap().0),
            version => Err(Error::UnknownPatchTableVersion(version)),
        }
    }

    fn info_v3(&self) -> Result<PatchInfoV3> {
        match self.version() {
            3 => Ok(PatchInfoV3::read_from_prefix(self.data).unwrap().0),
            version => Err(Error::UnknownPatchTableVersion(version)),
        }
    }

    fn slice_at<T: FromBytes + Immutable + Copy>(&self, addr: u64, count: u64) -> Vec<T> {
        let offset = (addr - self.table_vm_addr) as usize;
        let mut out = Vec::with_capacity(count as usize);
        let size = std::mem::size_of::<T>();
        for index in 0..count as usize {
            let start = offset + index * size;
            out.push(T::read_from_prefix(&self.data[start..]).unwrap().0);
        }
        out
    }

    /// Number of images in the table.
    pub fn num_images(&self) -> u64 {
        self.info().map(|info| info.patch_table_array_count).unwrap_or(0)
    }

    fn images(&self) -> Vec<ImagePatchesV2> {
        let info = self.info().expect("invalid patch table");
        self.slice_at(info.patch_table_array_addr, info.patch_table_array_count)
    }

    fn image_exports(&self) -> Vec<ImageExportV2> {
        let info = self.info().expect("invalid patch table");
        self.slice_at(
            info.patch_image_exports_array_addr,
            info.patch_image_exports_array_count,
        )
    }

    fn export_name(&self, info: &PatchInfoV2, name_offset: u32) -> &str {
        let pool_offset = (info.patch_export_names_addr - self.table_vm_addr) as usize;
        let pool = &self.data
            [pool_offset..pool_offset + info.patch_export_names_size as usize];
        let start = name_offset as usize;
        let len = crate::util::memchr_null(&pool[start..]);
        std::str::from_utf8(&pool[start..start + len]).unwrap_or("")
    }

    /// How many exports of `image_index` have patch records.
    pub fn patchable_export_count(&self, image_index: u32) -> u32 {
        self.images()
            .get(image_index as usize)
            .map(|image| image.patch_exports_count)
            .unwrap_or(0)
    }

    /// True if `user_image_index` records at least one use of
    /// `image_index`'s exports.
    pub fn image_has_client(&self, image_index: u32, user_image_index: u32) -> bool {
        let info = self.info().expect("invalid patch table");
        let Some(image) = self.images().get(image_index as usize).copied() else {
            return false;
        };
        let clients: Vec<ImageClientsV2> =
            self.slice_at(info.patch_clients_array_addr, info.patch_clients_array_count);
        clients
            [image.patch_clients_start_index as usize
                ..(image.patch_clients_start_index + image.patch_clients_count) as usize]
            .iter()
            .any(|client| client.client_dylib_index == user_image_index)
    }

    /// Walks the patchable exports of one image. The callback returns
    /// `false` to stop early.
    pub fn for_each_patchable_export(
        &self,
        image_index: u32,
        mut callback: impl FnMut(u32, &str, PatchKind) -> bool,
    ) {
        let info = self.info().expect("invalid patch table");
        let Some(image) = self.images().get(image_index as usize).copied() else {
            return;
        };
        let exports = self.image_exports();
        for export in &exports[image.patch_exports_start_index as usize
            ..(image.patch_exports_start_index + image.patch_exports_count) as usize]
        {
            let name = self.export_name(&info, export.export_name_offset());
            if !callback(export.dylib_offset_of_impl, name, export.patch_kind()) {
                break;
            }
        }
    }

    /// Walks every non-GOT use of one export across every client.
    ///
    /// The callback receives (client image index, dylib-relative use offset,
    /// pointer metadata, addend) and returns `false` to stop early.
    pub fn for_each_patchable_use_of_export(
        &self,
        image_index: u32,
        dylib_offset_of_impl: u32,
        mut callback: impl FnMut(u32, u32, PointerMetaData, u64) -> bool,
    ) {
        let info = self.info().expect("invalid patch table");
        let Some(image) = self.images().get(image_index as usize).copied() else {
            return;
        };
        let image_exports = self.image_exports();
        let clients: Vec<ImageClientsV2> =
            self.slice_at(info.patch_clients_array_addr, info.patch_clients_array_count);
        let client_exports: Vec<PatchableExportV2> = self.slice_at(
            info.patch_client_exports_array_addr,
            info.patch_client_exports_array_count,
        );
        let locations: Vec<PatchableLocationV2> = self.slice_at(
            info.patch_location_array_addr,
            info.patch_location_array_count,
        );

        'clients: for client in &clients[image.patch_clients_start_index as usize
            ..(image.patch_clients_start_index + image.patch_clients_count) as usize]
        {
            for client_export in &client_exports[client.patch_exports_start_index as usize
                ..(client.patch_exports_start_index + client.patch_exports_count) as usize]
            {
                let image_export = &image_exports[client_export.image_export_index as usize];
                if image_export.dylib_offset_of_impl != dylib_offset_of_impl {
                    continue;
                }
                for location in &locations[client_export.patch_locations_start_index as usize
                    ..(client_export.patch_locations_start_index
                        + client_export.patch_locations_count) as usize]
                {
                    let (pmd, addend) = unpack_location_bits(location.packed);
                    if !callback(
                        client.client_dylib_index,
                        location.dylib_offset_of_use,
                        pmd,
                        addend,
                    ) {
                        break 'clients;
                    }
                }
                // Found this client's record for the export; other clients
                // may still have their own
                break;
            }
        }
    }

    /// Walks every GOT use of one export. Lookup is a binary search: the
    /// builder sorted GOT client-exports by implementation offset.
    ///
    /// The callback receives (cache-relative use offset, pointer metadata,
    /// addend) and returns `false` to stop early.
    pub fn for_each_patchable_got_use_of_export(
        &self,
        image_index: u32,
        dylib_offset_of_impl: u32,
        mut callback: impl FnMut(u64, PointerMetaData, u64) -> bool,
    ) {
        let Ok(info) = self.info_v3() else {
            // v2 has no GOT tables
            return;
        };
        let got_clients: Vec<GotClientsV3> =
            self.slice_at(info.got_clients_array_addr, info.got_clients_array_count);
        let Some(got_client) = got_clients.get(image_index as usize).copied() else {
            return;
        };
        let image_exports = self.image_exports();
        let got_client_exports: Vec<PatchableExportV3> = self.slice_at(
            info.got_client_exports_array_addr,
            info.got_client_exports_array_count,
        );
        let got_locations: Vec<PatchableLocationV3> =
            self.slice_at(info.got_location_array_addr, info.got_location_array_count);

        let exports = &got_client_exports[got_client.patch_exports_start_index as usize
            ..(got_client.patch_exports_start_index + got_client.patch_exports_count) as usize];
        if exports.is_empty() {
            return;
        }

        let mut found = None;
        let mut low = 0isize;
        let mut high = exports.len() as isize - 1;
        while low <= high {
            let mid = (low + high) / 2;
            let export = &exports[mid as usize];
            let impl_offset =
                image_exports[export.image_export_index as usize].dylib_offset_of_impl;
            if impl_offset == dylib_offset_of_impl {
                found = Some(export);
                break;
            }
            if dylib_offset_of_impl < impl_offset {
                high = mid - 1;
            } else {
                low = mid + 1;
            }
        }
        let Some(export) = found else { return };

        for location in &got_locations[export.patch_locations_start_index as usize
            ..(export.patch_locations_start_index + export.patch_locations_count) as usize]
        {
            let (pmd, addend) = unpack_location_bits(location.packed);
            if !callback(location.cache_offset_of_use, pmd, addend) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::dylib::{BindTarget, MovedLinkeditMap, NListInfo};

    const CACHE_BASE: CacheVMAddress = CacheVMAddress::new(0x1000);

    fn dylib(index: usize, name: &str, load_addr: u64, binds: Vec<BindTarget>) -> CacheDylib {
        CacheDylib {
            cache_index: index,
            install_name: name.to_string(),
            cache_load_address: CacheVMAddress::new(load_addr),
            segments: Vec::new(),
            linkedit: MovedLinkeditMap::new(),
            nlist_info: NListInfo::default(),
            dependents: Vec::new(),
            bind_targets: binds,
        }
    }

    fn bind_to(dylib_index: usize, offset: u64, name: &str) -> BindTarget {
        BindTarget {
            kind: BindTargetKind::CacheImage {
                target_runtime_offset: VMOffset::new(offset),
                dylib_index,
                is_weak_def: false,
                is_function_variant: false,
            },
            addend: 0,
            is_weak_import: false,
            name: name.to_string(),
        }
    }

    fn location(addr: u64) -> PatchableLocation {
        PatchableLocation::new(
            CacheVMAddress::new(addr),
            PointerMetaData::PLAIN,
            0,
        )
    }

    /// The canonical two-dylib scenario: A exports _foo at +0x100, B binds
    /// it from a regular location at B+0x40 and from one GOT slot.
    fn build_two_dylib_table() -> (Vec<u8>, CacheVMAddress) {
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let b = dylib(
            1,
            "/usr/lib/libB.dylib",
            0x2000,
            vec![bind_to(0, 0x100, "_foo")],
        );

        let info_a = PatchInfo::with_bind_count(0);
        let mut info_b = PatchInfo::with_bind_count(1);
        info_b.bind_target_names[0] = "_foo".to_string();
        info_b.bind_uses[0].push(location(0x2040));
        info_b.bind_got_uses[0].push(GotUse {
            location: location(0x9000),
            target_value: VMOffset::new(0x1100 - 0x1000),
        });

        let mut builder = PatchTableBuilder::new();
        builder
            .build(
                &[a, b],
                &[info_a, info_b],
                &PatchableClassesSet::new(),
                &PatchableSingletonsSet::new(),
                CACHE_BASE,
            )
            .unwrap();

        let table_addr = CacheVMAddress::new(0x10_0000);
        let mut buffer = vec![0u8; builder.patch_table_size()];
        builder.write(&mut buffer, table_addr).unwrap();
        (buffer, table_addr)
    }

    #[test]
    fn test_two_dylib_scenario() {
        let (buffer, table_addr) = build_two_dylib_table();
        let table = PatchTable::new(&buffer, table_addr);

        assert_eq!(table.version(), 3);
        assert_eq!(table.num_images(), 2);
        assert_eq!(table.patchable_export_count(0), 1);
        assert_eq!(table.patchable_export_count(1), 0);
        assert!(table.image_has_client(0, 1));
        assert!(!table.image_has_client(1, 0));

        // A's one patchable export is _foo at +0x100
        let mut exports = Vec::new();
        table.for_each_patchable_export(0, |impl_offset, name, kind| {
            exports.push((impl_offset, name.to_string(), kind));
            true
        });
        assert_eq!(exports, vec![(0x100, "_foo".to_string(), PatchKind::Regular)]);

        // Exactly one regular use: client B at B+0x40
        let mut uses = Vec::new();
        table.for_each_patchable_use_of_export(0, 0x100, |client, offset, pmd, addend| {
            uses.push((client, offset, pmd, addend));
            true
        });
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, 1);
        assert_eq!(uses[0].1, 0x40);
        assert_eq!(uses[0].3, 0);

        // Exactly one GOT use, cache-relative
        let mut got_uses = Vec::new();
        table.for_each_patchable_got_use_of_export(0, 0x100, |offset, pmd, addend| {
            got_uses.push((offset, pmd, addend));
            true
        });
        assert_eq!(got_uses.len(), 1);
        assert_eq!(got_uses[0].0, 0x9000 - CACHE_BASE.raw());
    }

    #[test]
    fn test_got_duplicates_collapsed_regular_preserved() {
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let b = dylib(
            1,
            "/usr/lib/libB.dylib",
            0x2000,
            vec![bind_to(0, 0x100, "_foo")],
        );

        let mut info_b = PatchInfo::with_bind_count(1);
        info_b.bind_target_names[0] = "_foo".to_string();
        // Two identical regular uses: both must survive
        info_b.bind_uses[0].push(location(0x2040));
        info_b.bind_uses[0].push(location(0x2040));
        // Two identical GOT uses: collapsed to one
        let got = GotUse {
            location: location(0x9000),
            target_value: VMOffset::new(0x100),
        };
        info_b.bind_got_uses[0].push(got);
        info_b.bind_got_uses[0].push(got);

        let info_a = PatchInfo::with_bind_count(0);

        let mut builder = PatchTableBuilder::new();
        builder
            .build(
                &[a, b],
                &[info_a, info_b],
                &PatchableClassesSet::new(),
                &PatchableSingletonsSet::new(),
                CACHE_BASE,
            )
            .unwrap();
        let table_addr = CacheVMAddress::new(0x10_0000);
        let mut buffer = vec![0u8; builder.patch_table_size()];
        builder.write(&mut buffer, table_addr).unwrap();
        let table = PatchTable::new(&buffer, table_addr);

        let mut regular_count = 0;
        table.for_each_patchable_use_of_export(0, 0x100, |_, _, _, _| {
            regular_count += 1;
            true
        });
        assert_eq!(regular_count, 2);

        let mut got_count = 0;
        table.for_each_patchable_got_use_of_export(0, 0x100, |_, _, _| {
            got_count += 1;
            true
        });
        assert_eq!(got_count, 1);
    }

    #[test]
    fn test_pointer_metadata_roundtrip() {
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let b = dylib(
            1,
            "/usr/lib/libB.dylib",
            0x2000,
            vec![bind_to(0, 0x100, "_foo")],
        );

        let pmd = PointerMetaData::auth(0xBEEF, true, 2);
        let mut info_b = PatchInfo::with_bind_count(1);
        info_b.bind_target_names[0] = "_foo".to_string();
        info_b.bind_uses[0].push(PatchableLocation::new(
            CacheVMAddress::new(0x2040),
            pmd,
            (-1i64) as u64,
        ));
        // The 5-bit field sign-extends from bit 4, so -1 round-trips
        let info_a = PatchInfo::with_bind_count(0);

        let mut builder = PatchTableBuilder::new();
        builder
            .build(
                &[a, b],
                &[info_a, info_b],
                &PatchableClassesSet::new(),
                &PatchableSingletonsSet::new(),
                CACHE_BASE,
            )
            .unwrap();
        let table_addr = CacheVMAddress::new(0x10_0000);
        let mut buffer = vec![0u8; builder.patch_table_size()];
        builder.write(&mut buffer, table_addr).unwrap();
        let table = PatchTable::new(&buffer, table_addr);

        let mut seen = Vec::new();
        table.for_each_patchable_use_of_export(0, 0x100, |_, _, pmd, addend| {
            seen.push((pmd, addend));
            true
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, pmd);
        assert_eq!(seen[0].1 as i64, -1);
    }

    #[test]
    fn test_patch_kind_objc_class() {
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let b = dylib(
            1,
            "/usr/lib/libB.dylib",
            0x2000,
            vec![bind_to(0, 0x200, "_OBJC_CLASS_$_Foo")],
        );

        let mut info_b = PatchInfo::with_bind_count(1);
        info_b.bind_target_names[0] = "_OBJC_CLASS_$_Foo".to_string();
        info_b.bind_uses[0].push(location(0x2040));
        let info_a = PatchInfo::with_bind_count(0);

        let mut classes = PatchableClassesSet::new();
        classes.insert(CacheVMAddress::new(0x1200));

        let mut builder = PatchTableBuilder::new();
        builder
            .build(
                &[a, b],
                &[info_a, info_b],
                &classes,
                &PatchableSingletonsSet::new(),
                CACHE_BASE,
            )
            .unwrap();
        let table_addr = CacheVMAddress::new(0x10_0000);
        let mut buffer = vec![0u8; builder.patch_table_size()];
        builder.write(&mut buffer, table_addr).unwrap();
        let table = PatchTable::new(&buffer, table_addr);

        let mut kinds = Vec::new();
        table.for_each_patchable_export(0, |_, _, kind| {
            kinds.push(kind);
            true
        });
        assert_eq!(kinds, vec![PatchKind::ObjcClass]);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let mut builder = PatchTableBuilder::new();
        let result = builder.build(
            &[a],
            &[],
            &PatchableClassesSet::new(),
            &PatchableSingletonsSet::new(),
            CACHE_BASE,
        );
        assert!(matches!(result, Err(Error::PatchInfoMismatch { .. })));
    }

    #[test]
    fn test_addend_overflow_panics() {
        let result = std::panic::catch_unwind(|| {
            PatchableLocation::new(CacheVMAddress::new(0x2040), PointerMetaData::PLAIN, 0x20)
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_export_with_no_uses_is_absent() {
        // A dylib with bind targets but no recorded uses emits no exports
        let a = dylib(0, "/usr/lib/libA.dylib", 0x1000, Vec::new());
        let b = dylib(
            1,
            "/usr/lib/libB.dylib",
            0x2000,
            vec![bind_to(0, 0x100, "_foo")],
        );
        let info_a = PatchInfo::with_bind_count(0);
        let mut info_b = PatchInfo::with_bind_count(1);
        info_b.bind_target_names[0] = "_foo".to_string();

        let mut builder = PatchTableBuilder::new();
        builder
            .build(
                &[a, b],
                &[info_a, info_b],
                &PatchableClassesSet::new(),
                &PatchableSingletonsSet::new(),
                CACHE_BASE,
            )
            .unwrap();
        let table_addr = CacheVMAddress::new(0x10_0000);
        let mut buffer = vec![0u8; builder.patch_table_size()];
        builder.write(&mut buffer, table_addr).unwrap();
        let table = PatchTable::new(&buffer, table_addr);

        assert_eq!(table.patchable_export_count(0), 0);
        assert!(!table.image_has_client(0, 1));
    }
}
