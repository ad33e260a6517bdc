//! Parsed Mach-O image.
//!
//! [`MachImage`] is the "parsed header" view of an input dylib that the rest
//! of the builder consumes: load-command and segment/section iteration plus
//! typed accessors for the linkedit payloads (symbol table, dyld info,
//! chained fixups, split-seg info, export trie). Structural validation
//! beyond what walking requires is not this crate's job.

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

/// A dependent dylib reference from a load command.
#[derive(Debug, Clone)]
pub struct LinkedDylib {
    /// Install name of the dependency
    pub install_name: String,
    /// LC_LOAD_DYLIB / LC_LOAD_WEAK_DYLIB / LC_REEXPORT_DYLIB / LC_LOAD_UPWARD_DYLIB
    pub cmd: u32,
}

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    DyldInfo {
        command: DyldInfoCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

/// A parsed, immutable view of one input Mach-O dylib.
#[derive(Debug)]
pub struct MachImage {
    /// The Mach-O header
    pub header: MachHeader64,
    /// The raw file bytes
    pub data: Vec<u8>,
    /// Parsed load commands, in file order
    pub load_commands: Vec<LoadCommandInfo>,
}

impl MachImage {
    /// Parses a Mach-O image from raw file bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(&data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut load_commands = Vec::with_capacity(header.ncmds as usize);
        let mut offset = MachHeader64::SIZE;
        let cmds_end = MachHeader64::SIZE + header.sizeofcmds as usize;

        for _ in 0..header.ncmds {
            if offset + LoadCommand::SIZE > cmds_end || cmds_end > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let lc = LoadCommand::read_from_prefix(&data[offset..]).unwrap().0;
            if lc.cmdsize as usize > cmds_end - offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let info = Self::parse_one_command(&data, offset, lc)?;
            load_commands.push(info);
            offset += lc.cmdsize as usize;
        }

        Ok(Self {
            header,
            data,
            load_commands,
        })
    }

    fn parse_one_command(data: &[u8], offset: usize, lc: LoadCommand) -> Result<LoadCommandInfo> {
        let bytes = &data[offset..];
        let info = match lc.cmd {
            LC_SEGMENT_64 => {
                let command = SegmentCommand64::read_from_prefix(bytes)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0;
                let mut sections = Vec::with_capacity(command.nsects as usize);
                for i in 0..command.nsects as usize {
                    let sect_offset = offset + SegmentCommand64::SIZE + i * Section64::SIZE;
                    let section = Section64::read_from_prefix(&data[sect_offset..])
                        .map_err(|_| Error::LoadCommandOverflow { offset: sect_offset })?
                        .0;
                    sections.push(SectionInfo {
                        section,
                        struct_offset: sect_offset,
                    });
                }
                LoadCommandInfo::Segment(SegmentInfo {
                    command,
                    command_offset: offset,
                    sections,
                })
            }
            LC_SYMTAB => LoadCommandInfo::Symtab {
                command: SymtabCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0,
                offset,
            },
            LC_DYSYMTAB => LoadCommandInfo::Dysymtab {
                command: DysymtabCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0,
                offset,
            },
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => LoadCommandInfo::DyldInfo {
                command: DyldInfoCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0,
                offset,
            },
            LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS | LC_DATA_IN_CODE
            | LC_DYLD_EXPORTS_TRIE | LC_DYLD_CHAINED_FIXUPS | LC_CODE_SIGNATURE => {
                LoadCommandInfo::LinkeditData {
                    command: LinkeditDataCommand::read_from_prefix(bytes)
                        .map_err(|_| Error::LoadCommandOverflow { offset })?
                        .0,
                    offset,
                }
            }
            LC_ID_DYLIB | LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB
            | LC_LOAD_UPWARD_DYLIB => {
                let command = DylibCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0;
                let name_start = offset + command.dylib.name_offset as usize;
                let name_end = offset + lc.cmdsize as usize;
                let name_bytes = &data[name_start..name_end.min(data.len())];
                let name_len = crate::util::memchr_null(name_bytes);
                let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
                LoadCommandInfo::Dylib {
                    command,
                    name,
                    offset,
                }
            }
            _ => LoadCommandInfo::Unknown {
                cmd: lc.cmd,
                cmdsize: lc.cmdsize,
                offset,
            },
        };
        Ok(info)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Iterates the image's segments in load-command order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Segment(seg) => Some(seg),
            _ => None,
        })
    }

    /// Returns the segment with the given name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments().find(|seg| seg.name() == name)
    }

    /// Returns the symbol table command, if present.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Symtab { command, .. } => Some(command),
            _ => None,
        })
    }

    /// Returns the dynamic symbol table command, if present.
    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dysymtab { command, .. } => Some(command),
            _ => None,
        })
    }

    /// Returns the dyld info command, if present.
    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::DyldInfo { command, .. } => Some(command),
            _ => None,
        })
    }

    /// Returns the linkedit-data command of the given type, if present.
    pub fn linkedit_data_command(&self, cmd_type: u32) -> Option<&LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::LinkeditData { command, .. } if command.cmd == cmd_type => {
                Some(command)
            }
            _ => None,
        })
    }

    /// Returns the payload of a linkedit-data command as a byte slice.
    pub fn linkedit_data(&self, cmd_type: u32) -> Option<&[u8]> {
        let cmd = self.linkedit_data_command(cmd_type)?;
        if cmd.datasize == 0 {
            return None;
        }
        self.data
            .get(cmd.dataoff as usize..(cmd.dataoff + cmd.datasize) as usize)
    }

    /// Returns the rebase opcode stream from LC_DYLD_INFO, if present.
    pub fn rebase_opcodes(&self) -> Option<&[u8]> {
        let info = self.dyld_info()?;
        if info.rebase_size == 0 {
            return None;
        }
        self.data
            .get(info.rebase_off as usize..(info.rebase_off + info.rebase_size) as usize)
    }

    /// Returns the export trie bytes, from either LC_DYLD_EXPORTS_TRIE or
    /// LC_DYLD_INFO.
    pub fn export_trie(&self) -> Option<&[u8]> {
        if let Some(trie) = self.linkedit_data(LC_DYLD_EXPORTS_TRIE) {
            return Some(trie);
        }
        let info = self.dyld_info()?;
        if info.export_size == 0 {
            return None;
        }
        self.data
            .get(info.export_off as usize..(info.export_off + info.export_size) as usize)
    }

    /// Returns the dylib's install name from LC_ID_DYLIB.
    pub fn install_name(&self) -> Option<&str> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd == LC_ID_DYLIB => {
                Some(name.as_str())
            }
            _ => None,
        })
    }

    /// Iterates the dylibs this image links against, in load-command order.
    ///
    /// Two-level-namespace bind ordinals index into this order (1-based).
    pub fn linked_dylibs(&self) -> impl Iterator<Item = LinkedDylib> + '_ {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd != LC_ID_DYLIB => {
                Some(LinkedDylib {
                    install_name: name.clone(),
                    cmd: command.cmd,
                })
            }
            _ => None,
        })
    }

    /// Converts an input VM address to a file offset within this image.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        for seg in self.segments() {
            let cmd = &seg.command;
            if addr >= cmd.vmaddr && addr < cmd.vmaddr + cmd.filesize {
                return Some((cmd.fileoff + (addr - cmd.vmaddr)) as usize);
            }
        }
        None
    }

    /// Returns the symbol table entries.
    pub fn nlist_entries(&self) -> Vec<Nlist64> {
        let Some(symtab) = self.symtab() else {
            return Vec::new();
        };
        let mut entries = Vec::with_capacity(symtab.nsyms as usize);
        for i in 0..symtab.nsyms as usize {
            let offset = symtab.symoff as usize + i * Nlist64::SIZE;
            match Nlist64::read_from_prefix(&self.data[offset.min(self.data.len())..]) {
                Ok((entry, _)) => entries.push(entry),
                Err(_) => break,
            }
        }
        entries
    }

    /// Looks up a name in the symbol string table.
    pub fn symbol_name(&self, strx: u32) -> Result<&str> {
        let symtab = self.symtab().ok_or(Error::StringTableOverflow {
            offset: strx,
            size: 0,
        })?;
        if strx >= symtab.strsize {
            return Err(Error::StringTableOverflow {
                offset: strx,
                size: symtab.strsize,
            });
        }
        let start = (symtab.stroff + strx) as usize;
        let bytes = &self.data[start..(symtab.stroff + symtab.strsize) as usize];
        let len = crate::util::memchr_null(bytes);
        std::str::from_utf8(&bytes[..len]).map_err(|_| Error::StringTableOverflow {
            offset: strx,
            size: symtab.strsize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn minimal_dylib() -> Vec<u8> {
        // A header, one segment with one section, and a symtab command
        let seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: *b"__TEXT\0\0\0\0\0\0\0\0\0\0",
            vmaddr: 0x1000,
            vmsize: 0x1000,
            fileoff: 0,
            filesize: 0x1000,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        let mut sect = Section64::read_from_bytes(&[0u8; Section64::SIZE]).unwrap();
        sect.sectname[..7].copy_from_slice(b"__text\0");
        sect.segname[..7].copy_from_slice(b"__TEXT\0");
        sect.addr = 0x1400;
        sect.size = 0x100;
        sect.offset = 0x400;

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        };

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 2,
            sizeofcmds: (seg.cmdsize + symtab.cmdsize) as u32,
            flags: 0,
            reserved: 0,
        };

        let mut data = Vec::new();
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(seg.as_bytes());
        data.extend_from_slice(sect.as_bytes());
        data.extend_from_slice(symtab.as_bytes());
        data.resize(0x1000, 0);
        data
    }

    #[test]
    fn test_parse_minimal() {
        let image = MachImage::parse(minimal_dylib()).unwrap();
        assert_eq!(image.header.ncmds, 2);
        assert_eq!(image.segments().count(), 1);
        let seg = image.segment("__TEXT").unwrap();
        assert_eq!(seg.sections.len(), 1);
        assert_eq!(seg.sections[0].section.name(), "__text");
        assert!(image.symtab().is_some());
        assert!(image.dysymtab().is_none());
    }

    #[test]
    fn test_addr_to_offset() {
        let image = MachImage::parse(minimal_dylib()).unwrap();
        assert_eq!(image.addr_to_offset(0x1400), Some(0x400));
        assert_eq!(image.addr_to_offset(0x4000), None);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = minimal_dylib();
        data[0] = 0;
        assert!(matches!(
            MachImage::parse(data),
            Err(Error::InvalidMachoMagic(_))
        ));
    }
}
