//! Export trie parsing and serialization.
//!
//! The export trie is a compact prefix tree of exported symbols. The builder
//! has to both read it (from input dylibs) and write it back (after sliding
//! export addresses to their cache locations), so unlike a plain extractor
//! this module carries an emitter as well as a parser.

use super::constants::*;
use crate::error::{Error, Result};
use crate::util::{read_uleb128, write_uleb128};

// =============================================================================
// Export Entries
// =============================================================================

/// One exported symbol from a trie, in flattened form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Symbol address (an offset from the image base), or the re-export
    /// ordinal for re-exported symbols
    pub address: u64,
    /// Resolver address for stub-and-resolver exports
    pub other: u64,
    /// For re-exports with a different name in the source dylib
    pub import_name: Option<String>,
}

impl ExportEntry {
    /// Returns true if this is a re-export.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is an absolute symbol.
    #[inline]
    pub fn is_absolute(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK) == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
    }

    /// Returns true if this carries a resolver function.
    #[inline]
    pub fn has_resolver(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0
    }
}

// =============================================================================
// Parser
// =============================================================================

/// Parses every export from a trie into a flat, name-ordered list.
pub fn parse_export_trie(data: &[u8]) -> Result<Vec<ExportEntry>> {
    let mut exports = Vec::new();
    if !data.is_empty() {
        parse_node(data, 0, String::new(), &mut exports)?;
    }
    Ok(exports)
}

fn parse_node(
    data: &[u8],
    offset: usize,
    prefix: String,
    exports: &mut Vec<ExportEntry>,
) -> Result<()> {
    if offset >= data.len() {
        return Err(Error::InvalidExportTrie { offset });
    }

    let node_data = &data[offset..];
    let (terminal_size, bytes_read) =
        read_uleb128(node_data).ok_or(Error::InvalidUleb128 { offset })?;
    let mut cursor = bytes_read;

    if terminal_size > 0 {
        exports.push(parse_terminal(&node_data[cursor..], &prefix, offset)?);
    }
    cursor += terminal_size as usize;

    if cursor >= node_data.len() {
        return Ok(());
    }

    let child_count = node_data[cursor] as usize;
    cursor += 1;

    for _ in 0..child_count {
        // Edge label is a null-terminated string
        let label_start = cursor;
        while cursor < node_data.len() && node_data[cursor] != 0 {
            cursor += 1;
        }
        let label = String::from_utf8_lossy(&node_data[label_start..cursor]).into_owned();
        cursor += 1;

        let (child_offset, bytes) =
            read_uleb128(&node_data[cursor..]).ok_or(Error::InvalidUleb128 { offset: cursor })?;
        cursor += bytes;

        let child_prefix = format!("{prefix}{label}");
        parse_node(data, child_offset as usize, child_prefix, exports)?;
    }

    Ok(())
}

fn parse_terminal(data: &[u8], name: &str, offset: usize) -> Result<ExportEntry> {
    let (flags, mut cursor) = read_uleb128(data).ok_or(Error::InvalidUleb128 { offset })?;

    let mut entry = ExportEntry {
        name: name.to_string(),
        flags,
        address: 0,
        other: 0,
        import_name: None,
    };

    if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
        let (ordinal, bytes) =
            read_uleb128(&data[cursor..]).ok_or(Error::InvalidUleb128 { offset })?;
        cursor += bytes;
        entry.address = ordinal;

        // Import name, when it differs from the exported name
        if cursor < data.len() && data[cursor] != 0 {
            let name_start = cursor;
            while cursor < data.len() && data[cursor] != 0 {
                cursor += 1;
            }
            entry.import_name =
                Some(String::from_utf8_lossy(&data[name_start..cursor]).into_owned());
        }
    } else {
        let (addr, bytes) = read_uleb128(&data[cursor..]).ok_or(Error::InvalidUleb128 { offset })?;
        cursor += bytes;
        entry.address = addr;

        if (flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 {
            let (resolver, _) =
                read_uleb128(&data[cursor..]).ok_or(Error::InvalidUleb128 { offset })?;
            entry.other = resolver;
        }
    }

    Ok(entry)
}

// =============================================================================
// Emitter
// =============================================================================

#[derive(Default)]
struct TrieNode {
    terminal: Option<usize>, // index into the entries slice
    children: Vec<(String, usize)>,
    trie_offset: usize,
}

/// Serializes export entries back into trie form.
///
/// Offsets inside the trie are uleb128-encoded and the encoding of an offset
/// changes its own length, so offset assignment iterates until it reaches a
/// fixed point before the final emission pass.
pub fn emit_export_trie(entries: &[ExportEntry]) -> Vec<u8> {
    if entries.is_empty() {
        return Vec::new();
    }

    let mut nodes: Vec<TrieNode> = vec![TrieNode::default()];
    for (index, entry) in entries.iter().enumerate() {
        insert_entry(&mut nodes, index, &entry.name);
    }

    // Assign offsets until stable
    loop {
        let mut offset = 0usize;
        let mut changed = false;
        for node_index in 0..nodes.len() {
            if nodes[node_index].trie_offset != offset {
                nodes[node_index].trie_offset = offset;
                changed = true;
            }
            offset += node_size(&nodes, node_index, entries);
        }
        if !changed {
            break;
        }
    }

    let mut out = Vec::new();
    for node_index in 0..nodes.len() {
        debug_assert_eq!(out.len(), nodes[node_index].trie_offset);
        emit_node(&nodes, node_index, entries, &mut out);
    }
    out
}

fn insert_entry(nodes: &mut Vec<TrieNode>, entry_index: usize, name: &str) {
    let mut current = 0usize;
    let mut remaining = name;

    'outer: loop {
        if remaining.is_empty() {
            nodes[current].terminal = Some(entry_index);
            return;
        }

        for child_pos in 0..nodes[current].children.len() {
            let label = nodes[current].children[child_pos].0.clone();
            let common = common_prefix_len(&label, remaining);
            if common == 0 {
                continue;
            }

            if common == label.len() {
                // Full edge match, descend
                current = nodes[current].children[child_pos].1;
                remaining = &remaining[common..];
                continue 'outer;
            }

            // Partial match: split the edge
            let old_child = nodes[current].children[child_pos].1;
            let mid_index = nodes.len();
            nodes.push(TrieNode::default());
            nodes[mid_index]
                .children
                .push((label[common..].to_string(), old_child));
            nodes[current].children[child_pos] = (label[..common].to_string(), mid_index);

            current = mid_index;
            remaining = &remaining[common..];
            continue 'outer;
        }

        // No matching edge: add a leaf
        let leaf_index = nodes.len();
        nodes.push(TrieNode::default());
        nodes[current]
            .children
            .push((remaining.to_string(), leaf_index));
        nodes[leaf_index].terminal = Some(entry_index);
        return;
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn terminal_payload(entry: &ExportEntry) -> Vec<u8> {
    let mut payload = Vec::new();
    write_uleb128(entry.flags, &mut payload);
    if entry.is_reexport() {
        write_uleb128(entry.address, &mut payload);
        if let Some(import_name) = &entry.import_name {
            payload.extend_from_slice(import_name.as_bytes());
        }
        payload.push(0);
    } else {
        write_uleb128(entry.address, &mut payload);
        if entry.has_resolver() {
            write_uleb128(entry.other, &mut payload);
        }
    }
    payload
}

fn node_size(nodes: &[TrieNode], node_index: usize, entries: &[ExportEntry]) -> usize {
    let node = &nodes[node_index];
    let mut size = 0usize;

    let mut scratch = Vec::new();
    match node.terminal {
        Some(entry_index) => {
            let payload = terminal_payload(&entries[entry_index]);
            write_uleb128(payload.len() as u64, &mut scratch);
            size += scratch.len() + payload.len();
        }
        None => {
            size += 1; // uleb(0)
        }
    }

    size += 1; // child count
    for (label, child) in &node.children {
        size += label.len() + 1;
        scratch.clear();
        write_uleb128(nodes[*child].trie_offset as u64, &mut scratch);
        size += scratch.len();
    }
    size
}

fn emit_node(nodes: &[TrieNode], node_index: usize, entries: &[ExportEntry], out: &mut Vec<u8>) {
    let node = &nodes[node_index];

    match node.terminal {
        Some(entry_index) => {
            let payload = terminal_payload(&entries[entry_index]);
            write_uleb128(payload.len() as u64, out);
            out.extend_from_slice(&payload);
        }
        None => out.push(0),
    }

    out.push(node.children.len() as u8);
    for (label, child) in &node.children {
        out.extend_from_slice(label.as_bytes());
        out.push(0);
        write_uleb128(nodes[*child].trie_offset as u64, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, address: u64) -> ExportEntry {
        ExportEntry {
            name: name.to_string(),
            flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR,
            address,
            other: 0,
            import_name: None,
        }
    }

    #[test]
    fn test_roundtrip_simple() {
        let entries = vec![entry("_foo", 0x100), entry("_foobar", 0x200), entry("_bar", 0x300)];
        let trie = emit_export_trie(&entries);
        let mut parsed = parse_export_trie(&trie).unwrap();
        parsed.sort_by(|a, b| a.name.cmp(&b.name));
        let mut expected = entries.clone();
        expected.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_roundtrip_shared_prefixes() {
        let names = [
            "_objc_msgSend",
            "_objc_msgSendSuper",
            "_objc_msgSendSuper2",
            "_objc_retain",
            "_objc_release",
            "_malloc",
        ];
        let entries: Vec<ExportEntry> = names
            .iter()
            .enumerate()
            .map(|(i, n)| entry(n, 0x1000 + (i as u64) * 0x10))
            .collect();

        let trie = emit_export_trie(&entries);
        let mut parsed = parse_export_trie(&trie).unwrap();
        assert_eq!(parsed.len(), entries.len());
        parsed.sort_by(|a, b| a.name.cmp(&b.name));
        for e in &entries {
            assert!(parsed.iter().any(|p| p == e), "missing {}", e.name);
        }
    }

    #[test]
    fn test_roundtrip_reexport_and_resolver() {
        let mut reexport = entry("_renamed", 2);
        reexport.flags = EXPORT_SYMBOL_FLAGS_REEXPORT;
        reexport.import_name = Some("_original".to_string());

        let mut resolver = entry("_dyn", 0x100);
        resolver.flags = EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER;
        resolver.other = 0x180;

        let entries = vec![reexport.clone(), resolver.clone()];
        let trie = emit_export_trie(&entries);
        let parsed = parse_export_trie(&trie).unwrap();
        assert!(parsed.contains(&reexport));
        assert!(parsed.contains(&resolver));
    }

    #[test]
    fn test_empty() {
        assert!(emit_export_trie(&[]).is_empty());
        assert!(parse_export_trie(&[]).unwrap().is_empty());
    }
}
