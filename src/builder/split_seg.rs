//! Split-seg-info v2 decoding.
//!
//! A linked image carries split-seg info describing every reference between
//! its sections, so that a consumer relocating those sections independently
//! can correct each reference. The v2 encoding is a nested delta structure:
//!
//! ```text
//! format-byte(0x7F)
//! uleb(sectionPairCount)
//!   { uleb(fromSect) uleb(toSect) uleb(toOffsetCount)
//!     { uleb(toOffsetDelta) uleb(fromOffsetCount)
//!       { uleb(kind) uleb(fromOffsetDeltaCount)
//!         { uleb(fromOffsetDelta) } } } }
//! ```
//!
//! Offsets accumulate within their enclosing group; the from-offset
//! accumulator resets for each kind group.

use crate::macho::constants::{DYLD_CACHE_ADJ_V2_FORMAT, DYLD_CACHE_ADJ_V2_MAX_KIND};
use crate::util::read_uleb128;

/// One decoded reference from the split-seg stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSegReference {
    /// Index of the section-pair group this reference belongs to. Pairing
    /// state for MOVW/MOVT sequences is scoped to one group.
    pub pair_index: u64,
    /// Reference kind (DYLD_CACHE_ADJ_V2_*)
    pub kind: u64,
    /// Section containing the reference (0 = mach header)
    pub from_section: u64,
    /// Offset of the reference within its section
    pub from_offset: u64,
    /// Section the reference points into
    pub to_section: u64,
    /// Offset of the target within its section
    pub to_offset: u64,
}

/// Decoding failures. These are malformed-input conditions, surfaced to the
/// caller's diagnostics sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitSegError {
    /// The blob does not start with the v2 format byte.
    NotV2,
    /// A uleb ran off the end of the blob.
    Truncated,
    /// A reference kind above the known maximum.
    UnknownKind(u64),
}

impl std::fmt::Display for SplitSegError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitSegError::NotV2 => write!(f, "malformed split seg info (not v2)"),
            SplitSegError::Truncated => write!(f, "truncated split seg info"),
            SplitSegError::UnknownKind(kind) => {
                write!(f, "unknown split seg info v2 kind value ({kind})")
            }
        }
    }
}

/// Returns true if the blob claims the v2 format.
pub fn is_v2(blob: &[u8]) -> bool {
    blob.first() == Some(&DYLD_CACHE_ADJ_V2_FORMAT)
}

struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn uleb(&mut self) -> Result<u64, SplitSegError> {
        let (value, consumed) =
            read_uleb128(&self.data[self.position.min(self.data.len())..])
                .ok_or(SplitSegError::Truncated)?;
        self.position += consumed;
        Ok(value)
    }
}

/// Walks every reference in a v2 split-seg blob, in stream order.
///
/// The callback returns `false` to stop early (the walk returns `Ok`).
pub fn for_each_reference_v2(
    blob: &[u8],
    mut callback: impl FnMut(&SplitSegReference) -> bool,
) -> Result<(), SplitSegError> {
    if !is_v2(blob) {
        return Err(SplitSegError::NotV2);
    }

    let mut cursor = Cursor {
        data: blob,
        position: 1,
    };

    let section_pair_count = cursor.uleb()?;
    for pair_index in 0..section_pair_count {
        let from_section = cursor.uleb()?;
        let to_section = cursor.uleb()?;
        let to_offset_count = cursor.uleb()?;

        let mut to_offset = 0u64;
        for _ in 0..to_offset_count {
            let to_delta = cursor.uleb()?;
            let from_offset_count = cursor.uleb()?;
            to_offset = to_offset.wrapping_add(to_delta);

            for _ in 0..from_offset_count {
                let kind = cursor.uleb()?;
                if kind > DYLD_CACHE_ADJ_V2_MAX_KIND {
                    return Err(SplitSegError::UnknownKind(kind));
                }
                let from_delta_count = cursor.uleb()?;
                let mut from_offset = 0u64;
                for _ in 0..from_delta_count {
                    from_offset = from_offset.wrapping_add(cursor.uleb()?);
                    let reference = SplitSegReference {
                        pair_index,
                        kind,
                        from_section,
                        from_offset,
                        to_section,
                        to_offset,
                    };
                    if !callback(&reference) {
                        return Ok(());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Encodes references into the v2 format. Test support for the decoder and
/// for the adjustor's synthetic-image tests.
#[cfg(test)]
pub(crate) fn encode_v2(references: &[SplitSegReference]) -> Vec<u8> {
    use crate::util::write_uleb128;
    use std::collections::BTreeMap;

    // (from_section, to_section) -> to_offset -> kind -> [from_offset]
    type KindMap = BTreeMap<u64, Vec<u64>>;
    type ToMap = BTreeMap<u64, KindMap>;
    let mut pairs: BTreeMap<(u64, u64), ToMap> = BTreeMap::new();
    for r in references {
        pairs
            .entry((r.from_section, r.to_section))
            .or_default()
            .entry(r.to_offset)
            .or_default()
            .entry(r.kind)
            .or_default()
            .push(r.from_offset);
    }

    let mut out = vec![DYLD_CACHE_ADJ_V2_FORMAT];
    write_uleb128(pairs.len() as u64, &mut out);
    for ((from_section, to_section), to_map) in pairs {
        write_uleb128(from_section, &mut out);
        write_uleb128(to_section, &mut out);
        write_uleb128(to_map.len() as u64, &mut out);
        let mut last_to = 0u64;
        for (to_offset, kinds) in to_map {
            write_uleb128(to_offset - last_to, &mut out);
            last_to = to_offset;
            write_uleb128(kinds.len() as u64, &mut out);
            for (kind, mut from_offsets) in kinds {
                write_uleb128(kind, &mut out);
                from_offsets.sort_unstable();
                write_uleb128(from_offsets.len() as u64, &mut out);
                let mut last_from = 0u64;
                for from_offset in from_offsets {
                    write_uleb128(from_offset - last_from, &mut out);
                    last_from = from_offset;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::constants::*;

    #[test]
    fn test_not_v2() {
        assert_eq!(
            for_each_reference_v2(&[0x01, 0x00], |_| true),
            Err(SplitSegError::NotV2)
        );
        assert!(!is_v2(&[2, 0]));
        assert!(is_v2(&[DYLD_CACHE_ADJ_V2_FORMAT]));
    }

    #[test]
    fn test_empty_stream() {
        let blob = vec![DYLD_CACHE_ADJ_V2_FORMAT, 0x00];
        let mut count = 0;
        for_each_reference_v2(&blob, |_| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_roundtrip() {
        let references = vec![
            SplitSegReference {
                pair_index: 0,
                kind: DYLD_CACHE_ADJ_V2_POINTER_64,
                from_section: 2,
                from_offset: 0x10,
                to_section: 1,
                to_offset: 0x40,
            },
            SplitSegReference {
                pair_index: 0,
                kind: DYLD_CACHE_ADJ_V2_POINTER_64,
                from_section: 2,
                from_offset: 0x28,
                to_section: 1,
                to_offset: 0x40,
            },
            SplitSegReference {
                pair_index: 0,
                kind: DYLD_CACHE_ADJ_V2_ARM64_ADRP,
                from_section: 1,
                from_offset: 0x8,
                to_section: 2,
                to_offset: 0x100,
            },
        ];

        let blob = encode_v2(&references);
        let mut decoded = Vec::new();
        for_each_reference_v2(&blob, |r| {
            decoded.push(*r);
            true
        })
        .unwrap();

        assert_eq!(decoded.len(), references.len());
        for r in &references {
            assert!(
                decoded.iter().any(|d| (d.kind, d.from_section, d.from_offset, d.to_section, d.to_offset)
                    == (r.kind, r.from_section, r.from_offset, r.to_section, r.to_offset)),
                "missing {r:?}"
            );
        }
    }

    #[test]
    fn test_unknown_kind() {
        let mut blob = vec![DYLD_CACHE_ADJ_V2_FORMAT];
        // one pair: from=1 to=2, one to-offset group, delta 0, one kind group
        for value in [1u64, 1, 2, 1, 0, 1, 0x20, 1, 0] {
            crate::util::write_uleb128(value, &mut blob);
        }
        assert_eq!(
            for_each_reference_v2(&blob, |_| true),
            Err(SplitSegError::UnknownKind(0x20))
        );
    }

    #[test]
    fn test_early_stop() {
        let references = vec![
            SplitSegReference {
                pair_index: 0,
                kind: DYLD_CACHE_ADJ_V2_DELTA_32,
                from_section: 1,
                from_offset: 0x4,
                to_section: 2,
                to_offset: 0x8,
            },
            SplitSegReference {
                pair_index: 0,
                kind: DYLD_CACHE_ADJ_V2_DELTA_32,
                from_section: 1,
                from_offset: 0x24,
                to_section: 2,
                to_offset: 0x8,
            },
        ];
        let blob = encode_v2(&references);
        let mut seen = 0;
        for_each_reference_v2(&blob, |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_truncated() {
        let blob = vec![DYLD_CACHE_ADJ_V2_FORMAT, 0x01, 0x01];
        assert_eq!(
            for_each_reference_v2(&blob, |_| true),
            Err(SplitSegError::Truncated)
        );
    }
}
