// ==============================================================================
// binning.rs - Spatial Binning and Allele Normalization
// ==============================================================================
// Description: UCSC fixed fan-out bins and trimming of shared allele bases
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// References:
// - Kent et al. 2002, "The Human Genome Browser at UCSC" (binning scheme)
// ==============================================================================

const BIN_FIRST_SHIFT: u32 = 17;
const BIN_NEXT_SHIFT: u32 = 3;

/// Standard scheme, covers coordinates below 512 Mb
const BIN_OFFSETS: [u32; 5] = [512 + 64 + 8 + 1, 64 + 8 + 1, 8 + 1, 1, 0];

/// Extended scheme for coordinates up to 4 Gb
const BIN_OFFSETS_EXTENDED: [u32; 6] = [4096 + 512 + 64 + 8 + 1, 512 + 64 + 8 + 1, 64 + 8 + 1, 8 + 1, 1, 0];
const BIN_OFFSET_OLD_TO_EXTENDED: u32 = 4681;
const BIN_STANDARD_MAX: u64 = 1 << 29;

/// Smallest bin fully containing the 0-based half-open range `[start, end)`
pub fn max_ucsc_bin(start: u64, end: u64) -> u32 {
    let end = end.max(start + 1);
    if end <= BIN_STANDARD_MAX {
        find_bin(start, end, &BIN_OFFSETS)
    } else {
        BIN_OFFSET_OLD_TO_EXTENDED + find_bin(start, end, &BIN_OFFSETS_EXTENDED)
    }
}

fn find_bin(start: u64, end: u64, offsets: &[u32]) -> u32 {
    let mut start_bin = start >> BIN_FIRST_SHIFT;
    let mut end_bin = (end - 1) >> BIN_FIRST_SHIFT;
    for offset in offsets {
        if start_bin == end_bin {
            return *offset + start_bin as u32;
        }
        start_bin >>= BIN_NEXT_SHIFT;
        end_bin >>= BIN_NEXT_SHIFT;
    }
    // The top level covers the whole coordinate range
    0
}

/// Normalized variant coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVariant {
    pub bin: u32,
    pub pos: u64,
    pub ref_allele: String,
    pub alt_allele: String,
}

fn is_empty_allele(allele: &str) -> bool {
    allele.is_empty() || allele == "-" || allele == "."
}

/// Byte length of the leading characters two strings share
pub fn shared_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(c, _)| c.len_utf8())
        .sum()
}

/// Byte length of the trailing characters two strings share
pub fn shared_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(c, _)| c.len_utf8())
        .sum()
}

/// Normalize a variant for deduplication
///
/// Alleles are upper-cased, shared leading bases are removed (shifting the
/// position right), then shared trailing bases are removed. An allele that
/// becomes empty is written as `-`.
pub fn normalize_variant(pos: u64, ref_allele: &str, alt_allele: &str) -> NormalizedVariant {
    let mut r = if is_empty_allele(ref_allele) {
        String::new()
    } else {
        ref_allele.to_ascii_uppercase()
    };
    let mut a = if is_empty_allele(alt_allele) {
        String::new()
    } else {
        alt_allele.to_ascii_uppercase()
    };
    let mut pos = pos;

    let leading = shared_prefix_len(&r, &a);
    if leading > 0 {
        pos += r[..leading].chars().count() as u64;
        r.drain(..leading);
        a.drain(..leading);
    }

    let trailing = shared_suffix_len(&r, &a);
    if trailing > 0 {
        r.truncate(r.len() - trailing);
        a.truncate(a.len() - trailing);
    }

    if r.is_empty() {
        r.push('-');
    }
    if a.is_empty() {
        a.push('-');
    }

    NormalizedVariant {
        bin: max_ucsc_bin(pos.saturating_sub(1), pos),
        pos,
        ref_allele: r,
        alt_allele: a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_of_small_range() {
        // Leaf bins start at 585 for 128 kb windows
        assert_eq!(max_ucsc_bin(0, 1), 585);
        assert_eq!(max_ucsc_bin(131_072, 131_073), 586);
    }

    #[test]
    fn test_bin_spanning_leaf_boundary() {
        // Crosses a 128 kb boundary, lands in the 1 Mb level
        assert_eq!(max_ucsc_bin(131_000, 131_200), 73);
    }

    #[test]
    fn test_bin_extended_scheme() {
        let bin = max_ucsc_bin(600_000_000, 600_000_001);
        assert!(bin >= BIN_OFFSET_OLD_TO_EXTENDED);
    }

    #[test]
    fn test_normalize_snv_untouched() {
        let v = normalize_variant(100, "a", "g");
        assert_eq!(v.pos, 100);
        assert_eq!(v.ref_allele, "A");
        assert_eq!(v.alt_allele, "G");
        assert_eq!(v.bin, max_ucsc_bin(99, 100));
    }

    #[test]
    fn test_normalize_insertion() {
        let v = normalize_variant(100, "A", "ATT");
        assert_eq!(v.pos, 101);
        assert_eq!(v.ref_allele, "-");
        assert_eq!(v.alt_allele, "TT");
    }

    #[test]
    fn test_normalize_deletion_and_trailing() {
        let v = normalize_variant(100, "TCG", "T");
        assert_eq!((v.pos, v.ref_allele.as_str(), v.alt_allele.as_str()), (101, "CG", "-"));

        let v = normalize_variant(100, "ACCT", "AGCT");
        assert_eq!((v.pos, v.ref_allele.as_str(), v.alt_allele.as_str()), (101, "C", "G"));
    }

    #[test]
    fn test_normalize_missing_alleles() {
        let v = normalize_variant(5, ".", "A");
        assert_eq!(v.ref_allele, "-");
        assert_eq!(v.alt_allele, "A");
    }

    #[test]
    fn test_normalize_multibyte_alleles_sharing_a_lead_byte() {
        // é and ê share their first UTF-8 byte but are different characters
        assert_eq!(shared_prefix_len("é", "ê"), 0);
        assert_eq!(shared_suffix_len("aé", "bé"), 2);
        let v = normalize_variant(100, "é", "ê");
        assert_eq!((v.pos, v.ref_allele.as_str(), v.alt_allele.as_str()), (100, "é", "ê"));
    }
}
