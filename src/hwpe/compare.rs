//! Bit-level result comparison for reduced-precision matrix outputs.
//!
//! Results are compared as raw packed words: every FP16 half-word (or FP8
//! byte) of a word may differ from the golden one by at most [`ERR`] in its
//! integer encoding. Counts are per word, not per element.

use byteorder::{ByteOrder, LittleEndian};
use half::f16;

use super::fp8_from_f32;

/// Largest tolerated distance between encodings.
pub const ERR: u16 = 0x0011;

fn bytes_to_words(bytes: &mut Vec<u8>) -> Vec<u32> {
    bytes.resize(bytes.len().next_multiple_of(4), 0);
    let mut words = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(bytes, &mut words);
    words
}

/// Encode values as FP16 and pack two per little-endian word.
pub fn pack_fp16_words(values: &[f32]) -> Vec<u32> {
    let mut bytes = vec![0u8; values.len() * 2];
    for (chunk, &v) in bytes.chunks_exact_mut(2).zip(values) {
        LittleEndian::write_u16(chunk, f16::from_f32(v).to_bits());
    }
    bytes_to_words(&mut bytes)
}

/// Encode values as FP8 and pack four per little-endian word.
pub fn pack_fp8_words(values: &[f32]) -> Vec<u32> {
    let mut bytes: Vec<u8> = values.iter().map(|&v| fp8_from_f32(v)).collect();
    bytes_to_words(&mut bytes)
}

fn lanes_differ(actual: u32, golden: u32, lane_bits: u32) -> bool {
    let mask = (1u32 << lane_bits) - 1;
    (0..32 / lane_bits).any(|lane| {
        let shift = lane * lane_bits;
        let a = (actual >> shift) & mask;
        let g = (golden >> shift) & mask;
        a.abs_diff(g) > ERR as u32
    })
}

/// Number of words in which some FP16 half-word is off by more than [`ERR`].
pub fn compare_fp16_words(actual: &[u32], golden: &[u32]) -> usize {
    actual
        .iter()
        .zip(golden)
        .filter(|(&a, &g)| lanes_differ(a, g, 16))
        .count()
}

/// Number of words in which some FP8 byte is off by more than [`ERR`].
pub fn compare_fp8_words(actual: &[u32], golden: &[u32]) -> usize {
    actual
        .iter()
        .zip(golden)
        .filter(|(&a, &g)| lanes_differ(a, g, 8))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp16_tolerance() {
        let golden = [0x3C00_4000, 0x1234_5678];
        assert_eq!(compare_fp16_words(&golden, &golden), 0);
        // Off by exactly ERR in the low half is fine
        assert_eq!(compare_fp16_words(&[0x3C00_4011, 0x1234_5678], &golden), 0);
        // Off by ERR + 1 in the high half of the second word
        assert_eq!(compare_fp16_words(&[0x3C00_4000, 0x1246_5678], &golden), 1);
        // Both halves wrong still count once
        assert_eq!(compare_fp16_words(&[0x0000_0000, 0x1234_5678], &golden), 1);
    }

    #[test]
    fn test_packing() {
        assert_eq!(pack_fp16_words(&[1.0, 2.0]), vec![0x4000_3C00]);
        assert_eq!(pack_fp16_words(&[1.0]), vec![0x0000_3C00]);
        assert_eq!(pack_fp8_words(&[1.0, 2.0, -2.0, 0.0, 1.0]), vec![0x00C0_403C, 0x0000_003C]);
    }

    #[test]
    fn test_fp8_tolerance() {
        let golden = [0x1020_3040];
        assert_eq!(compare_fp8_words(&[0x1020_3051], &golden), 0);
        assert_eq!(compare_fp8_words(&[0x1020_3052], &golden), 1);
        assert_eq!(compare_fp8_words(&[0x3220_3040], &golden), 1);
    }
}
