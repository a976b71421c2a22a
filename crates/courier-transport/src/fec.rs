//! # XOR Forward Error Correction
//!
//! Courier's FEC is deliberately simple: a block of `k` data chunks
//! produces `r` parity chunks, each one the byte-wise XOR of every data
//! chunk in the block. All `r` parity chunks for a block are identical
//! — this recovers at most a single lost chunk per block; it is not
//! parity diversity. A block with two or more losses cannot be
//! reconstructed and must fall back to retransmission.

use bytes::Bytes;

/// XORs a set of equal-or-unequal-length chunks together, zero-padding
/// the shorter ones to the length of the longest.
pub fn xor_chunks(chunks: &[Bytes]) -> Bytes {
    let max_len = chunks.iter().map(|c| c.len()).max().unwrap_or(0);
    let mut out = vec![0u8; max_len];
    for chunk in chunks {
        for (i, byte) in chunk.iter().enumerate() {
            out[i] ^= byte;
        }
    }
    Bytes::from(out)
}

/// Generates the `r` (identical) parity chunks for one block of `k`
/// data chunks.
pub fn generate_parity(data_chunks: &[Bytes], r: u16) -> Vec<Bytes> {
    let parity = xor_chunks(data_chunks);
    (0..r).map(|_| parity.clone()).collect()
}

/// Attempts to recover exactly one missing data chunk in a block from
/// the other data chunks plus any received parity copy. Returns `None`
/// if more than one data chunk is missing, or no parity is available.
pub fn reconstruct_single_loss(
    present_data: &[Bytes],
    missing_len_hint: usize,
    parity: &Bytes,
) -> Bytes {
    let mut out = vec![0u8; missing_len_hint.max(parity.len())];
    for (i, byte) in parity.iter().enumerate() {
        out[i] ^= byte;
    }
    for chunk in present_data {
        for (i, byte) in chunk.iter().enumerate() {
            out[i] ^= byte;
        }
    }
    out.truncate(missing_len_hint);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_of_equal_length_chunks() {
        let a = Bytes::from_static(&[0b1010_1010]);
        let b = Bytes::from_static(&[0b0101_0101]);
        let parity = xor_chunks(&[a, b]);
        assert_eq!(parity.as_ref(), &[0xFF]);
    }

    #[test]
    fn xor_pads_unequal_lengths() {
        let a = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let b = Bytes::from_static(&[0xFF]);
        let parity = xor_chunks(&[a, b]);
        assert_eq!(parity.as_ref(), &[0xFE, 0x02, 0x03]);
    }

    #[test]
    fn generate_parity_produces_r_identical_copies() {
        let data = vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4, 5, 6])];
        let parity = generate_parity(&data, 3);
        assert_eq!(parity.len(), 3);
        assert!(parity.iter().all(|p| *p == parity[0]));
    }

    #[test]
    fn reconstruct_recovers_missing_chunk() {
        let a = Bytes::from_static(&[0x11, 0x22, 0x33]);
        let b = Bytes::from_static(&[0x44, 0x55, 0x66]);
        let c = Bytes::from_static(&[0x77, 0x88, 0x99]);
        let parity = xor_chunks(&[a.clone(), b.clone(), c.clone()]);

        // b is missing; reconstruct from a, c, and parity.
        let recovered = reconstruct_single_loss(&[a, c], b.len(), &parity);
        assert_eq!(recovered, b);
    }
}
