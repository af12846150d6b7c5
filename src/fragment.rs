//! C2: splits one event's payload into a header-prefixed first fragment plus N
//! fixed-size tail fragments, and the inverse (reassembly from stored fragments).

use crate::constants::{FRAGMENT_KEY_LEN, FRAGMENT_KEY_PREFIX};
use crate::error::FragmentError;
use crate::header::{build_header, read_header};

/// One stored (key, value) pair. Index 0's key additionally carries the
/// fragment-count header appended after the fixed 13-byte prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// `ceil(length / chunk_size)`, at least 1 (an empty event is still one fragment).
pub fn fragment_count(length: u64, chunk_size: u64) -> u32 {
    if length == 0 {
        return 1;
    }
    length.div_ceil(chunk_size) as u32
}

/// Builds the fixed 13-byte key prefix for `(id, fragment_index)`.
pub fn fragment_key_prefix(id: u64, index: u32) -> [u8; FRAGMENT_KEY_LEN] {
    let mut key = [0u8; FRAGMENT_KEY_LEN];
    key[0] = FRAGMENT_KEY_PREFIX;
    key[1..9].copy_from_slice(&id.to_be_bytes());
    key[9..13].copy_from_slice(&index.to_be_bytes());
    key
}

/// Builds the full key for a fragment: the fixed prefix, with fragment 0 additionally
/// carrying the header bytes that encode `n_additional = N - 1`.
pub fn fragment_key(id: u64, index: u32, n_additional: u32) -> Vec<u8> {
    let mut key = fragment_key_prefix(id, index).to_vec();
    if index == 0 {
        key.extend(build_header(n_additional));
    }
    key
}

/// Splits `payload` into the (key, value) pairs that make up one event's fragments,
/// in index order. Fragment 0's length is `length mod chunk_size` if nonzero, else
/// `chunk_size`; all others are exactly `chunk_size`.
pub fn split_event(id: u64, payload: &[u8], chunk_size: u64) -> Vec<Fragment> {
    let length = payload.len() as u64;
    let n = fragment_count(length, chunk_size);
    let first_len = if length == 0 {
        0
    } else {
        let rem = length % chunk_size;
        if rem == 0 { chunk_size } else { rem }
    } as usize;

    let mut fragments = Vec::with_capacity(n as usize);
    let mut offset = 0usize;
    for index in 0..n {
        let len = if index == 0 { first_len } else { chunk_size as usize };
        let value = payload[offset..offset + len].to_vec();
        fragments.push(Fragment {
            key: fragment_key(id, index, n - 1),
            value,
        });
        offset += len;
    }
    fragments
}

/// Reassembles fragments (already fetched from storage, in index order, fragment 0
/// first) back into the event payload. `first_key` must be fragment 0's full key
/// (carrying the header); `values` are the fragment values in index order.
pub fn reassemble(first_key: &[u8], values: &[Vec<u8>], chunk_size: u64) -> Result<Vec<u8>, FragmentError> {
    if first_key.len() < FRAGMENT_KEY_LEN {
        return Err(FragmentError::MalformedKey);
    }
    let (n_additional, _) = read_header(&first_key[FRAGMENT_KEY_LEN..])?;
    let n = n_additional + 1;
    if values.len() < n as usize {
        return Err(FragmentError::ShortRead {
            expected: n,
            observed: values.len() as u32,
        });
    }
    let first = &values[0];
    let mut out = Vec::with_capacity(first.len() + (n as usize - 1) * chunk_size as usize);
    out.extend_from_slice(first);
    for (i, value) in values[1..n as usize].iter().enumerate() {
        if value.len() as u64 != chunk_size {
            return Err(FragmentError::WrongFragmentLength {
                index: (i + 1) as u32,
                expected: chunk_size as usize,
                actual: value.len(),
            });
        }
        out.extend_from_slice(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_when_payload_fits_in_one_chunk() {
        let frags = split_event(1, b"hello", 10);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].value, b"hello");
        assert_eq!(frags[0].key[0], FRAGMENT_KEY_PREFIX);
    }

    #[test]
    fn empty_payload_is_still_one_fragment() {
        let frags = split_event(1, b"", 10);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].value, b"");
    }

    #[test]
    fn exact_multiple_puts_full_chunk_in_fragment_zero() {
        let payload = vec![7u8; 20];
        let frags = split_event(1, &payload, 10);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].value.len(), 10);
        assert_eq!(frags[1].value.len(), 10);
    }

    #[test]
    fn remainder_puts_partial_chunk_in_fragment_zero() {
        let payload = vec![7u8; 25];
        let frags = split_event(1, &payload, 10);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].value.len(), 5);
        assert_eq!(frags[1].value.len(), 10);
        assert_eq!(frags[2].value.len(), 10);
    }

    #[test]
    fn fragment_indices_are_strictly_increasing_in_key_order() {
        let payload = vec![9u8; 35];
        let frags = split_event(42, &payload, 10);
        let mut keys: Vec<&[u8]> = frags.iter().map(|f| f.key.as_slice()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "keys must already be produced in increasing order");
        // index 0..=3 encoded big-endian in bytes [9..13)
        for (i, key) in keys.drain(..).enumerate() {
            assert_eq!(u32::from_be_bytes(key[9..13].try_into().unwrap()), i as u32);
        }
    }

    #[test]
    fn round_trip_split_then_reassemble() {
        let payload: Vec<u8> = (0u32..987).map(|i| (i % 251) as u8).collect();
        let frags = split_event(7, &payload, 100);
        let values: Vec<Vec<u8>> = frags.iter().map(|f| f.value.clone()).collect();
        let rebuilt = reassemble(&frags[0].key, &values, 100).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn short_read_is_detected() {
        let payload = vec![1u8; 25];
        let frags = split_event(1, &payload, 10);
        let values: Vec<Vec<u8>> = frags[..2].iter().map(|f| f.value.clone()).collect();
        let err = reassemble(&frags[0].key, &values, 10).unwrap_err();
        assert_eq!(err, FragmentError::ShortRead { expected: 3, observed: 2 });
    }

    #[test]
    fn wrong_length_tail_fragment_is_detected() {
        let payload = vec![1u8; 25];
        let mut frags = split_event(1, &payload, 10);
        frags[1].value.push(0); // corrupt tail fragment length
        let values: Vec<Vec<u8>> = frags.iter().map(|f| f.value.clone()).collect();
        let err = reassemble(&frags[0].key, &values, 10).unwrap_err();
        assert_eq!(
            err,
            FragmentError::WrongFragmentLength { index: 1, expected: 10, actual: 11 }
        );
    }
}
