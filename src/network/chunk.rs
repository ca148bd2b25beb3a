//! Splitting a large payload into numbered, re-assemblable parts.
//!
//! The session-parameter exchange may exceed a single message's practical
//! size, so payload bytes are chunked into fixed-size parts that travel as
//! individual sequenced messages and are reassembled on the far side. The
//! retry/acknowledgement bookkeeping lives in the endpoint; this module only
//! knows about bytes.

/// Size of a single part in bytes. Comfortably under typical message-size
/// limits of data-channel transports.
pub const CHUNK_PART_SIZE: usize = 512;

/// Splits `payload` into parts of at most [`CHUNK_PART_SIZE`] bytes.
///
/// An empty payload still produces one (empty) part, so every exchange has at
/// least one part to send and acknowledge.
#[must_use]
pub fn split_parts(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload
        .chunks(CHUNK_PART_SIZE)
        .map(<[u8]>::to_vec)
        .collect()
}

/// Reassembles a payload from numbered parts arriving in any order.
#[derive(Debug, Clone)]
pub struct PartAssembly {
    parts: Vec<Option<Vec<u8>>>,
}

impl PartAssembly {
    /// Creates an assembly expecting `part_count` parts.
    #[must_use]
    pub fn new(part_count: usize) -> Self {
        Self {
            parts: vec![None; part_count.max(1)],
        }
    }

    /// Number of parts this assembly expects.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Inserts one part. Returns `false` if the index is out of range or the
    /// part was already present (duplicates are fine, they change nothing).
    pub fn insert(&mut self, part_index: usize, bytes: Vec<u8>) -> bool {
        match self.parts.get_mut(part_index) {
            Some(slot @ None) => {
                *slot = Some(bytes);
                true
            }
            _ => false,
        }
    }

    /// `true` once every part has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }

    /// Concatenates the parts back into the original payload.
    ///
    /// Returns `None` while parts are still missing.
    #[must_use]
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut payload = Vec::new();
        for part in self.parts.iter().flatten() {
            payload.extend_from_slice(part);
        }
        Some(payload)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod chunk_tests {
    use super::*;

    #[test]
    fn small_payload_is_one_part() {
        let parts = split_parts(b"hello");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], b"hello");
    }

    #[test]
    fn empty_payload_still_has_one_part() {
        let parts = split_parts(b"");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[test]
    fn large_payload_is_split_at_part_size() {
        let payload = vec![7u8; CHUNK_PART_SIZE * 2 + 100];
        let parts = split_parts(&payload);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), CHUNK_PART_SIZE);
        assert_eq!(parts[1].len(), CHUNK_PART_SIZE);
        assert_eq!(parts[2].len(), 100);
    }

    #[test]
    fn out_of_order_parts_reassemble() {
        let payload: Vec<u8> = (0..u8::MAX).cycle().take(CHUNK_PART_SIZE * 3 + 5).collect();
        let parts = split_parts(&payload);

        let mut assembly = PartAssembly::new(parts.len());
        for index in [3, 0, 2, 1] {
            assert!(!assembly.is_complete());
            assert!(assembly.insert(index, parts[index].clone()));
        }
        assert_eq!(assembly.assemble(), Some(payload));
    }

    #[test]
    fn duplicate_and_out_of_range_parts_are_rejected() {
        let mut assembly = PartAssembly::new(2);
        assert!(assembly.insert(0, vec![1]));
        assert!(!assembly.insert(0, vec![2]));
        assert!(!assembly.insert(5, vec![3]));
        assert!(assembly.assemble().is_none());
    }
}
