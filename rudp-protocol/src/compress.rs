//! Optional datagram compression
//!
//! Hosts may install a compressor that squeezes the command portion of every
//! outgoing datagram. The built-in implementation is an adaptive binary
//! range coder over a per-byte bit tree; the probability model resets for
//! every datagram, so loss or reordering of datagrams never desynchronizes
//! the two ends.

/// Pluggable datagram compressor
///
/// `compress` returns `None` when the encoded form would not be smaller than
/// the input, in which case the datagram travels uncompressed.
pub trait Compressor {
    fn compress(&mut self, input: &[u8]) -> Option<Vec<u8>>;

    /// Decode `input` back into at most `output_limit` bytes. Returns `None`
    /// when the input cannot produce exactly `output_limit` bytes.
    fn decompress(&mut self, input: &[u8], output_limit: usize) -> Option<Vec<u8>>;
}

const PROB_BITS: u32 = 11;
const PROB_INIT: u16 = 1 << (PROB_BITS - 1);
const PROB_MOVE_BITS: u32 = 5;
const TOP: u32 = 1 << 24;

/// Probability tree for one byte: node 1 is the root, children of node `n`
/// are `2n` and `2n + 1`, leaves map back to the byte value
type ByteTree = [u16; 256];

struct RangeEncoder {
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
    out: Vec<u8>,
}

impl RangeEncoder {
    fn new() -> Self {
        RangeEncoder {
            low: 0,
            range: u32::MAX,
            cache: 0,
            cache_size: 1,
            out: Vec::new(),
        }
    }

    fn shift_low(&mut self) {
        if (self.low as u32) < 0xFF00_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u8;
            let mut byte = self.cache;
            loop {
                self.out.push(byte.wrapping_add(carry));
                byte = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low as u32 as u64) << 8;
    }

    fn encode_bit(&mut self, prob: &mut u16, bit: u32) {
        let bound = (self.range >> PROB_BITS) * (*prob as u32);
        if bit == 0 {
            self.range = bound;
            *prob += ((1 << PROB_BITS) - *prob) >> PROB_MOVE_BITS;
        } else {
            self.low += bound as u64;
            self.range -= bound;
            *prob -= *prob >> PROB_MOVE_BITS;
        }
        while self.range < TOP {
            self.shift_low();
            self.range <<= 8;
        }
    }

    fn encode_byte(&mut self, tree: &mut ByteTree, byte: u8) {
        let mut node = 1usize;
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as u32;
            self.encode_bit(&mut tree[node], bit);
            node = (node << 1) | bit as usize;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        self.out
    }
}

struct RangeDecoder<'a> {
    code: u32,
    range: u32,
    input: &'a [u8],
    pos: usize,
}

impl<'a> RangeDecoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        let mut decoder = RangeDecoder {
            code: 0,
            range: u32::MAX,
            input,
            pos: 0,
        };
        // The first encoded byte is always the encoder's zero cache; fold it
        // into the code along with the next four bytes.
        for _ in 0..5 {
            decoder.code = (decoder.code << 8) | decoder.next_byte() as u32;
        }
        decoder
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.input.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        byte
    }

    fn decode_bit(&mut self, prob: &mut u16) -> u32 {
        let bound = (self.range >> PROB_BITS) * (*prob as u32);
        let bit = if self.code < bound {
            self.range = bound;
            *prob += ((1 << PROB_BITS) - *prob) >> PROB_MOVE_BITS;
            0
        } else {
            self.code -= bound;
            self.range -= bound;
            *prob -= *prob >> PROB_MOVE_BITS;
            1
        };
        if self.range < TOP {
            self.range <<= 8;
            self.code = (self.code << 8) | self.next_byte() as u32;
        }
        bit
    }

    fn decode_byte(&mut self, tree: &mut ByteTree) -> u8 {
        let mut node = 1usize;
        for _ in 0..8 {
            let bit = self.decode_bit(&mut tree[node]);
            node = (node << 1) | bit as usize;
        }
        (node - 256) as u8
    }
}

fn range_encode(input: &[u8]) -> Vec<u8> {
    let mut tree: ByteTree = [PROB_INIT; 256];
    let mut encoder = RangeEncoder::new();
    for &byte in input {
        encoder.encode_byte(&mut tree, byte);
    }
    encoder.finish()
}

fn range_decode(input: &[u8], length: usize) -> Vec<u8> {
    let mut tree: ByteTree = [PROB_INIT; 256];
    let mut decoder = RangeDecoder::new(input);
    (0..length).map(|_| decoder.decode_byte(&mut tree)).collect()
}

/// Adaptive binary range coder
///
/// Stateless between datagrams; safe to share one instance across all peers
/// of a host.
#[derive(Debug, Default, Clone, Copy)]
pub struct RangeCoder;

impl RangeCoder {
    pub fn new() -> Self {
        RangeCoder
    }
}

impl Compressor for RangeCoder {
    fn compress(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        if input.is_empty() {
            return None;
        }
        let encoded = range_encode(input);
        if encoded.len() < input.len() {
            Some(encoded)
        } else {
            None
        }
    }

    fn decompress(&mut self, input: &[u8], output_limit: usize) -> Option<Vec<u8>> {
        if output_limit == 0 {
            return None;
        }
        Some(range_decode(input, output_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip_text() {
        let input = b"the quick brown fox jumps over the lazy dog, repeatedly, \
                      the quick brown fox jumps over the lazy dog";
        let encoded = range_encode(input);
        let decoded = range_decode(&encoded, input.len());
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_repetitive_input_shrinks() {
        let input = vec![0x41u8; 512];
        let mut coder = RangeCoder::new();
        let encoded = coder.compress(&input).expect("should compress");
        assert!(encoded.len() < input.len());

        let decoded = coder.decompress(&encoded, input.len()).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_tiny_input_not_compressed() {
        // The coder's flush alone emits five bytes, so very short inputs can
        // never shrink
        let mut coder = RangeCoder::new();
        assert!(coder.compress(b"abc").is_none());
        assert!(coder.compress(b"").is_none());
    }

    #[test]
    fn test_roundtrip_all_byte_values() {
        let input: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let encoded = range_encode(&input);
        let decoded = range_decode(&encoded, input.len());
        assert_eq!(decoded, input);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = range_encode(&input);
            let decoded = range_decode(&encoded, input.len());
            prop_assert_eq!(decoded, input);
        }
    }
}
