//! Byte-swap and word decoding helpers.
//!
//! Vendor files state their byte order in a header field. Callers turn that
//! field into an [`Endian`] before touching any sample block; the decoders
//! here swap a copy of the raw buffer into native order when required and
//! then reinterpret it.

/// Byte order of a raw sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Map a "big-endian" header flag (Bruker BYTORDA/BYTORDP = 1) to an order.
    pub fn from_big_flag(big: bool) -> Self {
        if big {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Whether buffers in this order must be swapped before native reads.
    pub fn needs_swap(self) -> bool {
        self != Self::native()
    }
}

/// Swap bytes of 4-byte words in place.
pub fn bswap4(buf: &mut [u8]) {
    debug_assert!(buf.len() % 4 == 0, "bswap4: buffer length must be multiple of 4");
    for chunk in buf.chunks_exact_mut(4) {
        chunk.swap(0, 3);
        chunk.swap(1, 2);
    }
}

/// Swap bytes of 2-byte words in place.
pub fn bswap2(buf: &mut [u8]) {
    debug_assert!(buf.len() % 2 == 0, "bswap2: buffer length must be multiple of 2");
    for chunk in buf.chunks_exact_mut(2) {
        chunk.swap(0, 1);
    }
}

/// Swap bytes of 8-byte words in place.
pub fn bswap8(buf: &mut [u8]) {
    debug_assert!(buf.len() % 8 == 0, "bswap8: buffer length must be multiple of 8");
    for chunk in buf.chunks_exact_mut(8) {
        chunk.swap(0, 7);
        chunk.swap(1, 6);
        chunk.swap(2, 5);
        chunk.swap(3, 4);
    }
}

/// Copy whole words of `width` bytes into native order. A trailing partial
/// word is dropped.
fn native_words(raw: &[u8], width: usize, endian: Endian) -> Vec<u8> {
    let usable = raw.len() - raw.len() % width;
    let mut buf = raw[..usable].to_vec();
    if endian.needs_swap() {
        match width {
            2 => bswap2(&mut buf),
            4 => bswap4(&mut buf),
            8 => bswap8(&mut buf),
            _ => {}
        }
    }
    buf
}

/// Decode 2-byte signed integers.
pub fn int2_words(raw: &[u8], endian: Endian) -> Vec<i16> {
    native_words(raw, 2, endian)
        .chunks_exact(2)
        .map(|c| i16::from_ne_bytes([c[0], c[1]]))
        .collect()
}

/// Decode 4-byte signed integers.
pub fn int4_words(raw: &[u8], endian: Endian) -> Vec<i32> {
    native_words(raw, 4, endian)
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Decode 4-byte IEEE floats.
pub fn float4_words(raw: &[u8], endian: Endian) -> Vec<f32> {
    native_words(raw, 4, endian)
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Decode 8-byte IEEE floats.
pub fn float8_words(raw: &[u8], endian: Endian) -> Vec<f64> {
    native_words(raw, 8, endian)
        .chunks_exact(8)
        .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bswap4() {
        let mut buf = [0x01u8, 0x02, 0x03, 0x04];
        bswap4(&mut buf);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_bswap8_twice_is_identity() {
        let orig: Vec<u8> = (0u8..16).collect();
        let mut buf = orig.clone();
        bswap8(&mut buf);
        assert_eq!(buf[0], 7);
        bswap8(&mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn test_int4_orders_are_byte_swaps() {
        let raw = [0x00u8, 0x00, 0x01, 0x02, 0xff, 0xff, 0xff, 0xfe, 0x12, 0x34, 0x56, 0x78];
        let big = int4_words(&raw, Endian::Big);
        let little = int4_words(&raw, Endian::Little);
        assert_eq!(big, vec![0x0102, -2, 0x12345678]);
        for (b, l) in big.iter().zip(&little) {
            assert_eq!(b.swap_bytes(), *l);
        }
    }

    #[test]
    fn test_int2_and_float_words() {
        let raw = [0xffu8, 0xfe, 0x00, 0x05];
        assert_eq!(int2_words(&raw, Endian::Big), vec![-2, 5]);
        assert_eq!(float4_words(&1.5f32.to_be_bytes(), Endian::Big), vec![1.5]);
        assert_eq!(float8_words(&(-0.25f64).to_le_bytes(), Endian::Little), vec![-0.25]);
    }

    #[test]
    fn test_partial_word_dropped() {
        let raw = [0u8, 0, 0, 7, 1, 2];
        assert_eq!(int4_words(&raw, Endian::Big), vec![7]);
    }
}
