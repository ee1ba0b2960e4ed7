//! Mumble variable-length integer encoding
//!
//! Voice packet headers carry the session id and sequence number as
//! Mumble varints. The leading bits of the first byte select the width:
//!
//! ```text
//! 0xxxxxxx            7-bit positive
//! 10xxxxxx + 1 byte   14-bit positive
//! 110xxxxx + 2 bytes  21-bit positive
//! 1110xxxx + 3 bytes  28-bit positive
//! 111100__ + 4 bytes  32-bit positive
//! 111101__ + 8 bytes  64-bit positive
//! 111110__ + varint   negated recursive varint
//! 111111xx            byte-inverted negative two-bit number
//! ```

use bytes::{Buf, BufMut};

/// Encode a value as a Mumble varint into the buffer
pub fn write_varint<B: BufMut>(buf: &mut B, value: i64) {
    let mut value = value;

    // Negative numbers: small ones get the inverted two-bit form,
    // everything else is the negated recursive form.
    if value < 0 {
        if value >= -4 {
            buf.put_u8(0xFC | ((!value) as u8 & 0x03));
            return;
        }
        buf.put_u8(0xF8);
        value = !value;
        // Fall through and encode the positive complement.
        // (The decoder applies the inversion on read.)
        write_varint(buf, value);
        return;
    }

    let v = value as u64;
    if v < 0x80 {
        buf.put_u8(v as u8);
    } else if v < 0x4000 {
        buf.put_u8(0x80 | (v >> 8) as u8);
        buf.put_u8(v as u8);
    } else if v < 0x20_0000 {
        buf.put_u8(0xC0 | (v >> 16) as u8);
        buf.put_u8((v >> 8) as u8);
        buf.put_u8(v as u8);
    } else if v < 0x1000_0000 {
        buf.put_u8(0xE0 | (v >> 24) as u8);
        buf.put_u8((v >> 16) as u8);
        buf.put_u8((v >> 8) as u8);
        buf.put_u8(v as u8);
    } else if v <= u32::MAX as u64 {
        buf.put_u8(0xF0);
        buf.put_u32(v as u32);
    } else {
        buf.put_u8(0xF4);
        buf.put_u64(v);
    }
}

/// Decode a Mumble varint from the buffer
///
/// Returns `None` if the buffer is truncated.
pub fn read_varint<B: Buf>(buf: &mut B) -> Option<i64> {
    if !buf.has_remaining() {
        return None;
    }

    let first = buf.get_u8();

    if first & 0x80 == 0 {
        return Some((first & 0x7F) as i64);
    }
    if first & 0xC0 == 0x80 {
        if buf.remaining() < 1 {
            return None;
        }
        return Some((((first & 0x3F) as i64) << 8) | buf.get_u8() as i64);
    }
    if first & 0xE0 == 0xC0 {
        if buf.remaining() < 2 {
            return None;
        }
        return Some(
            (((first & 0x1F) as i64) << 16) | ((buf.get_u8() as i64) << 8) | buf.get_u8() as i64,
        );
    }
    if first & 0xF0 == 0xE0 {
        if buf.remaining() < 3 {
            return None;
        }
        return Some(
            (((first & 0x0F) as i64) << 24)
                | ((buf.get_u8() as i64) << 16)
                | ((buf.get_u8() as i64) << 8)
                | buf.get_u8() as i64,
        );
    }

    match first & 0xFC {
        0xF0 => {
            if buf.remaining() < 4 {
                return None;
            }
            Some(buf.get_u32() as i64)
        }
        0xF4 => {
            if buf.remaining() < 8 {
                return None;
            }
            Some(buf.get_u64() as i64)
        }
        0xF8 => {
            // Negated recursive varint
            let inner = read_varint(buf)?;
            Some(!inner)
        }
        0xFC => Some(!((first & 0x03) as i64)),
        _ => None,
    }
}
