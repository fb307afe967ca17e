use byteorder::{BigEndian, ByteOrder};

/// Complement-sum integrity pair over big-endian 16-bit words.
///
/// Returns `(sum, sum_of_complements)`. Either half that lands on `0xFFFF` is
/// stored as `0`, since `0xFFFF` marks erased flash. A trailing odd byte is
/// ignored.
pub fn checksum(buf: &[u8]) -> (u16, u16) {
    let mut sum: u16 = 0;
    let mut inv: u16 = 0;
    for word in buf.chunks_exact(2) {
        let value = BigEndian::read_u16(word);
        sum = sum.wrapping_add(value);
        inv = inv.wrapping_add(!value);
    }
    (fold_erased(sum), fold_erased(inv))
}

fn fold_erased(value: u16) -> u16 {
    if value == 0xFFFF {
        0
    } else {
        value
    }
}
