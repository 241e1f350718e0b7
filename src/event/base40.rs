//! Mark-text codec: six characters packed into 32 bits, base 40.
//!
//! The alphabet is `_abcdefghijklmnopqrstuvwxyz0123456789-./` with NUL at
//! index 0. Uppercase input maps to lowercase; decoding re-uppercases the
//! first letter. Anything else encodes as `.`.

use arrayvec::ArrayString;

#[rustfmt::skip]
const TO_BASE40: [u8; 256] = [
     0,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,37,38,39,
    27,28,29,30, 31,32,33,34, 35,36,38,38, 38,38,38,38,

    38, 1, 2, 3,  4, 5, 6, 7,  8, 9,10,11, 12,13,14,15,
    16,17,18,19, 20,21,22,23, 24,25,26,38, 38,38,38,38,
    38, 1, 2, 3,  4, 5, 6, 7,  8, 9,10,11, 12,13,14,15,
    16,17,18,19, 20,21,22,23, 24,25,26,38, 38,38,38,38,

    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,

    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
    38,38,38,38, 38,38,38,38, 38,38,38,38, 38,38,38,38,
];

const FROM_BASE40: [u8; 40] = *b"\0abcdefghijklmnopqrstuvwxyz0123456789-./";

/// Packs the first six characters of `s` into 32 bits. The first
/// character goes in last so it comes out first when decoding.
pub fn encode(s: &str) -> u64 {
    let bytes = &s.as_bytes()[..s.len().min(6)];
    let mut base40 = 0u64;
    for &b in bytes.iter().rev() {
        base40 = base40 * 40 + TO_BASE40[b as usize] as u64;
    }
    base40
}

/// Unpacks six characters from the low 32 bits, somewhat-arbitrarily
/// capitalizing the first letter.
pub fn decode(base40: u64) -> ArrayString<6> {
    let mut base40 = base40 & 0xffff_ffff;
    let mut out = ArrayString::new();
    let mut first_letter = true;
    while base40 > 0 {
        let n40 = (base40 % 40) as usize;
        base40 /= 40;
        let mut ch = FROM_BASE40[n40];
        if first_letter && (1..=26).contains(&n40) {
            ch &= !0x20; // uppercase
            first_letter = false;
        }
        out.push(ch as char);
    }
    out
}
