//! OEM code page data for short-name handling.
//!
//! One code page is selected at compile time; the table below is the
//! upper-case conversion for the extended half of CP437. It is pure data;
//! nothing here is derived at runtime.

/// Compile-time OEM code page identifier.
pub(crate) const CODE_PAGE: u16 = 437;

/// Upper-case map for bytes `0x80..=0xFF` of CP437.
#[rustfmt::skip]
static EXT_UPPER: [u8; 128] = [
    0x80, 0x9A, 0x90, 0x41, 0x8E, 0x41, 0x8F, 0x80, 0x45, 0x45, 0x45, 0x49, 0x49, 0x49, 0x8E, 0x8F,
    0x90, 0x92, 0x92, 0x4F, 0x99, 0x4F, 0x55, 0x55, 0x59, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F,
    0x41, 0x49, 0x4F, 0x55, 0xA5, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF,
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF,
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF,
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF,
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF,
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// Upper-case one OEM byte.
pub(crate) fn to_upper(c: u8) -> u8 {
    if c.is_ascii_lowercase() {
        c.to_ascii_uppercase()
    } else if c >= 0x80 {
        EXT_UPPER[(c - 0x80) as usize]
    } else {
        c
    }
}

/// Case-insensitive comparison of two OEM byte strings.
pub(crate) fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| to_upper(*x) == to_upper(*y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_and_extended_upper_casing() {
        assert_eq!(CODE_PAGE, 437);
        assert_eq!(to_upper(b'a'), b'A');
        assert_eq!(to_upper(b'Z'), b'Z');
        assert_eq!(to_upper(0x87), 0x80); // c-cedilla
        assert_eq!(to_upper(0x81), 0x9A); // u-umlaut
        assert_eq!(to_upper(0xB0), 0xB0);
    }

    #[test]
    fn comparisons_ignore_case() {
        assert!(eq_ignore_case(b"ReadMe.TXT", b"readme.txt"));
        assert!(!eq_ignore_case(b"a", b"ab"));
    }
}
