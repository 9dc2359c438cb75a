//! Open mode strings.
//!
//! The user-facing `open` takes a C-library style mode string and the VFS
//! translates it into the backends' flag vocabulary:
//!
//! | mode | flags |
//! |------|-------|
//! | `r`  | read |
//! | `r+` | read, write |
//! | `w`  | write, create, truncate |
//! | `w+` | read, write, create, truncate |
//! | `a`  | write, create, append |
//! | `a+` | read, write, create, append |
//!
//! A trailing `b` is accepted and ignored on any of them; anything else is
//! [`Errno::Inval`].

use crate::errno::{Errno, KResult};
use crate::fs::OpenFlags;

/// Parse a mode string into open flags.
pub fn parse(mode: &str) -> KResult<OpenFlags> {
    let mode = mode.strip_suffix('b').unwrap_or(mode);
    let flags = match mode {
        "r" => OpenFlags::READ,
        "r+" => OpenFlags::READ | OpenFlags::WRITE,
        "w" => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC,
        "w+" => OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC,
        "a" => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        "a+" => OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        _ => return Err(Errno::Inval),
    };
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_modes_map_to_flags() {
        assert_eq!(parse("r").unwrap(), OpenFlags::READ);
        assert_eq!(parse("r+").unwrap(), OpenFlags::READ | OpenFlags::WRITE);
        assert_eq!(
            parse("w").unwrap(),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC
        );
        assert_eq!(
            parse("a+").unwrap(),
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND
        );
    }

    #[test]
    fn binary_suffix_is_ignored() {
        assert_eq!(parse("rb").unwrap(), parse("r").unwrap());
        assert_eq!(parse("w+b").unwrap(), parse("w+").unwrap());
    }

    #[test]
    fn unknown_modes_are_invalid() {
        assert_eq!(parse("").unwrap_err(), Errno::Inval);
        assert_eq!(parse("x").unwrap_err(), Errno::Inval);
        assert_eq!(parse("rw").unwrap_err(), Errno::Inval);
        assert_eq!(parse("b").unwrap_err(), Errno::Inval);
    }
}
