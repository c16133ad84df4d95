//! Access-mode character used on the wire and in the dependency file.
//!
//! The three access bits map onto the printable digits `'0'..='7'`:
//! read is bit 0, write bit 1, execute bit 2.

/// Read/write/execute triple observed for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    pub const NONE: Access = Access::new(false, false, false);
    pub const READ: Access = Access::new(true, false, false);
    pub const WRITE: Access = Access::new(false, true, false);
    pub const EXECUTE: Access = Access::new(false, false, true);

    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    pub const fn bits(self) -> u8 {
        (self.read as u8) | ((self.write as u8) << 1) | ((self.execute as u8) << 2)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self::new(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0)
    }

    pub const fn is_none(self) -> bool {
        self.bits() == 0
    }
}

/// Encode an access triple as its wire character.
pub const fn access_to_char(access: Access) -> u8 {
    b'0' + access.bits()
}

/// Decode a wire character. Returns `None` outside `'0'..='7'`.
pub const fn char_to_access(c: u8) -> Option<Access> {
    if c >= b'0' && c <= b'7' {
        Some(Access::from_bits(c - b'0'))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_triples_survive_char_encoding() {
        for bits in 0u8..8 {
            let access = Access::from_bits(bits);
            let c = access_to_char(access);
            assert_eq!(char_to_access(c), Some(access), "bits {bits:03b}");
        }
    }

    #[test]
    fn test_known_characters() {
        assert_eq!(access_to_char(Access::NONE), b'0');
        assert_eq!(access_to_char(Access::READ), b'1');
        assert_eq!(access_to_char(Access::WRITE), b'2');
        assert_eq!(access_to_char(Access::new(true, true, false)), b'3');
        assert_eq!(access_to_char(Access::EXECUTE), b'4');
        assert_eq!(access_to_char(Access::new(true, true, true)), b'7');
    }

    #[test]
    fn test_rejects_non_digit() {
        assert_eq!(char_to_access(b'8'), None);
        assert_eq!(char_to_access(b'/'), None);
        assert_eq!(char_to_access(b'r'), None);
    }
}
