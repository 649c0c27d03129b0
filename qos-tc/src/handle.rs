//! HTB class handles.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits). Both halves are written in
//! hexadecimal by `tc`, so `1:10` is minor `0x10`.

use std::{fmt, str::FromStr};

use crate::Error;

/// A `major:minor` class handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId {
    pub major: u16,
    pub minor: u16,
}

impl ClassId {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The handle generated for the `index`-th (zero-based) class under `major` when the
    /// configuration does not provide one: `major:10`, `major:20`, ...
    ///
    /// # Example
    ///
    /// ```
    /// use qos_tc::ClassId;
    /// assert_eq!(ClassId::generated(1, 2).to_string(), "1:30");
    /// ```
    pub fn generated(major: u16, index: usize) -> Self {
        // "{n}0" is read back as hex by tc, so build it the same way.
        let text = format!("{}0", index + 1);
        let minor = u16::from_str_radix(&text, 16).unwrap_or(u16::MAX);
        Self { major, minor }
    }
}

impl From<ClassId> for u32 {
    /// # Example
    ///
    /// ```
    /// use qos_tc::ClassId;
    /// let id: ClassId = "1:10".parse().unwrap();
    /// assert_eq!(u32::from(id), 0x0001_0010);
    /// ```
    fn from(id: ClassId) -> Self {
        ((id.major as u32) << 16) | id.minor as u32
    }
}

impl From<u32> for ClassId {
    fn from(raw: u32) -> Self {
        Self { major: (raw >> 16) as u16, minor: (raw & 0xFFFF) as u16 }
    }
}

impl FromStr for ClassId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidHandle(s.to_string());
        let (major, minor) = s.trim().split_once(':').ok_or_else(invalid)?;

        let major = u16::from_str_radix(major, 16).map_err(|_| invalid())?;
        let minor = if minor.is_empty() {
            0
        } else {
            u16::from_str_radix(minor, 16).map_err(|_| invalid())?
        };

        Ok(Self { major, minor })
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: ClassId = "1:10".parse().unwrap();
        assert_eq!(id, ClassId::new(1, 0x10));
        assert_eq!(id.to_string(), "1:10");

        let id: ClassId = "2:a0".parse().unwrap();
        assert_eq!(id.minor, 0xa0);
        assert_eq!(id.to_string(), "2:a0");

        let root: ClassId = "1:".parse().unwrap();
        assert_eq!(root, ClassId::new(1, 0));
    }

    #[test]
    fn rejects_malformed() {
        assert!("10".parse::<ClassId>().is_err());
        assert!("x:1".parse::<ClassId>().is_err());
        assert!("1:zz".parse::<ClassId>().is_err());
        assert!("10000:1".parse::<ClassId>().is_err());
    }

    #[test]
    fn generated_handles() {
        assert_eq!(ClassId::generated(1, 0).to_string(), "1:10");
        assert_eq!(ClassId::generated(2, 1).to_string(), "2:20");
        assert_eq!(ClassId::generated(1, 9).to_string(), "1:100");
    }

    #[test]
    fn u32_conversion() {
        let id = ClassId::new(2, 0x20);
        let raw: u32 = id.into();
        assert_eq!(raw, 0x0002_0020);
        assert_eq!(ClassId::from(raw), id);
    }
}
