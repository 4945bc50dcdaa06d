use static_assertions::assert_impl_all;
use std::fmt;
use std::str::FromStr;

const BASE_UUID_BYTES: [u8; 16] = [0, 0, 0, 0, 0, 0, 0x10, 0, 0x80, 0, 0, 0x80, 0x5F, 0x9B, 0x34, 0xFB];

/// Lengths of the hyphen-separated groups of the textual form, in bytes.
const GROUPS: [usize; 5] = [4, 2, 2, 2, 6];

/// Bluetooth-tailored UUID. Identifies peripherals as well as services and characteristics.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Returns UUID with all bytes set to zero.
    pub const fn zeroed() -> Self {
        Self([0; 16])
    }

    /// Returns the Base UUID (`00000000-0000-1000-8000-00805F9B34FB`) as defined by the specs.
    pub const fn base() -> Self {
        Self(BASE_UUID_BYTES)
    }

    /// Constructs instance from the specified bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Constructs the full UUID of an assigned 16-bit number, e.g. `0x180F` for the Battery Service.
    pub const fn from_u16(v: u16) -> Self {
        let mut r = BASE_UUID_BYTES;
        r[2] = (v >> 8) as u8;
        r[3] = v as u8;
        Self(r)
    }

    /// Returns inner bytes array.
    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Returns the 16-bit assigned number if this UUID is derived from the Base UUID.
    pub fn to_u16(&self) -> Option<u16> {
        if self.0[..2] == BASE_UUID_BYTES[..2] && self.0[4..] == BASE_UUID_BYTES[4..] {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }
}

assert_impl_all!(Uuid: Send, Sync);

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = self.0.iter();
        for (i, &len) in GROUPS.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            for b in bytes.by_ref().take(len) {
                write!(f, "{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(v: [u8; 16]) -> Self {
        Self::from_bytes(v)
    }
}

impl From<u16> for Uuid {
    fn from(v: u16) -> Self {
        Self::from_u16(v)
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn dig(c: u8) -> Result<u8, UuidParseError> {
            Ok(match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                b'A'..=b'F' => c - b'A' + 10,
                _ => return Err(UuidParseError(())),
            })
        }

        let mut groups = s.split('-');
        let mut buf = [0; 16];
        let mut pos = 0;
        for &len in &GROUPS {
            let group = groups.next().ok_or(UuidParseError(()))?.as_bytes();
            if group.len() != len * 2 {
                return Err(UuidParseError(()));
            }
            for pair in group.chunks(2) {
                buf[pos] = (dig(pair[0])? << 4) | dig(pair[1])?;
                pos += 1;
            }
        }
        if groups.next().is_some() {
            return Err(UuidParseError(()));
        }
        Ok(buf.into())
    }
}

#[derive(Debug)]
pub struct UuidParseError(());

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid UUID string")
    }
}

impl std::error::Error for UuidParseError {}
