//! PostgreSQL advisory lock key encoding.

use std::fmt;

use advisory_lock_core::error::{LockError, LockResult};
use sha2::{Digest, Sha256};

/// Key for PostgreSQL advisory locks.
///
/// Advisory locks use either a single 64-bit key or a pair of 32-bit keys.
/// These represent different key spaces and do not overlap: `Single(0)` and
/// `Pair(0, 0)` are two independent locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostgresAdvisoryLockKey {
    /// Single 64-bit key.
    Single(i64),
    /// Pair of 32-bit keys.
    Pair(i32, i32),
}

impl PostgresAdvisoryLockKey {
    /// Maximum length for ASCII encoding (9 characters).
    const MAX_ASCII_LENGTH: usize = 9;
    /// Bits per ASCII character (7 bits).
    const ASCII_CHAR_BITS: u32 = 7;
    /// Maximum ASCII value (127).
    const MAX_ASCII_VALUE: u32 = (1 << Self::ASCII_CHAR_BITS) - 1;
    /// Hash string length (16 hex chars for i64).
    const HASH_STRING_LENGTH: usize = 16;
    /// Hash part length (8 hex chars for i32).
    const HASH_PART_LENGTH: usize = 8;
    /// Hash string separator.
    const HASH_STRING_SEPARATOR: char = ',';

    pub const fn new(key: i64) -> Self {
        Self::Single(key)
    }

    pub const fn new_pair(key1: i32, key2: i32) -> Self {
        Self::Pair(key1, key2)
    }

    /// Create a key from a string name.
    ///
    /// - ASCII strings up to 9 chars are encoded directly (collision-free)
    /// - 16-char hex strings are parsed as i64
    /// - "XXXXXXXX,XXXXXXXX" format parsed as (i32, i32)
    /// - Other strings are hashed to i64 (if `allow_hashing` is true)
    pub fn from_name(name: &str, allow_hashing: bool) -> LockResult<Self> {
        if let Some(key) = Self::try_encode_ascii(name) {
            return Ok(Self::Single(key));
        }

        if let Some(key) = Self::try_parse_hex_string(name) {
            return Ok(key);
        }

        if let Some(key) = Self::try_parse_pair_string(name) {
            return Ok(key);
        }

        if allow_hashing {
            return Ok(Self::Single(Self::hash_string(name)));
        }

        Err(LockError::InvalidName(format!(
            "Name '{}' could not be encoded as a PostgresAdvisoryLockKey. Please specify allow_hashing or use one of the following formats: (1) a 0-{} character string using only ASCII characters, (2) a {} character hex string, or (3) a 2-part, {} character string of the form XXXXXXXX{}XXXXXXXX",
            name,
            Self::MAX_ASCII_LENGTH,
            Self::HASH_STRING_LENGTH,
            Self::HASH_PART_LENGTH * 2 + 1,
            Self::HASH_STRING_SEPARATOR
        )))
    }

    /// Encodes any name, hashing it when no direct encoding applies.
    pub fn from_name_hashed(name: &str) -> Self {
        Self::try_encode_ascii(name)
            .map(Self::Single)
            .or_else(|| Self::try_parse_hex_string(name))
            .or_else(|| Self::try_parse_pair_string(name))
            .unwrap_or_else(|| Self::Single(Self::hash_string(name)))
    }

    /// Try to encode as ASCII string (up to 9 chars).
    fn try_encode_ascii(name: &str) -> Option<i64> {
        if name.len() > Self::MAX_ASCII_LENGTH {
            return None;
        }

        let mut result = 0i64;
        for ch in name.chars() {
            let ch_val = ch as u32;
            if ch_val > Self::MAX_ASCII_VALUE {
                return None;
            }
            result = (result << Self::ASCII_CHAR_BITS) | (ch_val as i64);
        }

        // Padding: one zero bit, then all-ones characters for the unused slots.
        result <<= 1;
        for _ in name.len()..Self::MAX_ASCII_LENGTH {
            result = (result << Self::ASCII_CHAR_BITS) | (Self::MAX_ASCII_VALUE as i64);
        }

        Some(result)
    }

    fn is_hex(part: &str, length: usize) -> bool {
        part.len() == length && part.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Try to parse as hex string (16 chars for i64).
    fn try_parse_hex_string(name: &str) -> Option<Self> {
        if !Self::is_hex(name, Self::HASH_STRING_LENGTH) {
            return None;
        }
        u64::from_str_radix(name, 16)
            .ok()
            .map(|key| Self::Single(key as i64))
    }

    /// Try to parse as pair format "XXXXXXXX,XXXXXXXX".
    fn try_parse_pair_string(name: &str) -> Option<Self> {
        let (first, second) = name.split_once(Self::HASH_STRING_SEPARATOR)?;
        if !Self::is_hex(first, Self::HASH_PART_LENGTH) || !Self::is_hex(second, Self::HASH_PART_LENGTH)
        {
            return None;
        }

        let key1 = u32::from_str_radix(first, 16).ok()?;
        let key2 = u32::from_str_radix(second, 16).ok()?;

        Some(Self::Pair(key1 as i32, key2 as i32))
    }

    /// Hash a string to i64 using SHA-256 (taking first 8 bytes).
    fn hash_string(name: &str) -> i64 {
        let hash_bytes = Sha256::digest(name.as_bytes());

        // First 8 bytes, little-endian.
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash_bytes[..8]);
        i64::from_le_bytes(prefix)
    }

    /// Returns true if this is a single key.
    pub fn has_single_key(&self) -> bool {
        matches!(self, Self::Single(_))
    }

    /// The 64-bit key, if this is a single key.
    pub fn single(&self) -> Option<i64> {
        match self {
            Self::Single(k) => Some(*k),
            Self::Pair(_, _) => None,
        }
    }

    /// The key pair, if this is a pair key.
    pub fn pair(&self) -> Option<(i32, i32)> {
        match self {
            Self::Single(_) => None,
            Self::Pair(k1, k2) => Some((*k1, *k2)),
        }
    }

    /// Convert to SQL function arguments.
    pub fn sql_args(&self) -> String {
        match self {
            Self::Single(k) => format!("{}", k),
            Self::Pair(k1, k2) => format!("{}, {}", k1, k2),
        }
    }

    /// `(classid, objid, objsubid)` under which `pg_locks` reports this key.
    pub(crate) fn lock_table_ids(&self) -> (u32, u32, i16) {
        match self {
            Self::Single(k) => ((*k >> 32) as u32, *k as u32, 1),
            Self::Pair(k1, k2) => (*k1 as u32, *k2 as u32, 2),
        }
    }
}

impl From<i64> for PostgresAdvisoryLockKey {
    fn from(key: i64) -> Self {
        Self::Single(key)
    }
}

impl From<(i32, i32)> for PostgresAdvisoryLockKey {
    fn from((key1, key2): (i32, i32)) -> Self {
        Self::Pair(key1, key2)
    }
}

/// Canonical hex form, accepted back by [`PostgresAdvisoryLockKey::from_name`].
impl fmt::Display for PostgresAdvisoryLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(k) => write!(f, "{:016x}", *k as u64),
            Self::Pair(k1, k2) => write!(
                f,
                "{:08x}{}{:08x}",
                *k1 as u32,
                Self::HASH_STRING_SEPARATOR,
                *k2 as u32
            ),
        }
    }
}
