use std::cmp::Ordering;

pub const KEY_SIZE: usize = 8;

/// Fixed-size index key. The byte image is what lives in node entries; the
/// comparator decides the ordering.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexKey([u8; KEY_SIZE]);

impl IndexKey {
    pub fn from_i64(value: i64) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn to_i64(self) -> i64 {
        i64::from_le_bytes(self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= KEY_SIZE);
        let mut data = [0u8; KEY_SIZE];
        data.copy_from_slice(&bytes[..KEY_SIZE]);
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndexKey({})", self.to_i64())
    }
}

/// Orders keys as signed 64-bit integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyComparator;

impl KeyComparator {
    pub fn compare(&self, a: &IndexKey, b: &IndexKey) -> Ordering {
        a.to_i64().cmp(&b.to_i64())
    }
}
