use crate::StorageError;
use osmosis_core::mapping::PairKey;

pub const KEY_SEPARATOR: u8 = 0;

/// Row key for one mapping: `source_uid \0 sink_uid \0 source_luid`.
/// Components must be non-empty and NUL-free so keys stay unambiguous and
/// pair prefixes stay range-scannable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingKey<'a> {
    pub pair: &'a PairKey,
    pub source_luid: &'a str,
}

impl<'a> MappingKey<'a> {
    pub fn new(pair: &'a PairKey, source_luid: &'a str) -> Self {
        Self { pair, source_luid }
    }

    pub fn validate_component(component: &str) -> Result<(), StorageError> {
        if component.is_empty() || component.bytes().any(|b| b == KEY_SEPARATOR) {
            return Err(StorageError::InvalidKey(component.to_string()));
        }
        Ok(())
    }

    pub fn prefix_for_pair(pair: &PairKey) -> Result<Vec<u8>, StorageError> {
        Self::validate_component(&pair.source_uid)?;
        Self::validate_component(&pair.sink_uid)?;
        let mut prefix = Vec::with_capacity(pair.source_uid.len() + pair.sink_uid.len() + 2);
        prefix.extend_from_slice(pair.source_uid.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix.extend_from_slice(pair.sink_uid.as_bytes());
        prefix.push(KEY_SEPARATOR);
        Ok(prefix)
    }

    /// Half-open byte range covering every row of the pair. The end bound
    /// is the prefix with its trailing separator bumped by one, which no
    /// NUL-free luid can reach.
    pub fn range_for_pair(pair: &PairKey) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
        let start = Self::prefix_for_pair(pair)?;
        let mut end = start.clone();
        *end.last_mut().expect("prefix is never empty") = KEY_SEPARATOR + 1;
        Ok((start, end))
    }

    pub fn to_bytes(self) -> Result<Vec<u8>, StorageError> {
        Self::validate_component(self.source_luid)?;
        let mut key = Self::prefix_for_pair(self.pair)?;
        key.extend_from_slice(self.source_luid.as_bytes());
        Ok(key)
    }

    /// Recover the pair identity from a full row key.
    pub fn pair_from_key(key: &[u8]) -> Option<PairKey> {
        let mut parts = key.splitn(3, |b| *b == KEY_SEPARATOR);
        let source_uid = std::str::from_utf8(parts.next()?).ok()?;
        let sink_uid = std::str::from_utf8(parts.next()?).ok()?;
        parts.next()?;
        Some(PairKey::new(source_uid, sink_uid))
    }
}
