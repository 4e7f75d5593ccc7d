use crate::StorageError;
use osmosis_core::mapping::Mapping;

pub fn encode_mapping(mapping: &Mapping) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(mapping)?)
}

pub fn decode_mapping(bytes: &[u8]) -> Result<Mapping, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}
