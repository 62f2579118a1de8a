//! Deterministic node identifiers.
//!
//! A node id is the first 16 bytes of `BLAKE3(semantic_key)` read as a
//! little-endian u128, so the same entity keeps its id across re-analysis
//! runs.

/// Derive the node id for a semantic key such as `src/a.js->foo->bar`.
pub fn compute_node_id(semantic_key: &str) -> u128 {
    let hash = blake3::hash(semantic_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[0..16]);
    u128::from_le_bytes(bytes)
}

/// Resolve an id as it appears on the wire.
///
/// Accepts a decimal u128, a `0x`-prefixed hex u128, or otherwise treats
/// the string as a semantic key and hashes it.
pub fn string_id_to_u128(s: &str) -> u128 {
    if let Some(hex) = s.strip_prefix("0x") {
        if let Ok(id) = u128::from_str_radix(hex, 16) {
            return id;
        }
    }
    if let Ok(id) = s.parse::<u128>() {
        return id;
    }
    compute_node_id(s)
}

/// Render an id for the wire (decimal).
pub fn id_to_string(id: u128) -> String {
    id.to_string()
}
