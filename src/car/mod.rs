/// CARv1 encoding and decoding for repository snapshots
///
/// CAR (Content Addressable aRchive) format:
/// - Header: CBOR-encoded { version: 1, roots: [CID] }
/// - Blocks: Repeated { varint(cid_len + block_len), cid_bytes, block_bytes }
use crate::error::{RelayError, RelayResult};
use libipld::Cid;
use serde_cbor::Value;

/// CARv1 encoder
pub struct CarEncoder {
    buffer: Vec<u8>,
}

impl CarEncoder {
    /// Create a new CAR encoder with the given root CID
    pub fn new(root: &Cid) -> RelayResult<Self> {
        let mut buffer = Vec::new();

        let header = serde_json::json!({
            "version": 1,
            "roots": [root.to_string()]
        });

        let header_bytes = serde_cbor::to_vec(&header)
            .map_err(|e| RelayError::Internal(format!("Failed to encode CAR header: {}", e)))?;

        write_varint(&mut buffer, header_bytes.len() as u64);
        buffer.extend_from_slice(&header_bytes);

        Ok(Self { buffer })
    }

    /// Add a block to the CAR file
    pub fn add_block(&mut self, cid: &Cid, data: &[u8]) {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.buffer, (cid_bytes.len() + data.len()) as u64);
        self.buffer.extend_from_slice(&cid_bytes);
        self.buffer.extend_from_slice(data);
    }

    /// Add blocks from a collection of CID/data pairs
    pub fn add_blocks(&mut self, blocks: Vec<(Cid, Vec<u8>)>) {
        for (cid, data) in blocks {
            self.add_block(&cid, &data);
        }
    }

    /// Finalize and return the CAR file bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }
}

/// A decoded CARv1 archive
#[derive(Debug, Clone)]
pub struct CarFile {
    pub roots: Vec<Cid>,
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

impl CarFile {
    /// Decode a CARv1 byte stream into its roots and blocks.
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let mut pos = 0usize;

        let header_len = read_varint(bytes, &mut pos)? as usize;
        let header_end = pos
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| RelayError::Validation("truncated CAR header".to_string()))?;

        let header: Value = serde_cbor::from_slice(&bytes[pos..header_end])
            .map_err(|e| RelayError::Validation(format!("invalid CAR header: {}", e)))?;
        pos = header_end;

        let roots = parse_roots(&header)?;

        let mut blocks = Vec::new();
        while pos < bytes.len() {
            let section_len = read_varint(bytes, &mut pos)? as usize;
            let section_end = pos
                .checked_add(section_len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| RelayError::Validation("truncated CAR section".to_string()))?;

            let mut cursor = std::io::Cursor::new(&bytes[pos..section_end]);
            let cid = Cid::read_bytes(&mut cursor)
                .map_err(|e| RelayError::Validation(format!("invalid block CID: {}", e)))?;
            let data_start = pos + cursor.position() as usize;

            blocks.push((cid, bytes[data_start..section_end].to_vec()));
            pos = section_end;
        }

        Ok(Self { roots, blocks })
    }

    /// The single root most ATProto snapshots carry.
    pub fn root(&self) -> RelayResult<Cid> {
        self.roots
            .first()
            .copied()
            .ok_or_else(|| RelayError::Validation("CAR file has no roots".to_string()))
    }
}

/// Roots may be encoded as CID text or as tag-42 binary links.
fn parse_roots(header: &Value) -> RelayResult<Vec<Cid>> {
    let map = match header {
        Value::Map(m) => m,
        _ => return Err(RelayError::Validation("CAR header is not a map".to_string())),
    };

    let roots_val = map
        .get(&Value::Text("roots".to_string()))
        .ok_or_else(|| RelayError::Validation("CAR header missing roots".to_string()))?;

    let entries = match roots_val {
        Value::Array(entries) => entries,
        _ => return Err(RelayError::Validation("CAR roots is not an array".to_string())),
    };

    let mut roots = Vec::with_capacity(entries.len());
    for entry in entries {
        let cid = match entry {
            Value::Text(s) => Cid::try_from(s.as_str())
                .map_err(|e| RelayError::Validation(format!("invalid root CID: {}", e)))?,
            Value::Tag(42, boxed) => match boxed.as_ref() {
                // Tag 42 wraps the CID bytes with a multibase identity prefix
                Value::Bytes(b) if !b.is_empty() => Cid::try_from(&b[1..])
                    .map_err(|e| RelayError::Validation(format!("invalid root CID: {}", e)))?,
                _ => {
                    return Err(RelayError::Validation("malformed CID link in roots".to_string()))
                }
            },
            _ => return Err(RelayError::Validation("unsupported root encoding".to_string())),
        };
        roots.push(cid);
    }

    Ok(roots)
}

/// Write an unsigned varint to a buffer
fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buffer.push((value as u8) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

/// Read an unsigned varint, advancing the position
fn read_varint(bytes: &[u8], pos: &mut usize) -> RelayResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| RelayError::Validation("truncated varint".to_string()))?;
        *pos += 1;

        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 64 {
            return Err(RelayError::Validation("varint overflow".to_string()));
        }
    }
}
