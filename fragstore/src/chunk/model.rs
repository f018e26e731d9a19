//! Chunk / fragment / block data model shared by the write and read paths.
//!
//! Binary fields (digests, cipher key/iv/tag) travel to and from the control
//! plane as base64 strings and are absent for dedup references.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::range::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    #[serde(rename = "D")]
    Data,
    #[serde(rename = "P")]
    Parity,
    #[serde(rename = "L")]
    Lrc,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layer::Data => "D",
            Layer::Parity => "P",
            Layer::Lrc => "L",
        };
        f.write_str(s)
    }
}

/// `(layer, layer_n, frag)` identifies one fragment of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragId {
    pub layer: Layer,
    pub layer_n: u32,
    pub frag: u32,
}

impl FragId {
    pub fn data(frag: u32) -> Self {
        Self {
            layer: Layer::Data,
            layer_n: 0,
            frag,
        }
    }

    pub fn parity(frag: u32) -> Self {
        Self {
            layer: Layer::Parity,
            layer_n: 0,
            frag,
        }
    }

    pub fn lrc(group: u32) -> Self {
        Self {
            layer: Layer::Lrc,
            layer_n: group,
            frag: 0,
        }
    }
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}.{}", self.layer, self.layer_n, self.frag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestType {
    Sha256,
    Sha512,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherType {
    Aes256Gcm,
    None,
}

/// Fixed coding policy for every chunk of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderParams {
    pub digest_type: DigestType,
    pub cipher_type: CipherType,
    pub data_frags: u32,
    pub parity_frags: u32,
    /// Data fragments per local XOR group; 0 disables LRC fragments.
    pub lrc_group: u32,
}

impl Default for CoderParams {
    fn default() -> Self {
        Self {
            digest_type: DigestType::Sha256,
            cipher_type: CipherType::Aes256Gcm,
            data_frags: 4,
            parity_frags: 2,
            lrc_group: 2,
        }
    }
}

impl CoderParams {
    pub fn lrc_frags(&self) -> u32 {
        if self.lrc_group == 0 {
            0
        } else {
            self.data_frags.div_ceil(self.lrc_group)
        }
    }

    pub fn total_frags(&self) -> u32 {
        self.data_frags + self.parity_frags + self.lrc_frags()
    }
}

/// Encoded chunk metadata (everything except the fragment payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Plaintext size.
    pub size: u64,
    pub frag_size: u64,
    pub coder: CoderParams,
    /// Whether the chunk may be deduplicated against existing chunks.
    pub dedup: bool,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub digest: Option<Vec<u8>>,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub cipher_key: Option<Vec<u8>>,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub cipher_iv: Option<Vec<u8>>,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub cipher_auth_tag: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragDesc {
    #[serde(flatten)]
    pub id: FragId,
    pub size: u64,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub digest: Option<Vec<u8>>,
}

/// One physical replica of a fragment on a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockMd {
    pub id: String,
    pub address: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct EncodedFrag {
    pub desc: FragDesc,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub info: ChunkInfo,
    pub frags: Vec<EncodedFrag>,
}

/// Read-side fragment with its resolved replica blocks (in failover order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragMapping {
    #[serde(flatten)]
    pub desc: FragDesc,
    pub blocks: Vec<BlockMd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMapping {
    pub start: u64,
    pub end: u64,
    pub seq: u64,
    pub upload_part_number: u32,
    pub chunk: ChunkInfo,
    pub frags: Vec<FragMapping>,
}

impl PartMapping {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }
}

/// Parts of an object overlapping some requested range, ordered by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMapping {
    pub size: u64,
    pub parts: Vec<PartMapping>,
}

impl ObjectMapping {
    /// Keeps only the parts overlapping `range`.
    pub fn filter(&self, range: &ByteRange) -> ObjectMapping {
        ObjectMapping {
            size: self.size,
            parts: self
                .parts
                .iter()
                .filter(|p| p.range().overlaps(range))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMd {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

pub(crate) mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(buf) => s.serialize_some(&B64.encode(buf)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| B64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> ChunkInfo {
        ChunkInfo {
            size: 5,
            frag_size: 2,
            coder: CoderParams::default(),
            dedup: true,
            digest: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            cipher_key: None,
            cipher_iv: None,
            cipher_auth_tag: None,
        }
    }

    #[test]
    fn binary_fields_are_base64_and_absent_when_none() {
        let json = serde_json::to_value(sample_chunk()).unwrap();
        assert_eq!(json["digest"], "3q2+7w==");
        assert!(json.get("cipher_key").is_none());
        let back: ChunkInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample_chunk());
    }

    #[test]
    fn frag_desc_flattens_id() {
        let desc = FragDesc {
            id: FragId::parity(1),
            size: 2,
            digest: None,
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["layer"], "P");
        assert_eq!(json["frag"], 1);
        assert_eq!(desc.id.to_string(), "P0.1");
    }

    #[test]
    fn lrc_frag_count_rounds_up() {
        let mut params = CoderParams::default();
        assert_eq!(params.lrc_frags(), 2);
        assert_eq!(params.total_frags(), 8);
        params.data_frags = 5;
        assert_eq!(params.lrc_frags(), 3);
        params.lrc_group = 0;
        assert_eq!(params.lrc_frags(), 0);
    }

    #[test]
    fn mapping_filter_keeps_overlapping_parts() {
        let part = |start, end| PartMapping {
            start,
            end,
            seq: start,
            upload_part_number: 0,
            chunk: sample_chunk(),
            frags: vec![],
        };
        let mapping = ObjectMapping {
            size: 30,
            parts: vec![part(0, 10), part(10, 20), part(20, 30)],
        };
        let narrowed = mapping.filter(&ByteRange::new(12, 21));
        assert_eq!(narrowed.size, 30);
        let starts: Vec<u64> = narrowed.parts.iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![10, 20]);
    }
}
