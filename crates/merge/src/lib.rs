//! Merge strategies and the content hasher.
//!
//! A strategy folds an ordered list of blobs into one; later blobs win. `raw` concatenates,
//! `json` and `yaml` decode to a generic document, deep-merge maps and replace everything else
//! (arrays included) wholesale, then re-encode.

#![forbid(unsafe_code)]

use kmerge_core::{Kind, Payload};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("decode {kind} blob #{index}: {message}")]
    Decode { kind: Kind, index: usize, message: String },
    #[error("{kind} blob #{index}: top level is not a mapping")]
    NotAMapping { kind: Kind, index: usize },
    #[error("encode {kind}: {message}")]
    Encode { kind: Kind, message: String },
}

/// A merge failure for one payload field.
#[derive(Debug, thiserror::Error)]
#[error("field {field}: {source}")]
pub struct FieldError {
    pub field: String,
    pub source: MergeError,
}

/// Combines an ordered sequence of blobs into one.
pub trait MergeStrategy {
    fn merge(&self, blobs: &[&[u8]]) -> Result<Vec<u8>, MergeError>;
}

impl MergeStrategy for Kind {
    fn merge(&self, blobs: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
        match self {
            Kind::Raw => Ok(raw_merge(blobs)),
            Kind::Json => structured_merge(Codec::Json, blobs),
            Kind::Yaml => structured_merge(Codec::Yaml, blobs),
        }
    }
}

pub fn raw_merge(blobs: &[&[u8]]) -> Vec<u8> {
    blobs.concat()
}

#[derive(Debug, Clone, Copy)]
enum Codec {
    Json,
    Yaml,
}

impl Codec {
    fn kind(self) -> Kind {
        match self {
            Codec::Json => Kind::Json,
            Codec::Yaml => Kind::Yaml,
        }
    }

    fn decode(self, index: usize, blob: &[u8]) -> Result<Json, MergeError> {
        let decode_err = |message: String| MergeError::Decode { kind: self.kind(), index, message };
        let doc: Json = match self {
            Codec::Json => serde_json::from_slice(blob).map_err(|e| decode_err(e.to_string()))?,
            Codec::Yaml => serde_yaml::from_slice(blob).map_err(|e| decode_err(e.to_string()))?,
        };
        match doc {
            Json::Object(_) => Ok(doc),
            // `null` or an empty YAML document
            Json::Null => Ok(Json::Object(Map::new())),
            _ => Err(MergeError::NotAMapping { kind: self.kind(), index }),
        }
    }

    fn encode(self, doc: &Json) -> Result<Vec<u8>, MergeError> {
        let encode_err = |message: String| MergeError::Encode { kind: self.kind(), message };
        match self {
            Codec::Json => serde_json::to_vec(doc).map_err(|e| encode_err(e.to_string())),
            Codec::Yaml => serde_yaml::to_string(doc).map(String::into_bytes).map_err(|e| encode_err(e.to_string())),
        }
    }
}

fn structured_merge(codec: Codec, blobs: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
    // Folding from null means no input encodes as the null document.
    let mut acc = Json::Null;
    for (index, blob) in blobs.iter().enumerate() {
        let doc = codec.decode(index, blob)?;
        deep_merge(&mut acc, doc);
    }
    codec.encode(&acc)
}

/// Merge `overlay` into `base`: maps merge key by key, anything else is replaced.
pub fn deep_merge(base: &mut Json, overlay: Json) {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Merge every field in `fields`, taking that field's blob from each source (in order) that has
/// it. The first failing field aborts the whole merge.
pub fn merge_fields<'a>(
    kind: Kind,
    fields: impl IntoIterator<Item = &'a String>,
    sources: &[&Payload],
) -> Result<Payload, FieldError> {
    let mut out = Payload::new();
    for field in fields {
        let blobs: Vec<&[u8]> = sources.iter().filter_map(|p| p.get(field)).map(Vec::as_slice).collect();
        trace!(field = %field, blobs = blobs.len(), %kind, "merging field");
        let merged = kind
            .merge(&blobs)
            .map_err(|source| FieldError { field: field.clone(), source })?;
        out.insert(field.clone(), merged);
    }
    Ok(out)
}

/// Hex SHA-256 over the payload. Keys are visited in ascending order and every key and blob is
/// length-prefixed, so the digest depends on content only.
pub fn content_hash(payload: &Payload) -> String {
    let mut hasher = Sha256::new();
    for (key, blob) in payload {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((blob.len() as u64).to_be_bytes());
        hasher.update(blob);
    }
    hex::encode(hasher.finalize())
}
