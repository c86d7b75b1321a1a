use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::Entity;
use crate::error::RemodbError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const ARCHIVE_MAGIC: &[u8; 8] = b"RMDBARC1";
const ARCHIVE_FLAG_SIGNED: u8 = 0x01;
const ARCHIVE_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 1 + 8;
const DIGEST_LEN: usize = 32;
const ZSTD_LEVEL: i32 = 3;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupPayload {
    pub format_version: u32,
    pub catalog: String,
    pub catalog_version: u64,
    pub created_at_micros: u64,
    pub schema: CatalogSchema,
    pub entities: Vec<Entity>,
}

impl BackupPayload {
    pub fn new(
        catalog: impl Into<String>,
        catalog_version: u64,
        created_at_micros: u64,
        schema: CatalogSchema,
        entities: Vec<Entity>,
    ) -> Self {
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            catalog: catalog.into(),
            catalog_version,
            created_at_micros,
            schema,
            entities,
        }
    }
}

/// Archive metadata readable without a signing key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub catalog: String,
    pub catalog_version: u64,
    pub created_at_micros: u64,
    pub entity_count: usize,
    pub entity_types: Vec<String>,
    pub signed: bool,
    pub compressed_bytes: u64,
    pub sha256: String,
}

/// Writes a single-file archive: magic, flags byte, payload length (u64 LE),
/// zstd-compressed MessagePack payload, SHA-256 of everything before it,
/// then an HMAC-SHA256 over the same bytes when the signed flag is set.
pub fn encode_archive(
    payload: &BackupPayload,
    signing_key: Option<&[u8]>,
) -> Result<Vec<u8>, RemodbError> {
    let raw = rmp_serde::to_vec_named(payload).map_err(|e| RemodbError::Encode(e.to_string()))?;
    let compressed = zstd::stream::encode_all(raw.as_slice(), ZSTD_LEVEL)
        .map_err(|e| RemodbError::Encode(e.to_string()))?;

    let flags = if signing_key.is_some() {
        ARCHIVE_FLAG_SIGNED
    } else {
        0
    };
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len() + 2 * DIGEST_LEN);
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.push(flags);
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    let body_len = out.len();
    let digest = Sha256::digest(&out[..body_len]);
    out.extend_from_slice(digest.as_slice());
    if let Some(key) = signing_key {
        let mac = hmac_bytes(key, &out[..body_len])?;
        out.extend_from_slice(&mac);
    }
    Ok(out)
}

struct Frame<'a> {
    signed: bool,
    body: &'a [u8],
    compressed: &'a [u8],
    digest: &'a [u8],
    mac: Option<&'a [u8]>,
}

fn frame(bytes: &[u8]) -> Result<Frame<'_>, RemodbError> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN || &bytes[..8] != ARCHIVE_MAGIC {
        return Err(RemodbError::Decode("not a remodb backup archive".into()));
    }
    let flags = bytes[8];
    if flags & !ARCHIVE_FLAG_SIGNED != 0 {
        return Err(RemodbError::Decode(format!(
            "unsupported archive flags {flags:#04x}"
        )));
    }
    let signed = flags & ARCHIVE_FLAG_SIGNED != 0;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[9..HEADER_LEN]);
    let payload_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| RemodbError::Decode("archive payload length overflow".into()))?;
    let body_len = HEADER_LEN
        .checked_add(payload_len)
        .ok_or_else(|| RemodbError::Decode("archive payload length overflow".into()))?;
    let trailer_len = if signed { 2 * DIGEST_LEN } else { DIGEST_LEN };
    let expected_len = body_len
        .checked_add(trailer_len)
        .ok_or_else(|| RemodbError::Decode("archive payload length overflow".into()))?;
    if bytes.len() != expected_len {
        return Err(RemodbError::Decode(format!(
            "archive length {} does not match header (expected {expected_len})",
            bytes.len()
        )));
    }
    Ok(Frame {
        signed,
        body: &bytes[..body_len],
        compressed: &bytes[HEADER_LEN..body_len],
        digest: &bytes[body_len..body_len + DIGEST_LEN],
        mac: signed.then(|| &bytes[body_len + DIGEST_LEN..]),
    })
}

fn check_digest(frame: &Frame<'_>) -> Result<(), RemodbError> {
    let actual = Sha256::digest(frame.body);
    if actual.as_slice() != frame.digest {
        return Err(RemodbError::IntegrityError {
            message: "backup archive checksum mismatch".into(),
        });
    }
    Ok(())
}

fn check_signature(frame: &Frame<'_>, signing_key: Option<&[u8]>) -> Result<(), RemodbError> {
    match (frame.mac, signing_key) {
        (Some(mac), Some(key)) => {
            let mut verifier = <HmacSha256 as Mac>::new_from_slice(key)
                .map_err(|e| RemodbError::Validation(format!("invalid hmac key: {e}")))?;
            verifier.update(frame.body);
            verifier
                .verify_slice(mac)
                .map_err(|_| RemodbError::IntegrityError {
                    message: "backup archive signature mismatch".into(),
                })
        }
        (None, Some(_)) => Err(RemodbError::IntegrityError {
            message: "backup archive is not signed".into(),
        }),
        (_, None) => Ok(()),
    }
}

fn decompress(frame: &Frame<'_>) -> Result<BackupPayload, RemodbError> {
    let raw = zstd::stream::decode_all(frame.compressed)
        .map_err(|e| RemodbError::Decode(e.to_string()))?;
    let payload: BackupPayload =
        rmp_serde::from_slice(&raw).map_err(|e| RemodbError::Decode(e.to_string()))?;
    if payload.format_version != ARCHIVE_FORMAT_VERSION {
        return Err(RemodbError::Decode(format!(
            "unsupported archive format version {}",
            payload.format_version
        )));
    }
    Ok(payload)
}

/// Decodes an archive after checking its checksum and, when a key is given,
/// its signature.
pub fn decode_archive(
    bytes: &[u8],
    signing_key: Option<&[u8]>,
) -> Result<BackupPayload, RemodbError> {
    let frame = frame(bytes)?;
    check_digest(&frame)?;
    check_signature(&frame, signing_key)?;
    decompress(&frame)
}

/// Checks framing, checksum and signature without decoding the payload.
pub fn verify_archive(bytes: &[u8], signing_key: Option<&[u8]>) -> Result<(), RemodbError> {
    let frame = frame(bytes)?;
    check_digest(&frame)?;
    check_signature(&frame, signing_key)
}

pub fn inspect_archive(bytes: &[u8]) -> Result<ArchiveSummary, RemodbError> {
    let frame = frame(bytes)?;
    check_digest(&frame)?;
    let payload = decompress(&frame)?;
    let mut entity_types: Vec<String> = payload
        .entities
        .iter()
        .map(|e| e.entity_type.clone())
        .collect();
    entity_types.sort();
    entity_types.dedup();
    Ok(ArchiveSummary {
        catalog: payload.catalog,
        catalog_version: payload.catalog_version,
        created_at_micros: payload.created_at_micros,
        entity_count: payload.entities.len(),
        entity_types,
        signed: frame.signed,
        compressed_bytes: frame.compressed.len() as u64,
        sha256: hex::encode(frame.digest),
    })
}

fn hmac_bytes(key: &[u8], bytes: &[u8]) -> Result<Vec<u8>, RemodbError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| RemodbError::Validation(format!("invalid hmac key: {e}")))?;
    mac.update(bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{FieldKey, Value};

    fn payload() -> BackupPayload {
        let mut entity = Entity::empty("product", 7);
        entity.version = 3;
        entity
            .attributes
            .insert(FieldKey::new("name", None), Value::text("Gadget"));
        BackupPayload::new("products", 12, 1, CatalogSchema::new("products"), vec![entity])
    }

    #[test]
    fn unsigned_archive_decodes_and_inspects() {
        let bytes = encode_archive(&payload(), None).expect("encode");
        assert_eq!(&bytes[..8], ARCHIVE_MAGIC);
        let decoded = decode_archive(&bytes, None).expect("decode");
        assert_eq!(decoded, payload());
        let summary = inspect_archive(&bytes).expect("inspect");
        assert_eq!(summary.catalog, "products");
        assert_eq!(summary.entity_count, 1);
        assert_eq!(summary.entity_types, vec!["product".to_string()]);
        assert!(!summary.signed);
        assert_eq!(summary.sha256.len(), 64);
    }

    #[test]
    fn signed_archive_requires_the_right_key() {
        let key = [7u8; 32];
        let bytes = encode_archive(&payload(), Some(&key)).expect("encode");
        verify_archive(&bytes, Some(&key)).expect("verify");
        assert!(matches!(
            verify_archive(&bytes, Some(&[8u8; 32])),
            Err(RemodbError::IntegrityError { .. })
        ));
        let unsigned = encode_archive(&payload(), None).expect("encode");
        assert!(matches!(
            decode_archive(&unsigned, Some(&key)),
            Err(RemodbError::IntegrityError { .. })
        ));
    }

    #[test]
    fn corruption_is_detected() {
        let mut bytes = encode_archive(&payload(), None).expect("encode");
        let mid = HEADER_LEN + 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(
            decode_archive(&bytes, None),
            Err(RemodbError::IntegrityError { .. })
        ));
        assert!(matches!(
            decode_archive(b"not an archive at all, definitely not", None),
            Err(RemodbError::Decode(_))
        ));
        let truncated = encode_archive(&payload(), None).expect("encode");
        assert!(decode_archive(&truncated[..truncated.len() - 1], None).is_err());
    }

    #[test]
    fn oversized_length_header_is_a_decode_error() {
        for payload_len in [(usize::MAX - HEADER_LEN) as u64, u64::MAX - 1] {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(ARCHIVE_MAGIC);
            bytes.push(0);
            bytes.extend_from_slice(&payload_len.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 64]);
            assert!(matches!(
                decode_archive(&bytes, None),
                Err(RemodbError::Decode(_))
            ));
            assert!(matches!(inspect_archive(&bytes), Err(RemodbError::Decode(_))));
            assert!(verify_archive(&bytes, None).is_err());
        }
    }
}
