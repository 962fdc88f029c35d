//! Value transport transforms: Snappy negotiation and XATTR pruning.
//!
//! The emitted message size always reflects the encoding chosen here, so size accounting on
//! both ends agrees.

use snap::raw::{Decoder, Encoder};

use tide_common::error::{DcpError, DcpResult};

use crate::message::Opcode;

/// Datatype bit for Snappy-compressed values (mirrors the storage-side bit).
pub const DATATYPE_SNAPPY: u8 = 0x02;
/// Datatype bit for values carrying an XATTR section.
pub const DATATYPE_XATTR: u8 = 0x04;

/// Inflates a Snappy-compressed value.
pub fn inflate(compressed: &[u8]) -> DcpResult<Vec<u8>> {
    Decoder::new()
        .decompress_vec(compressed)
        .map_err(|error| DcpError::Protocol(format!("snappy inflate failed: {error}")))
}

/// Deflates a value with Snappy.
pub fn deflate(raw: &[u8]) -> DcpResult<Vec<u8>> {
    Encoder::new()
        .compress_vec(raw)
        .map_err(|error| DcpError::Protocol(format!("snappy deflate failed: {error}")))
}

/// Builds a value with a leading XATTR section from `(key, value)` pairs and a body.
///
/// Section layout: a 4-byte big-endian total length, then per-entry 4-byte big-endian lengths
/// covering `key\0value\0`.
#[must_use]
pub fn build_xattr_value(pairs: &[(&[u8], &[u8])], body: &[u8]) -> Vec<u8> {
    let mut section = Vec::new();
    for (key, value) in pairs {
        let entry_len = key.len() + value.len() + 2;
        section.extend_from_slice(&u32::try_from(entry_len).unwrap_or(0).to_be_bytes());
        section.extend_from_slice(key);
        section.push(0);
        section.extend_from_slice(value);
        section.push(0);
    }

    let mut output = Vec::with_capacity(4 + section.len() + body.len());
    output.extend_from_slice(&u32::try_from(section.len()).unwrap_or(0).to_be_bytes());
    output.extend_from_slice(&section);
    output.extend_from_slice(body);
    output
}

/// Length of the XATTR section at the head of `value`, including the length prefix.
pub fn xattr_section_len(value: &[u8]) -> DcpResult<usize> {
    if value.len() < 4 {
        return Err(DcpError::Protocol(
            "value too short for xattr length prefix".to_owned(),
        ));
    }
    let mut prefix = [0_u8; 4];
    prefix.copy_from_slice(&value[..4]);
    let section = usize::try_from(u32::from_be_bytes(prefix))
        .map_err(|_| DcpError::Protocol("xattr section exceeds platform limits".to_owned()))?;
    let total = section
        .checked_add(4)
        .filter(|total| *total <= value.len())
        .ok_or_else(|| DcpError::Protocol("xattr section overruns value".to_owned()))?;
    Ok(total)
}

/// Strips the document body, keeping only the XATTR section.
pub fn prune_to_xattrs(value: &[u8]) -> DcpResult<Vec<u8>> {
    let len = xattr_section_len(value)?;
    Ok(value[..len].to_vec())
}

/// Stream-level value policy negotiated at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportPolicy {
    /// The consumer advertised Snappy support.
    pub consumer_supports_snappy: bool,
    /// The stream carries only XATTR sections, no document bodies.
    pub xattrs_only: bool,
    /// The producer negotiated `force_value_compression`.
    pub force_value_compression: bool,
}

/// Chooses and applies the transport encoding for one value.
///
/// Returns the bytes to put on the wire and the resulting datatype bits.
pub fn encode_for_transport(
    value: &[u8],
    datatype: u8,
    policy: TransportPolicy,
) -> DcpResult<(Vec<u8>, u8)> {
    let compressed = datatype & DATATYPE_SNAPPY != 0;

    if policy.xattrs_only {
        // XATTR-only streams never carry a compressed payload, whatever the consumer supports.
        let raw = if compressed {
            inflate(value)?
        } else {
            value.to_vec()
        };
        if datatype & DATATYPE_XATTR == 0 {
            return Ok((Vec::new(), 0));
        }
        let pruned = prune_to_xattrs(&raw)?;
        return Ok((pruned, DATATYPE_XATTR));
    }

    if compressed && !policy.consumer_supports_snappy {
        let inflated = inflate(value)?;
        return Ok((inflated, datatype & !DATATYPE_SNAPPY));
    }

    if !compressed && policy.force_value_compression && !value.is_empty() {
        let deflated = deflate(value)?;
        return Ok((deflated, datatype | DATATYPE_SNAPPY));
    }

    Ok((value.to_vec(), datatype))
}

/// Returns whether an opcode carries a document value subject to transport transforms.
#[must_use]
pub fn carries_value(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Mutation | Opcode::Deletion | Opcode::DeletionV2 | Opcode::Expiration
            | Opcode::Prepare
    )
}

#[cfg(test)]
mod tests {
    use super::{
        DATATYPE_SNAPPY, DATATYPE_XATTR, TransportPolicy, build_xattr_value, deflate,
        encode_for_transport, inflate, prune_to_xattrs, xattr_section_len,
    };
    use googletest::prelude::*;
    use rstest::rstest;

    const JSON_BODY: &[u8] =
        br#"{"product": "car", "price": "100"}, {"product": "bus", "price": "1000"}"#;

    #[rstest]
    fn snappy_roundtrip_preserves_bytes() {
        let compressed = deflate(JSON_BODY).expect("deflates");
        assert_that!(compressed.len() < JSON_BODY.len(), eq(true));
        let inflated = inflate(&compressed).expect("inflates");
        assert_that!(inflated.as_slice(), eq(JSON_BODY));
    }

    #[rstest]
    fn xattr_section_length_covers_prefix_and_entries() {
        let value = build_xattr_value(&[(b"meta", b"{\"rev\":1}")], b"body");
        // 4-byte total prefix + one entry: 4-byte len + "meta\0{\"rev\":1}\0".
        let expected_section: usize = 4 + 4 + 5 + 10;
        assert_that!(xattr_section_len(&value), eq(&Ok(expected_section)));

        let pruned = prune_to_xattrs(&value).expect("prunes");
        assert_that!(pruned.len(), eq(expected_section));
        assert_that!(value.ends_with(b"body"), eq(true));
        assert_that!(pruned.ends_with(b"body"), eq(false));
    }

    #[rstest]
    fn compressed_value_is_inflated_for_plain_consumers() {
        let compressed = deflate(JSON_BODY).expect("deflates");
        let (wire, datatype) = encode_for_transport(
            &compressed,
            DATATYPE_SNAPPY,
            TransportPolicy::default(),
        )
        .expect("transforms");
        assert_that!(wire.as_slice(), eq(JSON_BODY));
        assert_that!(datatype & DATATYPE_SNAPPY, eq(0_u8));
    }

    #[rstest]
    fn compressed_value_passes_through_for_snappy_consumers() {
        let compressed = deflate(JSON_BODY).expect("deflates");
        let (wire, datatype) = encode_for_transport(
            &compressed,
            DATATYPE_SNAPPY,
            TransportPolicy {
                consumer_supports_snappy: true,
                ..TransportPolicy::default()
            },
        )
        .expect("transforms");
        assert_that!(wire.as_slice(), eq(compressed.as_slice()));
        assert_that!(datatype & DATATYPE_SNAPPY, eq(DATATYPE_SNAPPY));
    }

    #[rstest]
    fn force_compression_deflates_uncompressed_values() {
        let (wire, datatype) = encode_for_transport(
            JSON_BODY,
            0,
            TransportPolicy {
                consumer_supports_snappy: true,
                force_value_compression: true,
                ..TransportPolicy::default()
            },
        )
        .expect("transforms");
        assert_that!(wire.len() < JSON_BODY.len(), eq(true));
        assert_that!(datatype & DATATYPE_SNAPPY, eq(DATATYPE_SNAPPY));
        assert_that!(inflate(&wire).expect("inflates").as_slice(), eq(JSON_BODY));
    }

    #[rstest]
    fn xattr_only_streams_emit_the_section_uncompressed() {
        let value = build_xattr_value(&[(b"sync", b"token")], JSON_BODY);
        let compressed = deflate(&value).expect("deflates");

        for consumer_supports_snappy in [false, true] {
            let (wire, datatype) = encode_for_transport(
                &compressed,
                DATATYPE_SNAPPY | DATATYPE_XATTR,
                TransportPolicy {
                    consumer_supports_snappy,
                    xattrs_only: true,
                    ..TransportPolicy::default()
                },
            )
            .expect("transforms");
            assert_that!(datatype, eq(DATATYPE_XATTR));
            assert_that!(
                wire.len(),
                eq(xattr_section_len(&value).expect("section length"))
            );
        }
    }

    #[rstest]
    fn xattr_only_stream_drops_values_without_xattrs() {
        let (wire, datatype) = encode_for_transport(
            JSON_BODY,
            0,
            TransportPolicy {
                xattrs_only: true,
                ..TransportPolicy::default()
            },
        )
        .expect("transforms");
        assert_that!(wire.is_empty(), eq(true));
        assert_that!(datatype, eq(0_u8));
    }
}
