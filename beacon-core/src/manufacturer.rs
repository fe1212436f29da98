//! Manufacturer-specific data: `<company_id>:<base64>` groups.
//!
//! The scanning bridge writes one group per company block, comma-separated.
//! Decoding never fails; a bad id becomes 0 and a bad payload becomes empty.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::types::CompanyDescriptor;

/// Leading payload bytes of a lost-item proximity tag.
pub const PROXIMITY_TAG_SIGNATURE: [u8; 2] = [0x12, 0x19];

/// Shortest payload that can carry the tag signature plus status bytes.
pub const PROXIMITY_TAG_MIN_LEN: usize = 4;

/// Standard alphabet, padding optional.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the first manufacturer group of a field.
pub fn decode_manufacturer_data(field: &str) -> CompanyDescriptor {
    match field.split(',').next() {
        Some(group) => decode_group(group),
        None => CompanyDescriptor::default(),
    }
}

/// Decode every manufacturer group of a field, skipping empty groups.
pub fn decode_all_manufacturer_data(field: &str) -> Vec<CompanyDescriptor> {
    field
        .split(',')
        .filter(|g| !g.trim().is_empty())
        .map(decode_group)
        .collect()
}

fn decode_group(group: &str) -> CompanyDescriptor {
    let Some((id, payload)) = group.split_once(':') else {
        return CompanyDescriptor::default();
    };
    // A second ':' means the group is not `<id>:<base64>`
    if payload.contains(':') {
        return CompanyDescriptor::default();
    }

    let company_id = id.trim().parse::<i32>().unwrap_or(0);
    let payload = PAYLOAD_ENGINE.decode(payload.trim()).unwrap_or_default();

    CompanyDescriptor {
        company_id,
        payload,
    }
}

/// True if the payload carries the proximity-tag signature.
pub fn detect_proximity_tag(descriptor: &CompanyDescriptor) -> bool {
    let p = &descriptor.payload;
    p.len() >= PROXIMITY_TAG_MIN_LEN && p[..2] == PROXIMITY_TAG_SIGNATURE
}

/// Encode a payload as one `<id>:<base64>` group.
pub fn encode_group(company_id: i32, payload: &[u8]) -> String {
    format!(
        "{company_id}:{}",
        base64::engine::general_purpose::STANDARD.encode(payload)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_proximity_tag() {
        let desc = decode_manufacturer_data("76:EhkQBQMYHCi2");
        assert_eq!(desc.company_id, 76);
        assert_eq!(
            desc.payload,
            vec![0x12, 0x19, 0x10, 0x05, 0x03, 0x18, 0x1C, 0x28, 0xB6]
        );
        assert!(detect_proximity_tag(&desc));
    }

    #[test]
    fn test_ibeacon_is_not_tag() {
        // 02 15 01 02
        let desc = decode_manufacturer_data("76:AhUBAg==");
        assert_eq!(desc.company_id, 76);
        assert_eq!(desc.payload, vec![0x02, 0x15, 0x01, 0x02]);
        assert!(!detect_proximity_tag(&desc));
    }

    #[test]
    fn test_short_signature_is_not_tag() {
        assert!(!detect_proximity_tag(&decode_manufacturer_data("76:EhkA")));
        assert!(!detect_proximity_tag(&decode_manufacturer_data("76:Ehk=")));
    }

    #[test]
    fn test_unpadded_base64_accepted() {
        let padded = decode_manufacturer_data("76:AhUBAg==");
        let bare = decode_manufacturer_data("76:AhUBAg");
        assert_eq!(padded, bare);
    }

    #[test]
    fn test_bad_company_id_defaults_zero() {
        let desc = decode_manufacturer_data("apple:EhkQBQMYHCi2");
        assert_eq!(desc.company_id, 0);
        assert_eq!(desc.payload.len(), 9);
    }

    #[test]
    fn test_bad_base64_empty_payload() {
        let desc = decode_manufacturer_data("76:not base64!");
        assert_eq!(desc.company_id, 76);
        assert!(desc.payload.is_empty());
        assert!(!detect_proximity_tag(&desc));
    }

    #[test]
    fn test_missing_or_extra_colon() {
        assert!(decode_manufacturer_data("").is_empty());
        assert!(decode_manufacturer_data("76").is_empty());
        assert!(decode_manufacturer_data("76:Ehk=:x").is_empty());
    }

    #[test]
    fn test_first_group_only() {
        let desc = decode_manufacturer_data("6:AhUBAg==,76:EhkQBQMYHCi2");
        assert_eq!(desc.company_id, 6);
        assert!(!detect_proximity_tag(&desc));
    }

    #[test]
    fn test_decode_all_groups() {
        let all = decode_all_manufacturer_data("6:AhUBAg==,76:EhkQBQMYHCi2,");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].company_id, 6);
        assert_eq!(all[1].company_id, 76);
        assert!(detect_proximity_tag(&all[1]));
        assert!(decode_all_manufacturer_data("").is_empty());
    }

    #[test]
    fn test_encode_group() {
        let group = encode_group(76, &[0x12, 0x19, 0x10, 0x05]);
        assert_eq!(group, "76:EhkQBQ==");
        assert!(detect_proximity_tag(&decode_manufacturer_data(&group)));
    }
}
