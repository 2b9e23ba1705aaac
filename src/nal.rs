use bytes::{Bytes, BytesMut};

/// Annex B start code (4-byte)
pub const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Check if data is in Annex B format by looking at the start codes.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

/// Splits an Annex B byte stream into NAL unit payloads, start codes removed.
/// Bytes before the first start code are ignored.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                // a 4-byte start code leaves one zero on the previous unit
                let mut end = i;
                if end > s && data[end - 1] == 0 {
                    end -= 1;
                }
                units.push(&data[s..end]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            units.push(&data[s..]);
        }
    }
    units.retain(|u| !u.is_empty());
    units
}

/// H.264 nal_unit_type.
pub fn nal_type(unit: &[u8]) -> u8 {
    unit.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Slice NAL units (coded picture data).
pub fn is_vcl(unit: &[u8]) -> bool {
    (1..=5).contains(&nal_type(unit))
}

/// Groups NAL units into per-picture chunks the way an encoder delivers
/// them: parameter sets and SEI ride along with the slice that follows.
/// Every chunk is re-emitted with 4-byte start codes.
pub fn access_units(data: &[u8]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut current = BytesMut::new();
    for unit in split_nal_units(data) {
        current.extend_from_slice(START_CODE);
        current.extend_from_slice(unit);
        if is_vcl(unit) {
            chunks.push(current.split().freeze());
        }
    }
    if !current.is_empty() {
        chunks.push(current.freeze());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb(&[0x00, 0x00]));
    }

    #[test]
    fn test_split_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, // sps
            0x00, 0x00, 0x01, 0x68, 0xBB, // pps
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x81, // idr
        ];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x67, 0xAA][..], &[0x68, 0xBB][..], &[0x65, 0x88, 0x81][..]]);
        assert_eq!(nal_type(units[2]), 5);
    }

    #[test]
    fn test_leading_garbage_ignored() {
        let data = [0xFF, 0xFE, 0x00, 0x00, 0x01, 0x41, 0x9A];
        assert_eq!(split_nal_units(&data), vec![&[0x41, 0x9A][..]]);
        assert!(split_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    #[test]
    fn test_access_units_group_parameter_sets_with_slice() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x01, // sps
            0x00, 0x00, 0x00, 0x01, 0x68, 0x02, // pps
            0x00, 0x00, 0x00, 0x01, 0x65, 0x03, // idr
            0x00, 0x00, 0x00, 0x01, 0x41, 0x04, // p slice
        ];
        let chunks = access_units(&data);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], &data[..18]);
        assert_eq!(&chunks[1][..], &data[18..]);
        assert!(chunks.iter().all(|c| is_annexb(c)));
    }
}
