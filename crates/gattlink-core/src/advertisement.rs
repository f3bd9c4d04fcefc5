//! Fixed-layout advertisement payload codec
//!
//! Legacy BLE advertising leaves 29 usable bytes once the mandatory flags
//! structure is accounted for. Every encode checks that ceiling and fails
//! instead of truncating.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{GattError, Result};

/// Largest advertisement payload this layer will hand to a native advertiser
pub const MAX_ADVERTISEMENT_PAYLOAD: usize = 29;

/// Reject payloads above the advertising ceiling
pub fn check_payload(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_ADVERTISEMENT_PAYLOAD {
        return Err(GattError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_ADVERTISEMENT_PAYLOAD,
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encoder/decoder for a payload made of fixed-width fields in declared order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementCodec {
    layout: SmallVec<[usize; 8]>,
}

impl AdvertisementCodec {
    /// Declare the byte width of each field
    pub fn new(layout: &[usize]) -> Self {
        Self {
            layout: SmallVec::from_slice(layout),
        }
    }

    pub fn layout(&self) -> &[usize] {
        &self.layout
    }

    /// Total encoded size implied by the layout
    pub fn encoded_len(&self) -> usize {
        self.layout.iter().sum()
    }

    /// Concatenate the fields in layout order
    pub fn encode<F: AsRef<[u8]>>(&self, fields: &[F]) -> Result<Vec<u8>> {
        let size: usize = fields.iter().map(|f| f.as_ref().len()).sum();
        if size > MAX_ADVERTISEMENT_PAYLOAD {
            return Err(GattError::PayloadTooLarge {
                size,
                max: MAX_ADVERTISEMENT_PAYLOAD,
            });
        }

        if fields.len() != self.layout.len() {
            return Err(GattError::FieldCountMismatch {
                expected: self.layout.len(),
                actual: fields.len(),
            });
        }

        let mut payload = Vec::with_capacity(size);
        for (index, (field, width)) in fields.iter().zip(self.layout.iter()).enumerate() {
            let field = field.as_ref();
            if field.len() != *width {
                return Err(GattError::FieldLengthMismatch {
                    index,
                    expected: *width,
                    actual: field.len(),
                });
            }
            payload.extend_from_slice(field);
        }

        Ok(payload)
    }

    /// Split a payload back into its fields
    ///
    /// Trailing bytes past the last declared field are reported as an extra
    /// field.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        check_payload(bytes)?;

        let mut fields = Vec::with_capacity(self.layout.len());
        let mut rest = bytes;
        for (index, width) in self.layout.iter().enumerate() {
            if rest.len() < *width {
                return Err(GattError::FieldLengthMismatch {
                    index,
                    expected: *width,
                    actual: rest.len(),
                });
            }
            let (field, tail) = rest.split_at(*width);
            fields.push(field.to_vec());
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(GattError::FieldCountMismatch {
                expected: self.layout.len(),
                actual: self.layout.len() + 1,
            });
        }

        Ok(fields)
    }
}

// ----------------------------------------------------------------------------
// Advertise Packet
// ----------------------------------------------------------------------------

/// Four big-endian 16-bit words carried as custom service data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdvertisePacket {
    pub words: [u16; 4],
}

impl AdvertisePacket {
    pub const DEFAULT_WORD: u16 = 0xB00B;
    const LAYOUT: [usize; 4] = [2, 2, 2, 2];

    pub fn new(words: [u16; 4]) -> Self {
        Self { words }
    }

    fn codec() -> AdvertisementCodec {
        AdvertisementCodec::new(&Self::LAYOUT)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let fields: Vec<[u8; 2]> = self.words.iter().map(|w| w.to_be_bytes()).collect();
        Self::codec().encode(&fields)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let fields = Self::codec().decode(bytes)?;
        let mut words = [0u16; 4];
        for (word, field) in words.iter_mut().zip(fields.iter()) {
            *word = u16::from_be_bytes([field[0], field[1]]);
        }
        Ok(Self { words })
    }
}

impl Default for AdvertisePacket {
    fn default() -> Self {
        Self::new([Self::DEFAULT_WORD; 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields_of(widths: &[usize]) -> Vec<Vec<u8>> {
        widths
            .iter()
            .enumerate()
            .map(|(i, w)| vec![i as u8 + 1; *w])
            .collect()
    }

    #[test]
    fn test_thirty_byte_payload_is_rejected() {
        let layout = [4, 4, 4, 4, 4, 4, 3, 3];
        let codec = AdvertisementCodec::new(&layout);
        let result = codec.encode(&fields_of(&layout));
        assert_eq!(
            result,
            Err(GattError::PayloadTooLarge { size: 30, max: 29 })
        );
    }

    #[test]
    fn test_twenty_nine_byte_payload_round_trips() {
        let layout = [4, 4, 4, 4, 4, 3, 3, 3];
        let codec = AdvertisementCodec::new(&layout);
        let fields = fields_of(&layout);

        let encoded = codec.encode(&fields).unwrap();
        assert_eq!(encoded.len(), MAX_ADVERTISEMENT_PAYLOAD);
        assert_eq!(codec.decode(&encoded).unwrap(), fields);
    }

    #[test]
    fn test_field_shape_is_checked() {
        let codec = AdvertisementCodec::new(&[2, 2]);
        assert!(matches!(
            codec.encode(&[vec![0u8; 2]]),
            Err(GattError::FieldCountMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            codec.encode(&[vec![0u8; 2], vec![0u8; 3]]),
            Err(GattError::FieldLengthMismatch { index: 1, expected: 2, actual: 3 })
        ));
        assert!(codec.decode(&[0u8; 3]).is_err());
        assert!(codec.decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_input() {
        let codec = AdvertisementCodec::new(&[30]);
        assert!(matches!(
            codec.decode(&[0u8; 30]),
            Err(GattError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_default_packet_bytes() {
        let bytes = AdvertisePacket::default().to_bytes().unwrap();
        assert_eq!(bytes, vec![0xB0, 0x0B, 0xB0, 0x0B, 0xB0, 0x0B, 0xB0, 0x0B]);
        assert_eq!(AdvertisePacket::from_bytes(&bytes).unwrap(), AdvertisePacket::default());
    }

    #[test]
    fn test_packet_words_are_big_endian() {
        let packet = AdvertisePacket::new([0x0102, 0x0304, 0x0506, 0x0708]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes, (1u8..=8).collect::<Vec<_>>());
        assert_eq!(AdvertisePacket::from_bytes(&bytes).unwrap(), packet);
    }
}
