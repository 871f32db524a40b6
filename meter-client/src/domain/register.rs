use std::str::FromStr;

use super::UnknownVariant;

/// Encoding of a register value on the wire.
///
/// 32-bit types span two consecutive 16-bit words, high word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    pub fn word_count(&self) -> u16 {
        match self {
            Self::U16 | Self::I16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
        }
    }

    /// Decode raw words. Returns `None` on a word-count mismatch or a
    /// non-finite float.
    pub fn decode(&self, words: &[u16]) -> Option<f64> {
        if words.len() != self.word_count() as usize {
            return None;
        }

        let value = match self {
            Self::U16 => f64::from(words[0]),
            Self::I16 => f64::from(words[0] as i16),
            Self::U32 => f64::from(join_words(words)),
            Self::I32 => f64::from(join_words(words) as i32),
            Self::F32 => f64::from(f32::from_bits(join_words(words))),
        };

        value.is_finite().then_some(value)
    }
}

fn join_words(words: &[u16]) -> u32 {
    (u32::from(words[0]) << 16) | u32::from(words[1])
}

impl FromStr for DataType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "u16" | "uint16" => Ok(Self::U16),
            "i16" | "int16" => Ok(Self::I16),
            "u32" | "uint32" => Ok(Self::U32),
            "i32" | "int32" => Ok(Self::I32),
            "f32" | "float32" | "float" => Ok(Self::F32),
            other => Err(UnknownVariant {
                kind: "data type",
                value: other.to_string(),
            }),
        }
    }
}

/// Mapping of one device register to a named data point.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisterMapping {
    pub address: u16,
    pub data_point: String,
    pub data_type: DataType,
    pub scale: f64,
    pub unit: String,
}

impl RegisterMapping {
    /// Decode raw words and apply the scale factor.
    pub fn decode(&self, words: &[u16]) -> Option<f64> {
        self.data_type
            .decode(words)
            .map(|v| v * self.scale)
            .filter(|v| v.is_finite())
    }

    /// Last word address occupied by this register.
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.data_type.word_count()) - 1
    }
}

/// Row shape of the `register_mappings` table joined to its device.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegisterRow {
    pub host: String,
    pub port: i32,
    pub protocol: String,
    pub unit_id: i16,
    pub register_address: i32,
    pub data_point: String,
    pub data_type: String,
    pub scale: f64,
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(data_type: DataType, scale: f64) -> RegisterMapping {
        RegisterMapping {
            address: 100,
            data_point: "voltage_l1".to_string(),
            data_type,
            scale,
            unit: "V".to_string(),
        }
    }

    #[test]
    fn decodes_signed_and_scaled_values() {
        assert_eq!(mapping(DataType::I16, 0.1).decode(&[0xFFF6]), Some(-1.0));
        assert_eq!(mapping(DataType::U16, 0.5).decode(&[460]), Some(230.0));
        assert_eq!(mapping(DataType::U32, 1.0).decode(&[0x0001, 0x0000]), Some(65536.0));
    }

    #[test]
    fn decodes_float_words_high_first() {
        let bits = 230.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(mapping(DataType::F32, 1.0).decode(&words), Some(230.5));
    }

    #[test]
    fn rejects_word_count_mismatch_and_nan() {
        assert_eq!(mapping(DataType::U32, 1.0).decode(&[1]), None);

        let nan = f32::NAN.to_bits();
        assert_eq!(
            mapping(DataType::F32, 1.0).decode(&[(nan >> 16) as u16, nan as u16]),
            None
        );
    }

    #[test]
    fn end_address_covers_two_word_types() {
        assert_eq!(mapping(DataType::F32, 1.0).end_address(), 101);
        assert_eq!(mapping(DataType::U16, 1.0).end_address(), 100);
    }
}
