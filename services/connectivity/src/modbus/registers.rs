//! Register value codec
//!
//! Words on the wire are 16-bit; 32-bit types span two registers. `BE` is
//! standard Modbus byte order; `LE` is fully byte-swapped (word order and
//! bytes within each word). Decode applies `scale`; encode applies the
//! inverse so a decode of an encode returns the original value.

use crate::error::{AdapterError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use types::{RegisterDataType, RegisterSpec, WordOrder};

/// Decoded register content
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Number(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

fn words_to_bytes(words: &[u16], order: WordOrder) -> Vec<u8> {
    match order {
        WordOrder::Be => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        WordOrder::Le => words.iter().rev().flat_map(|w| w.to_le_bytes()).collect(),
    }
}

fn bytes_to_words(bytes: &[u8], order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let buf = [pair[0], *pair.get(1).unwrap_or(&0)];
            match order {
                WordOrder::Be => u16::from_be_bytes(buf),
                WordOrder::Le => u16::from_le_bytes(buf),
            }
        })
        .collect();
    if order == WordOrder::Le {
        words.reverse();
    }
    words
}

/// Decode a word-register read (holding/input tables).
///
/// A short buffer is an error; the scan loop skips the register and
/// continues with the rest.
pub fn decode_words(spec: &RegisterSpec, words: &[u16]) -> Result<RegisterValue> {
    let needed = spec.data_type.word_count() as usize;
    if words.len() < needed {
        return Err(AdapterError::Configuration(format!(
            "register {}: short read ({} of {} words)",
            spec.name,
            words.len(),
            needed
        )));
    }

    let bytes = words_to_bytes(&words[..needed], spec.byte_order);
    let raw = match spec.data_type {
        RegisterDataType::Int16 => match spec.byte_order {
            WordOrder::Be => BigEndian::read_i16(&bytes) as f64,
            WordOrder::Le => LittleEndian::read_i16(&bytes) as f64,
        },
        RegisterDataType::Uint16 => match spec.byte_order {
            WordOrder::Be => BigEndian::read_u16(&bytes) as f64,
            WordOrder::Le => LittleEndian::read_u16(&bytes) as f64,
        },
        RegisterDataType::Int32 => match spec.byte_order {
            WordOrder::Be => BigEndian::read_i32(&bytes) as f64,
            WordOrder::Le => LittleEndian::read_i32(&bytes) as f64,
        },
        RegisterDataType::Uint32 => match spec.byte_order {
            WordOrder::Be => BigEndian::read_u32(&bytes) as f64,
            WordOrder::Le => LittleEndian::read_u32(&bytes) as f64,
        },
        RegisterDataType::Float32 => match spec.byte_order {
            WordOrder::Be => BigEndian::read_f32(&bytes) as f64,
            WordOrder::Le => LittleEndian::read_f32(&bytes) as f64,
        },
        RegisterDataType::Bool => {
            let word = words[0];
            let truthy = match spec.bit_offset {
                Some(bit) => (word >> bit) & 1 == 1,
                None => word != 0,
            };
            return Ok(RegisterValue::Bool(truthy));
        }
        RegisterDataType::Buffer => {
            let count = spec.word_count() as usize;
            let all = words_to_bytes(&words[..count.min(words.len())], spec.byte_order);
            return Ok(RegisterValue::Bytes(all));
        }
    };
    Ok(RegisterValue::Number(raw * spec.scale))
}

/// Decode a bit-register read (coil/discrete tables)
pub fn decode_bits(spec: &RegisterSpec, bits: &[bool]) -> Result<RegisterValue> {
    let first = *bits.first().ok_or_else(|| {
        AdapterError::Configuration(format!("register {}: empty bit read", spec.name))
    })?;
    Ok(RegisterValue::Bool(first))
}

/// Encode a numeric value for the write path. Applies the `1/scale`
/// inversion and produces one or two words depending on the data type.
pub fn encode_value(spec: &RegisterSpec, value: f64) -> Result<Vec<u16>> {
    if spec.scale == 0.0 {
        return Err(AdapterError::Configuration(format!(
            "register {}: zero scale",
            spec.name
        )));
    }
    let raw = value / spec.scale;

    let bytes = match spec.data_type {
        RegisterDataType::Int16 => {
            let v = checked_int(raw, i16::MIN as f64, i16::MAX as f64, &spec.name)? as i16;
            let mut buf = [0u8; 2];
            match spec.byte_order {
                WordOrder::Be => BigEndian::write_i16(&mut buf, v),
                WordOrder::Le => LittleEndian::write_i16(&mut buf, v),
            }
            buf.to_vec()
        }
        RegisterDataType::Uint16 => {
            let v = checked_int(raw, 0.0, u16::MAX as f64, &spec.name)? as u16;
            let mut buf = [0u8; 2];
            match spec.byte_order {
                WordOrder::Be => BigEndian::write_u16(&mut buf, v),
                WordOrder::Le => LittleEndian::write_u16(&mut buf, v),
            }
            buf.to_vec()
        }
        RegisterDataType::Int32 => {
            let v = checked_int(raw, i32::MIN as f64, i32::MAX as f64, &spec.name)? as i32;
            let mut buf = [0u8; 4];
            match spec.byte_order {
                WordOrder::Be => BigEndian::write_i32(&mut buf, v),
                WordOrder::Le => LittleEndian::write_i32(&mut buf, v),
            }
            buf.to_vec()
        }
        RegisterDataType::Uint32 => {
            let v = checked_int(raw, 0.0, u32::MAX as f64, &spec.name)? as u32;
            let mut buf = [0u8; 4];
            match spec.byte_order {
                WordOrder::Be => BigEndian::write_u32(&mut buf, v),
                WordOrder::Le => LittleEndian::write_u32(&mut buf, v),
            }
            buf.to_vec()
        }
        RegisterDataType::Float32 => {
            let mut buf = [0u8; 4];
            match spec.byte_order {
                WordOrder::Be => BigEndian::write_f32(&mut buf, raw as f32),
                WordOrder::Le => LittleEndian::write_f32(&mut buf, raw as f32),
            }
            buf.to_vec()
        }
        RegisterDataType::Bool => {
            return Ok(vec![if value != 0.0 { 1 } else { 0 }]);
        }
        RegisterDataType::Buffer => {
            return Err(AdapterError::Configuration(format!(
                "register {}: buffer registers cannot be written numerically",
                spec.name
            )));
        }
    };

    Ok(bytes_to_words(&bytes, spec.byte_order))
}

fn checked_int(raw: f64, min: f64, max: f64, name: &str) -> Result<i64> {
    let rounded = raw.round();
    if !rounded.is_finite() || rounded < min || rounded > max {
        return Err(AdapterError::Configuration(format!(
            "register {}: value {} out of range",
            name, raw
        )));
    }
    Ok(rounded as i64)
}
