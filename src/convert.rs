//! Conversion (§4.4): endianness- and sign-aware interpretation of raw
//! bytes as typed values. A direct port of
//! `original_source/lib/convert/src/convert.cpp`'s scratch-buffer
//! algorithm.

use crate::constants::MAX_CONVERSION_SIZE;
use crate::error::GswError;
use crate::vcm::{Endianness, Measurement, MeasurementType, Sign};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Raw(Vec<u8>),
}

/// Copies `raw` into a zero-padded `size`-byte scratch buffer, reversing
/// byte order if `receiver_endianness != system_endianness` — except for
/// `String` measurements, which copy verbatim regardless of endianness
/// (§4.4; `convert.cpp`'s `STRING_TYPE` arm never branches on endianness,
/// unlike its INT/FLOAT arms).
fn scratch(raw: &[u8], size: usize, receiver: Endianness, system: Endianness, r#type: MeasurementType) -> Result<Vec<u8>, GswError> {
    if size == 0 || size > MAX_CONVERSION_SIZE {
        return Err(GswError::failure("Convert", "scratch", format!("size {size} out of range")));
    }
    let mut buf = vec![0u8; size];
    let n = raw.len().min(size);
    buf[..n].copy_from_slice(&raw[..n]);
    if receiver != system && r#type != MeasurementType::String {
        buf.reverse();
    }
    Ok(buf)
}

/// `convert_from(system_endianness, raw_bytes, measurement) -> Value`.
pub fn convert_from(system: Endianness, raw: &[u8], meas: &Measurement) -> Result<Value, GswError> {
    let buf = scratch(raw, meas.size, meas.endianness, system, meas.r#type)?;

    match meas.r#type {
        MeasurementType::String => {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            Ok(Value::Str(String::from_utf8_lossy(&buf[..end]).into_owned()))
        }
        MeasurementType::Float => match meas.size {
            4 => {
                let arr: [u8; 4] = buf[..4].try_into().unwrap();
                Ok(Value::Float(f32::from_ne_bytes(arr) as f64))
            }
            8 => {
                let arr: [u8; 8] = buf[..8].try_into().unwrap();
                Ok(Value::Float(f64::from_ne_bytes(arr)))
            }
            other => Err(GswError::failure("Convert", "convert_from", format!("unsupported float size {other}"))),
        },
        MeasurementType::Int | MeasurementType::Undefined => {
            if meas.sign == Sign::Signed {
                Ok(Value::Int(bytes_to_i64(&buf)))
            } else {
                Ok(Value::UInt(bytes_to_u64(&buf)))
            }
        }
    }
}

/// Inverse of `convert_from`: produce `size` bytes in the measurement's
/// declared endianness from a native-endian value, for the idempotence
/// property in §8 and for `Writer::write`.
pub fn convert_to(system: Endianness, value: &Value, meas: &Measurement) -> Result<Vec<u8>, GswError> {
    let mut native = vec![0u8; meas.size];
    match (value, meas.r#type) {
        (Value::Str(s), MeasurementType::String) => {
            let bytes = s.as_bytes();
            let n = bytes.len().min(meas.size.saturating_sub(1));
            native[..n].copy_from_slice(&bytes[..n]);
        }
        (Value::Float(f), MeasurementType::Float) => match meas.size {
            4 => native.copy_from_slice(&(*f as f32).to_ne_bytes()),
            8 => native.copy_from_slice(&f.to_ne_bytes()),
            other => return Err(GswError::failure("Convert", "convert_to", format!("unsupported float size {other}"))),
        },
        (Value::Int(v), _) => {
            let full = v.to_ne_bytes();
            let n = meas.size.min(full.len());
            native[..n].copy_from_slice(&full[..n]);
        }
        (Value::UInt(v), _) => {
            let full = v.to_ne_bytes();
            let n = meas.size.min(full.len());
            native[..n].copy_from_slice(&full[..n]);
        }
        (Value::Raw(bytes), _) => {
            let n = bytes.len().min(meas.size);
            native[..n].copy_from_slice(&bytes[..n]);
        }
        _ => return Err(GswError::failure("Convert", "convert_to", "value/type mismatch")),
    }
    if meas.endianness != system && meas.r#type != MeasurementType::String {
        native.reverse();
    }
    Ok(native)
}

fn bytes_to_i64(buf: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    let n = buf.len().min(8);
    // sign-extend from the narrower width.
    let sign_byte = if buf[n - 1] & 0x80 != 0 { 0xFF } else { 0x00 };
    arr.fill(sign_byte);
    arr[..n].copy_from_slice(&buf[..n]);
    i64::from_ne_bytes(arr)
}

fn bytes_to_u64(buf: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = buf.len().min(8);
    arr[..n].copy_from_slice(&buf[..n]);
    u64::from_ne_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcm::Location;

    fn meas(size: usize, r#type: MeasurementType, sign: Sign, endianness: Endianness) -> Measurement {
        Measurement {
            name: "M".to_string(),
            size,
            r#type,
            sign,
            endianness,
            locations: vec![Location { packet_index: 0, offset: 0 }],
        }
    }

    #[test]
    fn little_endian_int_round_trips() {
        let m = meas(4, MeasurementType::Int, Sign::Unsigned, Endianness::Little);
        let raw = [0x01u8, 0x02, 0x03, 0x04];
        let v = convert_from(Endianness::Little, &raw, &m).unwrap();
        assert_eq!(v, Value::UInt(0x04030201));
    }

    #[test]
    fn byte_reversal_on_endianness_mismatch() {
        let m = meas(4, MeasurementType::Int, Sign::Unsigned, Endianness::Big);
        let raw = [0x01u8, 0x02, 0x03, 0x04];
        let v = convert_from(Endianness::Little, &raw, &m).unwrap();
        assert_eq!(v, Value::UInt(0x01020304));
    }

    #[test]
    fn signed_negative_value() {
        let m = meas(4, MeasurementType::Int, Sign::Signed, Endianness::Little);
        let raw = (-1i32).to_le_bytes();
        let v = convert_from(Endianness::Little, &raw, &m).unwrap();
        assert_eq!(v, Value::Int(-1));
    }

    #[test]
    fn float_round_trips() {
        let m = meas(8, MeasurementType::Float, Sign::Signed, Endianness::Little);
        let v = Value::Float(3.5);
        let bytes = convert_to(Endianness::Little, &v, &m).unwrap();
        let back = convert_from(Endianness::Little, &bytes, &m).unwrap();
        assert_eq!(back, Value::Float(3.5));
    }

    #[test]
    fn string_stops_at_null() {
        let m = meas(8, MeasurementType::String, Sign::Signed, Endianness::Little);
        let mut raw = b"hi\0\0\0\0\0\0".to_vec();
        raw.truncate(8);
        let v = convert_from(Endianness::Little, &raw, &m).unwrap();
        assert_eq!(v, Value::Str("hi".to_string()));
    }

    #[test]
    fn oversized_measurement_is_rejected() {
        let m = meas(512, MeasurementType::Int, Sign::Unsigned, Endianness::Little);
        let raw = vec![0u8; 512];
        assert!(convert_from(Endianness::Little, &raw, &m).is_err());
    }
}
