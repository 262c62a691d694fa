//! Byte codecs for values and catalog records.
//!
//! Every type reserves one distinguished byte pattern as its null sentinel
//! (the type's minimum value; two NUL bytes for strings). Serialization of an
//! application value that equals the sentinel fails loudly with
//! [`DbError::ReservedValue`] rather than silently producing a null.

use crate::error::{DbError, DbResult};
use crate::values::{Type, Value};

/// The string null sentinel: two NUL bytes.
pub const STRING_NULL_SENTINEL: &[u8] = b"\x00\x00";

/// Boolean encoding is one byte {0, 1}; 0xFF is reserved for null.
const BOOL_NULL: u8 = 0xFF;

// ---------------------------------------------------------------------------
// Varints (LEB128) — used by the catalog record layouts.
// ---------------------------------------------------------------------------

/// Append `value` as an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint, advancing `pos`.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> DbResult<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| DbError::DataCorruption("truncated varint".into()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(DbError::DataCorruption("varint overflow".into()));
        }
    }
}

/// Append a signed value as a zigzag varint.
pub fn write_varint_signed(buf: &mut Vec<u8>, value: i64) {
    write_varint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Read a zigzag varint, advancing `pos`.
pub fn read_varint_signed(buf: &[u8], pos: &mut usize) -> DbResult<i64> {
    let raw = read_varint(buf, pos)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

/// Append a varint-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// Read a varint-length-prefixed UTF-8 string, advancing `pos`.
pub fn read_string(buf: &[u8], pos: &mut usize) -> DbResult<String> {
    let len = read_varint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| DbError::DataCorruption("truncated string".into()))?;
    let out = std::str::from_utf8(&buf[*pos..end])
        .map_err(|_| DbError::DataCorruption("invalid utf-8 in record".into()))?
        .to_string();
    *pos = end;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Value codecs
// ---------------------------------------------------------------------------

/// Encode the null sentinel for `ty`.
pub fn encode_null(ty: &Type) -> Vec<u8> {
    match ty {
        Type::Bool => vec![BOOL_NULL],
        Type::Byte => i8::MIN.to_be_bytes().to_vec(),
        Type::Short => i16::MIN.to_be_bytes().to_vec(),
        Type::Int => i32::MIN.to_be_bytes().to_vec(),
        Type::Long | Type::Date => i64::MIN.to_be_bytes().to_vec(),
        Type::Float => f32::MIN.to_be_bytes().to_vec(),
        Type::Double => f64::MIN.to_be_bytes().to_vec(),
        Type::String => STRING_NULL_SENTINEL.to_vec(),
        Type::Complex32 => {
            let mut out = f32::MIN.to_be_bytes().to_vec();
            out.extend_from_slice(&f32::MIN.to_be_bytes());
            out
        }
        Type::Complex64 => {
            let mut out = f64::MIN.to_be_bytes().to_vec();
            out.extend_from_slice(&f64::MIN.to_be_bytes());
            out
        }
        Type::BoolVec(d) => vec![BOOL_NULL; *d as usize],
        Type::IntVec(d) => repeat_pattern(&i32::MIN.to_be_bytes(), *d),
        Type::LongVec(d) => repeat_pattern(&i64::MIN.to_be_bytes(), *d),
        Type::FloatVec(d) => repeat_pattern(&f32::MIN.to_be_bytes(), *d),
        Type::DoubleVec(d) => repeat_pattern(&f64::MIN.to_be_bytes(), *d),
        Type::Complex32Vec(d) => repeat_pattern(&f32::MIN.to_be_bytes(), *d * 2),
        Type::Complex64Vec(d) => repeat_pattern(&f64::MIN.to_be_bytes(), *d * 2),
    }
}

fn repeat_pattern(pattern: &[u8], times: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(pattern.len() * times as usize);
    for _ in 0..times {
        out.extend_from_slice(pattern);
    }
    out
}

/// Encode a non-null value to its canonical byte form.
///
/// Fails with [`DbError::ReservedValue`] when the application value would be
/// indistinguishable from the null sentinel of its type.
pub fn encode(value: &Value) -> DbResult<Vec<u8>> {
    let out = match value {
        Value::Bool(v) => vec![u8::from(*v)],
        Value::Byte(v) => v.to_be_bytes().to_vec(),
        Value::Short(v) => v.to_be_bytes().to_vec(),
        Value::Int(v) => v.to_be_bytes().to_vec(),
        Value::Long(v) | Value::Date(v) => v.to_be_bytes().to_vec(),
        Value::Float(v) => v.to_be_bytes().to_vec(),
        Value::Double(v) => v.to_be_bytes().to_vec(),
        Value::String(v) => v.as_bytes().to_vec(),
        Value::Complex32 { re, im } => {
            let mut out = re.to_be_bytes().to_vec();
            out.extend_from_slice(&im.to_be_bytes());
            out
        }
        Value::Complex64 { re, im } => {
            let mut out = re.to_be_bytes().to_vec();
            out.extend_from_slice(&im.to_be_bytes());
            out
        }
        Value::BoolVec(v) => v.iter().map(|b| u8::from(*b)).collect(),
        Value::IntVec(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
        Value::LongVec(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
        Value::FloatVec(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
        Value::DoubleVec(v) => v.iter().flat_map(|x| x.to_be_bytes()).collect(),
        Value::Complex32Vec(v) => v
            .iter()
            .flat_map(|(re, im)| {
                let mut pair = re.to_be_bytes().to_vec();
                pair.extend_from_slice(&im.to_be_bytes());
                pair
            })
            .collect(),
        Value::Complex64Vec(v) => v
            .iter()
            .flat_map(|(re, im)| {
                let mut pair = re.to_be_bytes().to_vec();
                pair.extend_from_slice(&im.to_be_bytes());
                pair
            })
            .collect(),
    };
    if out == encode_null(&value.type_of()) {
        return Err(DbError::ReservedValue(format!(
            "value {value} equals the null sentinel of {}",
            value.type_of()
        )));
    }
    Ok(out)
}

/// Encode an optional value, substituting the sentinel for `None`.
pub fn encode_optional(ty: &Type, value: Option<&Value>) -> DbResult<Vec<u8>> {
    match value {
        Some(v) => encode(v),
        None => Ok(encode_null(ty)),
    }
}

/// Decode bytes into `Some(value)`, or `None` when they equal the sentinel.
pub fn decode(ty: &Type, bytes: &[u8]) -> DbResult<Option<Value>> {
    if bytes == encode_null(ty).as_slice() {
        return Ok(None);
    }
    let expected = ty.physical_size();
    if *ty != Type::String && bytes.len() != expected {
        return Err(DbError::DataCorruption(format!(
            "value of type {ty} has {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    let value = match ty {
        Type::Bool => match bytes[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(DbError::DataCorruption(format!(
                    "invalid boolean byte {other:#x}"
                )));
            }
        },
        Type::Byte => Value::Byte(i8::from_be_bytes([bytes[0]])),
        Type::Short => Value::Short(i16::from_be_bytes(fixed(bytes)?)),
        Type::Int => Value::Int(i32::from_be_bytes(fixed(bytes)?)),
        Type::Long => Value::Long(i64::from_be_bytes(fixed(bytes)?)),
        Type::Date => Value::Date(i64::from_be_bytes(fixed(bytes)?)),
        Type::Float => Value::Float(f32::from_be_bytes(fixed(bytes)?)),
        Type::Double => Value::Double(f64::from_be_bytes(fixed(bytes)?)),
        Type::String => Value::String(
            std::str::from_utf8(bytes)
                .map_err(|_| DbError::DataCorruption("invalid utf-8 in string value".into()))?
                .to_string(),
        ),
        Type::Complex32 => Value::Complex32 {
            re: f32::from_be_bytes(fixed(&bytes[..4])?),
            im: f32::from_be_bytes(fixed(&bytes[4..])?),
        },
        Type::Complex64 => Value::Complex64 {
            re: f64::from_be_bytes(fixed(&bytes[..8])?),
            im: f64::from_be_bytes(fixed(&bytes[8..])?),
        },
        Type::BoolVec(_) => Value::BoolVec(
            bytes
                .iter()
                .map(|b| match b {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(DbError::DataCorruption(format!(
                        "invalid boolean byte {other:#x} in vector"
                    ))),
                })
                .collect::<DbResult<_>>()?,
        ),
        Type::IntVec(_) => Value::IntVec(decode_elements(bytes, i32::from_be_bytes)?),
        Type::LongVec(_) => Value::LongVec(decode_elements(bytes, i64::from_be_bytes)?),
        Type::FloatVec(_) => Value::FloatVec(decode_elements(bytes, f32::from_be_bytes)?),
        Type::DoubleVec(_) => Value::DoubleVec(decode_elements(bytes, f64::from_be_bytes)?),
        Type::Complex32Vec(_) => {
            let flat: Vec<f32> = decode_elements(bytes, f32::from_be_bytes)?;
            Value::Complex32Vec(flat.chunks_exact(2).map(|c| (c[0], c[1])).collect())
        }
        Type::Complex64Vec(_) => {
            let flat: Vec<f64> = decode_elements(bytes, f64::from_be_bytes)?;
            Value::Complex64Vec(flat.chunks_exact(2).map(|c| (c[0], c[1])).collect())
        }
    };
    Ok(Some(value))
}

fn fixed<const N: usize>(bytes: &[u8]) -> DbResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| DbError::DataCorruption("value byte length mismatch".into()))
}

fn decode_elements<T, const N: usize>(
    bytes: &[u8],
    from_be: impl Fn([u8; N]) -> T,
) -> DbResult<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(DbError::DataCorruption(
            "vector byte length is not a multiple of its element size".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| from_be(chunk.try_into().expect("chunk size")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_round_trip() {
        for ty in [
            Type::Bool,
            Type::Long,
            Type::Double,
            Type::String,
            Type::FloatVec(3),
            Type::Complex64Vec(2),
        ] {
            let bytes = encode_null(&ty);
            assert_eq!(decode(&ty, &bytes).unwrap(), None, "{ty}");
        }
    }

    #[test]
    fn reserved_value_is_rejected() {
        assert!(matches!(
            encode(&Value::Long(i64::MIN)),
            Err(DbError::ReservedValue(_))
        ));
        assert!(matches!(
            encode(&Value::String("\u{0}\u{0}".into())),
            Err(DbError::ReservedValue(_))
        ));
    }

    #[test]
    fn string_prefix_order_is_byte_order() {
        let alpha = encode(&Value::String("alpha".into())).unwrap();
        let alpine = encode(&Value::String("alpine".into())).unwrap();
        assert!(alpine.starts_with(b"alp"));
        assert!(alpha < alpine);
    }

    #[test]
    fn varint_signed_round_trip() {
        for v in [0i64, 1, -1, 300, -300, i64::MAX, i64::MIN + 1] {
            let mut buf = Vec::new();
            write_varint_signed(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_varint_signed(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    proptest! {
        #[test]
        fn long_round_trip(v in any::<i64>().prop_filter("sentinel", |v| *v != i64::MIN)) {
            let bytes = encode(&Value::Long(v)).unwrap();
            prop_assert_eq!(decode(&Type::Long, &bytes).unwrap(), Some(Value::Long(v)));
        }

        #[test]
        fn float_vec_round_trip(v in proptest::collection::vec(-1000.0f32..1000.0, 1..16)) {
            let value = Value::FloatVec(v.clone());
            let ty = value.type_of();
            let bytes = encode(&value).unwrap();
            prop_assert_eq!(decode(&ty, &bytes).unwrap(), Some(value));
        }

        #[test]
        fn varint_round_trip(v in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut pos = 0;
            prop_assert_eq!(read_varint(&buf, &mut pos).unwrap(), v);
        }
    }
}
