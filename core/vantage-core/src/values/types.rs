//! The type system: scalar and vector types with canonical ordinals.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged type discriminator.
///
/// The pair (ordinal, logical size) is canonical for on-disk type identity:
/// vector variants carry their dimension, scalars have logical size 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Epoch milliseconds, signed
    Date,
    String,
    Complex32,
    Complex64,
    BoolVec(u32),
    IntVec(u32),
    LongVec(u32),
    FloatVec(u32),
    DoubleVec(u32),
    Complex32Vec(u32),
    Complex64Vec(u32),
}

impl Type {
    /// Canonical ordinal of this type.
    pub fn ordinal(&self) -> u8 {
        match self {
            Type::Bool => 0,
            Type::Byte => 1,
            Type::Short => 2,
            Type::Int => 3,
            Type::Long => 4,
            Type::Float => 5,
            Type::Double => 6,
            Type::Date => 7,
            Type::String => 8,
            Type::Complex32 => 9,
            Type::Complex64 => 10,
            Type::BoolVec(_) => 11,
            Type::IntVec(_) => 12,
            Type::LongVec(_) => 13,
            Type::FloatVec(_) => 14,
            Type::DoubleVec(_) => 15,
            Type::Complex32Vec(_) => 16,
            Type::Complex64Vec(_) => 17,
        }
    }

    /// Reconstruct a type from its canonical (ordinal, logical size) pair.
    pub fn from_ordinal(ordinal: u8, logical_size: u32) -> DbResult<Type> {
        let ty = match ordinal {
            0 => Type::Bool,
            1 => Type::Byte,
            2 => Type::Short,
            3 => Type::Int,
            4 => Type::Long,
            5 => Type::Float,
            6 => Type::Double,
            7 => Type::Date,
            8 => Type::String,
            9 => Type::Complex32,
            10 => Type::Complex64,
            11 => Type::BoolVec(logical_size),
            12 => Type::IntVec(logical_size),
            13 => Type::LongVec(logical_size),
            14 => Type::FloatVec(logical_size),
            15 => Type::DoubleVec(logical_size),
            16 => Type::Complex32Vec(logical_size),
            17 => Type::Complex64Vec(logical_size),
            other => {
                return Err(DbError::DataCorruption(format!(
                    "unknown type ordinal {other}"
                )));
            }
        };
        Ok(ty)
    }

    /// Dimension for vectors, 1 for scalars.
    pub fn logical_size(&self) -> u32 {
        match self {
            Type::BoolVec(d)
            | Type::IntVec(d)
            | Type::LongVec(d)
            | Type::FloatVec(d)
            | Type::DoubleVec(d)
            | Type::Complex32Vec(d)
            | Type::Complex64Vec(d) => *d,
            _ => 1,
        }
    }

    /// Size in bytes of one serialized value of this type.
    ///
    /// Strings are variable-width; this returns the minimum (the two-byte
    /// null sentinel) for them.
    pub fn physical_size(&self) -> usize {
        let d = self.logical_size() as usize;
        match self {
            Type::Bool | Type::Byte => 1,
            Type::Short => 2,
            Type::Int | Type::Float => 4,
            Type::Long | Type::Double | Type::Date => 8,
            Type::String => 2,
            Type::Complex32 => 8,
            Type::Complex64 => 16,
            Type::BoolVec(_) => d,
            Type::IntVec(_) | Type::FloatVec(_) => 4 * d,
            Type::LongVec(_) | Type::DoubleVec(_) => 8 * d,
            Type::Complex32Vec(_) => 8 * d,
            Type::Complex64Vec(_) => 16 * d,
        }
    }

    /// True for all vector variants.
    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Type::BoolVec(_)
                | Type::IntVec(_)
                | Type::LongVec(_)
                | Type::FloatVec(_)
                | Type::DoubleVec(_)
                | Type::Complex32Vec(_)
                | Type::Complex64Vec(_)
        )
    }

    /// True for real-valued vector types usable by the distance kernels.
    pub fn is_real_vector(&self) -> bool {
        matches!(
            self,
            Type::IntVec(_) | Type::LongVec(_) | Type::FloatVec(_) | Type::DoubleVec(_)
        )
    }

    /// True for complex vector types.
    pub fn is_complex_vector(&self) -> bool {
        matches!(self, Type::Complex32Vec(_) | Type::Complex64Vec(_))
    }

    /// True for scalar types with a total order (everything but complex).
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Byte
                | Type::Short
                | Type::Int
                | Type::Long
                | Type::Float
                | Type::Double
                | Type::Date
                | Type::String
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::BoolVec(d) => write!(f, "BoolVec[{d}]"),
            Type::IntVec(d) => write!(f, "IntVec[{d}]"),
            Type::LongVec(d) => write!(f, "LongVec[{d}]"),
            Type::FloatVec(d) => write!(f, "FloatVec[{d}]"),
            Type::DoubleVec(d) => write!(f, "DoubleVec[{d}]"),
            Type::Complex32Vec(d) => write!(f, "Complex32Vec[{d}]"),
            Type::Complex64Vec(d) => write!(f, "Complex64Vec[{d}]"),
            other => write!(f, "{other:?}"),
        }
    }
}
