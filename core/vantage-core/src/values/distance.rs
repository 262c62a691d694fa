//! Distance kernels for vector similarity search.

use crate::error::{DbError, DbResult};
use crate::values::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A distance (or dissimilarity) function over real-valued vectors.
///
/// `Cosine` and `InnerProduct` are similarities; they are negated/inverted
/// into dissimilarities so that smaller is always nearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    L1,
    L2,
    L2Squared,
    Cosine,
    InnerProduct,
}

impl Distance {
    /// True for the Minkowski family supported by the VA-file bounds.
    pub fn is_minkowski(&self) -> bool {
        matches!(self, Distance::L1 | Distance::L2 | Distance::L2Squared)
    }

    /// Distance between two component slices of equal length.
    pub fn compute(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Distance::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            Distance::L2 => self.partial_to_final(
                a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>(),
            ),
            Distance::L2Squared => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Distance::Cosine => {
                let mut dot = 0.0;
                let mut norm_a = 0.0;
                let mut norm_b = 0.0;
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
            Distance::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>(),
        }
    }

    /// Distance between two values with numeric components.
    pub fn between(&self, a: &Value, b: &Value) -> DbResult<f64> {
        let xs = a.to_f64_components(false)?;
        let ys = b.to_f64_components(false)?;
        if xs.len() != ys.len() {
            return Err(DbError::Bind(format!(
                "distance between vectors of dimension {} and {}",
                xs.len(),
                ys.len()
            )));
        }
        Ok(self.compute(&xs, &ys))
    }

    /// Map an additive partial accumulation to the final distance.
    ///
    /// The Minkowski kernels accumulate per-dimension terms; only L2 applies
    /// a final square root. Used by the VA-file bounds and the PQ lookup
    /// tables, which sum per-dimension/per-subspace contributions.
    pub fn partial_to_final(&self, partial: f64) -> f64 {
        match self {
            Distance::L2 => partial.sqrt(),
            _ => partial,
        }
    }

    /// Per-dimension additive term of the Minkowski kernels.
    pub fn component_term(&self, delta: f64) -> f64 {
        match self {
            Distance::L1 => delta.abs(),
            Distance::L2 | Distance::L2Squared => delta * delta,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distance::L1 => "L1",
            Distance::L2 => "L2",
            Distance::L2Squared => "L2SQUARED",
            Distance::Cosine => "COSINE",
            Distance::InnerProduct => "INNERPRODUCT",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Distance {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L1" => Ok(Distance::L1),
            "L2" => Ok(Distance::L2),
            "L2SQUARED" | "L2SQ" => Ok(Distance::L2Squared),
            "COSINE" => Ok(Distance::Cosine),
            "INNERPRODUCT" | "IP" => Ok(Distance::InnerProduct),
            other => Err(DbError::Bind(format!("unknown distance '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minkowski_kernels() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert_eq!(Distance::L1.compute(&a, &b), 2.0);
        assert_eq!(Distance::L2Squared.compute(&a, &b), 2.0);
        assert!((Distance::L2.compute(&a, &b) - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn cosine_of_identical_vectors_is_zero() {
        let a = [0.5, 0.5, 0.1];
        assert!(Distance::Cosine.compute(&a, &a).abs() < 1e-12);
    }

    #[test]
    fn inner_product_prefers_aligned() {
        let q = [1.0, 1.0];
        let near = [2.0, 2.0];
        let far = [-1.0, -1.0];
        assert!(Distance::InnerProduct.compute(&q, &near) < Distance::InnerProduct.compute(&q, &far));
    }

    #[test]
    fn parse_round_trip() {
        for d in [
            Distance::L1,
            Distance::L2,
            Distance::L2Squared,
            Distance::Cosine,
            Distance::InnerProduct,
        ] {
            assert_eq!(d.to_string().parse::<Distance>().unwrap(), d);
        }
    }
}
