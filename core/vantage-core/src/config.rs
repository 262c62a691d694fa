//! Configuration options for the planner and the index implementations.
//!
//! Index configs round-trip through the string map persisted in the index
//! catalog record; every config validates its bounds on construction and on
//! decode.

use crate::error::{DbError, DbResult};
use crate::values::Distance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Planner options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Number of physical plans kept in the LRU plan cache.
    pub plan_cache_size: usize,
    /// Skip cache lookup and always replan.
    pub bypass_cache: bool,
    /// Store chosen plans in the cache by default.
    pub persist_plan: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            plan_cache_size: 128,
            bypass_cache: false,
            persist_plan: true,
        }
    }
}

/// Engine-wide options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub planner: PlannerConfig,
    /// Capacity of the transaction history ring buffer.
    pub transaction_history: Option<usize>,
}

fn parse_key<T: std::str::FromStr>(map: &BTreeMap<String, String>, key: &str) -> DbResult<T> {
    let raw = map
        .get(key)
        .ok_or_else(|| DbError::Validation(format!("missing index config key '{key}'")))?;
    raw.parse::<T>()
        .map_err(|_| DbError::Validation(format!("invalid index config value '{raw}' for '{key}'")))
}

fn parse_key_or<T: std::str::FromStr>(
    map: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> DbResult<T> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| {
            DbError::Validation(format!("invalid index config value '{raw}' for '{key}'"))
        }),
    }
}

/// VA-file index options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VafConfig {
    /// Number of cells per dimension; uniform across dimensions.
    pub marks_per_dimension: u32,
    /// Distance kernel the signatures are pruned under.
    pub distance: Distance,
}

impl VafConfig {
    pub const MIN_MARKS: u32 = 2;
    /// Signatures are one byte per dimension.
    pub const MAX_MARKS: u32 = 255;

    pub fn new(marks_per_dimension: u32, distance: Distance) -> DbResult<Self> {
        let config = Self {
            marks_per_dimension,
            distance,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if !(Self::MIN_MARKS..=Self::MAX_MARKS).contains(&self.marks_per_dimension) {
            return Err(DbError::Validation(format!(
                "marks_per_dimension must be in [{}, {}], got {}",
                Self::MIN_MARKS,
                Self::MAX_MARKS,
                self.marks_per_dimension
            )));
        }
        if !self.distance.is_minkowski() {
            return Err(DbError::Validation(format!(
                "VA-file pruning requires a Minkowski distance, got {}",
                self.distance
            )));
        }
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "marks_per_dimension".to_string(),
                self.marks_per_dimension.to_string(),
            ),
            ("distance".to_string(), self.distance.to_string()),
        ])
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> DbResult<Self> {
        Self::new(
            parse_key(map, "marks_per_dimension")?,
            parse_key_or(map, "distance", Distance::L2)?,
        )
    }
}

impl Default for VafConfig {
    fn default() -> Self {
        Self {
            marks_per_dimension: 16,
            distance: Distance::L2,
        }
    }
}

/// Product-quantization index options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqConfig {
    pub num_subspaces: u32,
    /// Codebook size per subspace; signatures store one signed byte per
    /// subspace, hence the 127 cap.
    pub num_centroids: u32,
    /// Target size of the sampled learning set.
    pub sample_size: u64,
    pub seed: i64,
    pub distance: Distance,
}

impl PqConfig {
    pub const MAX_CENTROIDS: u32 = 127;

    pub fn validate(&self) -> DbResult<()> {
        if self.num_subspaces < 1 {
            return Err(DbError::Validation(
                "num_subspaces must be at least 1".into(),
            ));
        }
        if !(1..=Self::MAX_CENTROIDS).contains(&self.num_centroids) {
            return Err(DbError::Validation(format!(
                "num_centroids must be in [1, {}], got {}",
                Self::MAX_CENTROIDS,
                self.num_centroids
            )));
        }
        if self.sample_size < u64::from(self.num_centroids) {
            return Err(DbError::Validation(
                "sample_size must be at least num_centroids".into(),
            ));
        }
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("num_subspaces".to_string(), self.num_subspaces.to_string()),
            ("num_centroids".to_string(), self.num_centroids.to_string()),
            ("sample_size".to_string(), self.sample_size.to_string()),
            ("seed".to_string(), self.seed.to_string()),
            ("distance".to_string(), self.distance.to_string()),
        ])
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> DbResult<Self> {
        let config = Self {
            num_subspaces: parse_key(map, "num_subspaces")?,
            num_centroids: parse_key(map, "num_centroids")?,
            sample_size: parse_key(map, "sample_size")?,
            seed: parse_key_or(map, "seed", 0)?,
            distance: parse_key_or(map, "distance", Distance::L2)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            num_subspaces: 8,
            num_centroids: 127,
            sample_size: 4096,
            seed: 0,
            distance: Distance::L2,
        }
    }
}

/// Grouping index options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GgConfig {
    pub num_groups: u32,
    pub seed: i64,
    pub distance: Distance,
}

impl GgConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.num_groups < 1 {
            return Err(DbError::Validation("num_groups must be at least 1".into()));
        }
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("num_groups".to_string(), self.num_groups.to_string()),
            ("seed".to_string(), self.seed.to_string()),
            ("distance".to_string(), self.distance.to_string()),
        ])
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> DbResult<Self> {
        let config = Self {
            num_groups: parse_key(map, "num_groups")?,
            seed: parse_key_or(map, "seed", 0)?,
            distance: parse_key_or(map, "distance", Distance::L2)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for GgConfig {
    fn default() -> Self {
        Self {
            num_groups: 100,
            seed: 0,
            distance: Distance::L2,
        }
    }
}

/// How super-bit LSH samples hyperplane components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LshSampling {
    Gaussian,
    Uniform,
}

impl std::str::FromStr for LshSampling {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GAUSSIAN" => Ok(LshSampling::Gaussian),
            "UNIFORM" => Ok(LshSampling::Uniform),
            other => Err(DbError::Validation(format!(
                "unknown sampling method '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for LshSampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LshSampling::Gaussian => write!(f, "GAUSSIAN"),
            LshSampling::Uniform => write!(f, "UNIFORM"),
        }
    }
}

/// Super-bit LSH index options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshConfig {
    pub stages: u32,
    pub buckets: u32,
    pub seed: i64,
    pub consider_imaginary: bool,
    pub sampling_method: LshSampling,
}

impl LshConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.stages < 1 {
            return Err(DbError::Validation("stages must be at least 1".into()));
        }
        if self.buckets < 2 {
            return Err(DbError::Validation("buckets must be at least 2".into()));
        }
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("stages".to_string(), self.stages.to_string()),
            ("buckets".to_string(), self.buckets.to_string()),
            ("seed".to_string(), self.seed.to_string()),
            (
                "consider_imaginary".to_string(),
                self.consider_imaginary.to_string(),
            ),
            (
                "sampling_method".to_string(),
                self.sampling_method.to_string(),
            ),
        ])
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> DbResult<Self> {
        let config = Self {
            stages: parse_key(map, "stages")?,
            buckets: parse_key(map, "buckets")?,
            seed: parse_key_or(map, "seed", 0)?,
            consider_imaginary: parse_key_or(map, "consider_imaginary", false)?,
            sampling_method: parse_key_or(map, "sampling_method", LshSampling::Gaussian)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            stages: 4,
            buckets: 32,
            seed: 0,
            consider_imaginary: false,
            sampling_method: LshSampling::Gaussian,
        }
    }
}
