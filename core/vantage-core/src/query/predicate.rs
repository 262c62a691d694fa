//! Predicates: atomic comparisons, boolean combinations, and k-NN.

use crate::catalog::{ColumnDef, ColumnName};
use crate::error::{DbError, DbResult};
use crate::query::Record;
use crate::values::{Distance, Type, Value};
use std::fmt;

/// Operator of an atomic comparison predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equal,
    In,
    Like,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    IsNull,
}

/// Atomic predicate: `column <op> values`, optionally negated.
#[derive(Debug, Clone, PartialEq, Hash)]
pub struct ComparisonPredicate {
    pub column: ColumnName,
    pub operator: ComparisonOperator,
    pub values: Vec<Value>,
    pub negated: bool,
}

impl ComparisonPredicate {
    pub fn equal(column: ColumnName, value: Value) -> Self {
        Self {
            column,
            operator: ComparisonOperator::Equal,
            values: vec![value],
            negated: false,
        }
    }

    pub fn within(column: ColumnName, values: Vec<Value>) -> Self {
        Self {
            column,
            operator: ComparisonOperator::In,
            values,
            negated: false,
        }
    }

    pub fn like(column: ColumnName, pattern: &str) -> Self {
        Self {
            column,
            operator: ComparisonOperator::Like,
            values: vec![Value::String(pattern.to_string())],
            negated: false,
        }
    }

    /// The fixed prefix of a `LIKE 'prefix%'` pattern, when the pattern has
    /// that shape (a literal prefix followed by a single trailing `%`).
    pub fn like_prefix(&self) -> Option<String> {
        if self.operator != ComparisonOperator::Like {
            return None;
        }
        let Some(Value::String(pattern)) = self.values.first() else {
            return None;
        };
        let prefix = pattern.strip_suffix('%')?;
        if prefix.contains(['%', '_']) {
            return None;
        }
        Some(prefix.to_string())
    }

    fn evaluate(&self, value: Option<&Value>) -> DbResult<bool> {
        let result = match self.operator {
            ComparisonOperator::IsNull => value.is_none(),
            _ => match value {
                None => false,
                Some(value) => match self.operator {
                    ComparisonOperator::Equal => self.values.first() == Some(value),
                    ComparisonOperator::In => self.values.contains(value),
                    ComparisonOperator::Like => {
                        let (Value::String(actual), Some(Value::String(pattern))) =
                            (value, self.values.first())
                        else {
                            return Err(DbError::Bind(format!(
                                "LIKE on non-string column {}",
                                self.column
                            )));
                        };
                        like_match(pattern, actual)
                    }
                    ComparisonOperator::Less
                    | ComparisonOperator::LessEqual
                    | ComparisonOperator::Greater
                    | ComparisonOperator::GreaterEqual => {
                        let Some(bound) = self.values.first() else {
                            return Err(DbError::Bind("comparison without operand".into()));
                        };
                        let Some(ordering) = value.compare(bound) else {
                            return Err(DbError::Bind(format!(
                                "cannot order {} against {}",
                                value.type_of(),
                                bound.type_of()
                            )));
                        };
                        match self.operator {
                            ComparisonOperator::Less => ordering.is_lt(),
                            ComparisonOperator::LessEqual => ordering.is_le(),
                            ComparisonOperator::Greater => ordering.is_gt(),
                            ComparisonOperator::GreaterEqual => ordering.is_ge(),
                            _ => unreachable!(),
                        }
                    }
                    ComparisonOperator::IsNull => unreachable!(),
                },
            },
        };
        Ok(result != self.negated)
    }
}

/// Connective of a compound predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BooleanOperator {
    And,
    Or,
}

/// k-nearest-neighbour predicate over a vector column.
#[derive(Debug, Clone, PartialEq, Hash)]
pub struct KnnPredicate {
    pub column: ColumnName,
    pub query: Value,
    pub k: usize,
    pub distance: Distance,
}

impl KnnPredicate {
    /// The synthetic column k-NN scans emit alongside the indexed column.
    pub fn distance_column(&self) -> ColumnDef {
        ColumnDef::new(
            self.column.entity_name().column("distance"),
            Type::Double,
            false,
            false,
        )
    }
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum Predicate {
    Comparison(ComparisonPredicate),
    Boolean {
        op: BooleanOperator,
        operands: Vec<Predicate>,
    },
    Not(Box<Predicate>),
    Knn(KnnPredicate),
}

impl Predicate {
    /// Evaluate against a record. k-NN predicates are not boolean and must
    /// be handled by a scan operator instead.
    pub fn matches(&self, record: &Record) -> DbResult<bool> {
        match self {
            Predicate::Comparison(cmp) => {
                if record.position(&cmp.column).is_none() {
                    return Err(DbError::Bind(format!(
                        "record does not carry column {}",
                        cmp.column
                    )));
                }
                cmp.evaluate(record.value(&cmp.column))
            }
            Predicate::Boolean { op, operands } => {
                for operand in operands {
                    let hit = operand.matches(record)?;
                    match op {
                        BooleanOperator::And if !hit => return Ok(false),
                        BooleanOperator::Or if hit => return Ok(true),
                        _ => {}
                    }
                }
                Ok(*op == BooleanOperator::And)
            }
            Predicate::Not(inner) => Ok(!inner.matches(record)?),
            Predicate::Knn(knn) => Err(DbError::UnsupportedPredicate(format!(
                "k-NN over {} is not a boolean predicate",
                knn.column
            ))),
        }
    }

    /// Columns this predicate reads.
    pub fn columns(&self) -> Vec<ColumnName> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.dedup();
        out
    }

    fn collect_columns(&self, out: &mut Vec<ColumnName>) {
        match self {
            Predicate::Comparison(cmp) => out.push(cmp.column.clone()),
            Predicate::Boolean { operands, .. } => {
                for operand in operands {
                    operand.collect_columns(out);
                }
            }
            Predicate::Not(inner) => inner.collect_columns(out),
            Predicate::Knn(knn) => out.push(knn.column.clone()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Comparison(cmp) => {
                write!(f, "{} {:?} [{} operands]", cmp.column, cmp.operator, cmp.values.len())
            }
            Predicate::Boolean { op, operands } => write!(f, "{op:?}({} operands)", operands.len()),
            Predicate::Not(inner) => write!(f, "NOT {inner}"),
            Predicate::Knn(knn) => write!(f, "KNN({}, k={})", knn.column, knn.k),
        }
    }
}

/// SQL-style wildcard match: `%` matches any run, `_` a single character.
fn like_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    // Iterative matcher with backtracking over the last `%`.
    let (mut p, mut v) = (0usize, 0usize);
    let (mut star, mut star_v) = (None::<usize>, 0usize);
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some(p);
            star_v = v;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_v += 1;
            v = star_v;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Name;
    use std::sync::Arc;

    fn record(value: Option<Value>) -> Record {
        let defs: Arc<[ColumnDef]> = vec![ColumnDef::new(
            Name::column("s", "e", "name"),
            Type::String,
            true,
            false,
        )]
        .into();
        Record::new(1, defs, vec![value])
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("alp%", "alpha"));
        assert!(like_match("alp%", "alp"));
        assert!(!like_match("alp%", "beta"));
        assert!(like_match("a_p%a", "alpha"));
        assert!(like_match("%pha", "alpha"));
        assert!(!like_match("%phx", "alpha"));
    }

    #[test]
    fn like_prefix_extraction() {
        let p = ComparisonPredicate::like(Name::column("s", "e", "name"), "alp%");
        assert_eq!(p.like_prefix(), Some("alp".to_string()));
        let p = ComparisonPredicate::like(Name::column("s", "e", "name"), "a%b");
        assert_eq!(p.like_prefix(), None);
        let p = ComparisonPredicate::like(Name::column("s", "e", "name"), "a_%");
        assert_eq!(p.like_prefix(), None);
    }

    #[test]
    fn equal_and_negation() {
        let p = Predicate::Comparison(ComparisonPredicate::equal(
            Name::column("s", "e", "name"),
            Value::String("x".into()),
        ));
        assert!(p.matches(&record(Some(Value::String("x".into())))).unwrap());
        assert!(!p.matches(&record(Some(Value::String("y".into())))).unwrap());
        assert!(!p.matches(&record(None)).unwrap());
        assert!(!Predicate::Not(Box::new(p.clone()))
            .matches(&record(Some(Value::String("x".into()))))
            .unwrap());
    }

    #[test]
    fn boolean_combinations() {
        let eq_x = Predicate::Comparison(ComparisonPredicate::equal(
            Name::column("s", "e", "name"),
            Value::String("x".into()),
        ));
        let is_null = Predicate::Comparison(ComparisonPredicate {
            column: Name::column("s", "e", "name"),
            operator: ComparisonOperator::IsNull,
            values: vec![],
            negated: false,
        });
        let or = Predicate::Boolean {
            op: BooleanOperator::Or,
            operands: vec![eq_x.clone(), is_null.clone()],
        };
        assert!(or.matches(&record(None)).unwrap());
        let and = Predicate::Boolean {
            op: BooleanOperator::And,
            operands: vec![eq_x, is_null],
        };
        assert!(!and.matches(&record(None)).unwrap());
    }

    #[test]
    fn knn_is_not_boolean() {
        let knn = Predicate::Knn(KnnPredicate {
            column: Name::column("s", "e", "v"),
            query: Value::FloatVec(vec![0.0]),
            k: 1,
            distance: Distance::L2,
        });
        assert!(matches!(
            knn.matches(&record(None)),
            Err(DbError::UnsupportedPredicate(_))
        ));
    }
}
