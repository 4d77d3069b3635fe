//! Per-kind schema table.
//!
//! Every [`StatKind`] declares the dimension names its rows are keyed by,
//! the type of its value and how two updates for the same row combine.
//! The registry is looked up at runtime by the queue, the flush scheduler
//! and the row stores.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{StatzError, StatzResult};
use crate::types::{Dimensions, StatKind, StatValue, ValueType};

/// How a newer value combines with an older one for the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Additive counter.
    Sum,
    /// Keep the largest value seen.
    Max,
    /// Last write wins.
    Replace,
}

impl MergePolicy {
    /// Combines `older` with `newer`, in that order.
    pub fn merge(self, older: &StatValue, newer: StatValue) -> StatValue {
        match (self, older, newer) {
            (MergePolicy::Sum, StatValue::Number(a), StatValue::Number(b)) => {
                StatValue::Number(a + b)
            }
            (MergePolicy::Max, StatValue::Number(a), StatValue::Number(b)) => {
                StatValue::Number(a.max(b))
            }
            (MergePolicy::Max, StatValue::Text(a), StatValue::Text(b)) => {
                if *a >= b {
                    StatValue::Text(a.clone())
                } else {
                    StatValue::Text(b)
                }
            }
            // Replace, and any mix the schema check should have rejected.
            (_, _, newer) => newer,
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePolicy::Sum => "sum",
            MergePolicy::Max => "max",
            MergePolicy::Replace => "replace",
        };
        f.write_str(name)
    }
}

/// Schema of a single statistic kind.
#[derive(Debug, Clone, PartialEq)]
pub struct StatSchema {
    pub kind: StatKind,
    /// Declared dimension names, sorted.
    pub dimensions: Vec<&'static str>,
    pub value_type: ValueType,
    pub merge: MergePolicy,
    /// Disabled kinds accept updates but never record them.
    pub enabled: bool,
}

impl StatSchema {
    fn new(kind: StatKind, dims: &[&'static str], value_type: ValueType, merge: MergePolicy) -> Self {
        let mut dimensions = dims.to_vec();
        dimensions.sort_unstable();
        Self {
            kind,
            dimensions,
            value_type,
            merge,
            enabled: true,
        }
    }

    /// Checks an update's dimension names and value type.
    pub fn validate(&self, dims: &Dimensions, value: &StatValue) -> StatzResult<()> {
        if value.value_type() != self.value_type {
            return Err(StatzError::schema_violation(
                self.kind,
                format!("expected a {:?} value, got {value:?}", self.value_type),
            ));
        }

        let declared: HashSet<&str> = self.dimensions.iter().copied().collect();
        let given: HashSet<&str> = dims.keys().map(String::as_str).collect();
        if declared != given {
            let mut missing: Vec<_> = declared.difference(&given).copied().collect();
            let mut unknown: Vec<_> = given.difference(&declared).copied().collect();
            missing.sort_unstable();
            unknown.sort_unstable();
            return Err(StatzError::schema_violation(
                self.kind,
                format!("dimensions mismatch (missing: {missing:?}, unknown: {unknown:?})"),
            ));
        }

        Ok(())
    }
}

fn default_schema(kind: StatKind) -> StatSchema {
    use MergePolicy::*;
    use StatKind::*;
    use ValueType::*;

    match kind {
        Players => StatSchema::new(kind, &[], Text, Replace),
        Joins | Votes => StatSchema::new(kind, &[], Number, Sum),
        Deaths | TimePlayed | TimesShorn | XpGained | EnteredBeds | EggsThrown => {
            StatSchema::new(kind, &["world"], Number, Sum)
        }
        ItemsCaught => StatSchema::new(kind, &["caught", "world"], Number, Sum),
        BlocksPlaced | BlocksBroken => StatSchema::new(kind, &["block", "world"], Number, Sum),
        KillsMobs => StatSchema::new(kind, &["mob", "weapon", "world"], Number, Sum),
        KillsPlayers => StatSchema::new(kind, &["playerKilled", "world"], Number, Sum),
        FoodEaten => StatSchema::new(kind, &["foodEaten", "world"], Number, Sum),
        DamageTaken => StatSchema::new(kind, &["cause", "world"], Number, Sum),
        DistanceTravelled => StatSchema::new(kind, &["moveType", "world"], Number, Sum),
        ItemsCrafted | ToolsBroken | ItemsDropped | ItemsPickedUp => {
            StatSchema::new(kind, &["item", "world"], Number, Sum)
        }
        ArrowsShot => StatSchema::new(kind, &["forceShot", "world"], Number, Sum),
        CommandsPerformed => {
            StatSchema::new(kind, &["arguments", "command", "world"], Number, Sum)
        }
        TimesKicked => StatSchema::new(kind, &["reason", "world"], Number, Sum),
        WorldsChanged => StatSchema::new(kind, &["destWorld", "world"], Number, Sum),
        BucketsFilled | BucketsEmptied => {
            StatSchema::new(kind, &["bucketType", "world"], Number, Sum)
        }
        Teleports => StatSchema::new(kind, &["cause", "destWorld", "world"], Number, Sum),
        VillagerTrades => StatSchema::new(kind, &["trade", "world"], Number, Sum),
        HighestAltitude => StatSchema::new(kind, &["world"], Number, Max),
        CurrentWorld => StatSchema::new(kind, &[], Text, Replace),
    }
}

/// Runtime lookup table from kind to schema.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<StatKind, StatSchema>,
}

impl SchemaRegistry {
    /// Registry containing every built-in kind with its default schema.
    pub fn builtin() -> Self {
        let schemas = StatKind::ALL
            .iter()
            .map(|kind| (*kind, default_schema(*kind)))
            .collect();
        Self { schemas }
    }

    /// Registry restricted to the given kinds. Lookups for anything else
    /// fail with [`StatzError::InvalidStatisticKind`].
    pub fn with_kinds(kinds: &[StatKind]) -> Self {
        let schemas = kinds
            .iter()
            .map(|kind| (*kind, default_schema(*kind)))
            .collect();
        Self { schemas }
    }

    pub fn schema(&self, kind: StatKind) -> StatzResult<&StatSchema> {
        self.schemas
            .get(&kind)
            .ok_or_else(|| StatzError::invalid_kind(kind.name()))
    }

    /// Overrides the merge policy of a kind.
    ///
    /// Summing text values is rejected.
    pub fn set_merge_policy(&mut self, kind: StatKind, merge: MergePolicy) -> StatzResult<()> {
        let schema = self
            .schemas
            .get_mut(&kind)
            .ok_or_else(|| StatzError::invalid_kind(kind.name()))?;
        if merge == MergePolicy::Sum && schema.value_type == ValueType::Text {
            return Err(StatzError::config(format!(
                "merge policy 'sum' requires a numeric statistic, {kind} holds text"
            )));
        }
        schema.merge = merge;
        Ok(())
    }

    pub fn disable(&mut self, kind: StatKind) -> StatzResult<()> {
        let schema = self
            .schemas
            .get_mut(&kind)
            .ok_or_else(|| StatzError::invalid_kind(kind.name()))?;
        schema.enabled = false;
        Ok(())
    }

    pub fn disable_all(&mut self) {
        for schema in self.schemas.values_mut() {
            schema.enabled = false;
        }
    }

    /// Registered schemas, ordered by kind.
    pub fn schemas(&self) -> Vec<&StatSchema> {
        let mut all: Vec<_> = self.schemas.values().collect();
        all.sort_by_key(|s| s.kind);
        all
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::dimensions;

    #[test]
    fn test_merge_policies() {
        let older = StatValue::Number(5.0);
        assert_eq!(
            MergePolicy::Sum.merge(&older, StatValue::Number(3.0)),
            StatValue::Number(8.0)
        );
        assert_eq!(
            MergePolicy::Max.merge(&older, StatValue::Number(3.0)),
            StatValue::Number(5.0)
        );
        assert_eq!(
            MergePolicy::Replace.merge(&older, StatValue::Number(3.0)),
            StatValue::Number(3.0)
        );
    }

    #[test]
    fn test_every_kind_has_a_schema() {
        let registry = SchemaRegistry::builtin();
        for kind in StatKind::ALL {
            let schema = registry.schema(*kind).unwrap();
            assert_eq!(schema.kind, *kind);
        }
    }

    #[test]
    fn test_validate_accepts_declared_dimensions() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(StatKind::DistanceTravelled).unwrap();
        let dims = dimensions([("world", "world"), ("moveType", "WALK")]);
        assert!(schema.validate(&dims, &StatValue::Number(1.0)).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_dimension() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(StatKind::DistanceTravelled).unwrap();
        let dims = dimensions([("world", "world")]);
        let err = schema.validate(&dims, &StatValue::Number(1.0)).unwrap_err();
        assert!(err.to_string().contains("moveType"));
    }

    #[test]
    fn test_validate_rejects_wrong_value_type() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(StatKind::CurrentWorld).unwrap();
        let err = schema
            .validate(&Dimensions::new(), &StatValue::Number(1.0))
            .unwrap_err();
        assert!(matches!(err, StatzError::SchemaViolation { .. }));
    }

    #[test]
    fn test_restricted_registry_rejects_unknown_kind() {
        let registry = SchemaRegistry::with_kinds(&[StatKind::Deaths]);
        assert!(registry.schema(StatKind::Deaths).is_ok());
        assert!(matches!(
            registry.schema(StatKind::Votes),
            Err(StatzError::InvalidStatisticKind { .. })
        ));
    }

    #[test]
    fn test_sum_override_on_text_kind_rejected() {
        let mut registry = SchemaRegistry::builtin();
        assert!(registry
            .set_merge_policy(StatKind::CurrentWorld, MergePolicy::Sum)
            .is_err());
        registry
            .set_merge_policy(StatKind::Deaths, MergePolicy::Max)
            .unwrap();
        assert_eq!(
            registry.schema(StatKind::Deaths).unwrap().merge,
            MergePolicy::Max
        );
    }
}
