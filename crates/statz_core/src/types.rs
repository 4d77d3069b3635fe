//! # Core Type Definitions
//!
//! The records that flow through the write-behind pipeline: who a statistic
//! belongs to ([`PlayerId`]), what it measures ([`StatKind`]), where it was
//! recorded ([`Dimensions`]) and what it is worth ([`StatValue`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StatzError;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a player.
///
/// Wraps a UUID so player ids cannot be confused with other identifiers
/// travelling through the same APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Statistic kinds
// ============================================================================

macro_rules! stat_kinds {
    ($($variant:ident => $name:literal, $table:literal;)+) => {
        /// Enumerated category of tracked player activity.
        ///
        /// Each kind maps to exactly one table in the row store and one
        /// entry in the [`SchemaRegistry`](crate::schema::SchemaRegistry).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum StatKind {
            $($variant,)+
        }

        impl StatKind {
            /// Every known kind, in declaration order.
            pub const ALL: &'static [StatKind] = &[$(StatKind::$variant,)+];

            /// Canonical upper-case name, as used in configuration and on the wire.
            pub fn name(&self) -> &'static str {
                match self {
                    $(StatKind::$variant => $name,)+
                }
            }

            /// Name of the backing table, without the store's prefix.
            pub fn table_name(&self) -> &'static str {
                match self {
                    $(StatKind::$variant => $table,)+
                }
            }
        }

        impl FromStr for StatKind {
            type Err = StatzError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($name => Ok(StatKind::$variant),)+
                    _ => Err(StatzError::invalid_kind(s)),
                }
            }
        }
    };
}

stat_kinds! {
    Players => "PLAYERS", "players";
    Deaths => "DEATHS", "number_of_deaths";
    Joins => "JOINS", "number_of_joins";
    ItemsCaught => "ITEMS_CAUGHT", "items_caught";
    BlocksPlaced => "BLOCKS_PLACED", "blocks_placed";
    BlocksBroken => "BLOCKS_BROKEN", "blocks_broken";
    KillsMobs => "KILLS_MOBS", "kills_mobs";
    KillsPlayers => "KILLS_PLAYERS", "kills_players";
    TimePlayed => "TIME_PLAYED", "time_played";
    FoodEaten => "FOOD_EATEN", "food_eaten";
    DamageTaken => "DAMAGE_TAKEN", "damage_taken";
    TimesShorn => "TIMES_SHORN", "times_shorn";
    DistanceTravelled => "DISTANCE_TRAVELLED", "distance_travelled";
    ItemsCrafted => "ITEMS_CRAFTED", "items_crafted";
    XpGained => "XP_GAINED", "xp_gained";
    Votes => "VOTES", "votes";
    ArrowsShot => "ARROWS_SHOT", "arrows_shot";
    EnteredBeds => "ENTERED_BEDS", "entered_beds";
    CommandsPerformed => "COMMANDS_PERFORMED", "commands_performed";
    TimesKicked => "TIMES_KICKED", "times_kicked";
    ToolsBroken => "TOOLS_BROKEN", "tools_broken";
    EggsThrown => "EGGS_THROWN", "eggs_thrown";
    WorldsChanged => "WORLDS_CHANGED", "worlds_changed";
    BucketsFilled => "BUCKETS_FILLED", "buckets_filled";
    BucketsEmptied => "BUCKETS_EMPTIED", "buckets_emptied";
    ItemsDropped => "ITEMS_DROPPED", "items_dropped";
    ItemsPickedUp => "ITEMS_PICKED_UP", "items_picked_up";
    Teleports => "TELEPORTS", "teleports";
    VillagerTrades => "VILLAGER_TRADES", "villager_trades";
    HighestAltitude => "HIGHEST_ALTITUDE", "highest_altitude";
    CurrentWorld => "CURRENT_WORLD", "current_world";
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Values and records
// ============================================================================

/// Named sub-keys distinguishing rows within a kind (world, moveType, ...).
///
/// Ordered so that two maps with the same pairs hash and compare equal
/// regardless of insertion order.
pub type Dimensions = BTreeMap<String, String>;

/// The value carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Number(f64),
    Text(String),
}

impl StatValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StatValue::Number(n) => Some(*n),
            StatValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatValue::Text(s) => Some(s),
            StatValue::Number(_) => None,
        }
    }

    pub(crate) fn value_type(&self) -> ValueType {
        match self {
            StatValue::Number(_) => ValueType::Number,
            StatValue::Text(_) => ValueType::Text,
        }
    }
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        StatValue::Number(value)
    }
}

impl From<i64> for StatValue {
    fn from(value: i64) -> Self {
        StatValue::Number(value as f64)
    }
}

impl From<&str> for StatValue {
    fn from(value: &str) -> Self {
        StatValue::Text(value.to_string())
    }
}

impl From<String> for StatValue {
    fn from(value: String) -> Self {
        StatValue::Text(value)
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Number(n) => write!(f, "{n}"),
            StatValue::Text(s) => f.write_str(s),
        }
    }
}

/// Declared type of a kind's value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Text,
}

/// Logical identity of a row: two updates with equal keys touch the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateKey {
    pub player_id: PlayerId,
    pub kind: StatKind,
    pub dimensions: Dimensions,
}

/// One persisted or pending statistic fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub player_id: PlayerId,
    pub kind: StatKind,
    #[serde(default)]
    pub dimensions: Dimensions,
    pub value: StatValue,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl StatRecord {
    pub fn new(
        player_id: PlayerId,
        kind: StatKind,
        dimensions: Dimensions,
        value: impl Into<StatValue>,
    ) -> Self {
        Self {
            player_id,
            kind,
            dimensions,
            value: value.into(),
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn key(&self) -> UpdateKey {
        UpdateKey {
            player_id: self.player_id,
            kind: self.kind,
            dimensions: self.dimensions.clone(),
        }
    }

    /// Looks up a dimension value by name.
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }
}

/// Builds a [`Dimensions`] map from name/value pairs.
pub fn dimensions<I, K, V>(pairs: I) -> Dimensions
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Current time in milliseconds since the Unix epoch.
pub fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
