use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DataError;

/// Identifier for a cached record.
///
/// Records created while offline get a `Local` placeholder id from the
/// store's persistent counter; once the create has been replayed against the
/// server the reconciler rewrites every reference to the server-assigned
/// `Remote` id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Local(i64),
    Remote(i64),
}

impl EntityId {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, EntityId::Local(_))
    }

    /// The server-assigned id, if this record has one.
    #[must_use]
    pub fn as_remote(self) -> Option<i64> {
        match self {
            EntityId::Remote(n) => Some(n),
            EntityId::Local(_) => None,
        }
    }

    /// Text encoding used as the primary key in the local store.
    #[must_use]
    pub fn key(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Local(n) => write!(f, "local:{n}"),
            EntityId::Remote(n) => write!(f, "remote:{n}"),
        }
    }
}

impl FromStr for EntityId {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |n: &str| {
            n.parse::<i64>()
                .map_err(|_| DataError::InvalidInput(format!("malformed entity id '{s}'")))
        };
        if let Some(n) = s.strip_prefix("local:") {
            Ok(EntityId::Local(parse(n)?))
        } else if let Some(n) = s.strip_prefix("remote:") {
            Ok(EntityId::Remote(parse(n)?))
        } else {
            Err(DataError::InvalidInput(format!(
                "malformed entity id '{s}'"
            )))
        }
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: EntityId,
    pub user_id: i64,
    pub name: String,
    pub calories: f64,
    pub protein: f64,
    pub fat: f64,
    pub carbs: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEntry {
    pub id: EntityId,
    pub user_id: i64,
    pub product_id: EntityId,
    pub amount: f64,
    pub created_at: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: EntityId,
    pub user_id: i64,
    pub daily_calories: f64,
    pub daily_protein: f64,
    pub daily_fat: f64,
    pub daily_carbs: f64,
    pub goal_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub calories: f64,
    pub protein: f64,
    pub fat: f64,
    pub carbs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub name: Option<String>,
    pub calories: Option<f64>,
    pub protein: Option<f64>,
    pub fat: Option<f64>,
    pub carbs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewConsumption {
    pub product_id: EntityId,
    pub amount: f64,
    /// Calendar day the entry is attributed to. Defaults to the local
    /// calendar day of `created_at` when not set.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConsumption {
    pub amount: Option<f64>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewGoal {
    pub daily_calories: f64,
    pub daily_protein: f64,
    pub daily_fat: f64,
    pub daily_carbs: f64,
    pub goal_type: String,
}

/// A locally cached record plus its sync bookkeeping.
///
/// `synced == false` means the record was created or mutated locally and the
/// server has not confirmed the write; it holds exactly while at least one
/// queued operation references the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<T> {
    pub record: T,
    pub synced: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Consumption,
    Goal,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Consumption => "consumption",
            EntityKind::Goal => "goal",
        }
    }
}

impl FromStr for EntityKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(EntityKind::Product),
            "consumption" => Ok(EntityKind::Consumption),
            "goal" => Ok(EntityKind::Goal),
            other => Err(DataError::InvalidInput(format!(
                "unknown entity kind '{other}'"
            ))),
        }
    }
}

impl FromStr for OperationKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(DataError::InvalidInput(format!(
                "unknown operation kind '{other}'"
            ))),
        }
    }
}

/// One pending mutation awaiting transmission to the server.
///
/// The queue is append-only except for removal after a successful replay;
/// the auto-increment `id` is the FIFO order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: i64,
    pub user_id: i64,
    pub kind: OperationKind,
    pub entity: EntityKind,
    pub entity_id: Option<EntityId>,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct NewSyncOperation {
    pub user_id: i64,
    pub kind: OperationKind,
    pub entity: EntityKind,
    pub entity_id: Option<EntityId>,
    pub payload: serde_json::Value,
}

// --- Derived aggregates ---

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MacroTotals {
    pub calories: f64,
    pub protein: f64,
    pub fat: f64,
    pub carbs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_calories: f64,
    pub total_protein: f64,
    pub total_fat: f64,
    pub total_carbs: f64,
    pub consumptions_count: i64,
}

/// One day of an N-day history, carrying its contributing entries for
/// drill-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDay {
    pub stats: DailyStats,
    pub entries: Vec<ConsumptionEntry>,
}

/// Macros contributed by consuming `amount` grams of a product whose values
/// are per 100 g.
#[must_use]
pub fn macro_contribution(product: &Product, amount: f64) -> MacroTotals {
    let factor = amount / 100.0;
    MacroTotals {
        calories: product.calories * factor,
        protein: product.protein * factor,
        fat: product.fat * factor,
        carbs: product.carbs * factor,
    }
}

/// Compute the per-day aggregate from consumption entries and their products.
///
/// This is the single implementation used for every locally computed
/// aggregate, so the offline path cannot drift from the remote one. Entries
/// whose product is missing from `products` (deleted locally while entries
/// still reference it) are counted in `consumptions_count` but contribute
/// zero macros.
#[must_use]
pub fn compute_daily_stats(
    date: NaiveDate,
    entries: &[ConsumptionEntry],
    products: &HashMap<EntityId, Product>,
) -> DailyStats {
    let mut totals = MacroTotals::default();
    let mut count = 0i64;
    for entry in entries.iter().filter(|e| e.date == date) {
        count += 1;
        if let Some(product) = products.get(&entry.product_id) {
            let c = macro_contribution(product, entry.amount);
            totals.calories += c.calories;
            totals.protein += c.protein;
            totals.fat += c.fat;
            totals.carbs += c.carbs;
        }
    }
    DailyStats {
        date,
        total_calories: totals.calories,
        total_protein: totals.protein,
        total_fat: totals.fat,
        total_carbs: totals.carbs,
        consumptions_count: count,
    }
}

// --- Validation ---

pub fn validate_product_data(name: &str, calories: f64, protein: f64, fat: f64, carbs: f64) -> Result<(), DataError> {
    if name.trim().is_empty() {
        return Err(DataError::InvalidInput(
            "Product name must not be empty".to_string(),
        ));
    }
    for (field, value) in [
        ("calories", calories),
        ("protein", protein),
        ("fat", fat),
        ("carbs", carbs),
    ] {
        if value < 0.0 {
            return Err(DataError::InvalidInput(format!(
                "{field} must not be negative"
            )));
        }
    }
    Ok(())
}

pub fn validate_amount(amount: f64) -> Result<(), DataError> {
    if amount <= 0.0 {
        return Err(DataError::InvalidInput(
            "amount must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_goal_data(goal: &NewGoal) -> Result<(), DataError> {
    if goal.goal_type.trim().is_empty() {
        return Err(DataError::InvalidInput(
            "goal_type must not be empty".to_string(),
        ));
    }
    for (field, value) in [
        ("daily_calories", goal.daily_calories),
        ("daily_protein", goal.daily_protein),
        ("daily_fat", goal.daily_fat),
        ("daily_carbs", goal.daily_carbs),
    ] {
        if value < 0.0 {
            return Err(DataError::InvalidInput(format!(
                "{field} must not be negative"
            )));
        }
    }
    Ok(())
}
