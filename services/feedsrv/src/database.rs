//! Persistence collaborator
//!
//! The engine records registrations, meals, plans, alerts and unparsable
//! traffic through [`FeederDatabase`]. [`InMemoryFeederDatabase`] is the
//! implementation shipped with the service and used by the tests.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{FeedSrvError, Result};
use crate::protocol::{DeviceIdentifier, MealPlan, QuantityValue};

/// Longest unknown-data kind label that is stored
const MAX_KIND_LEN: usize = 64;

/// Partial identification the feeders emit several times a week
const TRUNCATED_NOISE: &[u8] = &[0x9D, 0xA1, 0x14, 0x41, 0x4C];

/// Alert categories raised by feeders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Hopper ran empty while dispensing
    Empty,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Empty => "empty",
        }
    }
}

/// Who triggered a meal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MealOrigin {
    /// Button pressed on the device
    Manual,
    /// `feed_now` issued by the service
    Remote,
}

#[async_trait]
pub trait FeederDatabase: Send + Sync + 'static {
    /// Upsert the feeder with its source address; new feeders start at 5 g
    async fn register_feeder(&self, identifier: &DeviceIdentifier, ip: IpAddr) -> Result<()>;

    async fn record_meal(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
        origin: MealOrigin,
    ) -> Result<bool>;

    async fn remember_default_amount(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
    ) -> Result<bool>;

    /// Store a plan; `set_planning` awaits this before reporting success
    async fn record_planning(&self, identifier: &DeviceIdentifier, plan: &MealPlan) -> Result<()>;

    async fn log_alert(
        &self,
        identifier: &DeviceIdentifier,
        kind: AlertKind,
        data: serde_json::Value,
    ) -> Result<bool>;

    /// Keep traffic that could not be handled; returns `false` if skipped
    async fn log_unknown_data(&self, kind: &str, raw: &[u8], ip: Option<IpAddr>) -> Result<bool>;

    async fn fetch_last_responded(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Option<DateTime<Utc>>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeederRecord {
    pub identifier: DeviceIdentifier,
    pub default_amount: QuantityValue,
    pub last_responded: DateTime<Utc>,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealRecord {
    pub identifier: DeviceIdentifier,
    pub quantity: QuantityValue,
    pub origin: MealOrigin,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanningRecord {
    pub identifier: DeviceIdentifier,
    pub plan: MealPlan,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub identifier: DeviceIdentifier,
    pub kind: AlertKind,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownDataRecord {
    pub kind: String,
    pub data: Bytes,
    pub ip: Option<IpAddr>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    feeders: HashMap<DeviceIdentifier, FeederRecord>,
    meals: Vec<MealRecord>,
    plannings: Vec<PlanningRecord>,
    alerts: Vec<AlertRecord>,
    unknown_data: Vec<UnknownDataRecord>,
}

/// Process-local store
///
/// Meals, plans and alerts for an unregistered feeder are dropped, the way
/// a foreign-key insert would fail to match.
#[derive(Debug, Default)]
pub struct InMemoryFeederDatabase {
    tables: RwLock<Tables>,
}

impl InMemoryFeederDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feeder(&self, identifier: &DeviceIdentifier) -> Option<FeederRecord> {
        self.tables.read().feeders.get(identifier).cloned()
    }

    pub fn feeders(&self) -> Vec<FeederRecord> {
        self.tables.read().feeders.values().cloned().collect()
    }

    pub fn meals(&self) -> Vec<MealRecord> {
        self.tables.read().meals.clone()
    }

    pub fn plannings(&self) -> Vec<PlanningRecord> {
        self.tables.read().plannings.clone()
    }

    /// Most recent plan stored for `identifier`
    pub fn current_plan(&self, identifier: &DeviceIdentifier) -> Option<MealPlan> {
        self.tables
            .read()
            .plannings
            .iter()
            .rev()
            .find(|record| &record.identifier == identifier)
            .map(|record| record.plan.clone())
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.tables.read().alerts.clone()
    }

    pub fn unknown_data(&self) -> Vec<UnknownDataRecord> {
        self.tables.read().unknown_data.clone()
    }
}

#[async_trait]
impl FeederDatabase for InMemoryFeederDatabase {
    async fn register_feeder(&self, identifier: &DeviceIdentifier, ip: IpAddr) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.tables.write();
        tables
            .feeders
            .entry(identifier.clone())
            .and_modify(|record| {
                record.last_responded = now;
                record.ip = ip;
            })
            .or_insert_with(|| FeederRecord {
                identifier: identifier.clone(),
                default_amount: QuantityValue::DEFAULT,
                last_responded: now,
                ip,
            });
        Ok(())
    }

    async fn record_meal(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
        origin: MealOrigin,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        if !tables.feeders.contains_key(identifier) {
            return Ok(false);
        }
        tables.meals.push(MealRecord {
            identifier: identifier.clone(),
            quantity,
            origin,
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn remember_default_amount(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.feeders.get_mut(identifier) {
            Some(record) => {
                record.default_amount = quantity;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn record_planning(&self, identifier: &DeviceIdentifier, plan: &MealPlan) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.feeders.contains_key(identifier) {
            return Err(FeedSrvError::storage(format!(
                "Unknown feeder {}",
                identifier
            )));
        }
        tables.plannings.push(PlanningRecord {
            identifier: identifier.clone(),
            plan: plan.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn log_alert(
        &self,
        identifier: &DeviceIdentifier,
        kind: AlertKind,
        data: serde_json::Value,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        if !tables.feeders.contains_key(identifier) {
            return Ok(false);
        }
        tables.alerts.push(AlertRecord {
            identifier: identifier.clone(),
            kind,
            data,
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn log_unknown_data(&self, kind: &str, raw: &[u8], ip: Option<IpAddr>) -> Result<bool> {
        if raw == TRUNCATED_NOISE {
            return Ok(false);
        }
        let kind: String = kind.chars().take(MAX_KIND_LEN).collect();
        self.tables.write().unknown_data.push(UnknownDataRecord {
            kind,
            data: Bytes::copy_from_slice(raw),
            ip,
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn fetch_last_responded(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .tables
            .read()
            .feeders
            .get(identifier)
            .map(|record| record.last_responded))
    }
}
