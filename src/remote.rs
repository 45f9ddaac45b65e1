//! The remote API boundary.
//!
//! The embedding application implements [`RemoteApi`] with whatever HTTP
//! client it uses; this crate only consumes the trait. Tests implement it
//! with in-memory mocks.

use chrono::NaiveDate;
use thiserror::Error;

use crate::error::DataError;
use crate::models::{
    ConsumptionEntry, DailyStats, Goal, HistoryDay, NewConsumption, NewGoal, NewProduct, Product,
    UpdateConsumption, UpdateProduct,
};

/// Classification of a failed remote call.
///
/// `Network` is the only kind that triggers the local fallback path. The
/// split between terminal and retry-eligible kinds drives the reconciler's
/// stop-draining rule; see [`RemoteError::is_terminal_for_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Timeout, connection refused, DNS failure. The server was never
    /// reached; retrying later is sensible.
    Network,
    /// The entity does not exist on the server.
    NotFound,
    /// The server rejected the payload (validation or business rule).
    Validation,
    /// The server detected a conflicting state for the entity.
    Conflict,
    /// The session is not accepted by the server.
    Auth,
    /// Server-side failure (5xx). Transient from the client's perspective.
    Server,
    /// The server asked the client to back off.
    RateLimited,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    /// Whether the failure means the server never saw the request.
    #[must_use]
    pub fn is_network(&self) -> bool {
        self.kind == RemoteErrorKind::Network
    }

    /// Whether replaying further queued operations for the same entity is
    /// pointless: the entity no longer exists remotely or its state is
    /// invalid, so later operations would cascade nonsensically.
    #[must_use]
    pub fn is_terminal_for_entity(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::NotFound
                | RemoteErrorKind::Validation
                | RemoteErrorKind::Conflict
                | RemoteErrorKind::Auth
        )
    }
}

impl From<RemoteError> for DataError {
    fn from(e: RemoteError) -> Self {
        if e.is_network() {
            DataError::Network(e.message)
        } else {
            DataError::RemoteRejected(e.message)
        }
    }
}

/// Per-entity calls the remote server exposes.
///
/// Ids crossing this boundary are bare server ids; the tagged
/// [`EntityId`](crate::models::EntityId) scheme exists only on the client.
pub trait RemoteApi {
    // Products
    async fn products(&self, user_id: i64) -> Result<Vec<Product>, RemoteError>;
    async fn create_product(&self, user_id: i64, new: &NewProduct)
    -> Result<Product, RemoteError>;
    async fn update_product(
        &self,
        user_id: i64,
        id: i64,
        update: &UpdateProduct,
    ) -> Result<Product, RemoteError>;
    async fn delete_product(&self, user_id: i64, id: i64) -> Result<(), RemoteError>;

    // Consumption
    async fn create_consumption(
        &self,
        user_id: i64,
        product_id: i64,
        new: &NewConsumption,
    ) -> Result<ConsumptionEntry, RemoteError>;
    async fn update_consumption(
        &self,
        user_id: i64,
        id: i64,
        update: &UpdateConsumption,
    ) -> Result<ConsumptionEntry, RemoteError>;
    async fn delete_consumption(&self, user_id: i64, id: i64) -> Result<(), RemoteError>;
    async fn consumption_by_date(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<ConsumptionEntry>, RemoteError>;
    async fn daily_stats(&self, user_id: i64, date: NaiveDate) -> Result<DailyStats, RemoteError>;
    async fn history(&self, user_id: i64, days: u32) -> Result<Vec<HistoryDay>, RemoteError>;

    // Goals
    async fn goal(&self, user_id: i64) -> Result<Option<Goal>, RemoteError>;
    async fn upsert_goal(&self, user_id: i64, new: &NewGoal) -> Result<Goal, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        for kind in [
            RemoteErrorKind::NotFound,
            RemoteErrorKind::Validation,
            RemoteErrorKind::Conflict,
            RemoteErrorKind::Auth,
        ] {
            assert!(RemoteError::new(kind, "x").is_terminal_for_entity());
        }
        for kind in [
            RemoteErrorKind::Network,
            RemoteErrorKind::Server,
            RemoteErrorKind::RateLimited,
        ] {
            assert!(!RemoteError::new(kind, "x").is_terminal_for_entity());
        }
    }

    #[test]
    fn test_network_maps_to_data_error_network() {
        let err: DataError = RemoteError::network("timed out").into();
        assert!(matches!(err, DataError::Network(_)));

        let err: DataError = RemoteError::new(RemoteErrorKind::Validation, "bad name").into();
        assert!(matches!(err, DataError::RemoteRejected(_)));
    }
}
