//! Offline-first data layer for the nosh nutrition tracker.
//!
//! Feature code talks to a [`DataService`] that hides connectivity: reads
//! and writes go to the server when it is reachable and to a local SQLite
//! cache when it is not, with offline writes queued and later replayed by
//! the [`Reconciler`]. The embedding application supplies the two outward
//! faces, a [`RemoteApi`] implementation over its HTTP client and a
//! [`SessionProvider`] over its auth layer, and feeds platform
//! connectivity transitions into the [`NetworkMonitor`].

pub mod auth;
pub mod error;
pub mod models;
pub mod network;
pub mod remote;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testutil;

pub use auth::{SessionProvider, UserContext, resolve_user};
pub use error::DataError;
pub use models::{
    ConsumptionEntry, DailyStats, EntityId, Goal, HistoryDay, NewConsumption, NewGoal, NewProduct,
    Product, UpdateConsumption, UpdateProduct,
};
pub use network::NetworkMonitor;
pub use remote::{RemoteApi, RemoteError, RemoteErrorKind};
pub use service::DataService;
pub use store::{LocalStore, StoreEvent};
pub use sync::{Reconciler, SyncEvent, SyncReport};
