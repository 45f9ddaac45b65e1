//! User-id resolution.
//!
//! The authentication collaborator is consumed as an opaque "current user
//! id". Every data-service call takes an explicit [`UserContext`] resolved
//! up front, session-first with a durable cached-id fallback. A returning
//! user with no connectivity and no live session must still be able to read
//! and write their cached data.

use tracing::debug;

use crate::error::DataError;
use crate::store::LocalStore;

pub const CACHED_USER_ID_KEY: &str = "cached_user_id";

/// The session boundary. The embedding application implements this over its
/// auth layer; tests implement it with fixed values.
pub trait SessionProvider {
    /// The id of the live session, if one exists.
    fn current_user_id(&self) -> Option<i64>;
}

/// The resolved identity threaded into every data-service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
}

impl UserContext {
    #[must_use]
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}

/// Resolve the current user: a live session wins and refreshes the cached
/// copy; otherwise fall back to the id cached by a prior session; with
/// neither, fail `Unauthenticated`.
pub fn resolve_user(
    session: &dyn SessionProvider,
    store: &LocalStore,
) -> Result<UserContext, DataError> {
    if let Some(user_id) = session.current_user_id() {
        store.set_setting(CACHED_USER_ID_KEY, &user_id.to_string())?;
        return Ok(UserContext::new(user_id));
    }

    match store.get_setting(CACHED_USER_ID_KEY)? {
        Some(cached) => {
            let user_id = cached.parse::<i64>().map_err(|_| {
                DataError::StorageUnavailable(format!("corrupt cached user id '{cached}'"))
            })?;
            debug!(user_id, "no live session, using cached user id");
            Ok(UserContext::new(user_id))
        }
        None => Err(DataError::Unauthenticated),
    }
}
