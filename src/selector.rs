//! Account selection
//!
//! Resolves which registered account a tool call acts on. Resolution never
//! guesses: an explicit argument wins, otherwise the configured default is
//! used, otherwise the call fails.

use crate::errors::{AppError, AppResult};
use crate::registry::AccountRegistry;

/// Resolve the account email for a call
///
/// A blank `explicit` value counts as absent.
///
/// # Errors
///
/// - `UnknownAccount` if `explicit` names an unregistered account (the
///   default is never substituted)
/// - `NoAccountSpecified` if no account was named and no default exists
pub async fn select(registry: &AccountRegistry, explicit: Option<&str>) -> AppResult<String> {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(email) => registry.get(email).await.map(|entry| entry.email),
        None => match registry.resolve_default().await {
            Ok(entry) => Ok(entry.email),
            Err(AppError::NoDefault) => Err(AppError::NoAccountSpecified),
            Err(e) => Err(e),
        },
    }
}
