//! Account registry
//!
//! In-memory index of every known account, backed by [`CredentialStore`].
//! The registry exclusively owns all [`AccountEntry`] and
//! [`CredentialRecord`] values; callers receive clones scoped to a single
//! operation.
//!
//! Two locks: `writer` serializes everything that writes the index, and
//! `state` guards the in-memory maps for short, non-suspending sections
//! only. A mutation snapshots the state, persists the changed copy while
//! holding just `writer`, and then applies the change in memory, so a failed
//! write leaves the previous state untouched, no reader ever sees two (or a
//! transient zero) default accounts, and reads never wait on disk I/O.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::errors::{AppError, AppResult};
use crate::store::{AccountEntry, CredentialRecord, CredentialStore};

#[derive(Debug, Clone, Default)]
struct RegistryState {
    /// Insertion ordered
    entries: Vec<AccountEntry>,
    credentials: HashMap<String, CredentialRecord>,
}

impl RegistryState {
    fn position(&self, email: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.email == email)
    }
}

/// Result of removing an account
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    /// Entry as it was before removal
    pub entry: AccountEntry,
    /// The account was the default; no default is configured now
    pub was_default: bool,
}

/// Registry of accounts and their credentials
#[derive(Debug)]
pub struct AccountRegistry {
    store: CredentialStore,
    state: Mutex<RegistryState>,
    /// Held across index writes so snapshots reach disk in order
    writer: Mutex<()>,
}

impl AccountRegistry {
    /// Load the registry from disk
    ///
    /// Entries whose credential is missing, corrupt or lacks a refresh token
    /// are dropped with a warning (the pair is unusable without re-consent).
    /// If several entries claim to be default, only the first keeps the
    /// flag. A repaired index is written back.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the data directory cannot be read or the
    /// repaired index cannot be written.
    pub async fn load(store: CredentialStore) -> AppResult<Self> {
        let stored_entries = match store.load_index().await {
            Ok(entries) => entries,
            Err(AppError::CorruptCredential(msg)) => {
                tracing::warn!(error = %msg, "account index is corrupt; starting with no accounts");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut state = RegistryState::default();
        let mut repaired = false;
        let mut seen_default = false;

        for mut entry in stored_entries {
            let email = normalize_email(&entry.email);
            if email != entry.email {
                entry.email = email.clone();
                repaired = true;
            }
            if state.position(&email).is_some() {
                repaired = true;
                continue;
            }

            let credential = match store.load(&email).await {
                Ok(Some(record)) if record.is_usable() => record,
                Ok(Some(_)) => {
                    tracing::warn!(account = %email, "credential has no refresh token; re-add the account");
                    repaired = true;
                    continue;
                }
                Ok(None) => {
                    tracing::warn!(account = %email, "credential file missing; re-add the account");
                    repaired = true;
                    continue;
                }
                Err(AppError::CorruptCredential(msg)) => {
                    tracing::warn!(account = %email, error = %msg, "credential is corrupt; re-add the account");
                    repaired = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if entry.is_default {
                if seen_default {
                    entry.is_default = false;
                    repaired = true;
                }
                seen_default = true;
            }

            state.credentials.insert(email, credential);
            state.entries.push(entry);
        }

        if repaired {
            store.save_index(&state.entries).await?;
        }

        tracing::debug!(accounts = state.entries.len(), dir = %store.root().display(), "account registry loaded");
        Ok(Self {
            store,
            state: Mutex::new(state),
            writer: Mutex::new(()),
        })
    }

    /// All accounts in insertion order
    pub async fn list(&self) -> Vec<AccountEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Whether `email` is registered
    pub async fn contains(&self, email: &str) -> bool {
        let email = normalize_email(email);
        self.state.lock().await.position(&email).is_some()
    }

    /// Entry for `email`
    pub async fn get(&self, email: &str) -> AppResult<AccountEntry> {
        let email = normalize_email(email);
        let state = self.state.lock().await;
        state
            .position(&email)
            .map(|idx| state.entries[idx].clone())
            .ok_or(AppError::UnknownAccount(email))
    }

    /// Register a new account
    ///
    /// The account becomes default when `mark_default` is `Some(true)` or it
    /// is the first account in the registry.
    ///
    /// # Errors
    ///
    /// - `DuplicateAccount` if the email is already registered
    /// - `InvalidInput` if the record has no refresh token
    /// - `Storage` if persisting fails (nothing is registered in that case)
    pub async fn add(
        &self,
        mut record: CredentialRecord,
        mark_default: Option<bool>,
    ) -> AppResult<AccountEntry> {
        let email = normalize_email(&record.account_email);
        if email.is_empty() {
            return Err(AppError::invalid("account email must not be empty"));
        }
        if !record.is_usable() {
            return Err(AppError::invalid(format!(
                "no refresh token was issued for '{email}'; revoke the app's access in the Google account and retry"
            )));
        }
        record.account_email = email.clone();

        let _writer = self.writer.lock().await;
        let mut entries = {
            let state = self.state.lock().await;
            if state.position(&email).is_some() {
                return Err(AppError::DuplicateAccount(email));
            }
            state.entries.clone()
        };

        let now = Utc::now();
        let make_default = mark_default.unwrap_or(false) || entries.is_empty();
        let entry = AccountEntry {
            email: email.clone(),
            added_at: now,
            last_used_at: now,
            is_default: make_default,
        };
        if make_default {
            clear_default(&mut entries);
        }
        entries.push(entry.clone());

        self.store.save(&record).await?;
        if let Err(e) = self.store.save_index(&entries).await {
            if let Err(cleanup) = self.store.delete(&email).await {
                tracing::warn!(account = %email, error = %cleanup, "failed to roll back credential file");
            }
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            if make_default {
                clear_default(&mut state.entries);
            }
            state.entries.push(entry.clone());
            state.credentials.insert(email.clone(), record);
        }
        tracing::info!(account = %email, is_default = make_default, "account added");
        Ok(entry)
    }

    /// Remove an account and its credential
    ///
    /// Removing the default account leaves no default; it is never
    /// reassigned implicitly.
    ///
    /// # Errors
    ///
    /// - `UnknownAccount` if the email is not registered
    /// - `Storage` if the index cannot be written (nothing is removed)
    pub async fn remove(&self, email: &str) -> AppResult<RemoveOutcome> {
        let email = normalize_email(email);
        let _writer = self.writer.lock().await;
        let (mut entries, idx) = {
            let state = self.state.lock().await;
            let idx = state
                .position(&email)
                .ok_or_else(|| AppError::UnknownAccount(email.clone()))?;
            (state.entries.clone(), idx)
        };
        let entry = entries.remove(idx);

        self.store.save_index(&entries).await?;
        {
            let mut state = self.state.lock().await;
            state.entries.retain(|e| e.email != email);
            state.credentials.remove(&email);
        }
        if let Err(e) = self.store.delete(&email).await {
            tracing::warn!(account = %email, error = %e, "account removed but credential file could not be deleted");
        }

        let was_default = entry.is_default;
        if was_default {
            tracing::warn!(account = %email, "removed the default account; no default is configured now");
        } else {
            tracing::info!(account = %email, "account removed");
        }
        Ok(RemoveOutcome { entry, was_default })
    }

    /// Make `email` the only default account
    ///
    /// # Errors
    ///
    /// - `UnknownAccount` if the email is not registered
    /// - `Storage` if the index cannot be written (previous default stays)
    pub async fn set_default(&self, email: &str) -> AppResult<AccountEntry> {
        let email = normalize_email(email);
        let _writer = self.writer.lock().await;
        let mut entries = {
            let state = self.state.lock().await;
            if state.position(&email).is_none() {
                return Err(AppError::UnknownAccount(email));
            }
            state.entries.clone()
        };
        mark_default(&mut entries, &email);

        self.store.save_index(&entries).await?;
        let mut state = self.state.lock().await;
        mark_default(&mut state.entries, &email);
        tracing::info!(account = %email, "default account changed");
        state
            .position(&email)
            .map(|idx| state.entries[idx].clone())
            .ok_or(AppError::UnknownAccount(email))
    }

    /// The configured default account
    pub async fn resolve_default(&self) -> AppResult<AccountEntry> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .find(|e| e.is_default)
            .cloned()
            .ok_or(AppError::NoDefault)
    }

    /// Record a successful operation
    ///
    /// Best effort: the in-memory timestamp always advances, persistence
    /// failures are only logged.
    pub async fn touch(&self, email: &str) {
        let email = normalize_email(email);
        let _writer = self.writer.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(idx) = state.position(&email) else {
                return;
            };
            state.entries[idx].last_used_at = Utc::now();
            state.entries.clone()
        };
        if let Err(e) = self.store.save_index(&snapshot).await {
            tracing::warn!(account = %email, error = %e, "failed to persist last-used timestamp");
        }
    }

    /// Snapshot of the credential for `email`
    pub async fn credential(&self, email: &str) -> AppResult<CredentialRecord> {
        let email = normalize_email(email);
        self.state
            .lock()
            .await
            .credentials
            .get(&email)
            .cloned()
            .ok_or(AppError::UnknownAccount(email))
    }

    /// Persist and install a refreshed credential
    ///
    /// # Errors
    ///
    /// - `UnknownAccount` if the account was removed meanwhile
    /// - `Storage` if the write fails (the previous credential stays)
    pub async fn update_credential(&self, record: CredentialRecord) -> AppResult<()> {
        let email = normalize_email(&record.account_email);
        if !self.contains(&email).await {
            return Err(AppError::UnknownAccount(email));
        }
        self.store.save(&record).await?;

        let mut state = self.state.lock().await;
        if state.position(&email).is_none() {
            drop(state);
            if let Err(e) = self.store.delete(&email).await {
                tracing::warn!(account = %email, error = %e, "failed to delete credential of a removed account");
            }
            return Err(AppError::UnknownAccount(email));
        }
        state.credentials.insert(email, record);
        Ok(())
    }
}

fn clear_default(entries: &mut [AccountEntry]) {
    for entry in entries {
        entry.is_default = false;
    }
}

fn mark_default(entries: &mut [AccountEntry], email: &str) {
    for entry in entries {
        entry.is_default = entry.email == email;
    }
}

/// Canonical account key
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
