//! The authoritative in-process store.
//!
//! One `Store` owns the whole persisted state behind a global mutex, the
//! per-slot lock map, the volatile live-telemetry view, and the login
//! session table. Public operations take locks and delegate to `_locked`
//! helpers that assume the state lock is held; nothing writes state outside
//! that lock.
//!
//! Locking protocol: per-slot locks (canonical order) first, then the state
//! lock. The live view has its own independent mutex. Saves happen inside
//! the state lock; a failed save surfaces `internal` to the caller while the
//! in-memory state stays authoritative and the next successful save captures a
//! consistent superset.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::auth::{self, SessionTable};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::locks::SlotLockMap;
use crate::model::{Role, SlotRef, State, User, reserved_key};
use crate::{logger, snapshot};

/// Latest monitoring snapshot; always describes the current wall-clock hour.
#[derive(Debug, Default, Clone)]
pub struct LiveUsage {
    pub usage: BTreeMap<u32, Vec<String>>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct Store {
    pub(crate) cfg: AppConfig,
    pub(crate) state: Mutex<State>,
    pub(crate) slot_locks: SlotLockMap,
    pub(crate) live: Mutex<LiveUsage>,
    pub(crate) sessions: SessionTable,
}

/// Returned by a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: String,
    pub username: String,
    pub role: Role,
}

impl Store {
    /// Load (or initialize) the store from the configured snapshot path.
    pub fn open(cfg: AppConfig) -> anyhow::Result<Self> {
        let mut state = if cfg.state_path.exists() {
            snapshot::load(&cfg.state_path)?
        } else {
            info!(path = %cfg.state_path.display(), "no state file; starting fresh");
            State::default()
        };

        if cfg.force_reset {
            warn!(
                days = state.days.len(),
                "FORCE_RESET set; wiping days and sample histograms"
            );
            state.days.clear();
            state.gpu_usage_tracking.clear();
        }

        let sessions = SessionTable::new(cfg.session_ttl_hours);
        Ok(Self {
            cfg,
            state: Mutex::new(state),
            slot_locks: SlotLockMap::new(),
            live: Mutex::new(LiveUsage::default()),
            sessions,
        })
    }

    /// Run a read-only projection under the state lock.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.state.lock())
    }

    /// Whether any account exists yet (gates [`Store::bootstrap_admin`]).
    pub fn has_users(&self) -> bool {
        !self.state.lock().users.is_empty()
    }

    /// Persist the current state. Assumes the state lock is held by the
    /// caller; failures leave memory authoritative.
    pub(crate) fn save_locked(&self, state: &State) -> Result<(), ApiError> {
        logger::warn_if_slow("state_save", StdDuration::from_millis(250), || {
            snapshot::save(&self.cfg.state_path, state)
        })
        .map_err(|e| {
            tracing::error!(error = ?e, "state save failed; memory remains authoritative");
            ApiError::internal("failed to persist state")
        })
    }

    /// Persist outside of any mutation (shutdown, periodic flush).
    pub fn flush(&self) -> Result<(), ApiError> {
        let state = self.state.lock();
        self.save_locked(&state)
    }

    // =========================
    // Authentication
    // =========================

    /// Verify credentials and issue a session token.
    #[instrument(skip(self, password), target = "auth", fields(username))]
    pub fn login(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<LoginGrant, ApiError> {
        let role = {
            let mut state = self.state.lock();
            let user = state.user(username).ok_or(ApiError::AuthInvalid)?;
            if !user.enabled {
                return Err(ApiError::AuthInvalid);
            }
            if !auth::verify_password(password, &user.password_salt, &user.password_hash) {
                return Err(ApiError::AuthInvalid);
            }
            let role = user.role;

            if let Some(user) = state.user_mut(username) {
                user.last_login = Some(now);
            }
            self.save_locked(&state)?;
            role
        };

        let token = self.sessions.create(username, now);
        info!(username, "login succeeded");
        Ok(LoginGrant {
            token,
            username: username.to_string(),
            role,
        })
    }

    /// Resolve a session token to an enabled user, renewing the TTL.
    pub fn authenticate(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, ApiError> {
        let token = token.ok_or(ApiError::AuthRequired)?;
        let username = self
            .sessions
            .validate(token, now)
            .ok_or(ApiError::AuthInvalid)?;

        let state = self.state.lock();
        match state.user(&username) {
            Some(u) if u.enabled => Ok(username),
            _ => Err(ApiError::AuthInvalid),
        }
    }

    /// Like [`authenticate`], but additionally requires the admin role.
    pub fn authenticate_admin(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, ApiError> {
        let username = self.authenticate(token, now)?;
        let state = self.state.lock();
        Self::require_admin(&state, &username)?;
        Ok(username)
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions.revoke(token)
    }

    // =========================
    // Admin mutations (the external admin endpoints delegate here)
    // =========================

    /// Create the very first admin account. Only permitted while the user
    /// table is empty; afterwards all user management is admin-authenticated.
    #[instrument(skip(self, password), target = "admin")]
    pub fn bootstrap_admin(&self, username: &str, password: &str) -> Result<(), ApiError> {
        if username.is_empty() {
            return Err(ApiError::bad_request("username must not be empty"));
        }
        let mut state = self.state.lock();
        if !state.users.is_empty() {
            return Err(ApiError::Forbidden);
        }
        let salt = auth::generate_salt();
        let hash = auth::hash_password(password, &salt)?;
        state.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_salt: salt,
                password_hash: hash,
                role: Role::Admin,
                daily_budget: 0,
                balance: 0.0,
                enabled: true,
                last_login: None,
                outbid_notifications: Vec::new(),
            },
        );
        self.save_locked(&state)?;
        info!(username, "bootstrap admin created");
        Ok(())
    }

    pub(crate) fn require_admin(state: &State, actor: &str) -> Result<(), ApiError> {
        match state.user(actor) {
            Some(u) if u.is_admin() && u.enabled => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }

    #[instrument(skip(self, password), target = "admin", fields(actor, username))]
    pub fn create_user(
        &self,
        actor: &str,
        username: &str,
        password: &str,
        role: Role,
        daily_budget: u64,
        starting_balance: f64,
    ) -> Result<(), ApiError> {
        if username.is_empty() {
            return Err(ApiError::bad_request("username must not be empty"));
        }
        if !starting_balance.is_finite() || starting_balance < 0.0 {
            return Err(ApiError::bad_request("balance must be a non-negative number"));
        }

        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        if state.users.contains_key(username) {
            return Err(ApiError::bad_request("username already exists"));
        }

        let salt = auth::generate_salt();
        let hash = auth::hash_password(password, &salt)?;
        state.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_salt: salt,
                password_hash: hash,
                role,
                daily_budget,
                balance: starting_balance,
                enabled: true,
                last_login: None,
                outbid_notifications: Vec::new(),
            },
        );
        self.save_locked(&state)?;
        info!(username, ?role, "user created");
        Ok(())
    }

    /// Soft delete / restore. Users are never removed outright.
    #[instrument(skip(self), target = "admin")]
    pub fn set_user_enabled(
        &self,
        actor: &str,
        username: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        let user = state
            .user_mut(username)
            .ok_or_else(|| ApiError::not_found("user"))?;
        user.enabled = enabled;
        self.save_locked(&state)
    }

    #[instrument(skip(self), target = "admin")]
    pub fn set_daily_budget(
        &self,
        actor: &str,
        username: &str,
        daily_budget: u64,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        let user = state
            .user_mut(username)
            .ok_or_else(|| ApiError::not_found("user"))?;
        user.daily_budget = daily_budget;
        self.save_locked(&state)
    }

    #[instrument(skip(self), target = "admin")]
    pub fn set_balance(&self, actor: &str, username: &str, balance: f64) -> Result<(), ApiError> {
        if !balance.is_finite() || balance < 0.0 {
            return Err(ApiError::bad_request("balance must be a non-negative number"));
        }
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        let user = state
            .user_mut(username)
            .ok_or_else(|| ApiError::not_found("user"))?;
        user.balance = balance;
        self.save_locked(&state)
    }

    #[instrument(skip(self, new_password), target = "admin")]
    pub fn set_password(
        &self,
        actor: &str,
        username: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        let salt = auth::generate_salt();
        let hash = auth::hash_password(new_password, &salt)?;
        let user = state
            .user_mut(username)
            .ok_or_else(|| ApiError::not_found("user"))?;
        user.password_salt = salt;
        user.password_hash = hash;
        self.save_locked(&state)
    }

    /// Forbid (or re-allow) bidding on one entry.
    #[instrument(skip(self), target = "admin", fields(entry = %target))]
    pub fn set_reserved(
        &self,
        actor: &str,
        target: &SlotRef,
        reserved: bool,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;

        let key = reserved_key(&target.slot, target.gpu);
        if reserved {
            state
                .policy
                .reserved_slots
                .entry(target.day.clone())
                .or_default()
                .insert(key);
        } else if let Some(set) = state.policy.reserved_slots.get_mut(&target.day) {
            set.remove(&key);
            if set.is_empty() {
                state.policy.reserved_slots.remove(&target.day);
            }
        }
        self.save_locked(&state)
    }

    #[instrument(skip(self), target = "admin")]
    pub fn set_transition_hour(&self, actor: &str, hour: u8) -> Result<(), ApiError> {
        if hour > 23 {
            return Err(ApiError::bad_request("transition hour must be in [0, 23]"));
        }
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        let old = state.config.transition_hour;
        state.config.transition_hour = hour;
        self.save_locked(&state)?;
        info!(old, new = hour, "transition hour changed; regrouping applies to new days only");
        Ok(())
    }

    #[instrument(skip(self), target = "admin")]
    pub fn set_hourly_gpu_cap(&self, actor: &str, cap: Option<u32>) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;
        // Stored for forward compatibility; bid admission does not consult it.
        state.policy.hourly_gpu_cap = cap;
        self.save_locked(&state)
    }

    /// Explicit admin cleanup: drop final days strictly older than `before`.
    #[instrument(skip(self), target = "admin")]
    pub fn prune_history(&self, actor: &str, before: &str) -> Result<usize, ApiError> {
        let mut state = self.state.lock();
        Self::require_admin(&state, actor)?;

        let doomed: Vec<String> = state
            .days
            .iter()
            .filter(|(k, d)| {
                k.as_str() < before && d.status == crate::model::DayStatus::Final
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.days.remove(key);
            state.gpu_usage_tracking.remove(key);
        }
        if !doomed.is_empty() {
            self.save_locked(&state)?;
            info!(removed = doomed.len(), before, "pruned final days");
        }
        Ok(doomed.len())
    }
}
