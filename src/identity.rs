//! Identity pool: reusable credentials with per-identity daily quota.
//!
//! Identities are loaded from the database at startup and mutated
//! write-through: `mark_used` and `mark_exhausted` persist immediately.
//! One caveat: a crash between the in-memory `daily_used` increment and the
//! persist under-counts usage for that day. Quota accounting is not
//! exactly-once across crashes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::Database;

/// Lifecycle status of an identity. Identities are never deleted, only
/// status-transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Cooldown,
    NoCredits,
    Banned,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::NoCredits => "no_credits",
            Self::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cooldown" => Self::Cooldown,
            "no_credits" => Self::NoCredits,
            "banned" => Self::Banned,
            _ => Self::Active,
        }
    }
}

/// A reusable credential/quota unit consumed by one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Unique address-like handle (doubles as the confirmation target).
    pub handle: String,
    pub secret: String,
    pub daily_used: u32,
    pub last_used_date: Option<NaiveDate>,
    pub status: IdentityStatus,
    /// Opaque reference to this identity's session configuration. The pool
    /// only stores and attaches it; the collaborator interprets it.
    pub config_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Connection parameters for the shared confirmation mailbox, stored
/// alongside the identity records.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretString,
    /// Catch-all domain the identity handles live under.
    pub domain: String,
}

/// Pool statistics, computed against today's quota.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    pub total: usize,
    pub active: usize,
    /// Remaining uses across all active identities today.
    pub available_today: u32,
    /// Uses already consumed today.
    pub used_today: u32,
}

struct PoolInner {
    identities: Vec<Identity>,
    in_use: HashSet<String>,
}

/// Thread-safe pool of identities with daily quota enforcement.
///
/// All scanning and in-use bookkeeping happens under a single mutex; the
/// raw collection is never exposed.
pub struct IdentityPool {
    db: Arc<dyn Database>,
    daily_limit: u32,
    inner: Mutex<PoolInner>,
}

impl IdentityPool {
    /// Load all identity records from the database.
    pub async fn load(db: Arc<dyn Database>, daily_limit: u32) -> Result<Self, DatabaseError> {
        let identities = db.list_identities().await?;
        info!(count = identities.len(), "Identity pool loaded");
        Ok(Self {
            db,
            daily_limit,
            inner: Mutex::new(PoolInner {
                identities,
                in_use: HashSet::new(),
            }),
        })
    }

    /// Acquire an identity with remaining quota today, excluding any handle
    /// in `excluding`, any identity already in use, and any non-active one.
    ///
    /// `None` means no capacity right now, the normal "come back later"
    /// signal, not an error. The daily counter is lazily reset the first
    /// time an identity is observed on a new date.
    pub async fn acquire(&self, excluding: &HashSet<String>) -> Option<Identity> {
        let today = Utc::now().date_naive();
        let mut inner = self.inner.lock().await;
        let PoolInner {
            identities, in_use, ..
        } = &mut *inner;

        for identity in identities.iter_mut() {
            if excluding.contains(&identity.handle) || in_use.contains(&identity.handle) {
                continue;
            }
            if identity.status != IdentityStatus::Active {
                continue;
            }

            if identity.last_used_date != Some(today) {
                identity.daily_used = 0;
                identity.last_used_date = Some(today);
            }

            if identity.daily_used < self.daily_limit {
                in_use.insert(identity.handle.clone());
                debug!(handle = %identity.handle, "Identity locked");
                return Some(identity.clone());
            }
        }

        None
    }

    /// Release an identity lock. Idempotent if the handle was not held.
    pub async fn release(&self, identity: &Identity) {
        let mut inner = self.inner.lock().await;
        if inner.in_use.remove(&identity.handle) {
            debug!(handle = %identity.handle, "Identity released");
        }
    }

    /// Record one use against today's quota and persist write-through.
    pub async fn mark_used(&self, identity: &Identity) -> Result<(), DatabaseError> {
        let today = Utc::now().date_naive();
        let updated = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner
                .identities
                .iter_mut()
                .find(|i| i.handle == identity.handle)
            else {
                return Ok(());
            };
            entry.last_used_date = Some(today);
            entry.daily_used += 1;
            entry.clone()
        };
        self.db.upsert_identity(&updated).await
    }

    /// Mark an identity exhausted on the target side and persist.
    pub async fn mark_exhausted(&self, identity: &Identity) -> Result<(), DatabaseError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner
                .identities
                .iter_mut()
                .find(|i| i.handle == identity.handle)
            else {
                return Ok(());
            };
            entry.status = IdentityStatus::NoCredits;
            entry.clone()
        };
        warn!(handle = %identity.handle, "Identity marked out of credits");
        self.db.upsert_identity(&updated).await
    }

    /// Append a new identity and persist it.
    pub async fn add(
        &self,
        handle: &str,
        secret: &str,
        config_ref: &str,
    ) -> Result<Identity, DatabaseError> {
        let identity = Identity {
            handle: handle.to_string(),
            secret: secret.to_string(),
            daily_used: 0,
            last_used_date: None,
            status: IdentityStatus::Active,
            config_ref: config_ref.to_string(),
            created_at: Utc::now(),
        };
        self.db.upsert_identity(&identity).await?;
        self.inner.lock().await.identities.push(identity.clone());
        info!(handle = %handle, "Identity added");
        Ok(identity)
    }

    /// Look up an identity by handle.
    pub async fn get(&self, handle: &str) -> Option<Identity> {
        self.inner
            .lock()
            .await
            .identities
            .iter()
            .find(|i| i.handle == handle)
            .cloned()
    }

    /// How many identities an `acquire` could return right now. Used to
    /// size bounded-parallel batches.
    pub async fn available_today(&self) -> usize {
        let today = Utc::now().date_naive();
        let inner = self.inner.lock().await;
        inner
            .identities
            .iter()
            .filter(|i| {
                i.status == IdentityStatus::Active
                    && !inner.in_use.contains(&i.handle)
                    && (i.last_used_date != Some(today) || i.daily_used < self.daily_limit)
            })
            .count()
    }

    /// Aggregate quota statistics for the operator surface.
    pub async fn stats(&self) -> IdentityStats {
        let today = Utc::now().date_naive();
        let inner = self.inner.lock().await;

        let total = inner.identities.len();
        let mut active = 0;
        let mut available_today = 0;
        let mut used_today = 0;

        for identity in &inner.identities {
            if identity.status != IdentityStatus::Active {
                continue;
            }
            active += 1;
            if identity.last_used_date == Some(today) {
                used_today += identity.daily_used;
                available_today += self.daily_limit.saturating_sub(identity.daily_used);
            } else {
                available_today += self.daily_limit;
            }
        }

        IdentityStats {
            total,
            active,
            available_today,
            used_today,
        }
    }
}

// ── Handle/secret generation ────────────────────────────────────────

const NAME_PARTS: &[&str] = &[
    "wang", "li", "zhang", "liu", "chen", "yang", "zhao", "huang", "zhou", "wu", "lin", "song",
    "wei", "jun", "ming", "hua", "lei", "bo", "hao", "yu", "tao", "feng", "kai", "xin", "ning",
    "wen", "jia", "dong", "fei", "yun",
];

/// Generate a plausible address-like handle under `domain`.
pub fn generate_handle(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let a = NAME_PARTS.choose(&mut rng).unwrap_or(&"wang");
    let b = NAME_PARTS.choose(&mut rng).unwrap_or(&"wei");
    let local = match rng.gen_range(0..3) {
        0 => format!("{a}{b}"),
        1 => {
            let c = NAME_PARTS.choose(&mut rng).unwrap_or(&"jun");
            format!("{a}{b}{c}")
        }
        _ => format!("{a}{b}{}", rng.gen_range(1..100)),
    };
    format!("{local}@{domain}")
}

/// Generate a random secret for a new identity.
pub fn generate_secret(length: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
