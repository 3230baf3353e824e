//! One-time publication tokens

use dashmap::DashMap;
use mimir_core::{Error, Result, SystemEntry};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of a token in its text form
pub const TOKEN_LEN: usize = 36;

/// Random bytes per token; hex encoding doubles them to [`TOKEN_LEN`]
const TOKEN_BYTES: usize = TOKEN_LEN / 2;

/// Default lifetime of an unredeemed token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Mint a fresh token: 144 random bits, lowercase hex
#[must_use]
pub fn mint_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

struct Pending {
    entry: Arc<dyn SystemEntry>,
    expires_at: Instant,
}

/// Tokens minted for published entries, each redeemable once
pub struct TokenTable {
    pending: DashMap<String, Pending>,
    ttl: Duration,
}

impl TokenTable {
    /// Table whose tokens expire after `ttl`
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `ttl` is too large to add to the clock.
    pub fn new(ttl: Duration) -> Result<Self> {
        expiry(ttl)?;
        Ok(Self {
            pending: DashMap::new(),
            ttl,
        })
    }

    /// Register an entry and return its token
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the expiry overflows the clock.
    pub fn insert(&self, entry: Arc<dyn SystemEntry>) -> Result<String> {
        self.purge_expired();
        let expires_at = expiry(self.ttl)?;
        let token = mint_token();
        self.pending
            .insert(token.clone(), Pending { entry, expires_at });
        Ok(token)
    }

    /// Take the entry for a token; unknown, used and expired tokens yield `None`
    pub fn redeem(&self, token: &str) -> Option<Arc<dyn SystemEntry>> {
        let (_, pending) = self.pending.remove(token)?;
        if pending.expires_at <= Instant::now() {
            tracing::debug!("Expired token presented");
            return None;
        }
        Some(pending.entry)
    }

    /// Drop tokens past their lifetime
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.pending.retain(|_, pending| pending.expires_at > now);
    }

    /// Drop every token
    pub fn clear(&self) {
        self.pending.clear();
    }

    /// Number of outstanding tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no token is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn expiry(ttl: Duration) -> Result<Instant> {
    Instant::now().checked_add(ttl).ok_or_else(|| {
        Error::configuration(format!("token lifetime of {}s is out of range", ttl.as_secs()))
    })
}

impl std::fmt::Debug for TokenTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTable")
            .field("pending", &self.pending.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mimir_core::{Entry, EntryInfo, LocalEntry};
    use std::path::Path;

    #[derive(Debug, Default)]
    struct NullEntry(EntryInfo);

    impl Entry for NullEntry {
        fn info(&self) -> &EntryInfo {
            &self.0
        }
    }

    #[async_trait]
    impl LocalEntry for NullEntry {
        async fn transfer_to(&self, _file: &Path) -> mimir_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SystemEntry for NullEntry {
        async fn open(&self) -> mimir_core::Result<tokio::fs::File> {
            Err(mimir_core::Error::unavailable("file", "null entry"))
        }
    }

    #[test]
    fn test_tokens_are_36_hex_chars_and_unique() {
        let a = mint_token();
        let b = mint_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_redeem_once() {
        let table = TokenTable::new(DEFAULT_TOKEN_TTL).unwrap();
        let token = table.insert(Arc::new(NullEntry::default())).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.redeem(&token).is_some());
        assert!(table.redeem(&token).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_expired_tokens_are_refused_and_purged() {
        let table = TokenTable::new(Duration::ZERO).unwrap();
        let token = table.insert(Arc::new(NullEntry::default())).unwrap();
        assert!(table.redeem(&token).is_none());

        table.insert(Arc::new(NullEntry::default())).unwrap();
        table.purge_expired();
        assert!(table.is_empty());
    }

    #[test]
    fn test_huge_ttl_is_a_configuration_error() {
        let err = TokenTable::new(Duration::MAX).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }), "{err}");
    }

    #[test]
    fn test_clear_drops_everything() {
        let table = TokenTable::new(DEFAULT_TOKEN_TTL).unwrap();
        let token = table.insert(Arc::new(NullEntry::default())).unwrap();
        table.clear();
        assert!(table.redeem(&token).is_none());
    }
}
