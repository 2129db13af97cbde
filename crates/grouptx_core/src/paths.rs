//! Layout of a tenant's nodes in the coordination tree.
//!
//! ```text
//! <root>/apps/<tenant>/txids/tx<10-digit-seq>          counter bucket 0
//! <root>/apps/<tenant>/txids2/tx<10-digit-seq>         counter bucket 1
//! <root>/apps/<tenant>/txid_offset                     manual ID offset
//! <root>/apps/<tenant>/locks/<key>                     ephemeral lock
//! <root>/apps/<tenant>/blacklist/<txid>                blacklist entry
//! <root>/apps/<tenant>/validlist/<key-hash>/<txid>     validity record
//! <root>/groomerlock                                   groomer lock
//! ```
//!
//! Tenant names and entity-group keys are escaped before becoming path
//! components. Entity keys under `validlist` are hashed instead, since keys
//! can be arbitrarily long.

use grouptx_coord::path;
use sha2::{Digest, Sha256};

const APPS: &str = "apps";
const BUCKET_BASE: &str = "txids";
const COUNTER_PREFIX: &str = "tx";
const OFFSET: &str = "txid_offset";
const LOCKS: &str = "locks";
const BLACKLIST: &str = "blacklist";
const VALIDLIST: &str = "validlist";
const GROOMER_LOCK: &str = "groomerlock";

/// Child of a counter node listing the entity groups the transaction locked.
pub(crate) const GROUPS_NODE: &str = "groups";
/// Child of a counter node marking a cross-group transaction.
pub(crate) const XG_NODE: &str = "xg";
/// Child of a counter node claimed by whichever of commit or expiry comes first.
pub(crate) const OUTCOME_NODE: &str = "outcome";
/// Prefix of counter-node children recording registered keys.
pub(crate) const UPDATED_KEY_PREFIX: &str = "ukey";

/// Paths of one tenant's nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPaths {
    tenant: String,
    base: String,
}

impl TenantPaths {
    /// Creates the layout for `tenant` under `root`.
    #[must_use]
    pub fn new(root: &str, tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            base: path::join(&Self::apps_dir(root), &path::escape(tenant)),
        }
    }

    /// Returns the directory holding every tenant.
    #[must_use]
    pub fn apps_dir(root: &str) -> String {
        path::join(root, APPS)
    }

    /// Returns the path of the cluster-wide groomer lock.
    #[must_use]
    pub fn groomer_lock(root: &str) -> String {
        path::join(root, GROOMER_LOCK)
    }

    /// Returns the tenant name.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the tenant's directory.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Returns the node name of counter bucket `index` (`txids`, `txids2`, ...).
    #[must_use]
    pub fn bucket_name(index: u32) -> String {
        if index == 0 {
            BUCKET_BASE.to_string()
        } else {
            format!("{BUCKET_BASE}{}", u64::from(index) + 1)
        }
    }

    /// Parses a bucket node name back into its index.
    #[must_use]
    pub fn parse_bucket(name: &str) -> Option<u32> {
        let rest = name.strip_prefix(BUCKET_BASE)?;
        if rest.is_empty() {
            return Some(0);
        }
        if !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match rest.parse::<u32>().ok()? {
            0 | 1 => None,
            n => Some(n - 1),
        }
    }

    /// Returns the directory of counter bucket `index`.
    #[must_use]
    pub fn bucket_dir(&self, index: u32) -> String {
        path::join(&self.base, &Self::bucket_name(index))
    }

    /// Returns the prefix passed to a sequential create in bucket `index`.
    #[must_use]
    pub fn counter_prefix(&self, index: u32) -> String {
        path::join(&self.bucket_dir(index), COUNTER_PREFIX)
    }

    /// Returns the counter node for `sequence` in bucket `index`.
    #[must_use]
    pub fn counter_node(&self, index: u32, sequence: u64) -> String {
        format!("{}{sequence:010}", self.counter_prefix(index))
    }

    /// Parses the sequence number out of a counter node name.
    ///
    /// Negative values mean the service's 32-bit sequence wrapped.
    #[must_use]
    pub fn parse_sequence(name: &str) -> Option<i64> {
        name.strip_prefix(COUNTER_PREFIX)?.parse().ok()
    }

    /// Returns the manual offset node.
    #[must_use]
    pub fn offset_node(&self) -> String {
        path::join(&self.base, OFFSET)
    }

    /// Returns the directory of lock nodes.
    #[must_use]
    pub fn locks_dir(&self) -> String {
        path::join(&self.base, LOCKS)
    }

    /// Returns the lock node of entity group `key`.
    #[must_use]
    pub fn lock_node(&self, key: &str) -> String {
        path::join(&self.locks_dir(), &path::escape(key))
    }

    /// Returns the blacklist directory.
    #[must_use]
    pub fn blacklist_dir(&self) -> String {
        path::join(&self.base, BLACKLIST)
    }

    /// Returns the blacklist node of `txid`.
    #[must_use]
    pub fn blacklist_node(&self, txid: u64) -> String {
        path::join(&self.blacklist_dir(), &txid.to_string())
    }

    /// Returns the validity directory.
    #[must_use]
    pub fn validlist_dir(&self) -> String {
        path::join(&self.base, VALIDLIST)
    }

    /// Returns the directory of validity records for entity `key`.
    #[must_use]
    pub fn validity_dir(&self, key: &str) -> String {
        path::join(&self.validlist_dir(), &key_hash(key))
    }

    /// Returns the validity record written by `writer` for entity `key`.
    #[must_use]
    pub fn validity_record(&self, key: &str, writer: u64) -> String {
        path::join(&self.validity_dir(key), &writer.to_string())
    }
}

/// Returns the lowercase hex SHA-256 of `key`.
#[must_use]
pub(crate) fn key_hash(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_layout() {
        let paths = TenantPaths::new("/grouptx", "guestbook");
        assert_eq!(paths.base(), "/grouptx/apps/guestbook");
        assert_eq!(paths.bucket_dir(0), "/grouptx/apps/guestbook/txids");
        assert_eq!(paths.bucket_dir(1), "/grouptx/apps/guestbook/txids2");
        assert_eq!(
            paths.counter_node(0, 42),
            "/grouptx/apps/guestbook/txids/tx0000000042"
        );
        assert_eq!(paths.blacklist_node(7), "/grouptx/apps/guestbook/blacklist/7");
        assert_eq!(paths.offset_node(), "/grouptx/apps/guestbook/txid_offset");
        assert_eq!(TenantPaths::groomer_lock("/grouptx"), "/grouptx/groomerlock");
    }

    #[test]
    fn special_characters_are_escaped() {
        let paths = TenantPaths::new("/", "my app/v2");
        assert_eq!(paths.base(), "/apps/my%20app%2Fv2");
        assert_eq!(paths.lock_node("a/b"), "/apps/my%20app%2Fv2/locks/a%2Fb");
        assert_eq!(paths.tenant(), "my app/v2");
    }

    #[test]
    fn bucket_names_round_trip() {
        for index in [0, 1, 2, 17] {
            let name = TenantPaths::bucket_name(index);
            assert_eq!(TenantPaths::parse_bucket(&name), Some(index));
        }
        assert_eq!(TenantPaths::parse_bucket("txids1"), None);
        assert_eq!(TenantPaths::parse_bucket("txids0"), None);
        assert_eq!(TenantPaths::parse_bucket("locks"), None);
        assert_eq!(TenantPaths::parse_bucket("txids+3"), None);
    }

    #[test]
    fn parse_sequence_handles_wrapped_counters() {
        assert_eq!(TenantPaths::parse_sequence("tx0000000042"), Some(42));
        assert_eq!(TenantPaths::parse_sequence("tx2147483647"), Some(2_147_483_647));
        assert_eq!(TenantPaths::parse_sequence("tx-2147483648"), Some(-2_147_483_648));
        assert_eq!(TenantPaths::parse_sequence("groups"), None);
    }

    #[test]
    fn key_hash_is_sha256_hex() {
        assert_eq!(
            key_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(key_hash("k").len(), 64);
    }
}
