//! Thread-safe in-memory service directory

use super::entry::{Field, ServiceDirectoryEntry};
use super::full_match;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Registry of services keyed by unique name.
///
/// Mutators take the exclusive lock, searches the shared one. The directory
/// carries a last-mutation timestamp that strictly increases on every
/// successful mutation.
pub struct ServiceDirectory {
    services: RwLock<BTreeMap<String, ServiceDirectoryEntry>>,
    timestamp: Mutex<DateTime<Utc>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            timestamp: Mutex::new(Utc::now()),
        }
    }

    /// Time of the last successful mutation.
    pub async fn timestamp(&self) -> DateTime<Utc> {
        *self.timestamp.lock().await
    }

    /// Advance the mutation timestamp, staying strictly monotonic even when
    /// the wall clock does not move between calls.
    async fn bump_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.timestamp.lock().await;
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }

    /// Add an entry. Fails with `DuplicateEntry` when the name is taken.
    pub async fn register(&self, mut entry: ServiceDirectoryEntry) -> Result<()> {
        let mut services = self.services.write().await;
        debug!("register service: {}", entry);
        if services.contains_key(entry.name()) {
            warn!("duplicate entry: {}", entry);
            return Err(Error::DuplicateEntry(entry.name().to_string()));
        }
        let stamp = self.bump_timestamp().await;
        entry.set_timestamp(stamp);
        services.insert(entry.name().to_string(), entry);
        Ok(())
    }

    /// Remove the FIRST entry whose `field` matches the regex; further
    /// matches stay registered. Fails with `NotFound` when nothing matches.
    pub async fn deregister(&self, regex: &str, field: Field) -> Result<()> {
        let mut services = self.services.write().await;
        let mut found = None;
        for (name, entry) in services.iter() {
            if full_match(regex, &entry.field_content(field))? {
                found = Some(name.clone());
                break;
            }
        }
        match found {
            Some(name) => {
                services.remove(&name);
                self.bump_timestamp().await;
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "service directory entry matching '{}'",
                regex
            ))),
        }
    }

    /// Convenience removal by entry name.
    pub async fn deregister_entry(&self, entry: &ServiceDirectoryEntry) -> Result<()> {
        self.deregister(entry.name(), Field::Name).await
    }

    /// All entries whose `field` matches the regex as a full string. With
    /// `throw_if_empty` an empty result becomes `NotFound`.
    pub async fn search(
        &self,
        regex: &str,
        field: Field,
        throw_if_empty: bool,
    ) -> Result<Vec<ServiceDirectoryEntry>> {
        let services = self.services.read().await;
        let mut matches = Vec::new();
        for entry in services.values() {
            if full_match(regex, &entry.field_content(field))? {
                matches.push(entry.clone());
            }
        }
        if matches.is_empty() && throw_if_empty {
            return Err(Error::NotFound(format!(
                "service directory entry matching '{}'",
                regex
            )));
        }
        Ok(matches)
    }

    /// Convenience search by entry name.
    pub async fn search_entry(
        &self,
        entry: &ServiceDirectoryEntry,
    ) -> Result<Vec<ServiceDirectoryEntry>> {
        self.search(entry.name(), Field::Name, false).await
    }

    /// Replace the entry with the same name. Fails with `NotFound` when no
    /// such entry exists.
    pub async fn modify(&self, mut entry: ServiceDirectoryEntry) -> Result<()> {
        let mut services = self.services.write().await;
        if !services.contains_key(entry.name()) {
            return Err(Error::NotFound(entry.name().to_string()));
        }
        let stamp = self.bump_timestamp().await;
        entry.set_timestamp(stamp);
        services.insert(entry.name().to_string(), entry);
        Ok(())
    }

    /// Remove all entries whose `field` matches, then register the updates
    /// in order. The unique `field` values of the updates decide which
    /// existing entries are cleared; each value is interpreted as a regex.
    /// Duplicates among the updates themselves propagate `DuplicateEntry`.
    pub async fn merge_selectively(
        &self,
        updates: Vec<ServiceDirectoryEntry>,
        field: Field,
    ) -> Result<()> {
        let unique_values: BTreeSet<String> = updates
            .iter()
            .map(|entry| entry.field_content(field))
            .collect();
        for value in unique_values {
            self.clear_selectively(&value, field).await?;
        }
        for entry in updates {
            self.register(entry).await?;
        }
        Ok(())
    }

    /// Remove every entry whose `field` matches the regex. Removing nothing
    /// is not an error.
    pub async fn clear_selectively(&self, regex: &str, field: Field) -> Result<()> {
        let matches = self.search(regex, field, false).await?;
        for entry in matches {
            self.deregister(entry.name(), Field::Name).await?;
        }
        Ok(())
    }

    /// Snapshot of all entries in name order.
    pub async fn all(&self) -> Vec<ServiceDirectoryEntry> {
        self.services.read().await.values().cloned().collect()
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::locator::{ServiceLocation, ServiceLocator};

    fn entry(name: &str, service_type: &str) -> ServiceDirectoryEntry {
        ServiceDirectoryEntry::new(
            name,
            service_type,
            ServiceLocator::from(vec![ServiceLocation::new("udt://10.0.0.1:2000", "Sig")]),
            "entry",
        )
    }

    #[tokio::test]
    async fn register_rejects_duplicates_modify_replaces() {
        let directory = ServiceDirectory::new();
        directory.register(entry("svc", "type-a")).await.unwrap();
        assert!(matches!(
            directory.register(entry("svc", "type-b")).await,
            Err(Error::DuplicateEntry(_))
        ));

        directory.modify(entry("svc", "type-b")).await.unwrap();
        let found = directory.search("svc", Field::Name, true).await.unwrap();
        assert_eq!(found[0].service_type(), "type-b");

        assert!(matches!(
            directory.modify(entry("other", "type-c")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deregister_removes_first_match_only() {
        let directory = ServiceDirectory::new();
        directory.register(entry("svc-a", "shared")).await.unwrap();
        directory.register(entry("svc-b", "shared")).await.unwrap();

        directory.deregister("shared", Field::Type).await.unwrap();
        let rest = directory.all().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name(), "svc-b");

        directory.deregister("shared", Field::Type).await.unwrap();
        assert!(matches!(
            directory.deregister("shared", Field::Type).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_selectively_removes_all_matches() {
        let directory = ServiceDirectory::new();
        directory.register(entry("svc-a", "shared")).await.unwrap();
        directory.register(entry("svc-b", "shared")).await.unwrap();
        directory.register(entry("svc-c", "other")).await.unwrap();

        directory.clear_selectively("shared", Field::Type).await.unwrap();
        let rest = directory.all().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name(), "svc-c");
    }

    #[tokio::test]
    async fn search_is_full_string_match() {
        let directory = ServiceDirectory::new();
        directory.register(entry("test-A", "mts")).await.unwrap();
        directory.register(entry("test-B", "mts")).await.unwrap();

        assert_eq!(
            directory.search(".*", Field::Name, false).await.unwrap().len(),
            2
        );
        // A bare prefix is not a match
        assert!(directory
            .search("test", Field::Name, false)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            directory.search("other$", Field::Name, true).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn merge_selectively_replaces_matching_groups() {
        let directory = ServiceDirectory::new();
        directory.register(entry("old-a", "group-1")).await.unwrap();
        directory.register(entry("old-b", "group-1")).await.unwrap();
        directory.register(entry("keep", "group-2")).await.unwrap();

        directory
            .merge_selectively(
                vec![entry("new-a", "group-1"), entry("new-b", "group-1")],
                Field::Type,
            )
            .await
            .unwrap();

        let names: Vec<_> = directory
            .all()
            .await
            .iter()
            .map(|entry| entry.name().to_string())
            .collect();
        assert_eq!(names, vec!["keep", "new-a", "new-b"]);
    }

    #[tokio::test]
    async fn merge_selectively_propagates_update_duplicates() {
        let directory = ServiceDirectory::new();
        let result = directory
            .merge_selectively(
                vec![entry("dup", "group-1"), entry("dup", "group-1")],
                Field::Type,
            )
            .await;
        assert!(matches!(result, Err(Error::DuplicateEntry(_))));
    }

    #[tokio::test]
    async fn timestamp_strictly_increases_on_mutation() {
        let directory = ServiceDirectory::new();
        let start = directory.timestamp().await;

        directory.register(entry("svc", "mts")).await.unwrap();
        let after_register = directory.timestamp().await;
        assert!(after_register > start);

        directory.modify(entry("svc", "mts")).await.unwrap();
        let after_modify = directory.timestamp().await;
        assert!(after_modify > after_register);

        // Searches do not advance the timestamp
        directory.search(".*", Field::Name, false).await.unwrap();
        assert_eq!(directory.timestamp().await, after_modify);
    }
}
