//! Directory backed by a zero-configuration discovery fabric
//!
//! Entries are published as per-entry advertisements into one or more
//! scopes; lookups query whatever the fabric currently sees. A failed or
//! dying advertisement is not retried, it simply stops being visible.

use super::entry::{Field, ServiceDirectoryEntry};
use super::full_match;
use super::locator::ServiceLocator;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default discovery scope for directory entries.
pub const DEFAULT_SCOPE: &str = "_fipa_service_directory._udp";

/// A published service as the fabric sees it: a name plus labelled fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescription {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl ServiceDescription {
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == label)
            .map(|(_, value)| value.as_str())
    }
}

/// Query against the fabric: a name pattern plus an optional labelled-field
/// pattern. Both match as full-string regexes.
#[derive(Debug, Clone)]
pub struct SearchPattern {
    pub name_pattern: String,
    pub field: Option<(String, String)>,
}

impl SearchPattern {
    pub fn by_name(name_pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: name_pattern.into(),
            field: None,
        }
    }

    pub fn by_field(label: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: ".*".to_string(),
            field: Some((label.into(), pattern.into())),
        }
    }

    pub fn matches(&self, description: &ServiceDescription) -> Result<bool> {
        if !full_match(&self.name_pattern, &description.name)? {
            return Ok(false);
        }
        if let Some((label, pattern)) = &self.field {
            let value = description.field(label).unwrap_or_default();
            return full_match(pattern, value);
        }
        Ok(true)
    }
}

/// A running advertisement. Dropping the handle withdraws the entry.
pub trait Advertisement: Send {}

/// The discovery seam. The in-memory implementation below serves tests and
/// single-host setups; a real deployment plugs in a zeroconf client.
pub trait DiscoveryFabric: Send + Sync {
    /// Start advertising a description within a scope. The returned handle
    /// owns the advertisement.
    fn announce(
        &self,
        description: ServiceDescription,
        scope: &str,
    ) -> Result<Box<dyn Advertisement>>;

    /// Everything currently visible in the given scopes that matches the
    /// pattern.
    fn visible(&self, pattern: &SearchPattern, scopes: &[String]) -> Vec<ServiceDescription>;
}

/// Directory entries resolved through a discovery fabric.
pub struct DistributedServiceDirectory {
    fabric: Arc<dyn DiscoveryFabric>,
    scopes: Vec<String>,
    advertisements: Mutex<Vec<(ServiceDirectoryEntry, Box<dyn Advertisement>)>>,
}

impl DistributedServiceDirectory {
    pub fn new(fabric: Arc<dyn DiscoveryFabric>) -> Self {
        Self::with_scopes(fabric, vec![DEFAULT_SCOPE.to_string()])
    }

    pub fn with_scopes(fabric: Arc<dyn DiscoveryFabric>, scopes: Vec<String>) -> Self {
        Self {
            fabric,
            scopes,
            advertisements: Mutex::new(Vec::new()),
        }
    }

    /// Replace dots so a published name stays usable as a regex literal
    /// during lookups.
    pub fn canonize_name(name: &str) -> String {
        name.replace('.', "?")
    }

    fn decanonize_name(name: &str) -> String {
        name.replace('?', ".")
    }

    fn to_description(entry: &ServiceDirectoryEntry) -> ServiceDescription {
        let mut description = ServiceDescription {
            name: Self::canonize_name(entry.name()),
            fields: Vec::new(),
        };
        for field in Field::ALL {
            if field != Field::Name {
                description
                    .fields
                    .push((field.label().to_string(), entry.field_content(field)));
            }
        }
        description
    }

    fn to_entry(description: &ServiceDescription) -> ServiceDirectoryEntry {
        let timestamp = description
            .field(Field::Timestamp.label())
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        ServiceDirectoryEntry::from_parts(
            Self::decanonize_name(&description.name),
            description.field(Field::Type.label()).unwrap_or_default(),
            ServiceLocator::from_string(
                description.field(Field::Locator.label()).unwrap_or_default(),
            ),
            description
                .field(Field::Description.label())
                .unwrap_or_default(),
            timestamp,
        )
    }

    /// Publish an entry into the first listening scope.
    pub async fn register(&self, entry: ServiceDirectoryEntry) -> Result<()> {
        let scope = self
            .scopes
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        self.register_in(entry, &scope).await
    }

    /// Publish an entry into an explicit scope.
    pub async fn register_in(&self, entry: ServiceDirectoryEntry, scope: &str) -> Result<()> {
        debug!("distributed register: {}", entry);
        let mut advertisements = self.advertisements.lock().await;
        if advertisements
            .iter()
            .any(|(existing, _)| existing.name() == entry.name())
        {
            return Err(Error::DuplicateEntry(entry.name().to_string()));
        }
        let handle = self.fabric.announce(Self::to_description(&entry), scope)?;
        advertisements.push((entry, handle));
        Ok(())
    }

    /// Withdraw the first advertisement whose stored entry matches the
    /// regex on `field`. Fails with `NotFound` when none does.
    pub async fn deregister(&self, regex: &str, field: Field) -> Result<()> {
        let mut advertisements = self.advertisements.lock().await;
        let mut found = None;
        for (index, (entry, _)) in advertisements.iter().enumerate() {
            if full_match(regex, &entry.field_content(field))? {
                found = Some(index);
                break;
            }
        }
        match found {
            Some(index) => {
                // Dropping the handle stops the advertisement
                advertisements.remove(index);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "no advertised entry matching '{}'",
                regex
            ))),
        }
    }

    /// Query the fabric within the listening scopes.
    pub async fn search(
        &self,
        regex: &str,
        field: Field,
        throw_if_empty: bool,
    ) -> Result<Vec<ServiceDirectoryEntry>> {
        let pattern = if field == Field::Name {
            SearchPattern::by_name(regex)
        } else {
            SearchPattern::by_field(field.label(), regex)
        };
        let results = self.fabric.visible(&pattern, &self.scopes);
        if results.is_empty() && throw_if_empty {
            return Err(Error::NotFound(format!(
                "no visible entry matching '{}' on field {}",
                regex,
                field.label()
            )));
        }
        Ok(results.iter().map(Self::to_entry).collect())
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

type Registry = StdMutex<HashMap<String, HashMap<String, ServiceDescription>>>;

/// Process-local discovery fabric. Advertisements from every directory
/// sharing the same instance are visible to each other, which is all the
/// end-to-end tests need.
#[derive(Clone, Default)]
pub struct InMemoryDiscovery {
    registry: Arc<Registry>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

struct InMemoryAdvertisement {
    registry: Weak<Registry>,
    scope: String,
    name: String,
}

impl Advertisement for InMemoryAdvertisement {}

impl Drop for InMemoryAdvertisement {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut scopes) = registry.lock() {
                if let Some(entries) = scopes.get_mut(&self.scope) {
                    entries.remove(&self.name);
                }
            }
        }
    }
}

impl DiscoveryFabric for InMemoryDiscovery {
    fn announce(
        &self,
        description: ServiceDescription,
        scope: &str,
    ) -> Result<Box<dyn Advertisement>> {
        let mut scopes = self
            .registry
            .lock()
            .map_err(|_| Error::Transport("discovery registry poisoned".to_string()))?;
        let entries = scopes.entry(scope.to_string()).or_default();
        let name = description.name.clone();
        entries.insert(name.clone(), description);
        Ok(Box::new(InMemoryAdvertisement {
            registry: Arc::downgrade(&self.registry),
            scope: scope.to_string(),
            name,
        }))
    }

    fn visible(&self, pattern: &SearchPattern, scopes: &[String]) -> Vec<ServiceDescription> {
        let registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(_) => return Vec::new(),
        };
        let mut results = Vec::new();
        for scope in scopes {
            if let Some(entries) = registry.get(scope) {
                for description in entries.values() {
                    match pattern.matches(description) {
                        Ok(true) => results.push(description.clone()),
                        Ok(false) => {}
                        Err(err) => {
                            warn!("discovery pattern rejected: {}", err);
                            return Vec::new();
                        }
                    }
                }
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::locator::ServiceLocation;

    fn entry(name: &str) -> ServiceDirectoryEntry {
        ServiceDirectoryEntry::new(
            name,
            "mts",
            ServiceLocator::from(vec![ServiceLocation::new("udt://10.0.0.1:2000", "Sig")]),
            "distributed entry",
        )
    }

    fn directory() -> (DistributedServiceDirectory, InMemoryDiscovery) {
        let fabric = InMemoryDiscovery::new();
        let directory = DistributedServiceDirectory::new(Arc::new(fabric.clone()));
        (directory, fabric)
    }

    #[tokio::test]
    async fn register_search_deregister() {
        let (directory, _fabric) = directory();
        directory.register(entry("service-0")).await.unwrap();

        let found = directory
            .search("service-0", Field::Name, true)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "service-0");
        assert_eq!(found[0].service_type(), "mts");
        assert_eq!(
            found[0].field_content(Field::Locator),
            "udt://10.0.0.1:2000 Sig;"
        );

        directory.deregister("service-0", Field::Name).await.unwrap();
        assert!(directory
            .search("service-0", Field::Name, false)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            directory.deregister("service-0", Field::Name).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dotted_names_are_canonized_for_publication() {
        let (directory, fabric) = directory();
        directory.register(entry("module.agent.0")).await.unwrap();

        // On the wire the dots are gone
        let raw = fabric.visible(
            &SearchPattern::by_name(".*"),
            &[DEFAULT_SCOPE.to_string()],
        );
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].name, "module?agent?0");

        // A dotted lookup still resolves, and the read side restores the
        // dotted name
        let found = directory
            .search("module.agent.0", Field::Name, true)
            .await
            .unwrap();
        assert_eq!(found[0].name(), "module.agent.0");

        // A sibling in the same fabric that a raw dot wildcards onto
        directory.register(entry("moduleXagentX0")).await.unwrap();

        // Used unescaped, the dotted pattern is a wildcard and catches both
        // entries
        let loose = directory
            .search("module.agent.0", Field::Name, true)
            .await
            .unwrap();
        assert_eq!(loose.len(), 2);

        // The rewrite gives the dotted entry an exact handle: the escaped
        // canonical pattern resolves to the one intended entry and excludes
        // the sibling, which a raw-dot publication could never do
        let exact = directory
            .search("module\\?agent\\?0", Field::Name, true)
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name(), "module.agent.0");
    }

    #[tokio::test]
    async fn two_directories_share_one_fabric() {
        let fabric = Arc::new(InMemoryDiscovery::new());
        let left = DistributedServiceDirectory::new(fabric.clone());
        let right = DistributedServiceDirectory::new(fabric);

        left.register(entry("published-by-left")).await.unwrap();
        let found = right
            .search("published-by-left", Field::Name, true)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn search_by_labelled_field() {
        let (directory, _fabric) = directory();
        directory.register(entry("service-0")).await.unwrap();

        let found = directory.search("mts", Field::Type, true).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            directory.search("other-type", Field::Type, true).await,
            Err(Error::NotFound(_))
        ));
    }
}
