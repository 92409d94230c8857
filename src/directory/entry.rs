//! Directory records

use super::locator::ServiceLocator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Selector for the generic field-based searches. The numbering is part of
/// the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Field {
    Name = 0,
    Type = 1,
    Locator = 2,
    Description = 3,
    Timestamp = 4,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Name,
        Field::Type,
        Field::Locator,
        Field::Description,
        Field::Timestamp,
    ];

    /// Stable label used when entries are published through a discovery
    /// fabric.
    pub fn label(&self) -> &'static str {
        match self {
            Field::Name => "NAME",
            Field::Type => "TYPE",
            Field::Locator => "LOCATOR",
            Field::Description => "DESCRIPTION",
            Field::Timestamp => "TIMESTAMP",
        }
    }
}

/// One registered service: a unique name, its signature type, where it can
/// be reached and when the record last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDirectoryEntry {
    name: String,
    service_type: String,
    locator: ServiceLocator,
    description: String,
    timestamp: DateTime<Utc>,
}

impl ServiceDirectoryEntry {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        locator: ServiceLocator,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            locator,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_parts(
        name: impl Into<String>,
        service_type: impl Into<String>,
        locator: ServiceLocator,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            locator,
            description: description.into(),
            timestamp,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn locator(&self) -> &ServiceLocator {
        &self.locator
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    /// Text content of a field, the subject of every regex search.
    pub fn field_content(&self, field: Field) -> String {
        match field {
            Field::Name => self.name.clone(),
            Field::Type => self.service_type.clone(),
            Field::Locator => self.locator.to_string(),
            Field::Description => self.description.clone(),
            Field::Timestamp => self.timestamp.to_rfc3339(),
        }
    }
}

impl fmt::Display for ServiceDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) locations: {} description: {}",
            self.name, self.service_type, self.locator, self.description
        )
    }
}

impl Eq for ServiceDirectoryEntry {}

impl PartialOrd for ServiceDirectoryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceDirectoryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
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
            "test entry",
        )
    }

    #[test]
    fn field_content_by_selector() {
        let entry = entry("service-0");
        assert_eq!(entry.field_content(Field::Name), "service-0");
        assert_eq!(entry.field_content(Field::Type), "mts");
        assert_eq!(
            entry.field_content(Field::Locator),
            "udt://10.0.0.1:2000 Sig;"
        );
        assert_eq!(entry.field_content(Field::Description), "test entry");
        assert!(!entry.field_content(Field::Timestamp).is_empty());
    }

    #[test]
    fn natural_order_is_by_name() {
        let mut entries = vec![entry("b"), entry("a"), entry("c")];
        entries.sort();
        let names: Vec<_> = entries.iter().map(|entry| entry.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
