//! Service locations and the priority-ordered locator

use crate::directory::full_match;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One place a service listens: an address plus the signature the listener
/// publishes to claim its contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocation {
    service_address: String,
    signature_type: String,
    service_signature: String,
}

/// Field selector for location searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationField {
    ServiceAddress,
    SignatureType,
    ServiceSignature,
}

impl ServiceLocation {
    pub fn new(service_address: impl Into<String>, signature_type: impl Into<String>) -> Self {
        Self {
            service_address: service_address.into(),
            signature_type: signature_type.into(),
            service_signature: String::new(),
        }
    }

    pub fn with_signature(
        service_address: impl Into<String>,
        signature_type: impl Into<String>,
        service_signature: impl Into<String>,
    ) -> Self {
        Self {
            service_address: service_address.into(),
            signature_type: signature_type.into(),
            service_signature: service_signature.into(),
        }
    }

    /// Parse the space-separated form. Trailing fields are optional and
    /// default to empty.
    pub fn from_string(location: &str) -> Self {
        let mut parts = location.split(' ').filter(|part| !part.is_empty());
        Self {
            service_address: parts.next().unwrap_or_default().to_string(),
            signature_type: parts.next().unwrap_or_default().to_string(),
            service_signature: parts.next().unwrap_or_default().to_string(),
        }
    }

    pub fn service_address(&self) -> &str {
        &self.service_address
    }

    pub fn signature_type(&self) -> &str {
        &self.signature_type
    }

    pub fn service_signature(&self) -> &str {
        &self.service_signature
    }

    pub fn field_content(&self, field: LocationField) -> &str {
        match field {
            LocationField::ServiceAddress => &self.service_address,
            LocationField::SignatureType => &self.signature_type,
            LocationField::ServiceSignature => &self.service_signature,
        }
    }
}

impl fmt::Display for ServiceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = format!(
            "{} {} {}",
            self.service_address, self.signature_type, self.service_signature
        );
        f.write_str(text.trim_end())
    }
}

/// Ordered sequence of service locations; the head has the highest
/// priority. Duplicates are not rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocator {
    locations: Vec<ServiceLocation>,
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the semicolon-joined form, ignoring empty segments.
    pub fn from_string(locations: &str) -> Self {
        let locations = locations
            .split(';')
            .filter(|segment| !segment.trim().is_empty())
            .map(ServiceLocation::from_string)
            .collect();
        Self { locations }
    }

    pub fn locations(&self) -> &[ServiceLocation] {
        &self.locations
    }

    pub fn add_location(&mut self, location: ServiceLocation) {
        self.locations.push(location);
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// All locations whose `field` matches the regex as a full string.
    /// Fails with `NotFound` when nothing matches.
    pub fn search(&self, regex: &str, field: LocationField) -> Result<Vec<ServiceLocation>> {
        let mut matches = Vec::new();
        for location in &self.locations {
            if full_match(regex, location.field_content(field))? {
                matches.push(location.clone());
            }
        }
        if matches.is_empty() {
            return Err(Error::NotFound(format!(
                "service location matching '{}'",
                regex
            )));
        }
        Ok(matches)
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for location in &self.locations {
            write!(f, "{};", location)?;
        }
        Ok(())
    }
}

impl From<Vec<ServiceLocation>> for ServiceLocator {
    fn from(locations: Vec<ServiceLocation>) -> Self {
        Self { locations }
    }
}
