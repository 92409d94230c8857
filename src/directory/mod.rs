//! Service directory: registry records, the local registry and the
//! discovery-backed distributed variant

pub mod distributed;
pub mod entry;
pub mod local;
pub mod locator;

pub use distributed::{
    Advertisement, DiscoveryFabric, DistributedServiceDirectory, InMemoryDiscovery,
    SearchPattern, ServiceDescription, DEFAULT_SCOPE,
};
pub use entry::{Field, ServiceDirectoryEntry};
pub use local::ServiceDirectory;
pub use locator::{LocationField, ServiceLocation, ServiceLocator};

use crate::error::{Error, Result};

/// Full-string regex match, the matching rule for every directory and
/// locator search.
pub(crate) fn full_match(pattern: &str, text: &str) -> Result<bool> {
    let anchored = format!("\\A(?:{})\\z", pattern);
    let regex = regex::Regex::new(&anchored)
        .map_err(|err| Error::InvalidArgument(format!("invalid search pattern: {}", err)))?;
    Ok(regex.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::full_match;

    #[test]
    fn full_match_is_anchored() {
        assert!(full_match("agent-0", "agent-0").unwrap());
        assert!(!full_match("agent", "agent-0").unwrap());
        assert!(!full_match("gent-0", "agent-0").unwrap());
        assert!(full_match(".*-0", "agent-0").unwrap());
        assert!(full_match("agent-0$", "agent-0").unwrap());
    }

    #[test]
    fn full_match_rejects_bad_patterns() {
        assert!(full_match("(unclosed", "text").is_err());
    }
}
