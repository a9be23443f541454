//! Engine configuration shared by all admission handlers

use std::fmt;

use clap::ValueEnum;

use crate::{DEFAULT_METRICS_PORT, DEFAULT_SIDECAR_IMAGE};

/// What to do with an Endpoints subset whose every address is in the
/// `backupIP` list.
///
/// Replacing the address array with an empty one is never done; the choice is
/// between leaving the stale addresses in place and dropping the subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EmptiedSubsetPolicy {
    /// Leave the subset untouched
    #[default]
    Leave,
    /// Remove the whole subset
    RemoveSubset,
}

impl fmt::Display for EmptiedSubsetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptiedSubsetPolicy::Leave => write!(f, "leave"),
            EmptiedSubsetPolicy::RemoveSubset => write!(f, "remove-subset"),
        }
    }
}

/// Settings the capability evaluators read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Image of the injected log/metrics sidecar
    pub sidecar_image: String,
    /// Port the sidecar serves metrics on, advertised in scrape annotations
    pub metrics_port: u16,
    /// Handling of backup-IP filtering that empties a subset
    pub emptied_subset_policy: EmptiedSubsetPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            emptied_subset_policy: EmptiedSubsetPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.emptied_subset_policy, EmptiedSubsetPolicy::Leave);
        assert!(!config.sidecar_image.is_empty());
    }

    #[test]
    fn test_policy_parses_from_cli_spelling() {
        assert_eq!(
            EmptiedSubsetPolicy::from_str("remove-subset", false),
            Ok(EmptiedSubsetPolicy::RemoveSubset)
        );
        assert_eq!(
            EmptiedSubsetPolicy::from_str("leave", false),
            Ok(EmptiedSubsetPolicy::Leave)
        );
        assert!(EmptiedSubsetPolicy::from_str("drop", false).is_err());
        assert_eq!(EmptiedSubsetPolicy::RemoveSubset.to_string(), "remove-subset");
    }
}
