//! Registry configuration.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Options controlling a [`PresenceService`](crate::service::PresenceService)
/// instance.
///
/// All durations are in seconds. The defaults match the reference deployment
/// cadence: a 5 second housekeeping tick, metrics pushed every 45 seconds and
/// inbound change ids remembered for 60 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Unique id of this service instance, used to ignore replicated changes
    /// that originated here. Defaults to a fresh uuid.
    pub id: String,

    /// How long an inbound change id is remembered for deduplication.
    pub change_expiration_secs: u64,

    /// Housekeeping tick of the [`run`](crate::service::PresenceService::run)
    /// loop.
    pub update_tick_secs: u64,

    /// How often metrics are pushed to the backplane providers.
    pub metrics_update_secs: u64,

    /// A contact with no self connections, no subscriptions and replicated
    /// state untouched for this long is evicted from the registry.
    pub stale_contact_ttl_secs: u64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            change_expiration_secs: 60,
            update_tick_secs: 5,
            metrics_update_secs: 45,
            stale_contact_ttl_secs: 3600,
        }
    }
}

impl ServiceOptions {
    /// Options with an explicit service id and default cadences.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServiceOptions::default();
        assert!(!options.id.is_empty());
        assert_eq!(options.change_expiration_secs, 60);
        assert_eq!(options.metrics_update_secs, 45);
    }

    #[test]
    fn test_partial_deserialization() {
        let options: ServiceOptions =
            serde_json::from_str(r#"{"id":"service1","stale_contact_ttl_secs":120}"#).unwrap();
        assert_eq!(options.id, "service1");
        assert_eq!(options.stale_contact_ttl_secs, 120);
        assert_eq!(options.update_tick_secs, 5);
    }
}
