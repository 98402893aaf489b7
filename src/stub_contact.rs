//! Placeholder contacts for predicate-based pre-subscription.
//!
//! A [`StubContact`] lets a caller subscribe "to whoever eventually satisfies
//! predicate P" before any contact matching P exists. It reuses the
//! [`ContactBase`] subscription ledger but never aggregates live connections
//! itself; the registry relays matched data through
//! [`send_update_properties`](StubContact::send_update_properties) and
//! redirects messages once the stub is resolved to a real contact.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::contact::Contact;
use crate::contact_base::{ContactBase, ContactDataProvider, ContactNotifier};
use crate::properties::{ContactId, match_properties};

/// A forward-reference placeholder identified by a generated id and a
/// property-match predicate. Deleted by the registry once it has zero
/// subscriptions.
pub struct StubContact {
    base: ContactBase,
    match_properties: HashMap<String, Value>,
    resolved_contact: OnceLock<Arc<Contact>>,
}

impl StubContact {
    /// Create a stub for the given predicate under a generated id.
    pub fn new(
        contact_id: impl Into<ContactId>,
        match_properties: HashMap<String, Value>,
        notifier: Arc<dyn ContactNotifier>,
    ) -> Self {
        let contact_id = contact_id.into();
        log::debug!("StubContact -> contactId:{contact_id}");
        Self {
            base: ContactBase::new(contact_id, notifier),
            match_properties,
            resolved_contact: OnceLock::new(),
        }
    }

    /// The synthetic contact id of this stub.
    pub fn contact_id(&self) -> &str {
        self.base.contact_id()
    }

    /// The predicate a registering contact must satisfy to resolve this stub.
    pub fn match_properties(&self) -> &HashMap<String, Value> {
        &self.match_properties
    }

    /// True when the given aggregated properties satisfy the predicate.
    pub fn matches(&self, properties: &HashMap<String, Value>) -> bool {
        match_properties(&self.match_properties, properties)
    }

    /// The real contact this stub resolved to, if any.
    pub fn resolved_contact(&self) -> Option<&Arc<Contact>> {
        self.resolved_contact.get()
    }

    /// Record the real contact this stub resolved to. Set exactly once;
    /// later calls are ignored.
    pub fn set_resolved_contact(&self, contact: Arc<Contact>) {
        let _ = self.resolved_contact.set(contact);
    }

    /// True when at least one pending subscription targets this stub.
    pub fn has_subscriptions(&self) -> bool {
        self.base.has_subscriptions()
    }

    /// Register a pending subscription.
    pub fn add_subscription_properties(
        &self,
        connection_id: &str,
        self_connection_id: Option<&str>,
        property_names: &[String],
    ) {
        self.base
            .add_subscription_properties(connection_id, self_connection_id, property_names);
    }

    /// Remove one pending subscription.
    pub fn remove_subscription(&self, connection_id: &str, self_connection_id: Option<&str>) {
        self.base.remove_subscription(connection_id, self_connection_id);
    }

    /// Remove every pending subscription held by a connection.
    pub fn remove_all_subscriptions(&self, connection_id: &str) {
        self.base.remove_all_subscriptions(connection_id);
    }

    /// Relay matched contact data to this stub's subscribers, under the
    /// stub's synthetic id.
    pub async fn send_update_properties(
        &self,
        connection_id: &str,
        data_provider: &ContactDataProvider,
        affected_properties: &[String],
    ) {
        self.base
            .send_update_properties(connection_id, data_provider, affected_properties)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_base::testing::RecordingNotifier;
    use serde_json::json;

    fn predicate() -> HashMap<String, Value> {
        [("email".to_string(), json!("a@x.com"))].into()
    }

    #[test]
    fn test_matches_predicate() {
        let stub = StubContact::new("stub1", predicate(), RecordingNotifier::new());

        let matching: HashMap<String, Value> =
            [("email".to_string(), json!("a@x.com")), ("status".to_string(), json!("away"))]
                .into();
        let not_matching: HashMap<String, Value> = [("email".to_string(), json!("b@x.com"))].into();

        assert!(stub.matches(&matching));
        assert!(!stub.matches(&not_matching));
    }

    #[test]
    fn test_resolved_contact_set_once() {
        let notifier = RecordingNotifier::new();
        let stub = StubContact::new("stub1", predicate(), notifier.clone());
        assert!(stub.resolved_contact().is_none());

        let sink = Arc::new(NoopSink);
        let first = Arc::new(Contact::new("contact1", notifier.clone(), sink.clone()));
        let second = Arc::new(Contact::new("contact2", notifier, sink));

        stub.set_resolved_contact(first);
        stub.set_resolved_contact(second);
        assert_eq!(stub.resolved_contact().unwrap().contact_id(), "contact1");
    }

    #[test]
    fn test_relays_under_stub_id() {
        tokio_test::block_on(async {
            let notifier = RecordingNotifier::new();
            let stub = StubContact::new("stub1", predicate(), notifier.clone());
            stub.add_subscription_properties("subA", None, &["status".to_string()]);

            let provider = ContactDataProvider::Properties(
                [("status".to_string(), json!("available"))].into(),
            );
            stub.send_update_properties("conn1", &provider, &["status".to_string()])
                .await;

            let delivered = notifier.update_values_for("subA");
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].0.id, "stub1");
            assert_eq!(delivered[0].1["status"], json!("available"));
        });
    }

    struct NoopSink;

    #[async_trait::async_trait]
    impl crate::contact::ContactChangeSink for NoopSink {
        async fn contact_changed(&self, _changed: crate::backplane::ConnectionDataChanged) {}
    }
}
