//! A registered contact instance.
//!
//! A [`Contact`] aggregates one identity's property state from two sources:
//! the *self* connections live on this process and the *other* connections
//! replicated from remote instances through the backplane. All reads resolve
//! through the last-writer-wins merge in [`crate::properties`].
//!
//! Local mutations notify subscribers through the embedded [`ContactBase`]
//! and raise a change on the [`ContactChangeSink`] so the registry can
//! replicate them outward.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::backplane::{ConnectionDataChanged, ContactConnectionsChanged, ContactUpdateType};
use crate::contact_base::{ConnectionChangeType, ContactBase, ContactNotifier};
use crate::properties::{
    aggregate_properties, latest_property_value, ConnectionId, ConnectionProperties,
    ContactConnections, ContactId, ContactReference, PropertyValue, PROPERTY_WILDCARD,
};

/// Observer for replication-worthy contact mutations.
///
/// The registry installs one per contact; it fans every change out to all
/// registered backplane providers.
#[async_trait]
pub trait ContactChangeSink: Send + Sync {
    /// A local mutation happened on this contact.
    async fn contact_changed(&self, changed: ConnectionDataChanged);
}

/// Hook invoked with the properties a disconnect would orphan, before the
/// removal is committed. The transport layer uses it to absorb fast
/// reconnects by delaying the visible effect of a disconnect.
pub type AffectedPropertiesHook = Box<dyn FnOnce(Vec<String>) -> BoxFuture<'static, ()> + Send>;

/// Aggregated snapshot of a contact, as returned to match/search callers.
#[derive(Debug, Clone, Serialize)]
pub struct ContactData {
    /// The contact id.
    pub contact_id: ContactId,
    /// Aggregated properties across all connections.
    pub properties: HashMap<String, Value>,
    /// Plain property values per live self connection.
    pub connections: HashMap<ConnectionId, HashMap<String, Value>>,
}

struct SelfConnection {
    properties: ConnectionProperties,
    /// Bumped on every (re-)registration of this connection id; lets a
    /// pending graceful removal detect it has been superseded.
    epoch: u64,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// Aggregated presence state for one logical identity.
pub struct Contact {
    base: ContactBase,
    self_connections: RwLock<HashMap<ConnectionId, SelfConnection>>,
    other_connections: RwLock<ContactConnections>,
    /// connection id -> contact ids it subscribed to, for reverse cleanup.
    target_contacts: Mutex<HashMap<ConnectionId, HashSet<ContactId>>>,
    change_sink: Arc<dyn ContactChangeSink>,
    epoch_counter: AtomicU64,
    last_updated: Mutex<Instant>,
}

impl Contact {
    /// Create a contact owned by the registry.
    pub fn new(
        contact_id: impl Into<ContactId>,
        notifier: Arc<dyn ContactNotifier>,
        change_sink: Arc<dyn ContactChangeSink>,
    ) -> Self {
        let contact_id = contact_id.into();
        log::debug!("Contact -> contactId:{contact_id}");
        Self {
            base: ContactBase::new(contact_id, notifier),
            self_connections: RwLock::new(HashMap::new()),
            other_connections: RwLock::new(HashMap::new()),
            target_contacts: Mutex::new(HashMap::new()),
            change_sink,
            epoch_counter: AtomicU64::new(0),
            last_updated: Mutex::new(Instant::now()),
        }
    }

    /// The contact id.
    pub fn contact_id(&self) -> &str {
        self.base.contact_id()
    }

    /// True when this contact has no live self connection.
    pub fn is_self_empty(&self) -> bool {
        self.self_connections.read().is_empty()
    }

    /// Number of live self connections.
    pub fn self_connections_count(&self) -> usize {
        self.self_connections.read().len()
    }

    /// True when at least one subscription targets this contact.
    pub fn has_subscriptions(&self) -> bool {
        self.base.has_subscriptions()
    }

    /// Time since the last mutation (local or replicated), for eviction.
    pub fn idle_time(&self) -> std::time::Duration {
        self.last_updated.lock().elapsed()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a new self connection.
    ///
    /// Existing subscribers and the other self connections are notified of
    /// the added connection before the initial properties merge. Registering
    /// an already-known connection id does not duplicate its bag.
    pub async fn register_self(
        &self,
        connection_id: &str,
        initial_properties: Option<HashMap<String, Value>>,
    ) {
        // notify connection added (the new connection itself is not included)
        self.notify_connection_changed(connection_id, ConnectionChangeType::Added)
            .await;

        let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut self_connections = self.self_connections.write();
            let entry = self_connections
                .entry(connection_id.to_string())
                .or_insert_with(|| SelfConnection {
                    properties: ConnectionProperties::new(),
                    epoch: 0,
                });
            entry.epoch = epoch;
        }
        self.touch();

        if let Some(initial_properties) = initial_properties {
            self.update_properties_internal(
                connection_id,
                initial_properties,
                ContactUpdateType::Registration,
                true,
            )
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Target contact bookkeeping
    // -----------------------------------------------------------------------

    /// Track target contacts this connection subscribed to, for reverse
    /// cleanup on disconnect.
    pub fn add_target_contacts(&self, connection_id: &str, target_contact_ids: &[ContactId]) {
        self.target_contacts
            .lock()
            .entry(connection_id.to_string())
            .or_default()
            .extend(target_contact_ids.iter().cloned());
    }

    /// Stop tracking target contacts for a connection.
    pub fn remove_target_contacts(&self, connection_id: &str, target_contact_ids: &[ContactId]) {
        if let Some(targets) = self.target_contacts.lock().get_mut(connection_id) {
            for target_contact_id in target_contact_ids {
                targets.remove(target_contact_id);
            }
        }
    }

    /// The target contacts a connection is tracking.
    pub fn get_target_contacts(&self, connection_id: &str) -> Vec<ContactId> {
        self.target_contacts
            .lock()
            .get(connection_id)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscription and return a snapshot of the current values.
    ///
    /// A `None` filter means "aggregated across all connections"; a specific
    /// connection id restricts both the snapshot and later notifications to
    /// that connection's values.
    pub fn create_subscription(
        &self,
        connection_id: &str,
        self_connection_id: Option<&str>,
        property_names: &[String],
    ) -> HashMap<String, Value> {
        self.base
            .add_subscription_properties(connection_id, self_connection_id, property_names);

        if property_names.iter().any(|n| n == PROPERTY_WILDCARD) {
            self.get_all_properties(self_connection_id)
        } else {
            property_names
                .iter()
                .map(|name| (name.clone(), self.get_property_value(self_connection_id, name)))
                .collect()
        }
    }

    /// Register a subscription without resolving current values (used for
    /// backplane-matched targets whose snapshot was already returned).
    pub fn add_subscription_properties(
        &self,
        connection_id: &str,
        self_connection_id: Option<&str>,
        property_names: &[String],
    ) {
        self.base
            .add_subscription_properties(connection_id, self_connection_id, property_names);
    }

    /// Remove one subscription.
    pub fn remove_subscription(&self, connection_id: &str, self_connection_id: Option<&str>) {
        self.base.remove_subscription(connection_id, self_connection_id);
    }

    /// Remove every subscription held by a connection.
    pub fn remove_all_subscriptions(&self, connection_id: &str) {
        self.base.remove_all_subscriptions(connection_id);
    }

    // -----------------------------------------------------------------------
    // Property updates
    // -----------------------------------------------------------------------

    /// Merge a property batch published by one of the self connections and
    /// notify subscribers plus the contact's other connections.
    pub async fn update_properties(&self, connection_id: &str, properties: HashMap<String, Value>) {
        self.update_properties_internal(
            connection_id,
            properties,
            ContactUpdateType::UpdateProperties,
            true,
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// True when a message scoped to `target_connection_id` (or unscoped)
    /// could be delivered to a live self connection.
    pub fn can_send_message(&self, target_connection_id: Option<&str>) -> bool {
        match target_connection_id {
            None => !self.is_self_empty(),
            Some(connection_id) => self.self_connections.read().contains_key(connection_id),
        }
    }

    /// Deliver a message to one named self connection, or broadcast to all
    /// self connections when none is named.
    pub async fn send_receive_message(
        &self,
        from_contact: ContactReference,
        message_type: &str,
        body: Value,
        target_connection_id: Option<&str>,
    ) {
        let target_connection_ids: Vec<ConnectionId> = match target_connection_id {
            Some(connection_id) => vec![connection_id.to_string()],
            None => self.self_connections.read().keys().cloned().collect(),
        };

        join_all(target_connection_ids.into_iter().map(|connection_id| {
            let target = ContactReference::new(self.contact_id().to_string(), connection_id);
            let from = from_contact.clone();
            let body = body.clone();
            async move {
                self.base
                    .notify_receive_message(target, from, message_type, body)
                    .await;
            }
        }))
        .await;
    }

    // -----------------------------------------------------------------------
    // Disconnect
    // -----------------------------------------------------------------------

    /// Remove a self connection.
    ///
    /// When a hook is supplied it is awaited with the properties the removal
    /// would orphan before anything is committed (the grace point). A
    /// re-registration of the same connection id during the hook supersedes
    /// the removal entirely. Subscribers are notified only for properties
    /// whose aggregated value actually changed.
    pub async fn remove_self_connection(
        &self,
        connection_id: &str,
        affected_properties_hook: Option<AffectedPropertiesHook>,
    ) {
        let epoch = match self.self_connections.read().get(connection_id) {
            Some(entry) => entry.epoch,
            // the connection was never registered or already dropped
            None => return,
        };

        self.target_contacts.lock().remove(connection_id);

        let affected_properties: Vec<String> = {
            let self_connections = self.self_connections.read();
            self_connections
                .get(connection_id)
                .map(|entry| entry.properties.keys().cloned().collect())
                .unwrap_or_default()
        };

        // values every subscription currently resolves to, for diffing below
        let before_snapshot = self.connections_snapshot();
        let before_batches = self.base.subscriptions_notify_properties(
            &affected_properties,
            &|self_connection_id, name| {
                snapshot_property_value(&before_snapshot, self_connection_id, name)
            },
            None,
        );

        if let Some(hook) = affected_properties_hook {
            hook(affected_properties.clone()).await;

            // a re-registration during the grace window supersedes the removal
            match self.self_connections.read().get(connection_id) {
                Some(entry) if entry.epoch == epoch => {}
                _ => {
                    log::debug!(
                        "removeSelfConnection superseded -> contactId:{} connectionId:{connection_id}",
                        self.contact_id()
                    );
                    return;
                }
            }
        }

        self.self_connections.write().remove(connection_id);
        self.touch();

        // notify only the subscriptions whose resolved values actually changed
        let after_snapshot = self.connections_snapshot();
        let after_batches = self.base.subscriptions_notify_properties(
            &affected_properties,
            &|self_connection_id, name| {
                snapshot_property_value(&after_snapshot, self_connection_id, name)
            },
            None,
        );
        let changed_batches: HashMap<_, _> = after_batches
            .into_iter()
            .filter(|(key, properties)| before_batches.get(key) != Some(properties))
            .collect();

        // replicate the unregistration with absent-value markers
        let absent_properties: ConnectionProperties = affected_properties
            .iter()
            .map(|name| (name.clone(), PropertyValue::absent()))
            .collect();
        self.fire_change(connection_id, absent_properties, ContactUpdateType::Unregister)
            .await;

        self.base
            .dispatch_update_values(changed_batches, Some(connection_id))
            .await;

        self.notify_connection_changed(connection_id, ConnectionChangeType::Removed)
            .await;
    }

    // -----------------------------------------------------------------------
    // Replication inbound
    // -----------------------------------------------------------------------

    /// Replace the replicated connection state of this contact.
    ///
    /// Connection ids already live as self connections are dropped to keep
    /// the self/other maps disjoint.
    pub fn set_other_connection_properties(&self, other_connections: ContactConnections) {
        let filtered: ContactConnections = {
            let self_connections = self.self_connections.read();
            other_connections
                .into_iter()
                .filter(|(connection_id, _)| !self_connections.contains_key(connection_id))
                .collect()
        };
        *self.other_connections.write() = filtered;
        self.touch();
    }

    /// Apply a remote snapshot coming from a backplane provider and push the
    /// resulting aggregated values to local subscribers.
    pub async fn on_contact_changed(
        &self,
        changed: ContactConnectionsChanged,
        affected_properties: &[String],
    ) {
        log::debug!(
            "contact onContactChanged -> contactId:{} serviceId:{} type:{:?}",
            self.contact_id(),
            changed.service_id,
            changed.change_type
        );

        self.set_other_connection_properties(changed.data);

        match changed.change_type {
            ContactUpdateType::Registration => {
                self.notify_connection_changed(&changed.connection_id, ConnectionChangeType::Added)
                    .await;
            }
            ContactUpdateType::Unregister => {
                self.notify_connection_changed(
                    &changed.connection_id,
                    ConnectionChangeType::Removed,
                )
                .await;
            }
            _ => {}
        }

        // push already-merged values; nothing to re-merge or re-replicate
        let notify_properties = self.get_aggregated_properties(Some(affected_properties));
        self.update_properties_internal(
            &changed.connection_id,
            notify_properties,
            ContactUpdateType::None,
            false,
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    /// Union the self and other property bags and keep, per property, the
    /// value with the greatest update timestamp.
    ///
    /// With a filter, the result is restricted to the filtered names and
    /// absence markers are injected so that a removed property still yields
    /// an explicit `null` entry (forcing a removal notification downstream).
    pub fn get_aggregated_properties(&self, filter: Option<&[String]>) -> HashMap<String, Value> {
        let mut snapshot = self.connections_snapshot();
        if let Some(filter) = filter {
            let markers: ConnectionProperties = filter
                .iter()
                .map(|name| (name.clone(), PropertyValue::absent()))
                .collect();
            snapshot.push((String::new(), markers));
        }

        let mut aggregated = aggregate_properties(
            snapshot
                .iter()
                .map(|(connection_id, bag)| (connection_id.as_str(), bag)),
        );
        if let Some(filter) = filter {
            aggregated.retain(|name, _| filter.contains(name));
        }
        aggregated
    }

    /// Property bags of all known connections, self and replicated.
    pub fn get_self_connections(&self) -> ContactConnections {
        self.connections_snapshot().into_iter().collect()
    }

    /// Aggregated snapshot for match/search responses.
    pub fn to_contact_data(&self) -> ContactData {
        let connections = self
            .self_connections
            .read()
            .iter()
            .map(|(connection_id, entry)| {
                (
                    connection_id.clone(),
                    entry
                        .properties
                        .iter()
                        .map(|(name, pv)| (name.clone(), pv.value.clone()))
                        .collect(),
                )
            })
            .collect();

        ContactData {
            contact_id: self.contact_id().to_string(),
            properties: self.get_aggregated_properties(None),
            connections,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn update_properties_internal(
        &self,
        connection_id: &str,
        update_properties: HashMap<String, Value>,
        change_type: ContactUpdateType,
        merge: bool,
    ) {
        let updated = Utc::now();
        if merge {
            let mut self_connections = self.self_connections.write();
            let entry = self_connections
                .entry(connection_id.to_string())
                .or_insert_with(|| SelfConnection {
                    properties: ConnectionProperties::new(),
                    epoch: 0,
                });
            for (name, value) in &update_properties {
                entry
                    .properties
                    .insert(name.clone(), PropertyValue::new(value.clone(), updated));
            }
            drop(self_connections);
            self.touch();
        }

        let affected_properties: Vec<String> = update_properties.keys().cloned().collect();
        let snapshot = self.connections_snapshot();
        let self_connection_ids: HashSet<ConnectionId> =
            self.self_connections.read().keys().cloned().collect();

        // external subscriptions: unscoped ones aggregate, scoped ones only
        // when scoped to the mutating connection; the contact's own unscoped
        // self subscriptions are served by the explicit self notify below
        let resolver = |self_connection_id: Option<&str>, name: &str| {
            snapshot_property_value(&snapshot, self_connection_id, name)
        };
        let subscription_filter = |notify_connection_id: &str, self_connection_id: Option<&str>| {
            (!self_connection_ids.contains(notify_connection_id) && self_connection_id.is_none())
                || self_connection_id == Some(connection_id)
        };
        let external = self.base.send_update_values(
            Some(connection_id),
            &affected_properties,
            &resolver,
            Some(&subscription_filter),
        );

        // notify the contact's other live connections with the raw batch
        let self_notify = join_all(self_connection_ids.iter().map(|self_connection_id| {
            let properties = update_properties.clone();
            async move {
                self.base
                    .notify_update_values(self_connection_id, properties, Some(connection_id), None)
                    .await;
            }
        }));

        futures::join!(external, self_notify);

        if change_type != ContactUpdateType::None {
            let changed_values: ConnectionProperties = update_properties
                .into_iter()
                .map(|(name, value)| (name, PropertyValue::new(value, updated)))
                .collect();
            self.fire_change(connection_id, changed_values, change_type).await;
        }
    }

    async fn fire_change(
        &self,
        connection_id: &str,
        properties: ConnectionProperties,
        change_type: ContactUpdateType,
    ) {
        let changed = ConnectionDataChanged {
            change_id: uuid::Uuid::new_v4().to_string(),
            // the registry's fanout stamps its own service id on the wire;
            // filled here for completeness of the local envelope
            service_id: String::new(),
            connection_id: connection_id.to_string(),
            contact_id: self.contact_id().to_string(),
            change_type,
            data: properties,
        };
        self.change_sink.contact_changed(changed).await;
    }

    async fn notify_connection_changed(&self, connection_id: &str, change_type: ConnectionChangeType) {
        let recipients: HashSet<ConnectionId> = self
            .base
            .subscription_connection_ids()
            .into_iter()
            .chain(self.self_connections.read().keys().cloned())
            .filter(|recipient| recipient != connection_id)
            .collect();
        self.base
            .notify_connection_changed(recipients, connection_id, change_type)
            .await;
    }

    fn connections_snapshot(&self) -> Vec<(ConnectionId, ConnectionProperties)> {
        let mut snapshot: Vec<(ConnectionId, ConnectionProperties)> = self
            .self_connections
            .read()
            .iter()
            .map(|(connection_id, entry)| (connection_id.clone(), entry.properties.clone()))
            .collect();
        snapshot.extend(
            self.other_connections
                .read()
                .iter()
                .map(|(connection_id, bag)| (connection_id.clone(), bag.clone())),
        );
        snapshot
    }

    fn get_property_value(&self, connection_id: Option<&str>, property_name: &str) -> Value {
        let snapshot = self.connections_snapshot();
        snapshot_property_value(&snapshot, connection_id, property_name)
    }

    fn get_all_properties(&self, connection_id: Option<&str>) -> HashMap<String, Value> {
        match connection_id {
            Some(connection_id) => {
                if let Some(entry) = self.self_connections.read().get(connection_id) {
                    return entry
                        .properties
                        .iter()
                        .map(|(name, pv)| (name.clone(), pv.value.clone()))
                        .collect();
                }
                self.other_connections
                    .read()
                    .get(connection_id)
                    .map(|bag| {
                        bag.iter()
                            .map(|(name, pv)| (name.clone(), pv.value.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None => self.get_aggregated_properties(None),
        }
    }

    fn touch(&self) {
        *self.last_updated.lock() = Instant::now();
    }
}

/// Resolve a property against a connections snapshot: scoped to a single
/// connection's bag, or aggregated when unscoped.
fn snapshot_property_value(
    snapshot: &[(ConnectionId, ConnectionProperties)],
    connection_id: Option<&str>,
    property_name: &str,
) -> Value {
    match connection_id {
        Some(connection_id) => snapshot
            .iter()
            .find(|(id, _)| id == connection_id)
            .and_then(|(_, bag)| bag.get(property_name))
            .map(|pv| pv.value.clone())
            .unwrap_or(Value::Null),
        None => latest_property_value(
            snapshot.iter().map(|(id, bag)| (id.as_str(), bag)),
            property_name,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_base::testing::{NotifierEvent, RecordingNotifier};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        changes: Mutex<Vec<ConnectionDataChanged>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn changes(&self) -> Vec<ConnectionDataChanged> {
            self.changes.lock().clone()
        }
    }

    #[async_trait]
    impl ContactChangeSink for RecordingSink {
        async fn contact_changed(&self, changed: ConnectionDataChanged) {
            self.changes.lock().push(changed);
        }
    }

    fn props(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn new_contact(id: &str) -> (Arc<Contact>, Arc<RecordingNotifier>, Arc<RecordingSink>) {
        let notifier = RecordingNotifier::new();
        let sink = RecordingSink::new();
        let contact = Arc::new(Contact::new(id, notifier.clone(), sink.clone()));
        (contact, notifier, sink)
    }

    #[tokio::test]
    async fn test_register_self_idempotent() {
        let (contact, _, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;

        assert_eq!(contact.self_connections_count(), 1);
        assert_eq!(
            contact.get_aggregated_properties(None)["status"],
            json!("available")
        );
    }

    #[tokio::test]
    async fn test_register_fires_registration_change() {
        let (contact, _, sink) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;

        let changes = sink.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ContactUpdateType::Registration);
        assert_eq!(changes[0].contact_id, "contact1");
        assert_eq!(changes[0].data["status"].value, json!("available"));
    }

    #[tokio::test]
    async fn test_lww_across_connections() {
        let (contact, _, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        contact
            .register_self("conn2", Some(props(&[("status", json!("away"))])))
            .await;

        assert_eq!(contact.get_aggregated_properties(None)["status"], json!("away"));
    }

    #[tokio::test]
    async fn test_selective_fanout() {
        let (contact, notifier, _) = new_contact("contact1");
        contact.register_self("conn1", None).await;
        contact.create_subscription("subStatus", None, &names(&["status"]));
        contact.create_subscription("subAll", None, &names(&["*"]));
        notifier.clear();

        contact
            .update_properties(
                "conn1",
                props(&[("status", json!("away")), ("email", json!("a@x.com"))]),
            )
            .await;

        let status_only = notifier.update_values_for("subStatus");
        assert_eq!(status_only.len(), 1);
        assert_eq!(status_only[0].1, props(&[("status", json!("away"))]));

        let all = notifier.update_values_for("subAll");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_update_notifies_other_self_connections() {
        let (contact, notifier, _) = new_contact("contact1");
        contact.register_self("conn1", None).await;
        contact.register_self("conn2", None).await;
        notifier.clear();

        contact
            .update_properties("conn1", props(&[("status", json!("busy"))]))
            .await;

        // both self connections get the raw batch (including the source, as
        // a confirmation echo)
        assert_eq!(notifier.update_values_for("conn1").len(), 1);
        assert_eq!(notifier.update_values_for("conn2").len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_subscription_follows_one_connection() {
        let (contact, notifier, _) = new_contact("contact1");
        contact.register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        contact.register_self("conn2", Some(props(&[("status", json!("busy"))])))
            .await;

        let snapshot = contact.create_subscription("subA", Some("conn1"), &names(&["status"]));
        assert_eq!(snapshot["status"], json!("available"));

        notifier.clear();
        // a change on conn2 must not notify the conn1-scoped subscription
        contact
            .update_properties("conn2", props(&[("status", json!("offline"))]))
            .await;
        assert!(notifier.update_values_for("subA").is_empty());

        contact
            .update_properties("conn1", props(&[("status", json!("away"))]))
            .await;
        let delivered = notifier.update_values_for("subA");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["status"], json!("away"));
    }

    #[tokio::test]
    async fn test_create_subscription_snapshot() {
        let (contact, _, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;

        let snapshot = contact.create_subscription("subA", None, &names(&["status", "email"]));
        assert_eq!(snapshot["status"], json!("available"));
        assert_eq!(snapshot["email"], Value::Null);
    }

    #[tokio::test]
    async fn test_remove_last_connection_notifies_absence() {
        let (contact, notifier, sink) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        contact.create_subscription("subA", None, &names(&["status"]));
        notifier.clear();

        contact.remove_self_connection("conn1", None).await;

        assert!(contact.is_self_empty());
        let delivered = notifier.update_values_for("subA");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["status"], Value::Null);

        let last_change = sink.changes().pop().unwrap();
        assert_eq!(last_change.change_type, ContactUpdateType::Unregister);
        assert!(last_change.data.contains_key("status"));
    }

    #[tokio::test]
    async fn test_remove_connection_no_notification_when_value_survives() {
        let (contact, notifier, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        contact
            .register_self("conn2", Some(props(&[("status", json!("available"))])))
            .await;
        contact.create_subscription("subA", None, &names(&["status"]));
        notifier.clear();

        // conn1's value is older; removing it does not change the aggregate
        contact.remove_self_connection("conn1", None).await;
        assert!(notifier.update_values_for("subA").is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_connection_is_noop() {
        let (contact, notifier, sink) = new_contact("contact1");
        contact.remove_self_connection("ghost", None).await;
        assert!(notifier.events().is_empty());
        assert!(sink.changes().is_empty());
    }

    #[tokio::test]
    async fn test_grace_hook_sees_affected_properties() {
        let (contact, _, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_hook = seen.clone();
        let hook: AffectedPropertiesHook = Box::new(move |affected| {
            Box::pin(async move {
                *seen_in_hook.lock() = affected;
            })
        });

        contact.remove_self_connection("conn1", Some(hook)).await;
        assert_eq!(*seen.lock(), vec!["status".to_string()]);
        assert!(contact.is_self_empty());
    }

    #[tokio::test]
    async fn test_reconnect_during_grace_supersedes_removal() {
        let (contact, notifier, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;
        contact.create_subscription("subA", None, &names(&["status"]));
        notifier.clear();

        let contact_in_hook = contact.clone();
        let hook: AffectedPropertiesHook = Box::new(move |_| {
            Box::pin(async move {
                // the same connection id comes back before the grace elapses
                contact_in_hook.register_self("conn1", None).await;
            })
        });

        contact.remove_self_connection("conn1", Some(hook)).await;
        assert_eq!(contact.self_connections_count(), 1);
        assert!(notifier.update_values_for("subA").is_empty());
    }

    #[tokio::test]
    async fn test_on_contact_changed_merges_other_state() {
        let (contact, notifier, sink) = new_contact("contact1");
        contact.create_subscription("subA", None, &names(&["status"]));
        notifier.clear();

        let remote_bag: ConnectionProperties = [(
            "status".to_string(),
            PropertyValue::new(json!("available"), Utc::now()),
        )]
        .into();
        let changed = ContactConnectionsChanged::new(
            "service2",
            "remoteConn",
            "contact1",
            ContactUpdateType::Registration,
            [("remoteConn".to_string(), remote_bag)].into(),
        );

        contact.on_contact_changed(changed, &names(&["status"])).await;

        assert_eq!(
            contact.get_aggregated_properties(None)["status"],
            json!("available")
        );
        let delivered = notifier.update_values_for("subA");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["status"], json!("available"));
        // replicated changes are not re-replicated
        assert!(sink.changes().is_empty());
    }

    #[tokio::test]
    async fn test_self_and_other_maps_stay_disjoint() {
        let (contact, _, _) = new_contact("contact1");
        contact
            .register_self("conn1", Some(props(&[("status", json!("available"))])))
            .await;

        let stale_bag: ConnectionProperties = [(
            "status".to_string(),
            PropertyValue::new(json!("stale"), Utc::now()),
        )]
        .into();
        // a replicated snapshot echoing our own connection id is dropped
        contact.set_other_connection_properties([("conn1".to_string(), stale_bag)].into());

        assert_eq!(contact.get_self_connections().len(), 1);
        assert_eq!(
            contact.get_aggregated_properties(None)["status"],
            json!("available")
        );
    }

    #[tokio::test]
    async fn test_send_receive_message_broadcast_and_scoped() {
        let (contact, notifier, _) = new_contact("contact1");
        contact.register_self("conn1", None).await;
        contact.register_self("conn2", None).await;
        notifier.clear();

        let from = ContactReference::new("contact2", "connX");
        contact
            .send_receive_message(from.clone(), "typeTest", json!("hi"), None)
            .await;

        let targets: Vec<ContactReference> = notifier
            .events()
            .into_iter()
            .filter_map(|event| match event {
                NotifierEvent::ReceiveMessage { target, .. } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 2);

        notifier.clear();
        contact
            .send_receive_message(from, "typeTest", json!("hi"), Some("conn2"))
            .await;
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_changed_notifications() {
        let (contact, notifier, _) = new_contact("contact1");
        contact.register_self("conn1", None).await;
        contact.create_subscription("subA", None, &names(&["status"]));
        notifier.clear();

        contact.register_self("conn2", None).await;

        let recipients: Vec<String> = notifier
            .events()
            .into_iter()
            .filter_map(|event| match event {
                NotifierEvent::ConnectionChanged {
                    subscriber_connection_id,
                    change_type: ConnectionChangeType::Added,
                    contact,
                } if contact.connection_id.as_deref() == Some("conn2") => {
                    Some(subscriber_connection_id)
                }
                _ => None,
            })
            .collect();
        assert!(recipients.contains(&"subA".to_string()));
        assert!(recipients.contains(&"conn1".to_string()));
    }

    #[tokio::test]
    async fn test_target_contact_bookkeeping() {
        let (contact, _, _) = new_contact("contact1");
        contact.add_target_contacts("conn1", &["contact2".to_string(), "contact3".to_string()]);
        contact.add_target_contacts("conn1", &["contact3".to_string()]);

        let mut targets = contact.get_target_contacts("conn1");
        targets.sort();
        assert_eq!(targets, vec!["contact2".to_string(), "contact3".to_string()]);

        contact.remove_target_contacts("conn1", &["contact2".to_string()]);
        assert_eq!(contact.get_target_contacts("conn1"), vec!["contact3".to_string()]);
        assert!(contact.get_target_contacts("conn2").is_empty());
    }
}
