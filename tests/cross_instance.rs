//! Federation scenarios: two registry instances wired through an in-memory
//! backplane, exercising replication, remote subscriptions, message relay and
//! stub resolution across instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use presence_registry::{
    aggregate_properties, match_properties, BackplaneCallbacks, BackplaneError, BackplaneProvider,
    ConnectionChangeType, ConnectionDataChanged, ContactConnections, ContactId, ContactNotifier,
    ContactReference, ContactUpdateType, MessageData, PresenceService, ServiceMetrics,
    ServiceOptions,
};

// ---------------------------------------------------------------------------
// Transport double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestNotifier {
    updates: Mutex<Vec<(String, ContactReference, HashMap<String, Value>)>>,
    messages: Mutex<Vec<(ContactReference, ContactReference, String, Value)>>,
}

impl TestNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn updates_for(&self, subscriber: &str) -> Vec<(ContactReference, HashMap<String, Value>)> {
        self.updates
            .lock()
            .iter()
            .filter(|(connection_id, _, _)| connection_id == subscriber)
            .map(|(_, contact, properties)| (contact.clone(), properties.clone()))
            .collect()
    }

    fn messages(&self) -> Vec<(ContactReference, ContactReference, String, Value)> {
        self.messages.lock().clone()
    }

    fn clear(&self) {
        self.updates.lock().clear();
        self.messages.lock().clear();
    }
}

#[async_trait]
impl ContactNotifier for TestNotifier {
    async fn notify_update_values(
        &self,
        subscriber_connection_id: &str,
        contact: ContactReference,
        properties: HashMap<String, Value>,
        _filter_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.updates.lock().push((
            subscriber_connection_id.to_string(),
            contact,
            properties,
        ));
        Ok(())
    }

    async fn notify_connection_changed(
        &self,
        _subscriber_connection_id: &str,
        _contact: ContactReference,
        _change_type: ConnectionChangeType,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify_receive_message(
        &self,
        target: ContactReference,
        from: ContactReference,
        message_type: &str,
        body: Value,
    ) -> anyhow::Result<()> {
        self.messages
            .lock()
            .push((target, from, message_type.to_string(), body));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backplane
// ---------------------------------------------------------------------------

/// Shared store plus callback fan-out, standing in for a real document store
/// or message bus.
#[derive(Default)]
struct Bus {
    contacts: Mutex<HashMap<ContactId, ContactConnections>>,
    subscribers: Mutex<Vec<Arc<dyn BackplaneCallbacks>>>,
}

struct BusProvider {
    bus: Arc<Bus>,
}

impl BusProvider {
    fn new(bus: Arc<Bus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl BackplaneProvider for BusProvider {
    fn priority(&self) -> u32 {
        0
    }

    fn set_callbacks(&self, callbacks: Arc<dyn BackplaneCallbacks>) {
        self.bus.subscribers.lock().push(callbacks);
    }

    async fn get_contact_data(
        &self,
        contact_id: &str,
    ) -> Result<Option<ContactConnections>, BackplaneError> {
        Ok(self.bus.contacts.lock().get(contact_id).cloned())
    }

    async fn get_contacts_data(
        &self,
        matching: &HashMap<String, Value>,
    ) -> Result<HashMap<ContactId, ContactConnections>, BackplaneError> {
        let store = self.bus.contacts.lock();
        Ok(store
            .iter()
            .filter(|(_, data)| {
                let aggregated = aggregate_properties(
                    data.iter().map(|(connection_id, bag)| (connection_id.as_str(), bag)),
                );
                match_properties(matching, &aggregated)
            })
            .map(|(contact_id, data)| (contact_id.clone(), data.clone()))
            .collect())
    }

    async fn update_contact(&self, changed: ConnectionDataChanged) -> Result<(), BackplaneError> {
        let (snapshot, affected) = {
            let mut store = self.bus.contacts.lock();
            let entry = store.entry(changed.contact_id.clone()).or_default();
            match changed.change_type {
                ContactUpdateType::Unregister => {
                    entry.remove(&changed.connection_id);
                }
                _ => {
                    let bag = entry.entry(changed.connection_id.clone()).or_default();
                    for (name, value) in &changed.data {
                        bag.insert(name.clone(), value.clone());
                    }
                }
            }
            let affected: Vec<String> = changed.data.keys().cloned().collect();
            (entry.clone(), affected)
        };

        let subscribers = self.bus.subscribers.lock().clone();
        for callbacks in subscribers {
            callbacks
                .on_contact_changed(changed.with_data(snapshot.clone()), affected.clone())
                .await;
        }
        Ok(())
    }

    async fn send_message(
        &self,
        service_id: &str,
        message: MessageData,
    ) -> Result<(), BackplaneError> {
        let subscribers = self.bus.subscribers.lock().clone();
        for callbacks in subscribers {
            callbacks
                .on_message_received(service_id.to_string(), message.clone())
                .await;
        }
        Ok(())
    }

    async fn update_metrics(
        &self,
        _service_id: &str,
        _service_info: Value,
        _metrics: ServiceMetrics,
    ) -> Result<(), BackplaneError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenario setup
// ---------------------------------------------------------------------------

struct Instance {
    service: Arc<PresenceService>,
    notifier: Arc<TestNotifier>,
}

fn two_instances() -> (Instance, Instance) {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = Arc::new(Bus::default());
    let make = |id: &str| {
        let notifier = TestNotifier::new();
        let service = PresenceService::new(ServiceOptions::with_id(id), notifier.clone());
        service.add_backplane_provider(BusProvider::new(bus.clone()));
        Instance { service, notifier }
    };
    (make("serviceA"), make("serviceB"))
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

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscription_follows_contact_on_other_instance() {
    let (a, b) = two_instances();

    a.service
        .register_self_contact(
            &ContactReference::new("contactA", "connA"),
            Some(props(&[("status", json!("available"))])),
        )
        .await
        .unwrap();
    b.service
        .register_self_contact(&ContactReference::new("contactB", "connB"), None)
        .await
        .unwrap();

    // the subscription snapshot is hydrated from the shared backplane store
    let snapshot = b
        .service
        .add_subscriptions(
            &ContactReference::new("contactB", "connB"),
            &[ContactReference::any("contactA")],
            &names(&["status"]),
        )
        .await
        .unwrap();
    assert_eq!(snapshot["contactA"]["status"], json!("available"));
    b.notifier.clear();

    // a property change on instance A reaches the subscriber on instance B
    a.service
        .update_properties(
            &ContactReference::new("contactA", "connA"),
            props(&[("status", json!("away"))]),
        )
        .await
        .unwrap();

    let delivered = b.notifier.updates_for("connB");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.id, "contactA");
    assert_eq!(delivered[0].1["status"], json!("away"));

    // so does the disconnect
    b.notifier.clear();
    a.service
        .unregister_self_contact(&ContactReference::new("contactA", "connA"), None)
        .await
        .unwrap();
    let delivered = b.notifier.updates_for("connB");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1["status"], Value::Null);
}

#[tokio::test]
async fn message_relayed_to_other_instance() {
    let (a, b) = two_instances();

    a.service
        .register_self_contact(&ContactReference::new("contactA", "connA"), None)
        .await
        .unwrap();
    b.service
        .register_self_contact(&ContactReference::new("contactB", "connB"), None)
        .await
        .unwrap();
    b.notifier.clear();

    // contactB is not present on instance A, delivery goes over the bus
    a.service
        .send_message(
            &ContactReference::new("contactA", "connA"),
            ContactReference::any("contactB"),
            "typeTest",
            json!({"text": "hello"}),
        )
        .await
        .unwrap();

    let messages = b.notifier.messages();
    assert_eq!(messages.len(), 1);
    let (target, from, message_type, body) = &messages[0];
    assert_eq!(target.id, "contactB");
    assert_eq!(target.connection_id.as_deref(), Some("connB"));
    assert_eq!(from.id, "contactA");
    assert_eq!(message_type, "typeTest");
    assert_eq!(body["text"], json!("hello"));

    // the sender's own instance does not double-deliver
    assert!(a.notifier.messages().is_empty());
}

#[tokio::test]
async fn stub_resolved_by_registration_on_other_instance() {
    let (a, b) = two_instances();

    b.service
        .register_self_contact(&ContactReference::new("contactB", "connB"), None)
        .await
        .unwrap();

    // nobody matches yet anywhere: a stub holds the subscription
    let results = b
        .service
        .request_subscriptions(
            &ContactReference::new("contactB", "connB"),
            vec![props(&[("email", json!("c@x.com"))])],
            &names(&["status"]),
            true,
        )
        .await
        .unwrap();
    let stub_id = results[0].as_ref().unwrap()["id"].as_str().unwrap().to_string();
    assert_ne!(stub_id, "contactC");
    assert_eq!(b.service.get_metrics().stub_contact_count, 1);
    b.notifier.clear();

    // the awaited identity registers on the other instance
    a.service
        .register_self_contact(
            &ContactReference::new("contactC", "connC"),
            Some(props(&[("email", json!("c@x.com")), ("status", json!("available"))])),
        )
        .await
        .unwrap();

    let delivered = b.notifier.updates_for("connB");
    assert!(delivered
        .iter()
        .any(|(contact, properties)| contact.id == stub_id
            && properties["status"] == json!("available")));
}
