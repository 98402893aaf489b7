//! Shared subscription ledger and notification dispatch.
//!
//! [`ContactBase`] is the machinery common to real contacts and stub
//! contacts: it tracks who subscribed to which properties and fans changes
//! out to the transport collaborator behind the [`ContactNotifier`] trait.
//!
//! The core matching algorithm is
//! [`subscriptions_notify_properties`](ContactBase::subscriptions_notify_properties):
//! for each active subscription, intersect its property set with the changed
//! properties (a wildcard or empty set takes everything), resolve current
//! values through the supplied resolver and emit one notification batch per
//! subscription. Different resolvers are plugged in for a live contact, a
//! stub relaying registry matches, or a raw replicated snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::properties::{
    aggregate_properties, ConnectionId, ContactConnections, ContactId, ContactReference,
    PROPERTY_WILDCARD,
};

/// Key of one subscription: the subscriber's connection and an optional
/// filter restricting it to a single self connection of the target.
pub type SubscriptionKey = (ConnectionId, Option<ConnectionId>);

/// Kind of connection lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionChangeType {
    /// A connection of the observed contact appeared.
    Added,
    /// A connection of the observed contact went away.
    Removed,
}

// ---------------------------------------------------------------------------
// ContactNotifier trait
// ---------------------------------------------------------------------------

/// Outbound notification sink, implemented by the transport layer.
///
/// Every method targets one subscriber connection; delivery failures are
/// isolated by the caller and never abort the state change that triggered
/// them.
#[async_trait]
pub trait ContactNotifier: Send + Sync {
    /// Property values of `contact` changed. `contact.connection_id` is the
    /// connection that caused the change; `filter_connection_id` echoes the
    /// subscription's self-connection filter, if any.
    async fn notify_update_values(
        &self,
        subscriber_connection_id: &str,
        contact: ContactReference,
        properties: HashMap<String, Value>,
        filter_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// A connection of the observed contact was added or removed.
    async fn notify_connection_changed(
        &self,
        subscriber_connection_id: &str,
        contact: ContactReference,
        change_type: ConnectionChangeType,
    ) -> anyhow::Result<()>;

    /// Deliver a message to one connection of the target contact.
    async fn notify_receive_message(
        &self,
        target: ContactReference,
        from: ContactReference,
        message_type: &str,
        body: Value,
    ) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ContactDataProvider
// ---------------------------------------------------------------------------

/// Source of property values used when relaying changes that did not
/// originate from a live local contact.
pub enum ContactDataProvider {
    /// A ready-made aggregated property map.
    Properties(HashMap<String, Value>),
    /// A full per-connection snapshot, aggregated on demand.
    Connections(ContactConnections),
}

impl ContactDataProvider {
    /// The aggregated property map of this source.
    pub fn properties(&self) -> HashMap<String, Value> {
        match self {
            ContactDataProvider::Properties(properties) => properties.clone(),
            ContactDataProvider::Connections(connections) => aggregate_properties(
                connections
                    .iter()
                    .map(|(connection_id, bag)| (connection_id.as_str(), bag)),
            ),
        }
    }

    /// Resolve one property, optionally scoped to a single connection.
    ///
    /// The aggregated flavor has no per-connection detail and answers scoped
    /// lookups from the aggregated map.
    pub fn resolve(&self, self_connection_id: Option<&str>, property_name: &str) -> Value {
        match (self, self_connection_id) {
            (ContactDataProvider::Connections(connections), Some(connection_id)) => connections
                .get(connection_id)
                .and_then(|bag| bag.get(property_name))
                .map(|pv| pv.value.clone())
                .unwrap_or(Value::Null),
            _ => self
                .properties()
                .remove(property_name)
                .unwrap_or(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// ContactBase
// ---------------------------------------------------------------------------

/// Per-identity subscription ledger plus notification dispatch, shared by
/// [`Contact`](crate::contact::Contact) and
/// [`StubContact`](crate::stub_contact::StubContact).
pub struct ContactBase {
    contact_id: ContactId,
    subscriptions: Mutex<HashMap<SubscriptionKey, Vec<String>>>,
    notifier: Arc<dyn ContactNotifier>,
}

impl ContactBase {
    /// Create the ledger for one contact id.
    pub fn new(contact_id: impl Into<ContactId>, notifier: Arc<dyn ContactNotifier>) -> Self {
        Self {
            contact_id: contact_id.into(),
            subscriptions: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// The contact id this ledger belongs to.
    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    /// The transport sink notifications are forwarded to.
    pub fn notifier(&self) -> &Arc<dyn ContactNotifier> {
        &self.notifier
    }

    /// True when at least one subscription is registered.
    pub fn has_subscriptions(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    /// Register (or replace) a subscription. Property names are deduplicated.
    pub fn add_subscription_properties(
        &self,
        connection_id: &str,
        self_connection_id: Option<&str>,
        property_names: &[String],
    ) {
        let mut names: Vec<String> = property_names.to_vec();
        names.sort();
        names.dedup();

        self.subscriptions.lock().insert(
            (connection_id.to_string(), self_connection_id.map(String::from)),
            names,
        );
    }

    /// Remove one subscription; returns whether it existed.
    pub fn remove_subscription(&self, connection_id: &str, self_connection_id: Option<&str>) -> bool {
        self.subscriptions
            .lock()
            .remove(&(connection_id.to_string(), self_connection_id.map(String::from)))
            .is_some()
    }

    /// Remove every subscription held by a subscriber connection.
    pub fn remove_all_subscriptions(&self, connection_id: &str) {
        self.subscriptions
            .lock()
            .retain(|(subscriber, _), _| subscriber != connection_id);
    }

    /// Distinct subscriber connection ids.
    pub fn subscription_connection_ids(&self) -> HashSet<ConnectionId> {
        self.subscriptions
            .lock()
            .keys()
            .map(|(connection_id, _)| connection_id.clone())
            .collect()
    }

    /// Match the changed properties against every subscription and resolve
    /// the values to notify.
    ///
    /// Returns one property batch per subscription with a non-empty
    /// intersection. `resolver(self_connection_id, property_name)` supplies
    /// the current value; `filter(subscriber_connection_id,
    /// self_connection_id)` can exclude subscriptions up front.
    pub fn subscriptions_notify_properties(
        &self,
        affected_properties: &[String],
        resolver: &(dyn Fn(Option<&str>, &str) -> Value + Sync),
        filter: Option<&(dyn Fn(&str, Option<&str>) -> bool + Sync)>,
    ) -> HashMap<SubscriptionKey, HashMap<String, Value>> {
        let subscriptions: Vec<(SubscriptionKey, Vec<String>)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(key, names)| (key.clone(), names.clone()))
            .collect();

        let mut result = HashMap::new();
        for ((connection_id, self_connection_id), names) in subscriptions {
            if let Some(filter) = filter {
                if !filter(&connection_id, self_connection_id.as_deref()) {
                    continue;
                }
            }

            // an empty set or a wildcard entry subscribes to everything
            let wildcard = names.is_empty() || names.iter().any(|n| n == PROPERTY_WILDCARD);
            let notify_names: Vec<&String> = if wildcard {
                affected_properties.iter().collect()
            } else {
                affected_properties
                    .iter()
                    .filter(|name| names.contains(name))
                    .collect()
            };

            if notify_names.is_empty() {
                continue;
            }

            let notify_properties: HashMap<String, Value> = notify_names
                .into_iter()
                .map(|name| {
                    (
                        name.clone(),
                        resolver(self_connection_id.as_deref(), name),
                    )
                })
                .collect();
            result.insert((connection_id, self_connection_id), notify_properties);
        }

        result
    }

    /// Dispatch one resolved batch per subscription, all deliveries
    /// concurrent, failures isolated.
    pub async fn dispatch_update_values(
        &self,
        notify_batches: HashMap<SubscriptionKey, HashMap<String, Value>>,
        source_connection_id: Option<&str>,
    ) {
        join_all(notify_batches.into_iter().map(
            |((connection_id, self_connection_id), properties)| async move {
                self.notify_update_values(
                    &connection_id,
                    properties,
                    source_connection_id,
                    self_connection_id.as_deref(),
                )
                .await;
            },
        ))
        .await;
    }

    /// Match, resolve and dispatch in one step.
    pub async fn send_update_values(
        &self,
        source_connection_id: Option<&str>,
        affected_properties: &[String],
        resolver: &(dyn Fn(Option<&str>, &str) -> Value + Sync),
        filter: Option<&(dyn Fn(&str, Option<&str>) -> bool + Sync)>,
    ) {
        let batches = self.subscriptions_notify_properties(affected_properties, resolver, filter);
        self.dispatch_update_values(batches, source_connection_id).await;
    }

    /// Relay externally-sourced values (stub matches, replicated snapshots)
    /// to this ledger's subscribers.
    ///
    /// Unscoped subscriptions and subscriptions scoped to the originating
    /// connection are notified; other scoped subscriptions are untouched.
    pub async fn send_update_properties(
        &self,
        connection_id: &str,
        data_provider: &ContactDataProvider,
        affected_properties: &[String],
    ) {
        self.send_update_values(
            Some(connection_id),
            affected_properties,
            &|self_connection_id, property_name| {
                data_provider.resolve(self_connection_id, property_name)
            },
            Some(&|_: &str, self_connection_id: Option<&str>| {
                self_connection_id.is_none() || self_connection_id == Some(connection_id)
            }),
        )
        .await;
    }

    /// Notify one subscriber of changed values, logging and swallowing
    /// delivery failures.
    pub async fn notify_update_values(
        &self,
        subscriber_connection_id: &str,
        properties: HashMap<String, Value>,
        source_connection_id: Option<&str>,
        filter_connection_id: Option<&str>,
    ) {
        log::debug!(
            "notify updateValues -> subscriber:{} contactId:{} properties:{:?}",
            subscriber_connection_id,
            self.contact_id,
            properties.keys()
        );

        let contact = ContactReference {
            id: self.contact_id.clone(),
            connection_id: source_connection_id.map(String::from),
        };
        if let Err(error) = self
            .notifier
            .notify_update_values(
                subscriber_connection_id,
                contact,
                properties,
                filter_connection_id,
            )
            .await
        {
            log::warn!(
                "failed to notify updateValues to connection:{}: {error:#}",
                subscriber_connection_id
            );
        }
    }

    /// Notify a set of recipient connections that `changed_connection_id`
    /// was added to or removed from this contact.
    pub async fn notify_connection_changed<I>(
        &self,
        recipients: I,
        changed_connection_id: &str,
        change_type: ConnectionChangeType,
    ) where
        I: IntoIterator<Item = ConnectionId>,
    {
        log::debug!(
            "notify connectionChanged -> contactId:{} connectionId:{} changeType:{:?}",
            self.contact_id,
            changed_connection_id,
            change_type
        );

        join_all(recipients.into_iter().map(|recipient| {
            let contact = ContactReference::new(self.contact_id.clone(), changed_connection_id);
            async move {
                if let Err(error) = self
                    .notifier
                    .notify_connection_changed(&recipient, contact, change_type)
                    .await
                {
                    log::warn!(
                        "failed to notify connectionChanged to connection:{recipient}: {error:#}"
                    );
                }
            }
        }))
        .await;
    }

    /// Deliver a message notification to one target connection.
    pub async fn notify_receive_message(
        &self,
        target: ContactReference,
        from: ContactReference,
        message_type: &str,
        body: Value,
    ) {
        log::debug!(
            "notify receiveMessage -> target:{target} from:{from} messageType:{message_type}"
        );

        if let Err(error) = self
            .notifier
            .notify_receive_message(target.clone(), from, message_type, body)
            .await
        {
            log::warn!("failed to notify receiveMessage to {target}: {error:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
