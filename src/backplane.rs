//! Backplane provider contract.
//!
//! A backplane provider replicates contact state and relays messages between
//! independent service instances. Concrete implementations (document store,
//! key/value cache, RPC tunnel) live outside this crate; the registry only
//! depends on the [`BackplaneProvider`] trait and registers itself as the
//! [`BackplaneCallbacks`] observer for inbound changes.
//!
//! Providers are consulted only when local in-memory state cannot answer a
//! request. Reads go to providers in descending [`priority`] order and
//! short-circuit on the first success; replication writes go to every
//! registered provider, each isolated so one failure does not block the
//! others.
//!
//! [`priority`]: BackplaneProvider::priority

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::BackplaneError;
use crate::properties::{
    ConnectionId, ConnectionProperties, ContactConnections, ContactId, ContactReference,
};

// ---------------------------------------------------------------------------
// Change envelopes
// ---------------------------------------------------------------------------

/// Kind of contact mutation being replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactUpdateType {
    /// No replication-worthy change (used when applying remote snapshots).
    None,
    /// A self connection registered.
    Registration,
    /// Property values changed.
    UpdateProperties,
    /// A self connection unregistered.
    Unregister,
}

/// Replication envelope for a contact mutation.
///
/// `T` is the payload shape: outbound changes carry the mutated connection's
/// property bag ([`ConnectionDataChanged`]); inbound changes carry the full
/// remote picture of the contact ([`ContactConnectionsChanged`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactDataChanged<T> {
    /// Unique id of this change, used for deduplication across providers.
    pub change_id: String,
    /// Id of the service instance where the change originated.
    pub service_id: String,
    /// The connection that mutated.
    pub connection_id: ConnectionId,
    /// The contact that mutated.
    pub contact_id: ContactId,
    /// Kind of mutation.
    pub change_type: ContactUpdateType,
    /// Change payload.
    pub data: T,
}

impl<T> ContactDataChanged<T> {
    /// Create an envelope with a fresh change id.
    pub fn new(
        service_id: impl Into<String>,
        connection_id: impl Into<ConnectionId>,
        contact_id: impl Into<ContactId>,
        change_type: ContactUpdateType,
        data: T,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            connection_id: connection_id.into(),
            contact_id: contact_id.into(),
            change_type,
            data,
        }
    }

    /// Rebuild the envelope with a different payload, keeping identity.
    pub fn with_data<U>(&self, data: U) -> ContactDataChanged<U> {
        ContactDataChanged {
            change_id: self.change_id.clone(),
            service_id: self.service_id.clone(),
            connection_id: self.connection_id.clone(),
            contact_id: self.contact_id.clone(),
            change_type: self.change_type,
            data,
        }
    }
}

/// Outbound change: one connection's changed property bag.
pub type ConnectionDataChanged = ContactDataChanged<ConnectionProperties>;

/// Inbound change: the remote connections of a contact.
pub type ContactConnectionsChanged = ContactDataChanged<ContactConnections>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A transient message relayed between contacts; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    /// Unique id of this message, used for deduplication across providers.
    pub change_id: String,
    /// Who is sending the message.
    pub from_contact: ContactReference,
    /// Who should receive it.
    pub target_contact: ContactReference,
    /// Application-defined message type.
    pub message_type: String,
    /// Opaque payload.
    pub body: Value,
}

impl MessageData {
    /// Create a message with a fresh change id.
    pub fn new(
        from_contact: ContactReference,
        target_contact: ContactReference,
        message_type: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            from_contact,
            target_contact,
            message_type: message_type.into(),
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Point-in-time counters of a registry instance, pushed to providers for
/// operational dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Total contacts known to this instance.
    pub contact_count: usize,
    /// Contacts with at least one live self connection.
    pub online_contact_count: usize,
    /// Total live self connections.
    pub self_connection_count: usize,
    /// Total stub contacts awaiting resolution.
    pub stub_contact_count: usize,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Inbound observer the registry registers on every provider.
#[async_trait]
pub trait BackplaneCallbacks: Send + Sync {
    /// A contact changed on another service instance.
    async fn on_contact_changed(
        &self,
        changed: ContactConnectionsChanged,
        affected_properties: Vec<String>,
    );

    /// A message addressed to a contact arrived from another instance.
    async fn on_message_received(&self, source_id: String, message: MessageData);
}

/// Cross-instance replication/transport implementation.
#[async_trait]
pub trait BackplaneProvider: Send + Sync {
    /// Query order among providers; greater values are consulted first.
    fn priority(&self) -> u32;

    /// Register the inbound observer. Called once when the provider is added
    /// to a registry.
    fn set_callbacks(&self, callbacks: Arc<dyn BackplaneCallbacks>);

    /// Fetch the known connections of a contact, or `None` when the provider
    /// has no data for it.
    async fn get_contact_data(
        &self,
        contact_id: &str,
    ) -> Result<Option<ContactConnections>, BackplaneError>;

    /// Find contacts whose aggregated properties satisfy the exact-equality
    /// predicate. An empty map means no match.
    async fn get_contacts_data(
        &self,
        match_properties: &HashMap<String, Value>,
    ) -> Result<HashMap<ContactId, ContactConnections>, BackplaneError>;

    /// Replicate a local contact mutation.
    async fn update_contact(&self, changed: ConnectionDataChanged) -> Result<(), BackplaneError>;

    /// Relay a message to whichever instance holds the target contact.
    async fn send_message(
        &self,
        service_id: &str,
        message: MessageData,
    ) -> Result<(), BackplaneError>;

    /// Push instance metrics.
    async fn update_metrics(
        &self,
        service_id: &str,
        service_info: Value,
        metrics: ServiceMetrics,
    ) -> Result<(), BackplaneError>;
}
