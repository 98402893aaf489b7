//! The presence registry.
//!
//! [`PresenceService`] owns every [`Contact`] and [`StubContact`] of this
//! process, orchestrates registration, subscription requests (direct and
//! predicate-based), messaging and disconnect cleanup, and fans local
//! mutations out to the registered backplane providers.
//!
//! Control flow: transport layer -> registry operation -> contact/stub state
//! mutation -> notification dispatch -> transport layer (local) and backplane
//! providers (remote). Remote changes flow back through the
//! [`BackplaneCallbacks`] the registry registers on every provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backplane::{
    BackplaneCallbacks, BackplaneProvider, ConnectionDataChanged, ContactConnectionsChanged,
    ContactUpdateType, MessageData, ServiceMetrics,
};
use crate::contact::{AffectedPropertiesHook, Contact, ContactChangeSink};
use crate::contact_base::{ContactDataProvider, ContactNotifier};
use crate::errors::{BackplaneError, PresenceError};
use crate::options::ServiceOptions;
use crate::properties::{
    aggregate_properties, match_properties, ContactConnections, ContactId, ContactReference,
    PROPERTY_ID_RESERVED,
};
use crate::stub_contact::StubContact;

// ---------------------------------------------------------------------------
// Search predicates
// ---------------------------------------------------------------------------

/// One field predicate of a [`search_contacts`](PresenceService::search_contacts)
/// call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchProperty {
    /// Regular expression the aggregated value must match. `None` means
    /// "the property must be present with a non-null value".
    pub expression: Option<String>,
    /// Compile the expression case-insensitively.
    #[serde(default)]
    pub case_insensitive: bool,
}

// ---------------------------------------------------------------------------
// Backplane fan-out
// ---------------------------------------------------------------------------

/// Explicit listener list replacing event multicast: every registered
/// provider receives every local mutation, each call isolated.
struct BackplaneFanout {
    service_id: String,
    providers: RwLock<Vec<Arc<dyn BackplaneProvider>>>,
}

impl BackplaneFanout {
    fn new(service_id: String) -> Self {
        Self {
            service_id,
            providers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, provider: Arc<dyn BackplaneProvider>) {
        self.providers.write().push(provider);
    }

    fn clear(&self) {
        self.providers.write().clear();
    }

    fn count(&self) -> usize {
        self.providers.read().len()
    }

    fn all(&self) -> Vec<Arc<dyn BackplaneProvider>> {
        self.providers.read().clone()
    }

    fn by_priority(&self) -> Vec<Arc<dyn BackplaneProvider>> {
        let mut providers = self.all();
        providers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        providers
    }

    fn handle_provider_error(&self, operation: &str, error: &BackplaneError) {
        // cancellations are expected during shutdown and never logged
        if !error.is_cancelled() {
            log::error!("failed to invoke {operation} on backplane provider: {error}");
        }
    }

    /// Replicate a local change to every provider.
    async fn update_contact(&self, mut changed: ConnectionDataChanged) {
        changed.service_id = self.service_id.clone();
        for provider in self.all() {
            if let Err(error) = provider.update_contact(changed.clone()).await {
                self.handle_provider_error("updateContact", &error);
            }
        }
    }

    /// Query providers in priority order; first one with data wins.
    async fn get_contact_data(&self, contact_id: &str) -> Option<ContactConnections> {
        for provider in self.by_priority() {
            match provider.get_contact_data(contact_id).await {
                Ok(Some(data)) => return Some(data),
                Ok(None) => {}
                Err(error) => self.handle_provider_error("getContactData", &error),
            }
        }
        None
    }

    /// Match contacts via providers in priority order; first non-empty
    /// result wins.
    async fn get_contacts_data(
        &self,
        match_properties: &HashMap<String, Value>,
    ) -> HashMap<ContactId, ContactConnections> {
        for provider in self.by_priority() {
            match provider.get_contacts_data(match_properties).await {
                Ok(contacts) if !contacts.is_empty() => return contacts,
                Ok(_) => {}
                Err(error) => self.handle_provider_error("getContactsData", &error),
            }
        }
        HashMap::new()
    }

    /// Forward a message through the first provider (priority order) that
    /// accepts it.
    async fn send_message(&self, message: MessageData) {
        for provider in self.by_priority() {
            match provider.send_message(&self.service_id, message.clone()).await {
                Ok(()) => return,
                Err(error) => self.handle_provider_error("sendMessage", &error),
            }
        }
    }

    /// Push metrics to every provider.
    async fn update_metrics(&self, service_info: Value, metrics: ServiceMetrics) {
        for provider in self.all() {
            if let Err(error) = provider
                .update_metrics(&self.service_id, service_info.clone(), metrics)
                .await
            {
                self.handle_provider_error("updateMetrics", &error);
            }
        }
    }
}

#[async_trait]
impl ContactChangeSink for BackplaneFanout {
    async fn contact_changed(&self, changed: ConnectionDataChanged) {
        self.update_contact(changed).await;
    }
}

// ---------------------------------------------------------------------------
// PresenceService
// ---------------------------------------------------------------------------

/// Registry of all contacts known to this service instance.
pub struct PresenceService {
    options: ServiceOptions,
    notifier: Arc<dyn ContactNotifier>,
    contacts: DashMap<ContactId, Arc<Contact>>,
    stub_contacts: DashMap<ContactId, Arc<StubContact>>,
    /// Resolved self contact id -> stub contact ids still tracking it.
    resolved_contacts: DashMap<ContactId, HashSet<ContactId>>,
    fanout: Arc<BackplaneFanout>,
    /// Inbound change ids already processed, for cross-provider dedup.
    processed_changes: Mutex<HashMap<String, Instant>>,
}

impl PresenceService {
    /// Create a registry bound to the transport notifier.
    pub fn new(options: ServiceOptions, notifier: Arc<dyn ContactNotifier>) -> Arc<Self> {
        let fanout = Arc::new(BackplaneFanout::new(options.id.clone()));
        Arc::new(Self {
            options,
            notifier,
            contacts: DashMap::new(),
            stub_contacts: DashMap::new(),
            resolved_contacts: DashMap::new(),
            fanout,
            processed_changes: Mutex::new(HashMap::new()),
        })
    }

    /// Id of this service instance.
    pub fn service_id(&self) -> &str {
        &self.options.id
    }

    /// Register a backplane provider and wire its inbound callbacks.
    pub fn add_backplane_provider(self: &Arc<Self>, provider: Arc<dyn BackplaneProvider>) {
        log::info!(
            "addBackplaneProvider priority:{} serviceId:{}",
            provider.priority(),
            self.service_id()
        );
        provider.set_callbacks(self.clone() as Arc<dyn BackplaneCallbacks>);
        self.fanout.add(provider);
    }

    /// Number of registered backplane providers.
    pub fn backplane_provider_count(&self) -> usize {
        self.fanout.count()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a live self connection for a contact, then resolve any stub
    /// whose predicate the initial properties satisfy.
    pub async fn register_self_contact(
        &self,
        contact_ref: &ContactReference,
        initial_properties: Option<HashMap<String, Value>>,
    ) -> Result<(), PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::info!(
            "registerSelfContact -> contact:{contact_ref} initialProperties:{:?}",
            initial_properties.as_ref().map(|p| p.keys().collect::<Vec<_>>())
        );

        let contact = self.get_or_create_contact_hydrated(&contact_ref.id).await;
        contact
            .register_self(connection_id, initial_properties.clone())
            .await;

        if let Some(properties) = initial_properties {
            self.resolve_stub_contacts(connection_id, &properties, &mut || contact.clone())
                .await;
        }
        Ok(())
    }

    /// Unregister a self connection: clean up every reverse subscription the
    /// connection held, then remove the connection from its contact.
    ///
    /// The optional hook delays the visible effect of the disconnect; see
    /// [`Contact::remove_self_connection`].
    pub async fn unregister_self_contact(
        &self,
        contact_ref: &ContactReference,
        affected_properties_hook: Option<AffectedPropertiesHook>,
    ) -> Result<(), PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::info!("unregisterSelfContact -> contact:{contact_ref}");

        let registered = self.get_registered_contact(&contact_ref.id)?;
        for target_contact_id in registered.get_target_contacts(connection_id) {
            if let Some(stub) = self.get_stub_contact(&target_contact_id) {
                stub.remove_all_subscriptions(connection_id);
                if !stub.has_subscriptions() {
                    self.remove_stub_contact(&stub);
                }
            } else if let Some(target) = self.get_contact(&target_contact_id) {
                target.remove_all_subscriptions(connection_id);
            }
        }

        registered
            .remove_self_connection(connection_id, affected_properties_hook)
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe to a batch of target descriptors.
    ///
    /// Each descriptor is either a known id (carrying the reserved `id`
    /// property) or a match predicate. Predicates are answered from local
    /// aggregated state first, then the backplane providers, and finally --
    /// when `use_stub` allows -- by a placeholder stub whose synthetic id is
    /// returned. Descriptors that resolve to nothing yield `None`.
    pub async fn request_subscriptions(
        &self,
        contact_ref: &ContactReference,
        target_contact_properties: Vec<HashMap<String, Value>>,
        property_names: &[String],
        use_stub: bool,
    ) -> Result<Vec<Option<HashMap<String, Value>>>, PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::debug!(
            "requestSubscriptions -> contact:{contact_ref} targets:{} propertyNames:{:?}",
            target_contact_properties.len(),
            property_names
        );

        let mut results: Vec<Option<HashMap<String, Value>>> =
            vec![None; target_contact_properties.len()];

        let mut pending: Vec<(usize, HashMap<String, Value>)> = Vec::new();
        for (index, descriptor) in target_contact_properties.into_iter().enumerate() {
            match descriptor.get(PROPERTY_ID_RESERVED).and_then(Value::as_str) {
                Some(target_contact_id) => {
                    // target contact is known, subscribe right away
                    let target_contact_id = target_contact_id.to_string();
                    results[index] = Some(
                        self.add_subscription_single(contact_ref, &target_contact_id, property_names)
                            .await?,
                    );
                }
                None => pending.push((index, descriptor)),
            }
        }

        if pending.is_empty() {
            return Ok(results);
        }

        let registered = self.get_registered_contact(&contact_ref.id)?;
        let predicates: Vec<HashMap<String, Value>> =
            pending.iter().map(|(_, predicate)| predicate.clone()).collect();
        let local_matches = self.match_contacts(&predicates);

        for (pending_index, (result_index, predicate)) in pending.into_iter().enumerate() {
            if let Some(target_contact_id) = first_contact_id(&local_matches[pending_index]) {
                results[result_index] = Some(
                    self.add_subscription_single(contact_ref, &target_contact_id, property_names)
                        .await?,
                );
                continue;
            }

            // nothing local: ask the backplane providers
            let backplane_contacts = self.fanout.get_contacts_data(&predicate).await;
            if let Some(target_contact_id) = first_key(&backplane_contacts) {
                let data = backplane_contacts[&target_contact_id].clone();
                let mut matched_properties = aggregate_properties(
                    data.iter().map(|(connection_id, bag)| (connection_id.as_str(), bag)),
                );
                matched_properties
                    .insert(PROPERTY_ID_RESERVED.to_string(), json!(target_contact_id));

                // hydrate the contact locally and register the subscription
                let (target_contact, _) = self.get_or_create_contact(&target_contact_id);
                target_contact.set_other_connection_properties(data);
                registered.add_target_contacts(connection_id, &[target_contact_id.clone()]);
                target_contact.add_subscription_properties(connection_id, None, property_names);

                results[result_index] = Some(matched_properties);
            } else if use_stub {
                // no match anywhere: park the subscription on a stub that a
                // later registration may resolve
                let stub = self.find_or_create_stub_contact(&predicate);
                registered.add_target_contacts(connection_id, &[stub.contact_id().to_string()]);
                stub.add_subscription_properties(connection_id, None, property_names);

                results[result_index] = Some(
                    [(PROPERTY_ID_RESERVED.to_string(), json!(stub.contact_id()))].into(),
                );
            }
        }

        Ok(results)
    }

    /// Subscribe to explicitly named target contacts. Returns, per target
    /// id, a snapshot of the requested property values.
    pub async fn add_subscriptions(
        &self,
        contact_ref: &ContactReference,
        target_contacts: &[ContactReference],
        property_names: &[String],
    ) -> Result<HashMap<ContactId, HashMap<String, Value>>, PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::debug!(
            "addSubscriptions -> contact:{contact_ref} targets:{:?} propertyNames:{:?}",
            target_contacts.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            property_names
        );

        let registered = self.get_registered_contact(&contact_ref.id)?;
        let target_ids: Vec<ContactId> =
            target_contacts.iter().map(|target| target.id.clone()).collect();
        registered.add_target_contacts(connection_id, &target_ids);

        let mut result = HashMap::new();
        for target in target_contacts {
            let target_contact = self.get_or_create_contact_hydrated(&target.id).await;
            let snapshot = target_contact.create_subscription(
                connection_id,
                target.connection_id.as_deref(),
                property_names,
            );
            result.insert(target.id.clone(), snapshot);
        }
        Ok(result)
    }

    /// Remove subscriptions on the named targets. A stub left without
    /// subscriptions is deleted.
    pub fn remove_subscription(
        &self,
        contact_ref: &ContactReference,
        target_contacts: &[ContactReference],
    ) -> Result<(), PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::debug!(
            "removeSubscription -> contact:{contact_ref} targets:{:?}",
            target_contacts.iter().map(|c| c.id.as_str()).collect::<Vec<_>>()
        );

        let registered = self.get_registered_contact(&contact_ref.id)?;
        let target_ids: Vec<ContactId> =
            target_contacts.iter().map(|target| target.id.clone()).collect();
        registered.remove_target_contacts(connection_id, &target_ids);

        for target in target_contacts {
            if let Some(stub) = self.get_stub_contact(&target.id) {
                stub.remove_subscription(connection_id, target.connection_id.as_deref());
                if !stub.has_subscriptions() {
                    self.remove_stub_contact(&stub);
                }
            } else if let Some(target_contact) = self.get_contact(&target.id) {
                target_contact
                    .remove_subscription(connection_id, target.connection_id.as_deref());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Property updates
    // -----------------------------------------------------------------------

    /// Publish a property batch for a registered contact and relay it to any
    /// stub still tracking that identity (pre-resolution race window).
    pub async fn update_properties(
        &self,
        contact_ref: &ContactReference,
        properties: HashMap<String, Value>,
    ) -> Result<(), PresenceError> {
        let connection_id = required_connection_id(contact_ref)?;
        log::debug!(
            "updateProperties -> contact:{contact_ref} properties:{:?}",
            properties.keys().collect::<Vec<_>>()
        );

        let registered = self.get_registered_contact(&contact_ref.id)?;
        registered
            .update_properties(connection_id, properties.clone())
            .await;

        let affected: Vec<String> = properties.keys().cloned().collect();
        for stub in self.stub_contacts_for(&contact_ref.id) {
            let data_provider =
                ContactDataProvider::Properties(registered.get_aggregated_properties(None));
            stub.send_update_properties(connection_id, &data_provider, &affected)
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a message to a target contact.
    ///
    /// Delivered locally when the target has matching live self connections,
    /// and always forwarded through the backplane so a remote instance
    /// holding the true live connection receives it too. A target addressed
    /// by a resolved stub id is transparently redirected.
    pub async fn send_message(
        &self,
        contact_ref: &ContactReference,
        target_contact_ref: ContactReference,
        message_type: &str,
        body: Value,
    ) -> Result<(), PresenceError> {
        log::debug!(
            "sendMessage -> contact:{contact_ref} target:{target_contact_ref} messageType:{message_type}"
        );

        // the sender must be a registered contact
        self.get_registered_contact(&contact_ref.id)?;

        let mut target_contact_ref = target_contact_ref;
        if let Some(stub) = self.get_stub_contact(&target_contact_ref.id) {
            if let Some(resolved) = stub.resolved_contact() {
                log::debug!(
                    "resolved stub target -> stubId:{} contactId:{}",
                    target_contact_ref.id,
                    resolved.contact_id()
                );
                target_contact_ref = ContactReference {
                    id: resolved.contact_id().to_string(),
                    connection_id: target_contact_ref.connection_id,
                };
            }
        }

        if let Some(target_contact) = self.get_contact(&target_contact_ref.id) {
            if target_contact.can_send_message(target_contact_ref.connection_id.as_deref()) {
                target_contact
                    .send_receive_message(
                        contact_ref.clone(),
                        message_type,
                        body.clone(),
                        target_contact_ref.connection_id.as_deref(),
                    )
                    .await;
            }
        }

        // best effort: a remote instance may hold the live connection
        let message =
            MessageData::new(contact_ref.clone(), target_contact_ref, message_type, body);
        self.fanout.send_message(message).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Match / search
    // -----------------------------------------------------------------------

    /// Scan the in-memory aggregated properties with exact key/value
    /// equality. Returns, per predicate, the matching contact ids with their
    /// full aggregated properties.
    pub fn match_contacts(
        &self,
        matching_properties: &[HashMap<String, Value>],
    ) -> Vec<HashMap<ContactId, HashMap<String, Value>>> {
        let mut results = vec![HashMap::new(); matching_properties.len()];
        for entry in self.contacts.iter() {
            let aggregated = entry.value().get_aggregated_properties(None);
            for (index, predicate) in matching_properties.iter().enumerate() {
                if match_properties(predicate, &aggregated) {
                    results[index].insert(entry.key().clone(), aggregated.clone());
                }
            }
        }
        results
    }

    /// Regex scan over aggregated properties with an optional result cap.
    pub fn search_contacts(
        &self,
        search_properties: &HashMap<String, SearchProperty>,
        max_count: Option<usize>,
    ) -> Result<HashMap<ContactId, HashMap<String, Value>>, PresenceError> {
        let mut patterns = Vec::with_capacity(search_properties.len());
        for (property_name, search) in search_properties {
            let pattern = match &search.expression {
                Some(expression) => Some(
                    RegexBuilder::new(expression)
                        .case_insensitive(search.case_insensitive)
                        .build()?,
                ),
                None => None,
            };
            patterns.push((property_name.clone(), pattern));
        }

        let mut result = HashMap::new();
        for entry in self.contacts.iter() {
            if max_count.is_some_and(|max| result.len() >= max) {
                break;
            }

            let aggregated = entry.value().get_aggregated_properties(None);
            let matched = patterns.iter().all(|(property_name, pattern)| {
                let value = aggregated.get(property_name);
                match (pattern, value) {
                    // no expression: the property just has to be present
                    (None, Some(value)) => !value.is_null(),
                    (Some(pattern), Some(value)) if !value.is_null() => {
                        pattern.is_match(&value_as_text(value))
                    }
                    _ => false,
                }
            });
            if matched {
                result.insert(entry.key().clone(), aggregated);
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Point-in-time counters for dashboards.
    pub fn get_metrics(&self) -> ServiceMetrics {
        let mut online_contact_count = 0;
        let mut self_connection_count = 0;
        for entry in self.contacts.iter() {
            let count = entry.value().self_connections_count();
            if count > 0 {
                online_contact_count += 1;
            }
            self_connection_count += count;
        }

        ServiceMetrics {
            contact_count: self.contacts.len(),
            online_contact_count,
            self_connection_count,
            stub_contact_count: self.stub_contacts.len(),
        }
    }

    /// All known connection bags of a contact, hydrating from the backplane
    /// when the contact is not yet known locally.
    pub async fn get_self_connections(&self, contact_id: &str) -> ContactConnections {
        self.get_or_create_contact_hydrated(contact_id)
            .await
            .get_self_connections()
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Periodic housekeeping loop: pushes metrics to the providers and
    /// purges the change dedup cache and stale contacts. Runs until the
    /// future is dropped.
    pub async fn run(&self, service_info: Value) {
        let tick = Duration::from_secs(self.options.update_tick_secs.max(1));
        let metrics_every =
            (self.options.metrics_update_secs / self.options.update_tick_secs.max(1)).max(1);

        let mut interval = tokio::time::interval(tick);
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;

            if ticks % metrics_every == 0 {
                self.update_backplane_metrics(service_info.clone()).await;
            }

            self.purge_expired_changes();
            self.purge_stale_contacts();
        }
    }

    /// Push current metrics to every provider.
    pub async fn update_backplane_metrics(&self, service_info: Value) {
        let metrics = self.get_metrics();
        log::info!(
            "updateBackplaneMetrics -> contacts:{} online:{} connections:{} stubs:{}",
            metrics.contact_count,
            metrics.online_contact_count,
            metrics.self_connection_count,
            metrics.stub_contact_count
        );
        self.fanout.update_metrics(service_info, metrics).await;
    }

    /// Evict contacts with no self connections, no subscriptions and no
    /// recent replicated activity.
    pub fn purge_stale_contacts(&self) {
        let ttl = Duration::from_secs(self.options.stale_contact_ttl_secs);
        let stale: Vec<ContactId> = self
            .contacts
            .iter()
            .filter(|entry| {
                let contact = entry.value();
                contact.is_self_empty()
                    && !contact.has_subscriptions()
                    && contact.idle_time() >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        for contact_id in stale {
            log::debug!("purging stale contact -> contactId:{contact_id}");
            self.contacts.remove(&contact_id);
        }
    }

    /// Drop expired entries from the inbound change dedup cache.
    pub fn purge_expired_changes(&self) {
        let expiration = Duration::from_secs(self.options.change_expiration_secs);
        self.processed_changes
            .lock()
            .retain(|_, seen_at| seen_at.elapsed() < expiration);
    }

    /// Release the providers and the dedup cache.
    pub fn dispose(&self) {
        log::debug!("dispose -> serviceId:{}", self.service_id());
        self.processed_changes.lock().clear();
        self.fanout.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn get_contact(&self, contact_id: &str) -> Option<Arc<Contact>> {
        self.contacts.get(contact_id).map(|entry| entry.value().clone())
    }

    fn get_stub_contact(&self, contact_id: &str) -> Option<Arc<StubContact>> {
        self.stub_contacts
            .get(contact_id)
            .map(|entry| entry.value().clone())
    }

    fn get_registered_contact(&self, contact_id: &str) -> Result<Arc<Contact>, PresenceError> {
        self.get_contact(contact_id)
            .ok_or_else(|| PresenceError::ContactNotRegistered {
                contact_id: contact_id.to_string(),
            })
    }

    fn get_or_create_contact(&self, contact_id: &str) -> (Arc<Contact>, bool) {
        let mut created = false;
        let contact = self
            .contacts
            .entry(contact_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Contact::new(
                    contact_id,
                    self.notifier.clone(),
                    self.fanout.clone() as Arc<dyn ContactChangeSink>,
                ))
            })
            .clone();
        (contact, created)
    }

    /// Get-or-create with on-demand hydration of replicated state from the
    /// backplane for contacts seen for the first time.
    async fn get_or_create_contact_hydrated(&self, contact_id: &str) -> Arc<Contact> {
        let (contact, created) = self.get_or_create_contact(contact_id);
        if created {
            if let Some(data) = self.fanout.get_contact_data(contact_id).await {
                contact.set_other_connection_properties(data);
            }
        }
        contact
    }

    async fn add_subscription_single(
        &self,
        contact_ref: &ContactReference,
        target_contact_id: &str,
        property_names: &[String],
    ) -> Result<HashMap<String, Value>, PresenceError> {
        let targets = [ContactReference::any(target_contact_id)];
        let mut result = self
            .add_subscriptions(contact_ref, &targets, property_names)
            .await?;
        let mut snapshot = result.remove(target_contact_id).unwrap_or_default();
        snapshot.insert(PROPERTY_ID_RESERVED.to_string(), json!(target_contact_id));
        Ok(snapshot)
    }

    fn find_or_create_stub_contact(&self, match_predicate: &HashMap<String, Value>) -> Arc<StubContact> {
        let existing = self.stub_contacts.iter().find_map(|entry| {
            if entry.value().match_properties() == match_predicate {
                Some(entry.value().clone())
            } else {
                None
            }
        });
        if let Some(stub) = existing {
            return stub;
        }

        let stub = Arc::new(StubContact::new(
            Uuid::new_v4().to_string(),
            match_predicate.clone(),
            self.notifier.clone(),
        ));
        self.stub_contacts
            .insert(stub.contact_id().to_string(), stub.clone());
        stub
    }

    fn remove_stub_contact(&self, stub: &Arc<StubContact>) {
        log::debug!("stubContact removed -> contactId:{}", stub.contact_id());
        self.stub_contacts.remove(stub.contact_id());
        for mut entry in self.resolved_contacts.iter_mut() {
            entry.value_mut().remove(stub.contact_id());
        }
        self.resolved_contacts.retain(|_, stubs| !stubs.is_empty());
    }

    /// Stubs resolved to the given self contact id.
    fn stub_contacts_for(&self, contact_id: &str) -> Vec<Arc<StubContact>> {
        let stub_ids: Vec<ContactId> = self
            .resolved_contacts
            .get(contact_id)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default();
        stub_ids
            .iter()
            .filter_map(|stub_id| self.get_stub_contact(stub_id))
            .collect()
    }

    /// Resolve every unresolved stub whose predicate the properties satisfy.
    /// The factory supplies (and creates, when needed) the real contact.
    async fn resolve_stub_contacts(
        &self,
        connection_id: &str,
        properties: &HashMap<String, Value>,
        contact_factory: &mut (dyn FnMut() -> Arc<Contact> + Send),
    ) {
        let candidates: Vec<Arc<StubContact>> = self
            .stub_contacts
            .iter()
            .filter(|entry| {
                entry.value().resolved_contact().is_none() && entry.value().matches(properties)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for stub in candidates {
            let contact = contact_factory();
            stub.set_resolved_contact(contact.clone());
            self.resolved_contacts
                .entry(contact.contact_id().to_string())
                .or_default()
                .insert(stub.contact_id().to_string());

            let affected: Vec<String> = properties.keys().cloned().collect();
            stub.send_update_properties(
                connection_id,
                &ContactDataProvider::Properties(properties.clone()),
                &affected,
            )
            .await;
        }
    }

    /// True when this change id was already processed.
    fn track_change(&self, change_id: &str) -> bool {
        let mut processed = self.processed_changes.lock();
        if processed.contains_key(change_id) {
            return true;
        }
        processed.insert(change_id.to_string(), Instant::now());
        false
    }
}

// ---------------------------------------------------------------------------
// Inbound backplane callbacks
// ---------------------------------------------------------------------------

#[async_trait]
impl BackplaneCallbacks for PresenceService {
    async fn on_contact_changed(
        &self,
        changed: ContactConnectionsChanged,
        affected_properties: Vec<String>,
    ) {
        // drop duplicates relayed by multiple providers and our own echoes
        if self.track_change(&changed.change_id) || changed.service_id == self.service_id() {
            return;
        }
        log::debug!(
            "onContactChanged -> changeId:{} contactId:{} type:{:?}",
            changed.change_id,
            changed.contact_id,
            changed.change_type
        );

        if changed.change_type == ContactUpdateType::Registration {
            // a remote registration may resolve pending stubs; the local
            // contact is created lazily, only when a stub actually matches
            let aggregated = aggregate_properties(
                changed
                    .data
                    .iter()
                    .map(|(connection_id, bag)| (connection_id.as_str(), bag)),
            );
            let mut resolved: Option<Arc<Contact>> = None;
            let data = changed.data.clone();
            let contact_id = changed.contact_id.clone();
            self.resolve_stub_contacts(&changed.connection_id, &aggregated, &mut || {
                resolved
                    .get_or_insert_with(|| {
                        let (contact, _) = self.get_or_create_contact(&contact_id);
                        contact.set_other_connection_properties(data.clone());
                        contact
                    })
                    .clone()
            })
            .await;
        } else {
            for stub in self.stub_contacts_for(&changed.contact_id) {
                stub.send_update_properties(
                    &changed.connection_id,
                    &ContactDataProvider::Connections(changed.data.clone()),
                    &affected_properties,
                )
                .await;
            }
        }

        if let Some(contact) = self.get_contact(&changed.contact_id) {
            contact.on_contact_changed(changed, &affected_properties).await;
        }
    }

    async fn on_message_received(&self, source_id: String, message: MessageData) {
        if self.track_change(&message.change_id) || source_id == self.service_id() {
            return;
        }
        log::debug!(
            "onMessageReceived -> changeId:{} target:{}",
            message.change_id,
            message.target_contact
        );

        let MessageData {
            from_contact,
            target_contact,
            message_type,
            body,
            ..
        } = message;
        if let Some(contact) = self.get_contact(&target_contact.id) {
            if contact.can_send_message(target_contact.connection_id.as_deref()) {
                contact
                    .send_receive_message(
                        from_contact,
                        &message_type,
                        body,
                        target_contact.connection_id.as_deref(),
                    )
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required_connection_id(contact_ref: &ContactReference) -> Result<&str, PresenceError> {
    contact_ref
        .connection_id
        .as_deref()
        .ok_or(PresenceError::MissingConnectionId)
}

/// Deterministic pick among matched contacts: the smallest contact id.
fn first_contact_id(matches: &HashMap<ContactId, HashMap<String, Value>>) -> Option<ContactId> {
    matches.keys().min().cloned()
}

fn first_key<V>(map: &HashMap<ContactId, V>) -> Option<ContactId> {
    map.keys().min().cloned()
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
