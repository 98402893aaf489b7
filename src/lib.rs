//! # Presence Registry
//!
//! An in-memory, real-time presence and contact registry. Contacts publish
//! versioned properties from any number of live connections; subscribers
//! follow other contacts directly by id or through property predicates, and
//! receive push notifications whenever an aggregated value changes.
//!
//! A single [`PresenceService`] instance is self-contained. Multiple
//! instances federate through pluggable [`BackplaneProvider`]s that replicate
//! contact state and relay messages, so a subscriber on one instance observes
//! contacts registered on another.
//!
//! The crate is transport-agnostic: the hosting layer implements
//! [`ContactNotifier`] to push notifications to its clients and drives the
//! registry operations from its own wire protocol.

pub mod backplane;
pub mod contact;
pub mod contact_base;
pub mod errors;
pub mod options;
pub mod properties;
pub mod service;
pub mod stub_contact;

pub use backplane::{
    BackplaneCallbacks, BackplaneProvider, ConnectionDataChanged, ContactConnectionsChanged,
    ContactDataChanged, ContactUpdateType, MessageData, ServiceMetrics,
};
pub use contact::{AffectedPropertiesHook, Contact, ContactChangeSink, ContactData};
pub use contact_base::{ConnectionChangeType, ContactDataProvider, ContactNotifier};
pub use errors::{BackplaneError, PresenceError};
pub use options::ServiceOptions;
pub use properties::{
    aggregate_properties, match_properties, ConnectionId, ConnectionProperties,
    ContactConnections, ContactId, ContactReference, PropertyValue, PROPERTY_ID_RESERVED,
    PROPERTY_WILDCARD,
};
pub use service::{PresenceService, SearchProperty};
pub use stub_contact::StubContact;
