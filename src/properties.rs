//! Versioned property values and last-writer-wins aggregation.
//!
//! Every property a connection publishes is stored as a [`PropertyValue`]
//! carrying the wall-clock timestamp captured when it was merged. Aggregating
//! a contact means taking, for each property name, the value with the
//! greatest timestamp across all of its connections (self and replicated).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identity of a logical contact.
pub type ContactId = String;

/// Opaque identity of one live device/tab under a contact.
pub type ConnectionId = String;

/// Property name -> versioned value, scoped to one connection.
pub type ConnectionProperties = HashMap<String, PropertyValue>;

/// Connection id -> property bag, the full picture of one contact.
pub type ContactConnections = HashMap<ConnectionId, ConnectionProperties>;

/// Reserved property name used to carry a contact id inside a property map.
pub const PROPERTY_ID_RESERVED: &str = "id";

/// Subscription property name meaning "all properties".
pub const PROPERTY_WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// PropertyValue
// ---------------------------------------------------------------------------

/// A property value together with the last time it was updated.
///
/// Ordering between two values of the same property is decided by the
/// `updated` timestamp only; the payload itself is opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Value of the property.
    pub value: Value,
    /// Last time it was updated.
    pub updated: DateTime<Utc>,
}

impl PropertyValue {
    /// Create a property value updated at the given instant.
    pub fn new(value: Value, updated: DateTime<Utc>) -> Self {
        Self { value, updated }
    }

    /// A marker for a property that is now absent.
    ///
    /// Carries a `null` value and the minimum timestamp so that any real
    /// value wins the merge against it.
    pub fn absent() -> Self {
        Self {
            value: Value::Null,
            updated: DateTime::<Utc>::MIN_UTC,
        }
    }
}

// ---------------------------------------------------------------------------
// Contact reference
// ---------------------------------------------------------------------------

/// Identifies a contact and optionally one of its connections.
///
/// Every transport call carries one of these; a `None` connection id means
/// "any/all connections of this contact".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactReference {
    /// The contact id.
    pub id: ContactId,
    /// Optional connection id scoping the reference to one device/tab.
    pub connection_id: Option<ConnectionId>,
}

impl ContactReference {
    /// Create a reference to a specific connection of a contact.
    pub fn new(id: impl Into<ContactId>, connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            connection_id: Some(connection_id.into()),
        }
    }

    /// Create a reference to a contact with no connection scoping.
    pub fn any(id: impl Into<ContactId>) -> Self {
        Self {
            id: id.into(),
            connection_id: None,
        }
    }
}

impl std::fmt::Display for ContactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.connection_id {
            Some(connection_id) => write!(f, "{{id:{} connectionId:{}}}", self.id, connection_id),
            None => write!(f, "{{id:{}}}", self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Aggregate property bags from many connections into a single map using
/// last-writer-wins.
///
/// For each property name the value with the greatest `updated` timestamp is
/// kept. Ties resolve to the lexicographically greatest connection id, which
/// makes the merge deterministic regardless of map iteration order. Absence
/// markers injected under the empty connection id therefore lose against any
/// real value with the same timestamp.
pub fn aggregate_properties<'a, I>(connections: I) -> HashMap<String, Value>
where
    I: IntoIterator<Item = (&'a str, &'a ConnectionProperties)>,
{
    aggregate_property_values(connections)
        .into_iter()
        .map(|(name, pv)| (name, pv.value))
        .collect()
}

/// Same as [`aggregate_properties`] but keeps the winning [`PropertyValue`]
/// including its timestamp.
pub fn aggregate_property_values<'a, I>(connections: I) -> HashMap<String, PropertyValue>
where
    I: IntoIterator<Item = (&'a str, &'a ConnectionProperties)>,
{
    let mut winners: HashMap<String, (&'a str, &'a PropertyValue)> = HashMap::new();
    for (connection_id, properties) in connections {
        for (name, pv) in properties {
            match winners.get(name.as_str()) {
                Some((winner_connection_id, winner))
                    if (winner.updated, *winner_connection_id)
                        >= (pv.updated, connection_id) => {}
                _ => {
                    winners.insert(name.clone(), (connection_id, pv));
                }
            }
        }
    }

    winners
        .into_iter()
        .map(|(name, (_, pv))| (name, pv.clone()))
        .collect()
}

/// Resolve the current aggregated value of a single property, or `Null` when
/// no connection defines it.
pub fn latest_property_value<'a, I>(connections: I, property_name: &str) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a ConnectionProperties)>,
{
    let mut winner: Option<(&'a str, &'a PropertyValue)> = None;
    for (connection_id, properties) in connections {
        if let Some(pv) = properties.get(property_name) {
            match winner {
                Some((winner_connection_id, current))
                    if (current.updated, winner_connection_id) >= (pv.updated, connection_id) => {}
                _ => winner = Some((connection_id, pv)),
            }
        }
    }

    winner.map(|(_, pv)| pv.value.clone()).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Matching helpers
// ---------------------------------------------------------------------------

/// Return true when every (name, value) pair of `match_properties` is present
/// with an equal value in `properties`.
pub fn match_properties(
    match_properties: &HashMap<String, Value>,
    properties: &HashMap<String, Value>,
) -> bool {
    match_properties
        .iter()
        .all(|(name, value)| properties.get(name) == Some(value))
}

/// Exact map equality, used to dedup stub predicates and to detect no-op
/// removals.
pub fn equals_properties(a: &HashMap<String, Value>, b: &HashMap<String, Value>) -> bool {
    a == b
}
