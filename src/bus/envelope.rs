//! Routing metadata carried as message application properties.

use crate::broker::{ApplicationProperties, PropertyValue};
use crate::cluster::ServerId;

use super::{BusError, Result};

/// Property name for the destination namespace.
pub const NSP_PROPERTY: &str = "nsp";

/// Property name for the publishing adapter's identifier.
pub const UID_PROPERTY: &str = "uid";

/// Property name for the requester targeted by a response.
pub const REQUESTER_UID_PROPERTY: &str = "requesterUid";

/// Routing metadata of one broker message.
///
/// A message without `requester_uid` is a broadcast; with it, a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEnvelope {
    pub nsp: String,
    pub uid: ServerId,
    pub requester_uid: Option<ServerId>,
}

impl RoutingEnvelope {
    pub fn broadcast(nsp: impl Into<String>, uid: ServerId) -> Self {
        Self {
            nsp: nsp.into(),
            uid,
            requester_uid: None,
        }
    }

    pub fn response(nsp: impl Into<String>, uid: ServerId, requester_uid: ServerId) -> Self {
        Self {
            nsp: nsp.into(),
            uid,
            requester_uid: Some(requester_uid),
        }
    }

    pub fn is_response(&self) -> bool {
        self.requester_uid.is_some()
    }

    pub fn to_properties(&self) -> ApplicationProperties {
        let mut properties = ApplicationProperties::with_capacity(3);
        properties.insert(NSP_PROPERTY.to_string(), self.nsp.as_str().into());
        properties.insert(UID_PROPERTY.to_string(), self.uid.as_str().into());
        if let Some(requester_uid) = &self.requester_uid {
            properties.insert(
                REQUESTER_UID_PROPERTY.to_string(),
                requester_uid.as_str().into(),
            );
        }
        properties
    }

    /// Extract the envelope from received properties.
    ///
    /// An empty `requesterUid` counts as absent.
    pub fn from_properties(properties: Option<&ApplicationProperties>) -> Result<Self> {
        let properties = properties
            .ok_or_else(|| BusError::MalformedMessage("no application properties".to_string()))?;

        let nsp = string_property(properties, NSP_PROPERTY)?
            .ok_or_else(|| BusError::MalformedMessage("missing nsp".to_string()))?;
        let uid = string_property(properties, UID_PROPERTY)?
            .ok_or_else(|| BusError::MalformedMessage("missing uid".to_string()))?;
        let requester_uid = string_property(properties, REQUESTER_UID_PROPERTY)?
            .filter(|s| !s.is_empty())
            .map(ServerId::from);

        Ok(Self {
            nsp: nsp.to_string(),
            uid: ServerId::from(uid),
            requester_uid,
        })
    }
}

fn string_property<'a>(properties: &'a ApplicationProperties, name: &str) -> Result<Option<&'a str>> {
    match properties.get(name) {
        None => Ok(None),
        Some(PropertyValue::String(s)) => Ok(Some(s)),
        Some(other) => Err(BusError::MalformedMessage(format!(
            "{} is not a string: {:?}",
            name, other
        ))),
    }
}
