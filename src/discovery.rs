//! HA MQTT Discovery payloads.
//!
//! Each entity is announced once at startup on
//! `{discovery_prefix}/{domain}/{unique_id}/config` (retained). The payload
//! maps the two canonical tokens onto the component's own vocabulary:
//!
//!   lock:   ACTIVE = locked,  INACTIVE = unlocked
//!   switch: ACTIVE = on,      INACTIVE = off
//!   cover:  ACTIVE = closed,  INACTIVE = open

use serde_json::{json, Map, Value};

use crate::entity::{Availability, Domain, Entity, Status};
use crate::topics::{Category, TopicNamer};

/// Deploy-wide values shared by every discovery payload.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub device_id: String,
    pub device_name: String,
    pub qos: u8,
    pub origin_name: String,
    pub origin_version: String,
}

impl DiscoveryContext {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>, qos: u8) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            qos,
            origin_name: env!("CARGO_PKG_NAME").to_string(),
            origin_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Unique id of an entity across the whole broker, `{device_id}_{entity_id}`.
    pub fn unique_id(&self, entity: &Entity) -> String {
        format!("{}_{}", self.device_id, entity.id)
    }
}

/// A ready-to-publish discovery message.
#[derive(Debug, Clone)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

/// Build the discovery payload for one entity.
pub fn build_discovery(entity: &Entity, ctx: &DiscoveryContext, topics: &TopicNamer) -> Value {
    let mut payload = Map::new();
    payload.insert("name".into(), json!(entity.name));
    payload.insert("unique_id".into(), json!(ctx.unique_id(entity)));
    payload.insert(
        "command_topic".into(),
        json!(topics.topic(&entity.id, Category::Command)),
    );
    payload.insert(
        "state_topic".into(),
        json!(topics.topic(&entity.id, Category::State)),
    );
    payload.insert(
        "availability_topic".into(),
        json!(topics.topic(&entity.id, Category::Availability)),
    );
    payload.insert(
        "payload_available".into(),
        json!(Availability::Online.as_str()),
    );
    payload.insert(
        "payload_not_available".into(),
        json!(Availability::Offline.as_str()),
    );
    payload.insert("qos".into(), json!(ctx.qos));
    payload.insert("optimistic".into(), json!(false));

    let active = Status::ACTIVE;
    let inactive = Status::INACTIVE;
    let domain_fields = match entity.domain {
        Domain::Lock => json!({
            "payload_lock": active,
            "payload_unlock": inactive,
            "state_locked": active,
            "state_unlocked": inactive,
        }),
        Domain::Switch => json!({
            "payload_on": active,
            "payload_off": inactive,
            "state_on": active,
            "state_off": inactive,
        }),
        Domain::Cover => json!({
            "payload_close": active,
            "payload_open": inactive,
            // Pulse hardware has no stop line.
            "payload_stop": null,
            "state_closed": active,
            "state_open": inactive,
        }),
    };
    if let Value::Object(fields) = domain_fields {
        payload.extend(fields);
    }

    payload.insert(
        "device".into(),
        json!({
            "identifiers": [ctx.device_id],
            "name": ctx.device_name,
            "manufacturer": ctx.origin_name,
            "sw_version": ctx.origin_version,
        }),
    );
    payload.insert(
        "origin".into(),
        json!({
            "name": ctx.origin_name,
            "sw_version": ctx.origin_version,
        }),
    );

    Value::Object(payload)
}

/// Topic and serialized payload for one entity.
pub fn discovery_message(
    entity: &Entity,
    ctx: &DiscoveryContext,
    topics: &TopicNamer,
) -> DiscoveryMessage {
    DiscoveryMessage {
        topic: topics.discovery(entity.domain, &ctx.unique_id(entity)),
        payload: build_discovery(entity, ctx, topics).to_string(),
    }
}
