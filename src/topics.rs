//! Topic naming.
//!
//! Layout for entity `E` under namespace `ns`:
//!   ns/E/set           -> command (subscribed)
//!   ns/E/state         -> state (published, retained)
//!   ns/E/availability  -> availability (published, not retained)
//!
//! Topics are always recomputed, never stored, so the publisher and the
//! dispatcher agree without a lookup table.

use crate::entity::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Command,
    State,
    Availability,
}

impl Category {
    fn suffix(&self) -> &'static str {
        match self {
            Category::Command => "set",
            Category::State => "state",
            Category::Availability => "availability",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicNamer {
    namespace: String,
    discovery_prefix: String,
}

impl TopicNamer {
    pub fn new(namespace: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    pub fn topic(&self, entity_id: &str, category: Category) -> String {
        format!("{}/{}/{}", self.namespace, entity_id, category.suffix())
    }

    /// `{prefix}/{domain}/{unique_id}/config`
    pub fn discovery(&self, domain: Domain, unique_id: &str) -> String {
        format!("{}/{}/{}/config", self.discovery_prefix, domain, unique_id)
    }

    /// Map an inbound command topic back to the entity id it addresses.
    /// `pulsebridge/front-door/set` -> `front-door`
    pub fn command_entity<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.namespace.as_str())?.strip_prefix('/')?;
        let id = rest.strip_suffix("/set")?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }
}
