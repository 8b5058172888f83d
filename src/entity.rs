use std::fmt;

use serde::Deserialize;

/// Device types the bridge can expose. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Lock,
    Switch,
    Cover,
}

impl Domain {
    /// Home Assistant component name, also used in the discovery topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Lock => "lock",
            Domain::Switch => "switch",
            Domain::Cover => "cover",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured binary-state device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub domain: Domain,
    /// Hardware channel pulsed to change state.
    pub control: String,
    /// Hardware channel read for the current state.
    pub monitor: String,
}

/// Canonical status token carried on command and state topics.
///
/// `Active` means the monitored line reads true (locked / on / closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Inactive,
}

impl Status {
    pub const ACTIVE: &'static str = "ACTIVE";
    pub const INACTIVE: &'static str = "INACTIVE";

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => Self::ACTIVE,
            Status::Inactive => Self::INACTIVE,
        }
    }

    /// Decode a command payload. Anything but the two exact tokens is `None`.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"ACTIVE" => Some(Status::Active),
            b"INACTIVE" => Some(Status::Inactive),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Status::Active)
    }
}

impl From<bool> for Status {
    fn from(value: bool) -> Self {
        if value {
            Status::Active
        } else {
            Status::Inactive
        }
    }
}

/// Token published on availability topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}
