//! Message type tags and the custom-type registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tag identifying a message type.
///
/// The standard types occupy tags 1 through 8. Custom types are assigned
/// successive tags by [`MsgType::register`] and are neither requests nor
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MsgType(pub i32);

const STANDARD_NAMES: [&str; 8] = ["CALL", "SUB", "UNSB", "PUB", "ACK", "NACK", "RES", "EVNT"];

const FIRST_CUSTOM: i32 = 9;

struct Registry {
    by_name: BTreeMap<String, i32>,
    by_tag: BTreeMap<i32, String>,
    next: i32,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        by_name: BTreeMap::new(),
        by_tag: BTreeMap::new(),
        next: FIRST_CUSTOM,
    })
});

impl MsgType {
    pub const CALL: MsgType = MsgType(1);
    pub const SUB: MsgType = MsgType(2);
    pub const UNSB: MsgType = MsgType(3);
    pub const PUB: MsgType = MsgType(4);
    pub const ACK: MsgType = MsgType(5);
    pub const NACK: MsgType = MsgType(6);
    pub const RES: MsgType = MsgType(7);
    pub const EVNT: MsgType = MsgType(8);

    /// Register a custom message type under `name` and return its tag.
    ///
    /// Meant to be called once per custom type during startup. Registering a
    /// name twice (or shadowing a standard name) is a configuration error
    /// and panics.
    pub fn register(name: &str) -> MsgType {
        if STANDARD_NAMES.contains(&name) {
            panic!("message type {name} is a standard type");
        }
        let mut reg = REGISTRY.write().unwrap();
        if reg.by_name.contains_key(name) {
            panic!("message type {name} already registered");
        }
        let tag = reg.next;
        reg.next += 1;
        reg.by_name.insert(name.to_string(), tag);
        reg.by_tag.insert(tag, name.to_string());
        MsgType(tag)
    }

    /// Look up a type by its wire name, standard or registered.
    pub fn from_name(name: &str) -> Option<MsgType> {
        if let Some(i) = STANDARD_NAMES.iter().position(|n| *n == name) {
            return Some(MsgType(i as i32 + 1));
        }
        REGISTRY.read().unwrap().by_name.get(name).map(|t| MsgType(*t))
    }

    /// True for the client-sent request types.
    pub fn is_read(self) -> bool {
        matches!(self, MsgType::CALL | MsgType::SUB | MsgType::UNSB | MsgType::PUB)
    }

    /// True for the server-sent response types.
    pub fn is_write(self) -> bool {
        matches!(self, MsgType::ACK | MsgType::NACK | MsgType::RES | MsgType::EVNT)
    }

    /// True for the eight standard types.
    pub fn is_standard(self) -> bool {
        (1..=8).contains(&self.0)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_standard() {
            return f.write_str(STANDARD_NAMES[(self.0 - 1) as usize]);
        }
        if let Some(name) = REGISTRY.read().unwrap().by_tag.get(&self.0) {
            return f.write_str(name);
        }
        write!(f, "<unknown: {}>", self.0)
    }
}

impl Serialize for MsgType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MsgType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        MsgType::from_name(&name)
            .ok_or_else(|| D::Error::custom(format!("unknown message type: {name}")))
    }
}
