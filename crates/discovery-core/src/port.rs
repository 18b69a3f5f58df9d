//! Port and event records reported by discovery workers.
//!
//! These are plain data. Field names on the wire follow the pluggable
//! discovery protocol (`protocolLabel`, `hardwareId`, ...), and every field
//! except `address` and `protocol` is optional when decoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Protocol name used when no explicit port was given and the upload tool is
/// expected to find the board by itself.
pub const DEFAULT_PROTOCOL: &str = "default";

/// Protocol assumed for a bare address that no worker reported.
pub const SERIAL_PROTOCOL: &str = "serial";

/// One discoverable attachment point.
///
/// `(address, protocol)` pairs are not unique across workers: two workers
/// may report the same device and both reports are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Protocol-specific identifier (`/dev/ttyACM0`, `COM3`, `192.168.1.7`)
    pub address: String,
    /// Human readable label for the address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Transport kind (`serial`, `network`, vendor names or `default`)
    pub protocol: String,
    /// Human readable protocol name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol_label: String,
    /// Worker-reported metadata such as USB `vid`/`pid`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Stable hardware identifier, when the worker knows one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hardware_id: String,
}

impl Port {
    /// Create a port with just an address and protocol.
    pub fn new(address: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    /// The "no explicit port" sentinel.
    pub fn default_port() -> Self {
        Self::new("", DEFAULT_PROTOCOL)
    }

    /// Set the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the display protocol label.
    pub fn with_protocol_label(mut self, label: impl Into<String>) -> Self {
        self.protocol_label = label.into();
        self
    }

    /// Add one metadata property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether this is the `default` sentinel.
    pub fn is_default(&self) -> bool {
        self.protocol == DEFAULT_PROTOCOL
    }

    /// Key identifying this port within a single worker's snapshot.
    pub fn key(&self) -> PortKey {
        PortKey {
            address: self.address.clone(),
            protocol: self.protocol.clone(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.protocol)
    }
}

/// `(address, protocol)` pair used to replay add/remove events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    /// Port address
    pub address: String,
    /// Port protocol
    pub protocol: String,
}

/// Kind of presence notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A port appeared
    Add,
    /// A port went away
    Remove,
}

impl EventKind {
    /// Wire name of the event (`add` / `remove`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Remove => "remove",
        }
    }

    /// Parse a wire `eventType` into an event kind.
    pub fn from_wire(event_type: &str) -> Option<Self> {
        match event_type {
            "add" => Some(EventKind::Add),
            "remove" => Some(EventKind::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification about a port's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Whether the port appeared or went away
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The port concerned
    pub port: Port,
}

impl Event {
    /// Build an `add` event.
    pub fn add(port: Port) -> Self {
        Self {
            kind: EventKind::Add,
            port,
        }
    }

    /// Build a `remove` event.
    pub fn remove(port: Port) -> Self {
        Self {
            kind: EventKind::Remove,
            port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_decodes_wire_names() {
        let json = r#"{
            "address": "/dev/ttyACM0",
            "label": "ttyACM0",
            "protocol": "serial",
            "protocolLabel": "Serial Port (USB)",
            "properties": {"pid": "0x0043", "vid": "0x2341"},
            "hardwareId": "85736323838351E0B1A1"
        }"#;

        let port: Port = serde_json::from_str(json).unwrap();
        assert_eq!(port.address, "/dev/ttyACM0");
        assert_eq!(port.properties.get("vid").map(String::as_str), Some("0x2341"));
        assert_eq!(port.hardware_id, "85736323838351E0B1A1");

        let mut expected = Port::new("/dev/ttyACM0", "serial")
            .with_label("ttyACM0")
            .with_protocol_label("Serial Port (USB)")
            .with_property("vid", "0x2341")
            .with_property("pid", "0x0043");
        expected.hardware_id = "85736323838351E0B1A1".into();
        assert_eq!(port, expected);
    }

    #[test]
    fn test_port_optional_fields_default() {
        let port: Port = serde_json::from_str(r#"{"address":"COM3","protocol":"serial"}"#).unwrap();
        assert_eq!(port, Port::new("COM3", "serial"));
        assert!(port.properties.is_empty());
    }

    #[test]
    fn test_default_sentinel() {
        let port = Port::default_port();
        assert!(port.is_default());
        assert!(port.address.is_empty());
        assert!(!Port::new("/dev/ttyUSB0", SERIAL_PROTOCOL).is_default());
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::from_wire("add"), Some(EventKind::Add));
        assert_eq!(EventKind::from_wire("remove"), Some(EventKind::Remove));
        assert_eq!(EventKind::from_wire("list"), None);
        assert_eq!(EventKind::Remove.to_string(), "remove");
    }
}
