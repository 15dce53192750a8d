//! Parsed view of a job body.
//!
//! Job bodies are YAML documents owned by the submitter. The scheduler only
//! reads the `protocols` block (multi-node role, essential flag, VLAN
//! requirements) and the top-level `connection` key, and writes the resolved
//! multi-node role map back before a group is released to its dispatchers.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::{Mapping, Value};

use crate::error::SchedulerResult;

/// Multi-node coordination protocol.
pub const MULTINODE: &str = "lava-multinode";

/// VLAN allocation protocol.
pub const VLAND: &str = "lava-vland";

/// Top-level key marking a secondary (device-less) connection.
pub const CONNECTION_KEY: &str = "connection";

/// Cheap textual test run before parsing a definition.
#[must_use]
pub fn references_protocol(text: &str, protocol: &str) -> bool {
    text.contains(protocol)
}

/// A parsed job definition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    root: Value,
}

impl JobDefinition {
    /// Parses a YAML job body.
    pub fn parse(text: &str) -> SchedulerResult<Self> {
        let root: Value = serde_yaml::from_str(text)?;
        Ok(Self { root })
    }

    /// Serialises the definition back to YAML.
    pub fn to_yaml(&self) -> SchedulerResult<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    fn protocol(&self, name: &str) -> Option<&Value> {
        self.root.get("protocols").and_then(|p| p.get(name))
    }

    /// Returns true when the definition declares the protocol block.
    #[must_use]
    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocol(name).is_some()
    }

    /// Role of this sub-job within its multi-node group.
    #[must_use]
    pub fn multinode_role(&self) -> Option<&str> {
        self.protocol(MULTINODE)
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
    }

    /// Returns true when the role is declared essential.
    #[must_use]
    pub fn is_essential(&self) -> bool {
        let Some(multinode) = self.protocol(MULTINODE) else {
            return false;
        };
        if multinode.get("role").is_none() {
            return false;
        }
        multinode
            .get("essential")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns true for secondary connections that need no device.
    #[must_use]
    pub fn is_dynamic_connection(&self) -> bool {
        self.root.get(CONNECTION_KEY).is_some()
    }

    /// VLANs requested through the VLAN protocol, with the interface tags
    /// each one requires.
    #[must_use]
    pub fn vlan_requests(&self) -> BTreeMap<String, BTreeSet<String>> {
        let Some(Value::Mapping(vlans)) = self.protocol(VLAND) else {
            return BTreeMap::new();
        };
        vlans
            .iter()
            .filter_map(|(name, spec)| {
                let name = name.as_str()?.to_owned();
                let tags = spec
                    .get("tags")
                    .and_then(Value::as_sequence)
                    .map(|seq| {
                        seq.iter()
                            .filter_map(Value::as_str)
                            .map(ToOwned::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                Some((name, tags))
            })
            .collect()
    }

    /// Writes the group's device-to-role map into the multi-node block.
    ///
    /// Definitions without a multi-node block are left untouched.
    pub fn set_multinode_roles(&mut self, roles: &BTreeMap<String, String>) {
        let Some(Value::Mapping(multinode)) = self
            .root
            .get_mut("protocols")
            .and_then(|p| p.get_mut(MULTINODE))
        else {
            return;
        };
        let mapping: Mapping = roles
            .iter()
            .map(|(device, role)| (Value::String(device.clone()), Value::String(role.clone())))
            .collect();
        multinode.insert(Value::String("roles".to_owned()), Value::Mapping(mapping));
    }
}
