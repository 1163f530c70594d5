use std::{
    collections::HashSet,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Failed to read inventory file {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },
    #[error("Failed to parse inventory: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Node [{0}] appears more than once in the inventory")]
    DuplicateNode(String),
    #[error("Node [{0}] not found")]
    NodeNotFound(String),
    #[error("Option [{0}] missing from inventory")]
    MissingOption(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAssignment {
    Static,
    Dynamic,
}

/// Which interface of a node an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRole {
    Primary,
    Bmc,
    Hsm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface<'a> {
    pub role: InterfaceRole,
    pub ip: &'a str,
    pub mac: &'a str,
    pub assignment: IpAssignment,
}

/// One node of the test cluster as described by the inventory.
///
/// Credentials are deliberately absent, they live in the inventory options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Fully qualified name, unique within a directory.
    #[serde(rename = "node")]
    pub name: String,

    pub ip: String,
    pub mac: String,
    pub ip_type: IpAssignment,

    pub bmc_ip: String,
    pub bmc_mac: String,
    pub bmc_ip_type: IpAssignment,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_ip_type: Option<IpAssignment>,

    #[serde(rename = "t_machine_type", default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "t_exclude", default)]
    pub exclude: Option<String>,
}

impl NodeRecord {
    /// Host part of the fully qualified name.
    pub fn short_name(&self) -> &str {
        short_hostname(&self.name)
    }

    pub fn is_excluded(&self) -> bool {
        self.exclude.as_deref() == Some("yes")
    }

    pub fn interfaces(&self) -> Vec<Interface<'_>> {
        let mut interfaces = vec![
            Interface {
                role: InterfaceRole::Primary,
                ip: &self.ip,
                mac: &self.mac,
                assignment: self.ip_type,
            },
            Interface {
                role: InterfaceRole::Bmc,
                ip: &self.bmc_ip,
                mac: &self.bmc_mac,
                assignment: self.bmc_ip_type,
            },
        ];

        if let (Some(ip), Some(mac), Some(assignment)) =
            (&self.hsm_ip, &self.hsm_mac, self.hsm_ip_type)
        {
            interfaces.push(Interface {
                role: InterfaceRole::Hsm,
                ip,
                mac,
                assignment,
            });
        }

        interfaces
    }

    /// Interfaces that get their address from DHCP. Static interfaces never do.
    pub fn dhcp_interfaces(&self) -> Vec<Interface<'_>> {
        self.interfaces()
            .into_iter()
            .filter(|i| i.assignment == IpAssignment::Dynamic)
            .collect()
    }
}

impl Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

pub fn short_hostname(fqdn: &str) -> &str {
    fqdn.split('.').next().unwrap_or(fqdn)
}

#[derive(Debug, Deserialize)]
struct Inventory {
    nodes: Vec<NodeRecord>,
    #[serde(flatten)]
    options: Map<String, Value>,
}

/// Read only view over the node inventory JSON document.
///
/// The document has a top level `nodes` array and scalar options such as
/// `ipmi_user`, `ipmi_pass` and `domain`.
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    nodes: Vec<NodeRecord>,
    options: Map<String, Value>,
}

impl NodeDirectory {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| DirectoryError::Read {
            path: path.to_owned(),
            err,
        })?;

        tracing::debug!("Loaded inventory from {}", path.display());

        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, DirectoryError> {
        let inventory: Inventory = serde_json::from_str(json)?;
        Self::new(inventory.nodes, inventory.options)
    }

    pub fn new(nodes: Vec<NodeRecord>, options: Map<String, Value>) -> Result<Self, DirectoryError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(DirectoryError::DuplicateNode(node.name.clone()));
            }
        }

        Ok(Self { nodes, options })
    }

    pub fn all_nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn require_node(&self, name: &str) -> Result<&NodeRecord, DirectoryError> {
        self.node_by_name(name)
            .ok_or_else(|| DirectoryError::NodeNotFound(name.to_owned()))
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// A string option, numbers and booleans are rendered as their JSON text.
    pub fn string_option(&self, name: &str) -> Option<String> {
        match self.options.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn require_string_option(&self, name: &str) -> Result<String, DirectoryError> {
        self.string_option(name)
            .ok_or_else(|| DirectoryError::MissingOption(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = include_str!("../tests/fixtures/test_network_cfg.json");

    #[test]
    fn loads_nodes_and_options() {
        let directory = NodeDirectory::from_json_str(INVENTORY).unwrap();

        assert_eq!(directory.all_nodes().len(), 3);
        assert_eq!(directory.string_option("ipmi_user").as_deref(), Some("admin"));
        assert_eq!(directory.string_option("domain").as_deref(), Some("a.b.de"));
        assert!(directory.option("no_such_option").is_none());
    }

    #[test]
    fn node_by_name() {
        let directory = NodeDirectory::from_json_str(INVENTORY).unwrap();

        let node = directory.node_by_name("test_node").unwrap();
        assert_eq!(node.bmc_ip, "1.2.3.4");
        assert_eq!(node.short_name(), "test_node");

        assert!(directory.node_by_name("missing").is_none());
        assert!(matches!(
            directory.require_node("missing"),
            Err(DirectoryError::NodeNotFound(_))
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let json = r#"{
            "nodes": [
                {"node": "a.lab", "ip": "1.1.1.1", "mac": "m1", "ip_type": "static",
                 "bmc_ip": "2.2.2.2", "bmc_mac": "b1", "bmc_ip_type": "static"},
                {"node": "a.lab", "ip": "1.1.1.2", "mac": "m2", "ip_type": "static",
                 "bmc_ip": "2.2.2.3", "bmc_mac": "b2", "bmc_ip_type": "static"}
            ]
        }"#;

        let err = NodeDirectory::from_json_str(json).unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateNode(name) if name == "a.lab"));
    }

    #[test]
    fn rejects_unknown_assignment_mode() {
        let json = r#"{
            "nodes": [
                {"node": "a.lab", "ip": "1.1.1.1", "mac": "m1", "ip_type": "sometimes",
                 "bmc_ip": "2.2.2.2", "bmc_mac": "b1", "bmc_ip_type": "static"}
            ]
        }"#;

        assert!(matches!(
            NodeDirectory::from_json_str(json),
            Err(DirectoryError::Parse(_))
        ));
    }

    #[test]
    fn only_dynamic_interfaces_are_dhcp_eligible() {
        let directory = NodeDirectory::from_json_str(INVENTORY).unwrap();
        let node = directory.node_by_name("ses-client-3.a.b.de").unwrap();

        let dhcp: Vec<_> = node.dhcp_interfaces().iter().map(|i| i.role).collect();
        assert_eq!(dhcp, vec![InterfaceRole::Primary, InterfaceRole::Hsm]);

        assert_eq!(node.short_name(), "ses-client-3");
        assert!(!node.is_excluded());
    }

    #[test]
    fn excluded_flag() {
        let directory = NodeDirectory::from_json_str(INVENTORY).unwrap();
        let node = directory.node_by_name("ses-spare-1.a.b.de").unwrap();

        assert!(node.is_excluded());
        assert!(node.dhcp_interfaces().is_empty());
    }
}
