//! Connection configuration document.
//!
//! The document is a JSON object keyed by connection name (`Inband`,
//! `RackManager`, `NodeManager`, ...). Optional `"{Name}Tunnel"` sections carry
//! tunnel settings and a global `"Connection"` section holds shared options.

use super::ConfigError;
use serde_json::{Map, Value};
use std::path::Path;

/// Name of the global options section.
pub const GLOBAL_SECTION: &str = "Connection";

/// Field prefixes tried, in order, after the connection's own lower-cased name.
const ROLE_PREFIXES: [&str; 3] = ["inband", "rackmanager", "nodemanager"];

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_REDFISH_PORT: u16 = 443;
pub const DEFAULT_TUNNEL_LOCAL_HOST: &str = "localhost";
pub const DEFAULT_TUNNEL_SSH_LOCAL_PORT: u16 = 2222;
pub const DEFAULT_TUNNEL_REDFISH_LOCAL_PORT: u16 = 8443;
pub const DEFAULT_TUNNEL_AGENT_PORT: u16 = 22;

#[derive(Debug, Clone, Default)]
pub struct ConnectionsConfig {
    sections: Map<String, Value>,
}

impl ConnectionsConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(sections) => Ok(Self { sections }),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        Self::from_value(value)
    }

    /// Section for `name`, or `SectionNotFound`.
    pub fn section(&self, name: &str) -> Result<ConnectionSection, ConfigError> {
        match self.sections.get(name) {
            Some(Value::Object(fields)) => Ok(ConnectionSection {
                name: name.to_string(),
                fields: fields.clone(),
            }),
            _ => Err(ConfigError::SectionNotFound(name.to_string())),
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        matches!(self.sections.get(name), Some(Value::Object(_)))
    }

    fn global(&self) -> Option<&Map<String, Value>> {
        self.sections.get(GLOBAL_SECTION).and_then(Value::as_object)
    }

    /// Global TLS switch for Redfish. Defaults to true.
    pub fn use_ssl(&self) -> bool {
        self.global()
            .and_then(|g| g.get("use_ssl"))
            .map(truthy)
            .unwrap_or(true)
    }

    pub fn global_redfish_port(&self) -> Option<u16> {
        self.global()
            .and_then(|g| g.get("redfish_port"))
            .and_then(as_port)
    }

    /// Connection names to probe: the global `connections` list when present,
    /// otherwise every section that is neither global nor a tunnel section.
    pub fn declared_connections(&self) -> Vec<String> {
        if let Some(list) = self
            .global()
            .and_then(|g| g.get("connections"))
            .and_then(Value::as_array)
        {
            return list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        self.sections
            .iter()
            .filter(|(name, value)| {
                name.as_str() != GLOBAL_SECTION && !name.ends_with("Tunnel") && value.is_object()
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Connection types to probe. `local` is always included.
    pub fn declared_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .global()
            .and_then(|g| g.get("connection_types"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["ssh".to_string(), "redfish".to_string()]);
        if !types.iter().any(|t| t == "local") {
            types.push("local".to_string());
        }
        types
    }

    /// Tunnel settings for `name` when its section enables tunnelling.
    pub fn tunnel_for(&self, name: &str) -> Result<Option<TunnelSettings>, ConfigError> {
        let section = self.section(name)?;
        if !section.tunnel_enabled() {
            return Ok(None);
        }
        let tunnel_name = format!("{name}Tunnel");
        let tunnel = self.section(&tunnel_name).unwrap_or(ConnectionSection {
            name: tunnel_name,
            fields: Map::new(),
        });

        let agent = tunnel
            .get_str("tunnel_agent")
            .ok_or_else(|| ConfigError::MissingField {
                name: tunnel.name.clone(),
                field: "tunnel_agent".to_string(),
            })?;

        Ok(Some(TunnelSettings {
            agent,
            agent_port: tunnel
                .get_port("tunnel_agent_port")?
                .unwrap_or(DEFAULT_TUNNEL_AGENT_PORT),
            local_host: tunnel
                .get_str("tunnel_local_host")
                .unwrap_or_else(|| DEFAULT_TUNNEL_LOCAL_HOST.to_string()),
            ssh_local_port: tunnel
                .get_port("tunnel_ssh_local_port")?
                .unwrap_or(DEFAULT_TUNNEL_SSH_LOCAL_PORT),
            redfish_local_port: tunnel
                .get_port("tunnel_redfish_local_port")?
                .unwrap_or(DEFAULT_TUNNEL_REDFISH_LOCAL_PORT),
            username: section.username(),
            password: section.password(),
        }))
    }
}

/// One connection's fields with prefix-aware lookup.
#[derive(Debug, Clone)]
pub struct ConnectionSection {
    pub name: String,
    fields: Map<String, Value>,
}

impl ConnectionSection {
    /// Empty section, used for the implicit `local` connection.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Map::new(),
        }
    }

    /// Look up `field` as `{name}_{field}`, then `{role}_{field}`, then bare.
    pub fn lookup(&self, field: &str) -> Option<&Value> {
        let own = self.name.to_ascii_lowercase();
        std::iter::once(own.as_str())
            .chain(ROLE_PREFIXES)
            .map(|prefix| format!("{prefix}_{field}"))
            .find_map(|key| self.fields.get(&key))
            .or_else(|| self.fields.get(field))
            .filter(|v| !v.is_null())
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.lookup(field).is_some()
    }

    pub fn get_str(&self, field: &str) -> Option<String> {
        match self.lookup(field)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, field: &str) -> bool {
        self.lookup(field).map(truthy).unwrap_or(false)
    }

    pub fn get_port(&self, field: &str) -> Result<Option<u16>, ConfigError> {
        match self.lookup(field) {
            None => Ok(None),
            Some(value) => as_port(value).map(Some).ok_or_else(|| ConfigError::InvalidField {
                name: self.name.clone(),
                field: field.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn host(&self) -> Result<String, ConfigError> {
        self.get_str("host").ok_or_else(|| ConfigError::MissingField {
            name: self.name.clone(),
            field: "host".to_string(),
        })
    }

    pub fn username(&self) -> String {
        self.get_str("username").unwrap_or_default()
    }

    pub fn password(&self) -> Option<String> {
        self.get_str("password")
    }

    pub fn identity_file(&self) -> Option<String> {
        self.get_str("identity_file")
            .or_else(|| self.get_str("key_file"))
    }

    /// Password fed to `sudo -S`, falling back to the login password.
    pub fn sudo_password(&self) -> Option<String> {
        self.get_str("sudo_password").or_else(|| self.password())
    }

    pub fn ssh_port(&self) -> Result<u16, ConfigError> {
        Ok(match self.get_port("ssh_port")? {
            Some(port) => port,
            None => self.get_port("port")?.unwrap_or(DEFAULT_SSH_PORT),
        })
    }

    pub fn redfish_port(&self) -> Result<Option<u16>, ConfigError> {
        self.get_port("redfish_port")
    }

    pub fn tunnel_enabled(&self) -> bool {
        self.get_bool("tunnel")
    }
}

/// Local port-forward settings for a tunneled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub agent: String,
    pub agent_port: u16,
    pub local_host: String,
    pub ssh_local_port: u16,
    pub redfish_local_port: u16,
    pub username: String,
    pub password: Option<String>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        _ => false,
    }
}

fn as_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConnectionsConfig {
        ConnectionsConfig::from_value(json!({
            "Connection": {
                "use_ssl": false,
                "redfish_port": 8000,
                "connections": ["Inband", "NodeManager"],
                "connection_types": ["ssh", "redfish"]
            },
            "Inband": {
                "inband_host": "10.0.0.5",
                "inband_username": "root",
                "inband_password": "pw",
                "inband_ssh_port": "2200"
            },
            "NodeManager": {
                "nodemanager_host": "10.0.1.9",
                "nodemanager_username": "admin",
                "nodemanager_password": "secret",
                "nodemanager_tunnel": true
            },
            "NodeManagerTunnel": {
                "nodemanager_tunnel_agent": "jump.example",
                "nodemanager_tunnel_ssh_local_port": 2022
            },
            "Bmc": {
                "host": "bmc.example",
                "port": 2201
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_prefixed_lookup() {
        let cfg = sample();
        let inband = cfg.section("Inband").unwrap();
        assert_eq!(inband.host().unwrap(), "10.0.0.5");
        assert_eq!(inband.username(), "root");
        assert_eq!(inband.ssh_port().unwrap(), 2200);
        assert_eq!(inband.sudo_password().as_deref(), Some("pw"));

        let bmc = cfg.section("Bmc").unwrap();
        assert_eq!(bmc.host().unwrap(), "bmc.example");
        assert_eq!(bmc.ssh_port().unwrap(), 2201);
        assert_eq!(bmc.username(), "");
    }

    #[test]
    fn test_missing_section_and_field() {
        let cfg = sample();
        assert!(matches!(
            cfg.section("RackManager"),
            Err(ConfigError::SectionNotFound(_))
        ));
        let empty = ConnectionSection::empty("local");
        assert!(matches!(empty.host(), Err(ConfigError::MissingField { .. })));
        assert_eq!(empty.ssh_port().unwrap(), DEFAULT_SSH_PORT);
    }

    #[test]
    fn test_global_options() {
        let cfg = sample();
        assert!(!cfg.use_ssl());
        assert_eq!(cfg.global_redfish_port(), Some(8000));
        assert_eq!(cfg.declared_connections(), vec!["Inband", "NodeManager"]);
        assert_eq!(cfg.declared_types(), vec!["ssh", "redfish", "local"]);

        let bare = ConnectionsConfig::from_value(json!({"Inband": {}})).unwrap();
        assert!(bare.use_ssl());
        assert_eq!(bare.declared_connections(), vec!["Inband"]);
    }

    #[test]
    fn test_tunnel_settings() {
        let cfg = sample();
        assert!(cfg.tunnel_for("Inband").unwrap().is_none());

        let tunnel = cfg.tunnel_for("NodeManager").unwrap().unwrap();
        assert_eq!(tunnel.agent, "jump.example");
        assert_eq!(tunnel.local_host, DEFAULT_TUNNEL_LOCAL_HOST);
        assert_eq!(tunnel.ssh_local_port, 2022);
        assert_eq!(tunnel.redfish_local_port, DEFAULT_TUNNEL_REDFISH_LOCAL_PORT);
        assert_eq!(tunnel.agent_port, DEFAULT_TUNNEL_AGENT_PORT);
        assert_eq!(tunnel.username, "admin");
    }

    #[test]
    fn test_tunnel_without_agent_is_error() {
        let cfg = ConnectionsConfig::from_value(json!({
            "NodeManager": { "nodemanager_tunnel": "yes" }
        }))
        .unwrap();
        assert!(matches!(
            cfg.tunnel_for("NodeManager"),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_invalid_port() {
        let cfg = ConnectionsConfig::from_value(json!({
            "Inband": { "inband_ssh_port": "not-a-port" }
        }))
        .unwrap();
        let inband = cfg.section("Inband").unwrap();
        assert!(matches!(
            inband.ssh_port(),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            ConnectionsConfig::from_json_str("[1,2]"),
            Err(ConfigError::NotAnObject)
        ));
    }
}
