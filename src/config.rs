//! Gateway configuration loaded from TOML.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::FlowName;
use crate::template::{Template, Templates};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Users allowed to authenticate against the gateway
    pub users: Vec<UserConfig>,

    /// Flows, tried in order
    pub flows: Vec<FlowConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("remote-gateway");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            users: Vec::new(),
            flows: Vec::new(),
        }
    }
}

/// A user that may log in to the gateway.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,

    /// Hex encoded SHA-256 digest of the password.
    pub password_sha256: String,
}

impl UserConfig {
    pub fn new(name: impl Into<String>, password: &str) -> Self {
        Self {
            name: name.into(),
            password_sha256: sha256_hex(password),
        }
    }

    pub fn verify_password(&self, password: &str) -> bool {
        sha256_hex(password).eq_ignore_ascii_case(self.password_sha256.trim())
    }
}

impl fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserConfig")
            .field("name", &self.name)
            .field("password_sha256", &"***")
            .finish()
    }
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// A routing policy: who may use it and which backend serves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: FlowName,

    /// Users this flow applies to; empty means every authenticated user.
    #[serde(default)]
    pub users: Vec<String>,

    pub backend: BackendConfig,
}

impl FlowConfig {
    pub fn applies_to(&self, user: &str) -> bool {
        self.users.is_empty() || self.users.iter().any(|u| u == user)
    }
}

/// Backend selection, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Remote(RemoteConfig),
}

impl BackendConfig {
    /// Registry tag of the backend.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Remote(_) => "remote",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Remote(conf) => conf.validate(),
        }
    }
}

/// Configuration of the remote backend. Every field is templated and rendered
/// per request.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_true", alias = "loginAllowed")]
    pub login_allowed: Template<bool>,

    pub host: Template<String>,
    #[serde(default = "default_port")]
    pub port: Template<String>,
    #[serde(default = "default_user")]
    pub user: Template<String>,
    #[serde(default = "empty_string")]
    pub password: Template<String>,

    /// Parsed and validated, not consulted when running tasks.
    #[serde(default, alias = "shellCommand")]
    pub shell_command: Templates,
    /// Parsed and validated, not consulted when running tasks.
    #[serde(default, alias = "execCommand")]
    pub exec_command: Templates,
    /// Parsed and validated; sftp always runs the fixed upstream server command.
    #[serde(default, alias = "sftpCommand")]
    pub sftp_command: Templates,

    #[serde(default = "empty_string")]
    pub banner: Template<String>,
    #[serde(default = "default_true", alias = "portForwardingAllowed")]
    pub port_forwarding_allowed: Template<bool>,
}

fn default_true() -> Template<bool> {
    Template::of(true)
}

fn default_port() -> Template<String> {
    Template::literal("22")
}

fn default_user() -> Template<String> {
    Template::literal("{{authorization.user.name}}")
}

fn empty_string() -> Template<String> {
    Template::literal("")
}

impl RemoteConfig {
    /// Configuration with defaults for everything but the host.
    pub fn with_host(host: Template<String>) -> Self {
        Self {
            login_allowed: default_true(),
            host,
            port: default_port(),
            user: default_user(),
            password: empty_string(),
            shell_command: Templates::default(),
            exec_command: Templates::default(),
            sftp_command: Templates::default(),
            banner: empty_string(),
            port_forwarding_allowed: default_true(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.source().trim().is_empty() {
            bail!("host: required but empty");
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "***" };
        f.debug_struct("RemoteConfig")
            .field("login_allowed", &self.login_allowed)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &password)
            .field("shell_command", &self.shell_command)
            .field("exec_command", &self.exec_command)
            .field("sftp_command", &self.sftp_command)
            .field("banner", &self.banner)
            .field("port_forwarding_allowed", &self.port_forwarding_allowed)
            .finish()
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut user_names = HashSet::new();
        for user in &self.users {
            if user.name.is_empty() {
                bail!("users: empty user name");
            }
            if !user_names.insert(user.name.as_str()) {
                bail!("users: duplicate user '{}'", user.name);
            }
        }

        let mut flow_names = HashSet::new();
        for flow in &self.flows {
            if flow.name.as_str().is_empty() {
                bail!("flows: empty flow name");
            }
            if !flow_names.insert(flow.name.as_str()) {
                bail!("flows: duplicate flow '{}'", flow.name);
            }
            for user in &flow.users {
                if !user_names.contains(user.as_str()) {
                    bail!("flows.{}: unknown user '{}'", flow.name, user);
                }
            }
            flow.backend
                .validate()
                .with_context(|| format!("flows.{}.backend", flow.name))?;
        }
        Ok(())
    }

    /// Example configuration printed by `--generate-config`.
    pub fn sample() -> Result<Self> {
        let host = Template::new("upstream.example.com")
            .map_err(|e| anyhow!("sample host: {e}"))?;
        Ok(Self {
            users: vec![UserConfig::new("alice", "change-me")],
            flows: vec![FlowConfig {
                name: FlowName::new("default"),
                users: Vec::new(),
                backend: BackendConfig::Remote(RemoteConfig::with_host(host)),
            }],
            ..Self::default()
        })
    }

    pub fn find_user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create host key directory: {}", parent.display()))?;
        }
        Ok(())
    }
}
