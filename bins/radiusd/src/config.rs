use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use thiserror::Error;

use radius::unlang::{
    parse_sections, CompileCtx, Dictionary, ParseError, PolicyCatalog, ReturnCode, SectionKind,
    VirtualServer,
};
use radius::{ListenerConfig, ModuleRegistry, StaticClient, MapRegistry, StaticModule};

use crate::constants::DEFAULT_CONFIG_FILE_PATH;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Error while parsing unlang: {0}")]
    Unlang(#[from] ParseError),

    #[error("Error while compiling unlang: {0}")]
    Compile(#[from] radius::unlang::CompileError),

    #[error("Unknown module type '{0}'")]
    UnknownModuleType(String),

    #[error("Unknown rcode '{0}' for always module")]
    UnknownRcode(String),

    #[error("Unknown section '{0}' in server unlang")]
    UnknownSection(String),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: ListenerConfig,

    #[serde(default)]
    pub client: Vec<ClientConfig>,

    #[serde(default)]
    pub module: Vec<ModuleConfig>,

    pub server: ServerConfig,

    pub dynamic_server: Option<ServerConfig>,

    pub workers: Option<usize>,

    /// Seconds before a request is answered with a synthesized error.
    #[serde(default = "default_max_request_time")]
    pub max_request_time: u64,
}

fn default_max_request_time() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub network: IpNetwork,
    pub secret: String,
    pub shortname: Option<String>,

    #[serde(default)]
    pub require_message_authenticator: bool,

    #[serde(default)]
    pub connected: bool,
}

impl ClientConfig {
    pub fn to_static(&self) -> StaticClient {
        StaticClient {
            network: self.network,
            secret: self.secret.clone(),
            shortname: self
                .shortname
                .clone()
                .unwrap_or_else(|| self.network.ip().to_string()),
            require_message_authenticator: self.require_message_authenticator,
            use_connected: self.connected,
        }
    }
}

/// A module instance. `always` is built in; everything else comes from
/// the module registry the deployment links in.
#[derive(Debug, Deserialize)]
pub struct ModuleConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub rcode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Unlang source: one block per section (authorize, authenticate,
    /// ...), plus an optional policy block.
    pub unlang: String,
}

impl Config {
    pub fn read(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE_PATH));
        let s = fs::read_to_string(path)?;
        let c: Self = toml::from_str(&s)?;
        Ok(c)
    }

    pub fn max_request_time(&self) -> Duration {
        Duration::from_secs(self.max_request_time)
    }

    /// Instantiate the configured modules.
    pub fn build_modules(&self) -> Result<ModuleRegistry, ConfigError> {
        let mut registry = ModuleRegistry::new();

        for module in &self.module {
            match module.ty.as_str() {
                "always" => {
                    let name = module.rcode.as_deref().unwrap_or("ok");
                    let rcode = ReturnCode::from_name(name)
                        .ok_or_else(|| ConfigError::UnknownRcode(name.to_string()))?;
                    registry.register(StaticModule::new(module.name.clone(), rcode));
                }
                other => return Err(ConfigError::UnknownModuleType(other.to_string())),
            }
        }

        Ok(registry)
    }
}

impl ServerConfig {
    /// Compile the unlang text into a virtual server.
    pub fn compile(
        &self,
        modules: &ModuleRegistry,
        maps: &MapRegistry,
        dict: &Dictionary,
    ) -> Result<Arc<VirtualServer>, ConfigError> {
        let sections = parse_sections(&self.unlang)?;

        // The policy catalog is shared by every section of this server.
        let mut policies = PolicyCatalog::new();
        for section in &sections {
            if section.name1 == "policy" {
                policies = PolicyCatalog::from_section(section);
            }
        }

        let ctx = CompileCtx {
            modules,
            maps,
            policies: &policies,
            dict,
        };

        let name = self.name.clone().unwrap_or_else(|| "default".to_string());
        let mut server = VirtualServer::new(name);

        for section in &sections {
            if section.name1 == "policy" {
                continue;
            }

            // "authenticate Auth-Type PAP" style subsections compile as
            // separate method trees keyed by their second name.
            let kind = SectionKind::from_name(&section.name1)
                .ok_or_else(|| ConfigError::UnknownSection(section.name1.clone()))?;
            let name2 = section
                .name2
                .as_deref()
                .and_then(|n| n.strip_prefix("Auth-Type "))
                .map(|n| n.to_string())
                .or_else(|| section.name2.clone());

            let tree = ctx.compile(section, kind)?;
            server.add_section(kind, name2, tree);
        }

        Ok(Arc::new(server))
    }
}
