/**
 * CONFIGURATION - Fichier YAML du contrôleur + table des nodes attendus
 *
 * RÔLE : `ControllerConfig` = forme sérialisée (YAML + défauts),
 * `ConfigTable` = vue résolue et immuable (code des programmes chargé une fois).
 *
 * EXEMPLE :
 * ```yaml
 * mqtt: { host: 172.16.16.5, port: 1883 }
 * timing: { poll_interval_ms: 2000, request_timeout_ms: 10000 }
 * nodes:
 *   rx1:
 *     program: { file: ./programs/vr1_rx.grc, type: py }
 *     args: [""]
 *     attributes: [bandwidth, center_freq, throughput, pkt_rcvd]
 * ```
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "RADIO_CONTROLLER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "controller.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("node '{0}' has neither program.file nor program.code")]
    MissingProgram(String),
    #[error("failed to read program file {path:?} for node '{node}': {source}")]
    ProgramFile {
        node: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no nodes configured")]
    NoNodes,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default)]
    pub mqtt: MqttConf,
    #[serde(default)]
    pub timing: TimingConf,
    #[serde(default)]
    pub side_channel: SideChannelConf,
    #[serde(default = "default_nodes")]
    pub nodes: BTreeMap<String, NodeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConf {
    pub poll_interval_ms: u64,
    pub quorum_check_interval_ms: u64,
    /// `None` = une requête sans réponse reste en attente jusqu'à l'exit du node.
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SideChannelConf {
    pub getter_path: PathBuf,
    pub setter_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConf {
    pub program: ProgramConf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProgramConf {
    /// Par défaut : le nom du node.
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub code: Option<String>,
    #[serde(rename = "type", default = "default_program_type")]
    pub program_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum AttributeConf {
    Name(String),
    Detailed {
        name: String,
        record_as: Option<String>,
        scale: Option<Scale>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Scale {
    pub divisor: f64,
    pub unit: String,
}

fn default_client_id() -> String { "radio-controller".into() }
fn default_keep_alive() -> u64 { 15 }
fn default_topic_prefix() -> String { "radio".into() }
fn default_args() -> Vec<String> { vec![String::new()] }
fn default_program_type() -> String { "py".into() }

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

impl Default for TimingConf {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            quorum_check_interval_ms: 2000,
            request_timeout_ms: Some(10_000),
        }
    }
}

impl TimingConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn quorum_check_interval(&self) -> Duration {
        Duration::from_millis(self.quorum_check_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SideChannelConf {
    fn default() -> Self {
        Self {
            getter_path: PathBuf::from("./getter.json"),
            setter_path: PathBuf::from("./setter.json"),
        }
    }
}

/// Flowgraph minimal embarqué : la config par défaut démarre sans fichier externe.
fn placeholder_flowgraph(id: &str) -> String {
    format!("options:\n  parameters:\n    id: {id}\n    generate_options: no_gui\nblocks: []\nconnections: []\n")
}

/// Le testbed d'origine : un émetteur et deux récepteurs.
fn default_nodes() -> BTreeMap<String, NodeConf> {
    let node = |program: &str, attributes: &[&str]| NodeConf {
        program: ProgramConf {
            name: None,
            file: None,
            code: Some(placeholder_flowgraph(program)),
            program_type: default_program_type(),
        },
        args: default_args(),
        attributes: attributes.iter().map(|a| AttributeConf::Name(a.to_string())).collect(),
    };
    let rx_attributes = ["bandwidth", "center_freq", "throughput", "pkt_rcvd", "pkt_right"];

    let mut nodes = BTreeMap::new();
    nodes.insert("tx".to_string(), node("vr1_vr2_tx", &["bandwidth", "center_freq"]));
    nodes.insert("rx1".to_string(), node("vr1_rx", &rx_attributes));
    nodes.insert("rx2".to_string(), node("vr2_rx", &rx_attributes));
    nodes
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            timing: TimingConf::default(),
            side_channel: SideChannelConf::default(),
            nodes: default_nodes(),
        }
    }
}

/// Charge la config depuis `RADIO_CONTROLLER_CONFIG` (défaut `controller.yaml`).
/// Fichier absent ou vide : config par défaut.
pub async fn load_config() -> Result<ControllerConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> Result<ControllerConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(ControllerConfig::default());
    }

    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(ControllerConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ============ TABLE RÉSOLUE ============

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDescriptor {
    pub name: String,
    pub code: String,
    pub program_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub record_as: String,
    pub scale: Option<Scale>,
}

impl Attribute {
    /// Attribut nommé sans précision : applique les conventions connues
    /// (`throughput` en Kbps, `pkt_rcvd` enregistré comme `pkt_rcv`).
    pub fn named(name: &str) -> Self {
        let (record_as, scale) = match name {
            "throughput" => (
                name,
                Some(Scale {
                    divisor: 1000.0,
                    unit: "Kbps".into(),
                }),
            ),
            "pkt_rcvd" => ("pkt_rcv", None),
            _ => (name, None),
        };
        Self {
            name: name.to_string(),
            record_as: record_as.to_string(),
            scale,
        }
    }
}

impl From<&AttributeConf> for Attribute {
    fn from(conf: &AttributeConf) -> Self {
        match conf {
            AttributeConf::Name(name) => Attribute::named(name),
            AttributeConf::Detailed { name, record_as, scale } => {
                let defaults = Attribute::named(name);
                Attribute {
                    name: name.clone(),
                    record_as: record_as.clone().unwrap_or(defaults.record_as),
                    scale: scale.clone().or(defaults.scale),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub program: ProgramDescriptor,
    pub args: Vec<String>,
    pub attributes: Vec<Attribute>,
}

impl ConfigEntry {
    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

/// Table immuable nom de node → entrée. Construite une fois au démarrage.
#[derive(Debug, Clone, Default)]
pub struct ConfigTable {
    entries: BTreeMap<String, ConfigEntry>,
    required: Vec<String>,
}

impl ConfigTable {
    pub async fn from_config(cfg: &ControllerConfig) -> Result<Self, ConfigError> {
        if cfg.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }

        let mut entries = BTreeMap::new();
        for (name, node) in &cfg.nodes {
            let code = match (&node.program.code, &node.program.file) {
                (Some(code), _) => code.clone(),
                (None, Some(file)) => fs::read_to_string(file).await.map_err(|source| {
                    ConfigError::ProgramFile {
                        node: name.clone(),
                        path: file.clone(),
                        source,
                    }
                })?,
                (None, None) => return Err(ConfigError::MissingProgram(name.clone())),
            };

            let entry = ConfigEntry {
                program: ProgramDescriptor {
                    name: node.program.name.clone().unwrap_or_else(|| name.clone()),
                    code,
                    program_type: node.program.program_type.clone(),
                },
                args: node.args.clone(),
                attributes: node.attributes.iter().map(Attribute::from).collect(),
            };
            entries.insert(name.clone(), entry);
        }

        let required: Vec<String> = entries.keys().cloned().collect();
        info!(nodes = ?required, "configuration table loaded");
        Ok(Self { entries, required })
    }

    pub fn entry(&self, name: &str) -> Option<&ConfigEntry> {
        self.entries.get(name)
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
