/**
 * RADIO NODE SIM - Node radio simulé
 *
 * RÔLE :
 * Remplace un vrai node (SDR + runtime de flowgraph) pour faire tourner le
 * contrôleur sans matériel. Parle exactement les mêmes contrats MQTT.
 *
 * FONCTIONNEMENT :
 * - Au ConnAck : abonnement à son topic de commandes + annonce register@v1
 *   (répété à chaque reconnexion broker)
 * - Last-will sur exit@v1 : un crash produit quand même un exit côté contrôleur
 * - activate_radio_program : mémorise le programme, passe en "running"
 * - get_parameters : renvoie les attributs connus ; pkt_rcvd / pkt_right /
 *   throughput avancent à chaque lecture tant qu'un programme tourne
 * - set_parameters : fusionne les valeurs nombre/texte
 * - Ctrl-C : exit@v1 puis déconnexion propre
 *
 * COMMUNICATION MQTT :
 * Écoute: {prefix}/nodes/command@v1/{node_id}
 * Publie: {prefix}/nodes/register@v1, exit@v1, response@v1
 */

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Paquets simulés par lecture quand un programme tourne.
const PACKETS_PER_READ: u64 = 100;
const PACKET_BITS: u64 = 50;
/// Un paquet sur 50 arrive corrompu.
const CORRUPT_EVERY: u64 = 50;

// ============ CONTRATS (identiques au contrôleur) ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetParameters,
    SetParameters,
    ActivateRadioProgram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: String,
    pub name: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExitNotice {
    pub node_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub request_id: String,
    pub node_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub node_id: String,
    pub operation: Operation,
    pub status: ResponseStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationPayload {
    pub program_name: String,
    pub program_code: String,
    pub program_args: Vec<String>,
    pub program_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid activation payload: {0}")]
    Activation(#[from] serde_json::Error),
    #[error("get_parameters expects a list of attribute names")]
    AttributeList,
    #[error("set_parameters expects a mapping of attribute values")]
    SetterMapping,
    #[error("attribute '{0}' is read-only")]
    ReadOnly(String),
}

// ============ SETTINGS ============

#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub node_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub topic_prefix: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mqtt_port = match std::env::var("MQTT_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {raw}"))?,
            Err(_) => 1883,
        };
        Ok(Self {
            name: std::env::var("NODE_NAME").unwrap_or_else(|_| "tx".into()),
            node_id: std::env::var("NODE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string()),
            mqtt_host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
            mqtt_port,
            topic_prefix: std::env::var("RADIO_TOPIC_PREFIX")
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "radio".into()),
        })
    }

    fn topic(&self, contract: &str) -> String {
        format!("{}/nodes/{}", self.topic_prefix, contract)
    }

    fn command_topic(&self) -> String {
        format!("{}/nodes/command@v1/{}", self.topic_prefix, self.node_id)
    }

    fn exit_notice(&self, reason: &str) -> NodeExitNotice {
        NodeExitNotice {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

// ============ ÉTAT RADIO ============

#[derive(Debug)]
struct LoadedProgram {
    name: String,
    program_type: String,
    args: Vec<String>,
}

/// État d'un node : réglages + compteurs de trafic.
#[derive(Debug)]
pub struct RadioState {
    settings: BTreeMap<String, Value>,
    program: Option<LoadedProgram>,
    pkt_rcvd: u64,
    pkt_right: u64,
    throughput: u64,
}

impl Default for RadioState {
    fn default() -> Self {
        let mut settings = BTreeMap::new();
        settings.insert("bandwidth".to_string(), json!(20));
        settings.insert("center_freq".to_string(), json!(900));
        settings.insert("gain".to_string(), json!(10));
        Self {
            settings,
            program: None,
            pkt_rcvd: 0,
            pkt_right: 0,
            throughput: 0,
        }
    }
}

impl RadioState {
    pub fn is_running(&self) -> bool {
        self.program.is_some()
    }

    fn activate(&mut self, payload: Value) -> Result<Value, CommandError> {
        let payload: ActivationPayload = serde_json::from_value(payload)?;
        info!(
            program = %payload.program_name,
            program_type = %payload.program_type,
            code_bytes = payload.program_code.len(),
            "radio program loaded"
        );
        let program = LoadedProgram {
            name: payload.program_name,
            program_type: payload.program_type,
            args: payload.program_args,
        };
        let data = json!({
            "running": true,
            "program_name": program.name,
            "program_type": program.program_type,
            "program_args": program.args,
        });
        self.program = Some(program);
        self.pkt_rcvd = 0;
        self.pkt_right = 0;
        self.throughput = 0;
        Ok(data)
    }

    fn read(&mut self, payload: &Value) -> Result<Value, CommandError> {
        let requested = payload.as_array().ok_or(CommandError::AttributeList)?;

        if self.is_running() {
            let corrupt = PACKETS_PER_READ / CORRUPT_EVERY;
            self.pkt_rcvd += PACKETS_PER_READ;
            self.pkt_right += PACKETS_PER_READ - corrupt;
            self.throughput = PACKETS_PER_READ * PACKET_BITS;
        }

        let mut data = Map::new();
        for name in requested.iter().filter_map(Value::as_str) {
            let value = match name {
                "pkt_rcvd" => Some(json!(self.pkt_rcvd)),
                "pkt_right" => Some(json!(self.pkt_right)),
                "throughput" => Some(json!(self.throughput)),
                other => self.settings.get(other).cloned(),
            };
            // attribut inconnu : omis, le contrôleur le marquera indisponible
            if let Some(value) = value {
                data.insert(name.to_string(), value);
            }
        }
        Ok(Value::Object(data))
    }

    fn write(&mut self, payload: Value) -> Result<Value, CommandError> {
        let Value::Object(values) = payload else {
            return Err(CommandError::SetterMapping);
        };

        // tout ou rien : un compteur dans le lot rejette le lot entier
        if let Some(name) = values.keys().find(|name| is_counter(name)) {
            return Err(CommandError::ReadOnly(name.clone()));
        }

        let mut applied = Map::new();
        for (name, value) in values {
            match value {
                Value::Number(_) | Value::String(_) => {
                    self.settings.insert(name.clone(), value.clone());
                    applied.insert(name, value);
                }
                other => warn!(attribute = %name, value = %other, "unsupported value type, ignored"),
            }
        }
        Ok(Value::Object(applied))
    }
}

fn is_counter(name: &str) -> bool {
    matches!(name, "pkt_rcvd" | "pkt_right" | "throughput")
}

/// Exécute une commande et construit la réponse, succès ou erreur.
pub fn process_command(state: &mut RadioState, command: CommandEnvelope) -> CommandResponse {
    let result = match command.operation {
        Operation::ActivateRadioProgram => state.activate(command.payload),
        Operation::GetParameters => state.read(&command.payload),
        Operation::SetParameters => state.write(command.payload),
    };

    let (status, data, error) = match result {
        Ok(data) => (ResponseStatus::Success, Some(data), None),
        Err(e) => (ResponseStatus::Error, None, Some(e.to_string())),
    };
    CommandResponse {
        request_id: command.request_id,
        node_id: command.node_id,
        operation: command.operation,
        status,
        data,
        error,
    }
}

// ============ MQTT ============

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

async fn announce(client: &AsyncClient, settings: &Settings) -> Result<()> {
    client
        .subscribe(settings.command_topic(), QoS::AtLeastOnce)
        .await?;
    let announcement = NodeAnnouncement {
        node_id: settings.node_id.clone(),
        name: settings.name.clone(),
        timestamp: Some(now_rfc3339()),
    };
    client
        .publish(
            settings.topic("register@v1"),
            QoS::AtLeastOnce,
            false,
            serde_json::to_vec(&announcement)?,
        )
        .await?;
    info!(node = %settings.name, node_id = %settings.node_id, "registered with controller");
    Ok(())
}

async fn handle_command(client: &AsyncClient, settings: &Settings, state: &mut RadioState, payload: &[u8]) {
    let command: CommandEnvelope = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "invalid command JSON, ignored");
            return;
        }
    };
    debug!(operation = ?command.operation, request_id = %command.request_id, "command received");

    let response = process_command(state, command);
    if let Some(err) = &response.error {
        warn!(operation = ?response.operation, error = %err, "command failed");
    }

    match serde_json::to_vec(&response) {
        Ok(json) => {
            if let Err(e) = client
                .publish(settings.topic("response@v1"), QoS::AtLeastOnce, false, json)
                .await
            {
                error!(error = %e, "failed to publish response");
            }
        }
        Err(e) => error!(error = %e, "failed to encode response"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("radio_node_sim=info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(node = %settings.name, node_id = %settings.node_id, "radio node simulator starting");

    let mut opts = MqttOptions::new(
        format!("radio-node-{}", settings.node_id),
        settings.mqtt_host.clone(),
        settings.mqtt_port,
    );
    opts.set_keep_alive(Duration::from_secs(5));
    opts.set_last_will(LastWill::new(
        settings.topic("exit@v1"),
        serde_json::to_vec(&settings.exit_notice("connection lost"))?,
        QoS::AtLeastOnce,
        false,
    ));

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    let command_topic = settings.command_topic();
    let mut state = RadioState::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received, leaving the testbed");
                let notice = serde_json::to_vec(&settings.exit_notice("interrupted"))?;
                client
                    .publish(settings.topic("exit@v1"), QoS::AtLeastOnce, false, notice)
                    .await
                    .context("failed to publish exit notice")?;
                client.disconnect().await.context("failed to disconnect")?;
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if let Err(e) = announce(&client, &settings).await {
                        error!(error = %e, "registration failed");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == command_topic => {
                    handle_command(&client, &settings, &mut state, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT error, retrying");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    // vide la file : exit + disconnect doivent partir avant de quitter
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    info!("radio node simulator stopped");
    Ok(())
}
