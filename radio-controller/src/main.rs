/**
 * RADIO CONTROLLER - Point d'entrée du contrôleur de testbed radio
 *
 * RÔLE : Bootstrap : config, table des nodes, side-channel, transport MQTT,
 * puis boucle de contrôle jusqu'à ce que tous les nodes soient partis (ou Ctrl-C).
 *
 * ARCHITECTURE : Event-driven via MQTT (register / exit / response), polling
 * périodique des paramètres, fichiers getter/setter pour les outils externes.
 */

use radio_controller::config::{load_config, ConfigTable};
use radio_controller::control_loop::Orchestrator;
use radio_controller::side_channel::SideChannel;
use radio_controller::transport::mqtt::MqttTransport;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("radio_controller=info")),
        )
        .init();

    info!("radio controller starting");

    let cfg = load_config().await.context("failed to load configuration")?;
    let table = ConfigTable::from_config(&cfg)
        .await
        .context("failed to build node configuration table")?;
    let side_channel = SideChannel::new(&cfg.side_channel);
    info!(
        getter = %side_channel.getter_path().display(),
        setter = %side_channel.setter_path().display(),
        "side-channel files"
    );

    let (transport, events) = MqttTransport::start(&cfg.mqtt);
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, prefix = %cfg.mqtt.topic_prefix, "MQTT transport started");

    let mut orchestrator = Orchestrator::new(
        Arc::new(table),
        cfg.timing.clone(),
        side_channel,
        transport,
        events,
    );

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.trigger(),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    orchestrator.run().await;
    info!("radio controller stopped");
    Ok(())
}
