use super::{Transport, TransportError, TransportEvent};
use crate::config::MqttConf;
use crate::models::Node;
use crate::protocol::{CommandEnvelope, CommandResponse, NodeAnnouncement, NodeExitNotice, Topics};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

/// Transport MQTT : publie les commandes, une task dédiée poll l'event loop
/// et pousse les événements décodés dans le canal de la boucle de contrôle.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
}

impl MqttTransport {
    pub fn start(conf: &MqttConf) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut opts = MqttOptions::new(conf.client_id.clone(), conf.host.clone(), conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        opts.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let topics = Topics::new(conf.topic_prefix.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(host = %conf.host, port = conf.port, client_id = %conf.client_id, "starting MQTT transport");
        task::spawn(poll_event_loop(client.clone(), eventloop, topics.clone(), events_tx));

        (Self { client, topics }, events_rx)
    }
}

// try_* : file de requêtes pleine (broker injoignable) → erreur immédiate, jamais d'attente
impl Transport for MqttTransport {
    async fn send(&self, command: &CommandEnvelope) -> Result<(), TransportError> {
        let topic = self.topics.command(&command.node_id);
        let payload = serde_json::to_vec(command)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.client.try_disconnect()?;
        info!("MQTT transport stopped");
        Ok(())
    }
}

async fn poll_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Topics,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // (ré)abonnement à chaque connexion au broker
                for topic in [topics.register(), topics.exit(), topics.response()] {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        error!(topic = %topic, error = %e, "MQTT subscribe failed");
                    }
                }
                info!("connected to MQTT broker");
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                match decode_event(&topics, &p.topic, &p.payload) {
                    Ok(Some(event)) => {
                        if events.send(event).is_err() {
                            debug!("event receiver dropped, leaving MQTT loop");
                            break;
                        }
                    }
                    Ok(None) => debug!(topic = %p.topic, "ignoring message on unexpected topic"),
                    Err(e) => warn!(topic = %p.topic, error = %e, "invalid JSON payload"),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, leaving event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if events.is_closed() {
                    break;
                }
                warn!(error = ?e, "MQTT connection error, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Décode un message entrant. `Ok(None)` pour un topic qui ne nous concerne pas.
pub(crate) fn decode_event(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<Option<TransportEvent>, serde_json::Error> {
    if topic == topics.register() {
        let announcement: NodeAnnouncement = serde_json::from_slice(payload)?;
        Ok(Some(TransportEvent::Connected(Node::connected(
            announcement.node_id,
            announcement.name,
        ))))
    } else if topic == topics.exit() {
        let exit: NodeExitNotice = serde_json::from_slice(payload)?;
        Ok(Some(TransportEvent::Disconnected {
            node_id: exit.node_id,
            name: exit.name,
            reason: exit.reason,
        }))
    } else if topic == topics.response() {
        let response: CommandResponse = serde_json::from_slice(payload)?;
        Ok(Some(TransportEvent::Response(response)))
    } else {
        Ok(None)
    }
}
