/**
 * TRANSPORT - Lien contrôleur ↔ nodes
 *
 * RÔLE :
 * La boucle de contrôle ne voit que deux choses : un `Transport` pour publier
 * les commandes et libérer la connexion, et le canal de `TransportEvent`
 * (arrivées, départs, réponses) rendu au démarrage du transport.
 *
 * IMPLÉMENTATIONS : `mqtt` (rumqttc), `mock` (tests, en mémoire).
 */

pub mod mqtt;

#[cfg(test)]
pub mod mock;

use crate::models::Node;
use crate::protocol::{CommandEnvelope, CommandResponse};
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected(Node),
    Disconnected {
        node_id: String,
        name: String,
        reason: String,
    },
    Response(CommandResponse),
}

pub trait Transport: Send + Sync + 'static {
    /// Publie une commande vers un node. Ne bloque pas sur la réponse.
    fn send(&self, command: &CommandEnvelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Libère la connexion sous-jacente.
    fn stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
