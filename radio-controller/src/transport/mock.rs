/**
 * MOCK TRANSPORT - Transport en mémoire pour les tests
 *
 * RÔLE : enregistre toutes les commandes publiées et simule les événements
 * entrants (register / exit / response) sans broker MQTT. `fail_sends` et
 * `hang_sends` reproduisent un client en erreur ou bloqué.
 */

use super::{Transport, TransportError, TransportEvent};
use crate::models::Node;
use crate::protocol::{CommandEnvelope, CommandResponse, Operation, ResponseStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<CommandEnvelope>>>,
    stopped: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    hang_sends: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            fail_sends: Arc::new(AtomicBool::new(false)),
            hang_sends: Arc::new(AtomicBool::new(false)),
            events,
        };
        (transport, receiver)
    }

    /// Simule un node qui s'annonce.
    pub fn connect(&self, node_id: &str, name: &str) {
        let _ = self
            .events
            .send(TransportEvent::Connected(Node::connected(node_id, name)));
    }

    /// Simule un node qui quitte le testbed.
    pub fn disconnect(&self, node_id: &str, name: &str, reason: &str) {
        let _ = self.events.send(TransportEvent::Disconnected {
            node_id: node_id.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Simule la réponse d'un node à une commande publiée.
    pub fn respond(&self, command: &CommandEnvelope, data: Value) {
        let _ = self
            .events
            .send(TransportEvent::Response(success_for(command, data)));
    }

    /// Exit de plusieurs nodes d'un coup, dans l'ordre donné.
    pub fn shutdown_all(&self, nodes: &[(&str, &str)]) {
        for (node_id, name) in nodes {
            self.disconnect(node_id, name, "shutdown");
        }
    }

    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// `send` ne rend plus la main, comme un client dont la file est pleine.
    pub fn hang_sends(&self, hang: bool) {
        self.hang_sends.store(hang, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<CommandEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, node_id: &str, operation: Operation) -> Vec<CommandEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.node_id == node_id && c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    async fn send(&self, command: &CommandEnvelope) -> Result<(), TransportError> {
        if self.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.stopped.load(Ordering::SeqCst) || self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        self.sent.lock().push(command.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn success_for(command: &CommandEnvelope, data: Value) -> CommandResponse {
    CommandResponse {
        request_id: command.request_id.clone(),
        node_id: command.node_id.clone(),
        operation: command.operation,
        status: ResponseStatus::Success,
        data: Some(data),
        error: None,
    }
}
