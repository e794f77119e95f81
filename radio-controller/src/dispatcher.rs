/**
 * COMMAND DISPATCHER - Requêtes asynchrones vers les nodes + corrélation des réponses
 *
 * RÔLE :
 * Chaque commande publiée reçoit un request_id (UUID v4) et une entrée dans la
 * table des requêtes en attente. La réponse correspondante est routée soit vers
 * un canal oneshot (mode bloquant), soit vers le handler de son opération,
 * soit vers le handler par défaut.
 *
 * CYCLE DE VIE D'UNE REQUÊTE EN ATTENTE :
 * - créée par `request` / `request_with_reply`
 * - détruite par `complete` (réponse), `expire` (timeout), `forget_node` (exit)
 *   ou `clear` (arrêt)
 */

use crate::models::Node;
use crate::protocol::{CommandEnvelope, CommandResponse, Operation};
use crate::registry::NodeRegistry;
use crate::transport::{Transport, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type RequestId = String;

/// Ce que reçoit un handler quand une réponse est corrélée.
#[derive(Debug, Clone)]
pub struct Completion {
    pub node_name: String,
    pub elapsed: Duration,
    pub response: CommandResponse,
}

pub type Handler<S> = Box<dyn FnMut(&mut S, &Completion) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to publish {operation} to node '{node}': {source}")]
    Send {
        node: String,
        operation: Operation,
        #[source]
        source: TransportError,
    },
    #[error("node '{0}' is not connected")]
    NotConnected(String),
    #[error("request {0} timed out")]
    Timeout(RequestId),
    #[error("request {0} abandoned before a response arrived")]
    Abandoned(RequestId),
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Debug)]
struct PendingRequest {
    node_id: String,
    node_name: String,
    operation: Operation,
    issued_at: Instant,
    deadline: Option<Instant>,
    reply: Option<oneshot::Sender<CommandResponse>>,
}

pub struct Dispatcher<T, S> {
    transport: T,
    pending: HashMap<RequestId, PendingRequest>,
    handlers: HashMap<Operation, Handler<S>>,
    default_handler: Option<Handler<S>>,
    request_timeout: Option<Duration>,
}

impl<T: Transport, S> Dispatcher<T, S> {
    pub fn new(transport: T, request_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            default_handler: None,
            request_timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Un seul handler par opération : le dernier enregistré gagne.
    pub fn register_handler<F>(&mut self, operation: Operation, handler: F)
    where
        F: FnMut(&mut S, &Completion) + Send + 'static,
    {
        if self.handlers.insert(operation, Box::new(handler)).is_some() {
            debug!(operation = %operation, "replacing response handler");
        }
    }

    pub fn register_default_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut S, &Completion) + Send + 'static,
    {
        if self.default_handler.replace(Box::new(handler)).is_some() {
            debug!("replacing default response handler");
        }
    }

    /// Envoi non bloquant : le résultat ira au handler de l'opération.
    pub async fn request(
        &mut self,
        node: &Node,
        operation: Operation,
        args: Value,
    ) -> Result<RequestId, DispatchError> {
        self.issue(node, operation, args, None).await
    }

    /// Envoi dont la réponse sera livrée sur le receiver retourné au lieu du handler.
    pub async fn request_with_reply(
        &mut self,
        node: &Node,
        operation: Operation,
        args: Value,
    ) -> Result<(RequestId, oneshot::Receiver<CommandResponse>), DispatchError> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.issue(node, operation, args, Some(tx)).await?;
        Ok((request_id, rx))
    }

    async fn issue(
        &mut self,
        node: &Node,
        operation: Operation,
        args: Value,
        reply: Option<oneshot::Sender<CommandResponse>>,
    ) -> Result<RequestId, DispatchError> {
        let request_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let envelope = CommandEnvelope {
            request_id: request_id.clone(),
            node_id: node.id.clone(),
            operation,
            payload: args,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };

        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                operation,
                issued_at: now,
                deadline: self.request_timeout.map(|t| now + t),
                reply,
            },
        );

        if let Err(source) = self.transport.send(&envelope).await {
            self.pending.remove(&request_id);
            return Err(DispatchError::Send {
                node: node.name.clone(),
                operation,
                source,
            });
        }

        debug!(node = %node.name, operation = %operation, request_id = %request_id, "command sent");
        Ok(request_id)
    }

    /// Route une réponse. Retourne `false` si elle a été ignorée
    /// (requête inconnue/expirée ou node déconnecté).
    pub fn complete(&mut self, state: &mut S, response: CommandResponse, registry: &NodeRegistry) -> bool {
        let Some(pending) = self.pending.remove(&response.request_id) else {
            debug!(
                request_id = %response.request_id,
                node_id = %response.node_id,
                "response for unknown or expired request, dropping"
            );
            return false;
        };

        if pending.node_id != response.node_id || !registry.contains_id(&response.node_id) {
            info!(
                node = %pending.node_name,
                operation = %pending.operation,
                request_id = %response.request_id,
                "response from a node that is no longer connected, dropping"
            );
            return false;
        }

        let completion = Completion {
            node_name: pending.node_name,
            elapsed: pending.issued_at.elapsed(),
            response,
        };

        if let Some(reply) = pending.reply {
            if reply.send(completion.response).is_err() {
                debug!(node = %completion.node_name, "blocking caller went away before the response");
            }
            return true;
        }

        match self.handlers.get_mut(&completion.response.operation) {
            Some(handler) => handler(state, &completion),
            None => match self.default_handler.as_mut() {
                Some(handler) => handler(state, &completion),
                None => debug!(
                    operation = %completion.response.operation,
                    "no handler registered, response discarded"
                ),
            },
        }
        true
    }

    /// Supprime les requêtes dont la deadline est passée.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|request_id, pending| match pending.deadline {
            Some(deadline) if deadline <= now => {
                warn!(
                    node = %pending.node_name,
                    operation = %pending.operation,
                    request_id = %request_id,
                    "request timed out without response"
                );
                false
            }
            _ => true,
        });
        before - self.pending.len()
    }

    pub fn cancel(&mut self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Oublie les requêtes d'un node qui vient de partir.
    pub fn forget_node(&mut self, node_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.node_id != node_id);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(node_id = %node_id, dropped, "dropped pending requests of departed node");
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
