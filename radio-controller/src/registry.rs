/**
 * NODE REGISTRY - Membres connectés du testbed, indexés par nom
 *
 * RÔLE : Registration / exit des nodes annoncés par le transport.
 * Politique de doublon : last-writer-wins. Un exit n'enlève l'entrée que si
 * l'id correspond à l'instance enregistrée (un exit tardif d'une ancienne
 * instance ne retire pas la nouvelle).
 *
 * Aucune opération ne retourne d'erreur : les cas anormaux sont loggés.
 */

use crate::models::{ConnectionState, Node};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub type NodesMap = BTreeMap<String, Node>;

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: NodesMap,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un node sous son nom. Retourne l'instance remplacée s'il y en avait une.
    pub fn on_connect(&mut self, mut node: Node) -> Option<Node> {
        node.state = ConnectionState::Connected;
        let name = node.name.clone();
        let id = node.id.clone();

        let replaced = self.nodes.insert(name.clone(), node);
        match &replaced {
            Some(old) if old.id != id => warn!(
                node = %name,
                old_id = %old.id,
                new_id = %id,
                "node name reused by a new instance, replacing"
            ),
            Some(_) => debug!(node = %name, id = %id, "node re-announced"),
            None => info!(node = %name, id = %id, "new node appeared"),
        }
        replaced
    }

    /// Retire le node si présent. `reason` n'est jamais interprété.
    pub fn on_disconnect(&mut self, node_id: &str, name: &str, reason: &str) -> Option<Node> {
        let current_id = self.nodes.get(name).map(|n| n.id.clone());
        match current_id {
            Some(current_id) if current_id == node_id => {
                let mut removed = self.nodes.remove(name)?;
                removed.state = ConnectionState::Disconnected;
                info!(node = %name, id = %node_id, reason = %reason, "node exit");
                Some(removed)
            }
            Some(current_id) => {
                info!(
                    node = %name,
                    id = %node_id,
                    current_id = %current_id,
                    reason = %reason,
                    "exit from a replaced instance, ignoring"
                );
                None
            }
            None => {
                info!(node = %name, id = %node_id, reason = %reason, "exit for unknown node, ignoring");
                None
            }
        }
    }

    /// Rafraîchit `last_seen` quand un message du node arrive.
    pub fn touch(&mut self, node_id: &str) -> bool {
        match self.nodes.values_mut().find(|n| n.id == node_id) {
            Some(node) => {
                node.last_seen = OffsetDateTime::now_utc();
                true
            }
            None => false,
        }
    }

    /// Copie indépendante, stable pendant une itération de la boucle.
    pub fn snapshot(&self) -> NodesMap {
        self.nodes.clone()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains_id(&self, node_id: &str) -> bool {
        self.nodes.values().any(|n| n.id == node_id)
    }

    /// Nodes connectés dont le nom fait partie de `required`, dans l'ordre de `required`.
    pub fn connected_required<'a, I>(&self, required: I) -> Vec<Node>
    where
        I: IntoIterator<Item = &'a String>,
    {
        required
            .into_iter()
            .filter_map(|name| self.nodes.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
