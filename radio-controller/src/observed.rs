/**
 * OBSERVED VARIABLES - Dernières valeurs remontées par les nodes
 *
 * RÔLE :
 * - clés `"{node}_{attribut}"`, alimentées uniquement par le handler get_parameters
 * - attribut attendu mais absent de la réponse → `UNAVAILABLE` ("NA")
 * - merge idempotent : la même réponse deux fois donne le même mapping
 *
 * FONCTIONNEMENT :
 * Après chaque merge, le mapping complet est réécrit dans le fichier getter.
 */

use crate::config::{Attribute, ConfigTable, Scale};
use crate::dispatcher::Completion;
use crate::side_channel::SideChannel;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNAVAILABLE: &str = "NA";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObservedVariables {
    values: BTreeMap<String, Value>,
}

impl ObservedVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, node: &str, attributes: &[Attribute], data: &Map<String, Value>) {
        for attribute in attributes {
            let value = match data.get(&attribute.name) {
                Some(raw) => match &attribute.scale {
                    Some(scale) => scaled(node, &attribute.name, raw, scale),
                    None => raw.clone(),
                },
                None => Value::String(UNAVAILABLE.to_string()),
            };
            self.values
                .insert(format!("{}_{}", node, attribute.record_as), value);
        }

        // attributs renvoyés sans être configurés : gardés tels quels
        for (name, raw) in data {
            if !attributes.iter().any(|a| &a.name == name) {
                self.values.insert(format!("{}_{}", node, name), raw.clone());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

fn scaled(node: &str, attribute: &str, raw: &Value, scale: &Scale) -> Value {
    let number = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        // {:?} garde la décimale : 5000 / 1000 -> "5.0"
        Some(n) => Value::String(format!("{:?} {}", n / scale.divisor, scale.unit)),
        None => {
            warn!(node = %node, attribute = %attribute, value = %raw, "non numeric value, recording as is");
            raw.clone()
        }
    }
}

/// État manipulé par les handlers : variables + sortie getter.
pub struct ObservationStore {
    variables: ObservedVariables,
    sink: SideChannel,
}

impl ObservationStore {
    pub fn new(sink: SideChannel) -> Self {
        Self {
            variables: ObservedVariables::new(),
            sink,
        }
    }

    pub fn variables(&self) -> &ObservedVariables {
        &self.variables
    }

    /// Fusionne puis réécrit le fichier getter. Une erreur d'écriture est loggée, pas propagée.
    pub fn record(&mut self, node: &str, attributes: &[Attribute], data: &Map<String, Value>) {
        self.variables.merge(node, attributes, data);
        if let Err(e) = self.sink.persist_observed(self.variables.values()) {
            warn!(path = %self.sink.getter_path().display(), error = %e, "failed to persist observed variables");
        }
    }
}

/// Handler `get_parameters` : merge des attributs configurés pour le node.
pub fn get_parameters_handler(
    config: Arc<ConfigTable>,
) -> impl FnMut(&mut ObservationStore, &Completion) + Send + 'static {
    move |store: &mut ObservationStore, completion: &Completion| {
        let response = &completion.response;
        if !response.is_success() {
            warn!(
                node = %completion.node_name,
                error = response.error.as_deref().unwrap_or("unknown"),
                "get_parameters failed on node"
            );
            return;
        }

        info!(
            node = %completion.node_name,
            elapsed_ms = completion.elapsed.as_millis() as u64,
            data = ?response.data,
            "get_parameters response"
        );

        let empty = Map::new();
        let data = match response.data.as_ref() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!(node = %completion.node_name, data = %other, "get_parameters data is not a mapping");
                &empty
            }
            None => &empty,
        };
        let attributes = config
            .entry(&completion.node_name)
            .map(|entry| entry.attributes.as_slice())
            .unwrap_or(&[]);

        store.record(&completion.node_name, attributes, data);
    }
}

/// Handler par défaut : trace la réponse, sans effet de bord.
pub fn log_response(_store: &mut ObservationStore, completion: &Completion) {
    let response = &completion.response;
    if response.is_success() {
        info!(
            node = %completion.node_name,
            operation = %response.operation,
            data = ?response.data,
            "default handler"
        );
    } else {
        warn!(
            node = %completion.node_name,
            operation = %response.operation,
            error = response.error.as_deref().unwrap_or("unknown"),
            "command failed on node"
        );
    }
    debug!(request_id = %response.request_id, "response consumed");
}
