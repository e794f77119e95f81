/**
 * RADIO CONTROLLER - Bibliothèque du contrôleur de testbed
 *
 * RÔLE : registre des nodes, dispatcher de commandes (async + bloquant),
 * table de configuration, variables observées, side-channel et boucle de
 * contrôle. Le binaire `main.rs` ne fait que l'assemblage.
 */

pub mod config;
pub mod control_loop;
pub mod dispatcher;
pub mod models;
pub mod observed;
pub mod protocol;
pub mod registry;
pub mod side_channel;
pub mod transport;
