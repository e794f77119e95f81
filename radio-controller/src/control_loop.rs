/**
 * CONTROL LOOP - Cycle de vie du testbed
 *
 * RÔLE :
 * AwaitingQuorum → Activating → Polling → Draining → Stopped
 * - AwaitingQuorum : attend que tous les nodes configurés soient connectés
 * - Activating : chaque node requis reçoit son programme dès son apparition ;
 *   le passage par cet état au quorum rattrape les activations manquées
 * - Polling : à chaque tick, get_parameters vers chaque node requis connecté,
 *   puis application des setters déposés dans le side-channel
 * - Draining / Stopped : registre vide (ou interruption) → libération du transport
 *
 * FONCTIONNEMENT :
 * Une seule task. `tokio::select!` sur le signal d'arrêt, le canal
 * d'événements du transport et les tickers. Les handlers de réponses
 * s'exécutent entre deux ticks, jamais en parallèle de la boucle.
 */

use crate::config::{ConfigTable, TimingConf};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::models::{LoopState, Node};
use crate::observed::{get_parameters_handler, log_response, ObservationStore, ObservedVariables};
use crate::protocol::{ActivationPayload, CommandResponse, Operation};
use crate::registry::{NodeRegistry, NodesMap};
use crate::side_channel::{SideChannel, SideChannelError};
use crate::transport::{Transport, TransportEvent};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Déclenche l'arrêt de la boucle depuis n'importe quelle task (Ctrl-C...).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// `None` si l'arrêt est demandé avant la fin de `work` (un envoi bloqué
/// dans le transport ne doit pas retenir l'interruption).
async fn unless_shutdown<F: Future>(rx: &mut watch::Receiver<bool>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown_requested(rx) => None,
        out = work => Some(out),
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct Orchestrator<T: Transport> {
    config: Arc<ConfigTable>,
    timing: TimingConf,
    registry: NodeRegistry,
    dispatcher: Dispatcher<T, ObservationStore>,
    store: ObservationStore,
    side_channel: SideChannel,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// ids des instances déjà activées
    activated: HashSet<String>,
    state: LoopState,
    state_tx: watch::Sender<LoopState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        config: Arc<ConfigTable>,
        timing: TimingConf,
        side_channel: SideChannel,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(transport, timing.request_timeout());
        dispatcher.register_handler(Operation::GetParameters, get_parameters_handler(config.clone()));
        dispatcher.register_default_handler(log_response);

        let (state_tx, _) = watch::channel(LoopState::AwaitingQuorum);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            timing,
            registry: NodeRegistry::new(),
            dispatcher,
            store: ObservationStore::new(side_channel.clone()),
            side_channel,
            events,
            activated: HashSet::new(),
            state: LoopState::AwaitingQuorum,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn state_watcher(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn observed(&self) -> &ObservedVariables {
        self.store.variables()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Accès au dispatcher pour enregistrer d'autres handlers.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T, ObservationStore> {
        &mut self.dispatcher
    }

    /// Boucle principale. Retourne quand l'état devient `Stopped`.
    pub async fn run(&mut self) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut quorum_ticker = interval(self.timing.quorum_check_interval());
        quorum_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_ticker = interval(self.timing.poll_interval());
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(required = ?self.config.required(), "control loop started");

        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    info!("interrupt received, stopping");
                    self.stop().await;
                }
                // une étape interrompue est reprise par la branche d'arrêt au tour suivant
                event = self.events.recv() => match event {
                    Some(event) => {
                        unless_shutdown(&mut shutdown, self.handle_event(event)).await;
                    }
                    None => {
                        error!("transport event channel closed, stopping");
                        self.stop().await;
                    }
                },
                _ = quorum_ticker.tick(), if self.state == LoopState::AwaitingQuorum => {
                    if self.quorum_reached() {
                        unless_shutdown(&mut shutdown, self.enter_polling()).await;
                    } else {
                        self.log_quorum_progress();
                    }
                }
                _ = poll_ticker.tick(), if self.state == LoopState::Polling => {
                    unless_shutdown(&mut shutdown, self.poll_tick()).await;
                }
            }
        }
    }

    /// Requête bloquante : suspend la boucle jusqu'à la réponse, le timeout ou l'arrêt.
    /// Les autres événements continuent d'être traités pendant l'attente.
    pub async fn request_blocking(
        &mut self,
        name: &str,
        operation: Operation,
        args: Value,
    ) -> Result<CommandResponse, DispatchError> {
        let node = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::NotConnected(name.to_string()))?;
        let mut shutdown = self.shutdown_rx.clone();
        let issued = unless_shutdown(
            &mut shutdown,
            self.dispatcher.request_with_reply(&node, operation, args),
        )
        .await;
        let Some(issued) = issued else {
            self.stop().await;
            return Err(DispatchError::Shutdown);
        };
        let (request_id, mut reply) = issued?;
        let deadline = self.timing.request_timeout().map(|t| Instant::now() + t);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    self.dispatcher.cancel(&request_id);
                    self.stop().await;
                    return Err(DispatchError::Shutdown);
                }
                result = &mut reply => {
                    return result.map_err(|_| DispatchError::Abandoned(request_id));
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        unless_shutdown(&mut shutdown, self.handle_event(event)).await;
                    }
                    None => {
                        error!("transport event channel closed, stopping");
                        self.stop().await;
                        return Err(DispatchError::Shutdown);
                    }
                },
                _ = deadline_reached(deadline) => {
                    self.dispatcher.cancel(&request_id);
                    return Err(DispatchError::Timeout(request_id));
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(node) => self.on_node_connected(node).await,
            TransportEvent::Disconnected { node_id, name, reason } => {
                self.on_node_exit(&node_id, &name, &reason).await
            }
            TransportEvent::Response(response) => {
                self.registry.touch(&response.node_id);
                self.dispatcher
                    .complete(&mut self.store, response, &self.registry);
            }
        }
    }

    async fn on_node_connected(&mut self, node: Node) {
        if self.state.is_terminal() || self.state == LoopState::Draining {
            return;
        }
        let name = node.name.clone();
        let id = node.id.clone();

        if let Some(previous) = self.registry.on_connect(node) {
            if previous.id != id {
                self.dispatcher.forget_node(&previous.id);
                self.activated.remove(&previous.id);
            }
        }

        if !self.config.is_required(&name) {
            info!(node = %name, "node is not part of this deployment, ignoring it");
        } else {
            self.activate(&name).await;
        }

        if self.state == LoopState::AwaitingQuorum && self.quorum_reached() {
            self.enter_polling().await;
        }
    }

    async fn on_node_exit(&mut self, node_id: &str, name: &str, reason: &str) {
        if let Some(removed) = self.registry.on_disconnect(node_id, name, reason) {
            self.dispatcher.forget_node(&removed.id);
            self.activated.remove(&removed.id);
        }

        if self.state == LoopState::Polling && self.registry.is_empty() {
            self.drain().await;
        }
    }

    fn quorum_reached(&self) -> bool {
        self.config
            .required()
            .iter()
            .all(|name| self.registry.get(name).is_some())
    }

    fn log_quorum_progress(&self) {
        let required = self.config.required();
        let connected = self.registry.connected_required(required).len();
        info!(
            connected,
            missing = required.len() - connected,
            total_registered = self.registry.len(),
            "waiting for nodes"
        );
    }

    async fn enter_polling(&mut self) {
        self.set_state(LoopState::Activating);
        let config = Arc::clone(&self.config);
        for name in config.required() {
            self.activate(name).await;
        }
        info!("all nodes connected, starting to poll");
        self.set_state(LoopState::Polling);
    }

    /// Envoie le programme au node `name` si cette instance ne l'a pas encore reçu.
    async fn activate(&mut self, name: &str) {
        let Some(node) = self.registry.get(name).cloned() else {
            return;
        };
        if self.activated.contains(&node.id) {
            return;
        }
        let Some(entry) = self.config.entry(name) else {
            return;
        };

        let payload = ActivationPayload {
            program_name: entry.program.name.clone(),
            program_code: entry.program.code.clone(),
            program_args: entry.args.clone(),
            program_type: entry.program.program_type.clone(),
        };
        let args = match serde_json::to_value(&payload) {
            Ok(args) => args,
            Err(e) => {
                error!(node = %name, error = %e, "failed to encode activation payload");
                return;
            }
        };

        match self
            .dispatcher
            .request(&node, Operation::ActivateRadioProgram, args)
            .await
        {
            Ok(request_id) => {
                info!(node = %name, program = %payload.program_name, request_id = %request_id, "radio program activation sent");
                self.activated.insert(node.id);
            }
            Err(e) => warn!(node = %name, error = %e, "activation failed, will retry on next tick"),
        }
    }

    async fn poll_tick(&mut self) {
        if self.registry.is_empty() {
            self.drain().await;
            return;
        }

        let snapshot = self.registry.snapshot();
        let config = Arc::clone(&self.config);

        // les getters sont asynchrones : les réponses arrivent via le handler get_parameters
        for name in config.required() {
            let (Some(node), Some(entry)) = (snapshot.get(name), config.entry(name)) else {
                continue;
            };
            self.activate(name).await;

            debug!(node = %name, "requesting parameters");
            if let Err(e) = self
                .dispatcher
                .request(node, Operation::GetParameters, json!(entry.attribute_names()))
                .await
            {
                warn!(node = %name, error = %e, "get_parameters not sent");
            }
        }

        self.apply_setters(&snapshot).await;

        let expired = self.dispatcher.expire(Instant::now());
        if expired > 0 {
            debug!(expired, pending = self.dispatcher.pending_len(), "expired requests");
        }
    }

    async fn apply_setters(&mut self, snapshot: &NodesMap) {
        let setters = match self.side_channel.take_setters() {
            Ok(setters) => setters,
            Err(SideChannelError::Missing(path)) => {
                debug!(path = %path.display(), "no setters file");
                return;
            }
            Err(e) => {
                warn!(
                    path = %self.side_channel.setter_path().display(),
                    error = %e,
                    "could not read setters file, skipping this cycle"
                );
                return;
            }
        };

        for (name, payload) in setters {
            if !self.config.is_required(&name) {
                warn!(node = %name, "setter for a node outside the deployment, discarding");
                continue;
            }
            let Some(node) = snapshot.get(&name) else {
                warn!(node = %name, "setter for a disconnected node, discarding");
                continue;
            };
            if !payload.is_object() {
                warn!(node = %name, payload = %payload, "setter payload is not a mapping, discarding");
                continue;
            }

            info!(node = %name, payload = %payload, "setting node configuration");
            if let Err(e) = self
                .dispatcher
                .request(node, Operation::SetParameters, payload)
                .await
            {
                warn!(node = %name, error = %e, "set_parameters not sent");
            }
        }
    }

    async fn drain(&mut self) {
        self.set_state(LoopState::Draining);
        info!("all nodes disconnected, exiting controller");
        self.stop().await;
    }

    async fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.dispatcher.clear();
        if let Err(e) = self.dispatcher.transport().stop().await {
            warn!(error = %e, "transport did not stop cleanly");
        }
        self.set_state(LoopState::Stopped);
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "control loop transition");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, SideChannelConf};
    use crate::protocol::CommandEnvelope;
    use crate::transport::mock::MockTransport;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Bench {
        transport: MockTransport,
        side_channel: SideChannel,
        _dir: TempDir,
    }

    async fn bench(request_timeout_ms: Option<u64>) -> (Orchestrator<MockTransport>, Bench) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ControllerConfig::default();
        for (name, node) in cfg.nodes.iter_mut() {
            node.program.file = None;
            node.program.code = Some(format!("# {name} flowgraph"));
        }
        cfg.timing = TimingConf {
            poll_interval_ms: 100,
            quorum_check_interval_ms: 100,
            request_timeout_ms,
        };
        let side_channel = SideChannel::new(&SideChannelConf {
            getter_path: dir.path().join("getter.json"),
            setter_path: dir.path().join("setter.json"),
        });
        let table = ConfigTable::from_config(&cfg).await.unwrap();

        let (transport, events) = MockTransport::new();
        let orchestrator = Orchestrator::new(
            Arc::new(table),
            cfg.timing.clone(),
            side_channel.clone(),
            transport.clone(),
            events,
        );
        let bench = Bench {
            transport,
            side_channel,
            _dir: dir,
        };
        (orchestrator, bench)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn read_json(path: &Path) -> Option<Value> {
        std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn last_get(transport: &MockTransport, node_id: &str) -> Option<CommandEnvelope> {
        transport.sent_to(node_id, Operation::GetParameters).pop()
    }

    fn spawn(
        mut orchestrator: Orchestrator<MockTransport>,
    ) -> tokio::task::JoinHandle<Orchestrator<MockTransport>> {
        tokio::spawn(async move {
            orchestrator.run().await;
            orchestrator
        })
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_completes_only_with_the_last_required_node() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;

        for (id, name) in [("id-rx1", "rx1"), ("id-tx", "tx")] {
            t.connect(id, name);
            wait_until(|| !t.sent_to(id, Operation::ActivateRadioProgram).is_empty()).await;
            assert_eq!(*states.borrow(), LoopState::AwaitingQuorum);
        }
        assert!(t.sent_to("id-rx1", Operation::GetParameters).is_empty());

        t.connect("id-rx2", "rx2");
        states
            .wait_for(|s| *s == LoopState::Polling)
            .await
            .unwrap();

        for (id, name) in [("id-tx", "tx"), ("id-rx1", "rx1"), ("id-rx2", "rx2")] {
            let activations = t.sent_to(id, Operation::ActivateRadioProgram);
            assert_eq!(activations.len(), 1, "{name} activated once");
            let payload: ActivationPayload =
                serde_json::from_value(activations[0].payload.clone()).unwrap();
            assert_eq!(payload.program_name, name);
            assert_eq!(payload.program_args, vec![String::new()]);
            assert_eq!(payload.program_type, "py");
            assert_eq!(payload.program_code, format!("# {name} flowgraph"));
        }

        t.shutdown_all(&[("id-tx", "tx"), ("id-rx1", "rx1"), ("id-rx2", "rx2")]);
        let orchestrator = handle.await.unwrap();
        assert_eq!(orchestrator.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_nodes_are_never_activated_nor_block_quorum() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;

        t.connect("id-x", "spectrum-analyzer");
        t.connect("id-tx", "tx");
        t.connect("id-rx1", "rx1");
        t.connect("id-rx2", "rx2");
        states
            .wait_for(|s| *s == LoopState::Polling)
            .await
            .unwrap();

        wait_until(|| last_get(t, "id-rx2").is_some()).await;
        assert!(t.sent().iter().all(|c| c.node_id != "id-x"));

        // le node étranger garde la boucle en vie tant qu'il est enregistré
        t.shutdown_all(&[("id-tx", "tx"), ("id-rx1", "rx1"), ("id-rx2", "rx2")]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*states.borrow(), LoopState::Polling);

        t.disconnect("id-x", "spectrum-analyzer", "done");
        states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();
        let orchestrator = handle.await.unwrap();
        assert!(orchestrator.registry().is_empty());
        assert!(t.sent().iter().all(|c| c.node_id != "id-x"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_response_lands_in_the_getter_file() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        wait_until(|| last_get(t, "id-rx1").is_some()).await;
        let get = last_get(t, "id-rx1").unwrap();
        assert_eq!(
            get.payload,
            json!(["bandwidth", "center_freq", "throughput", "pkt_rcvd", "pkt_right"])
        );
        t.respond(&get, json!({"bandwidth": 20, "center_freq": 900}));

        let getter = bench.side_channel.getter_path().to_path_buf();
        wait_until(|| read_json(&getter).is_some()).await;
        let written = read_json(&getter).unwrap();
        assert_eq!(written["rx1_bandwidth"], json!(20));
        assert_eq!(written["rx1_center_freq"], json!(900));
        assert_eq!(written["rx1_throughput"], json!("NA"));
        assert_eq!(written["rx1_pkt_rcv"], json!("NA"));

        let get = last_get(t, "id-rx2").unwrap();
        t.respond(&get, json!({"throughput": 5000}));
        wait_until(|| {
            read_json(&getter)
                .map(|v| v.get("rx2_throughput").is_some())
                .unwrap_or(false)
        })
        .await;
        assert_eq!(read_json(&getter).unwrap()["rx2_throughput"], json!("5.0 Kbps"));

        bench.shutdown(&mut states).await;
        let orchestrator = handle.await.unwrap();
        assert_eq!(orchestrator.observed().get("rx1_bandwidth"), Some(&json!(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn setter_round_trip_reaches_the_getter_file() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        let setter = bench.side_channel.setter_path().to_path_buf();
        std::fs::write(
            &setter,
            serde_json::to_vec(&json!({
                "rx1": {"center_freq": 915},
                "ghost": {"center_freq": 1}
            }))
            .unwrap(),
        )
        .unwrap();

        wait_until(|| !t.sent_to("id-rx1", Operation::SetParameters).is_empty()).await;
        let set = t.sent_to("id-rx1", Operation::SetParameters).remove(0);
        assert_eq!(set.payload, json!({"center_freq": 915}));
        assert_eq!(read_json(&setter), Some(json!({})));
        t.respond(&set, json!({"center_freq": 915}));

        // le node applique la valeur, le prochain get la remonte
        t.clear();
        wait_until(|| last_get(t, "id-rx1").is_some()).await;
        let get = last_get(t, "id-rx1").unwrap();
        t.respond(&get, json!({"center_freq": 915}));

        let getter = bench.side_channel.getter_path().to_path_buf();
        wait_until(|| {
            read_json(&getter)
                .map(|v| v["rx1_center_freq"] == json!(915))
                .unwrap_or(false)
        })
        .await;
        assert!(t.sent().iter().all(|c| c.operation != Operation::SetParameters || c.node_id == "id-rx1"));

        bench.shutdown(&mut states).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_setter_file_is_cleared_and_polling_continues() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        let setter = bench.side_channel.setter_path().to_path_buf();
        std::fs::write(&setter, b"{ not json").unwrap();
        wait_until(|| read_json(&setter) == Some(json!({}))).await;

        t.clear();
        wait_until(|| last_get(t, "id-tx").is_some()).await;
        assert_eq!(*states.borrow(), LoopState::Polling);

        bench.shutdown(&mut states).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn partial_exit_keeps_polling_and_full_exit_stops() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        t.disconnect("id-rx2", "rx2", "power off");
        wait_until(|| !t.sent_to("id-tx", Operation::GetParameters).is_empty()).await;
        t.clear();
        wait_until(|| t.sent_to("id-tx", Operation::GetParameters).len() >= 2).await;
        assert!(t.sent_to("id-rx2", Operation::GetParameters).is_empty());
        assert_eq!(*states.borrow(), LoopState::Polling);

        t.disconnect("id-tx", "tx", "power off");
        t.disconnect("id-rx1", "rx1", "power off");
        states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();

        let orchestrator = handle.await.unwrap();
        assert!(orchestrator.registry().is_empty());
        assert!(t.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_under_new_id_is_activated_again() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        t.connect("id-rx1-b", "rx1");
        wait_until(|| !t.sent_to("id-rx1-b", Operation::ActivateRadioProgram).is_empty()).await;

        // exit tardif de l'ancienne instance : ignoré
        t.disconnect("id-rx1", "rx1", "stale");
        t.clear();
        wait_until(|| last_get(t, "id-rx1-b").is_some()).await;
        assert!(last_get(t, "id-rx1").is_none());

        bench.shutdown(&mut states).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_awaiting_quorum_releases_transport() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let shutdown = orchestrator.shutdown_handle();
        let handle = spawn(orchestrator);

        bench.transport.connect("id-tx", "tx");
        wait_until(|| !bench.transport.sent().is_empty()).await;
        shutdown.trigger();

        states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();
        handle.await.unwrap();
        assert!(bench.transport.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_is_reached_on_the_third_node_in_every_order() {
        let nodes = [("id-tx", "tx"), ("id-rx1", "rx1"), ("id-rx2", "rx2")];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let (orchestrator, bench) = bench(Some(1000)).await;
            let mut states = orchestrator.state_watcher();
            let handle = spawn(orchestrator);
            let t = &bench.transport;

            for &i in &order[..2] {
                let (id, name) = nodes[i];
                t.connect(id, name);
                wait_until(|| !t.sent_to(id, Operation::ActivateRadioProgram).is_empty()).await;
                assert_eq!(*states.borrow(), LoopState::AwaitingQuorum, "order {order:?}");
            }
            assert!(
                t.sent().iter().all(|c| c.operation == Operation::ActivateRadioProgram),
                "order {order:?}: polled before quorum"
            );

            let (id, name) = nodes[order[2]];
            t.connect(id, name);
            states.wait_for(|s| *s == LoopState::Polling).await.unwrap();
            for (id, _) in nodes {
                assert_eq!(t.sent_to(id, Operation::ActivateRadioProgram).len(), 1);
            }

            bench.shutdown(&mut states).await;
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_polling_releases_transport() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let shutdown = orchestrator.shutdown_handle();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();
        wait_until(|| last_get(t, "id-rx1").is_some()).await;

        shutdown.trigger();
        states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();
        let orchestrator = handle.await.unwrap();
        assert!(t.is_stopped());
        // nodes toujours enregistrés : l'arrêt ne passe pas par Draining
        assert_eq!(orchestrator.registry().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_is_honored_while_a_send_is_stuck() {
        let (orchestrator, bench) = bench(Some(1000)).await;
        let mut states = orchestrator.state_watcher();
        let shutdown = orchestrator.shutdown_handle();
        let handle = spawn(orchestrator);
        let t = &bench.transport;
        bench.connect_all();
        states.wait_for(|s| *s == LoopState::Polling).await.unwrap();

        t.hang_sends(true);
        t.clear();
        // au moins un tick de polling est maintenant bloqué dans send
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();

        states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();
        let orchestrator = handle.await.unwrap();
        assert!(t.is_stopped());
        assert_eq!(orchestrator.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_aborts_a_blocking_request() {
        let (mut orchestrator, bench) = bench(None).await;
        let shutdown = orchestrator.shutdown_handle();
        orchestrator
            .handle_event(TransportEvent::Connected(Node::connected("id-tx", "tx")))
            .await;

        let watcher = bench.transport.clone();
        tokio::spawn(async move {
            wait_until(|| last_get(&watcher, "id-tx").is_some()).await;
            shutdown.trigger();
        });

        let err = orchestrator
            .request_blocking("tx", Operation::GetParameters, json!(["bandwidth"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Shutdown));
        assert_eq!(orchestrator.state(), LoopState::Stopped);
        assert_eq!(orchestrator.dispatcher_mut().pending_len(), 0);
        assert!(bench.transport.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_request_waits_for_its_response() {
        let (mut orchestrator, bench) = bench(Some(1000)).await;
        orchestrator
            .handle_event(TransportEvent::Connected(Node::connected("id-tx", "tx")))
            .await;

        let responder = bench.transport.clone();
        tokio::spawn(async move {
            wait_until(|| last_get(&responder, "id-tx").is_some()).await;
            let get = last_get(&responder, "id-tx").unwrap();
            responder.respond(&get, json!({"bandwidth": 5}));
        });

        let response = orchestrator
            .request_blocking("tx", Operation::GetParameters, json!(["bandwidth"]))
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["bandwidth"], json!(5));
        // la réponse est livrée à l'appelant, pas au handler
        assert!(orchestrator.observed().get("tx_bandwidth").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_request_times_out() {
        let (mut orchestrator, _bench) = bench(Some(500)).await;
        orchestrator
            .handle_event(TransportEvent::Connected(Node::connected("id-tx", "tx")))
            .await;

        let err = orchestrator
            .request_blocking("tx", Operation::GetParameters, json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
        // seule l'activation de tx reste en attente
        assert_eq!(orchestrator.dispatcher_mut().pending_len(), 1);

        let err = orchestrator
            .request_blocking("rx2", Operation::GetParameters, json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotConnected(_)));
    }

    impl Bench {
        fn connect_all(&self) {
            self.transport.connect("id-tx", "tx");
            self.transport.connect("id-rx1", "rx1");
            self.transport.connect("id-rx2", "rx2");
        }

        async fn shutdown(&self, states: &mut watch::Receiver<LoopState>) {
            self.transport
                .shutdown_all(&[("id-tx", "tx"), ("id-rx1", "rx1"), ("id-rx2", "rx2")]);
            states.wait_for(|s| *s == LoopState::Stopped).await.unwrap();
        }
    }
}
