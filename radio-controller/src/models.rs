use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Un node distant tel que vu par le contrôleur.
/// `id` vient du transport (opaque), `name` est la clé de la configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub connected_at: OffsetDateTime,
    pub last_seen: OffsetDateTime,
}

impl Node {
    pub fn connected(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            name: name.into(),
            state: ConnectionState::Connected,
            connected_at: now,
            last_seen: now,
        }
    }
}

/// États de la boucle de contrôle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingQuorum,
    Activating,
    Polling,
    Draining,
    Stopped,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Stopped)
    }
}
