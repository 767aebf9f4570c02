//! Connection registry and message routing.
//!
//! The physical transport is out of scope; a connection is a pair of
//! channels. The router validates inbound frames, manages usernames and
//! games, and forwards parsed commands onto each game's inbound queue. Lock
//! order is always connections before games.

use crate::server::game::{self, GameInfo, InboundEvent, GameStatus, ServerGame, SlotKind};
use crate::server::lobby::Lobby;
use crate::shared::error::GameError;
use crate::shared::messages::{Envelope, GameMode, Response, parse_binary_upload};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type ConnectionId = u64;

/// Default field size handed to new games when the client does not send its
/// terminal dimensions.
const DEFAULT_LINES: i64 = 40;
const DEFAULT_COLS: i64 = 80;

struct Connection {
    username: Option<String>,
    out_tx: Sender<Response>,
}

struct GameEntry {
    info: Arc<GameInfo>,
    inbound_tx: Sender<InboundEvent>,
}

#[derive(Default)]
struct GamesRegistry {
    games: HashMap<String, GameEntry>,
    by_user: HashMap<String, String>,
}

/// A connected client's endpoints, as the transport layer would see them.
pub struct ClientHandle {
    pub id: ConnectionId,
    pub responses: Receiver<Response>,
}

pub struct Router {
    base_path: PathBuf,
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    games: RwLock<GamesRegistry>,
}

impl Router {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            games: RwLock::new(GamesRegistry::default()),
        }
    }

    /// Registers a new connection and returns the client-side endpoints.
    pub fn connect(&self) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, responses) = unbounded();
        self.connections.write().expect("not poisoned").insert(
            id,
            Connection {
                username: None,
                out_tx,
            },
        );
        log::info!("ROUTER: connection {} opened", id);
        ClientHandle { id, responses }
    }

    /// Tears a connection down and tells its game the player is gone.
    pub fn disconnect(&self, id: ConnectionId) {
        let username = {
            let mut connections = self.connections.write().expect("not poisoned");
            connections.remove(&id).and_then(|c| c.username)
        };
        log::info!("ROUTER: connection {} closed", id);
        let Some(username) = username else { return };
        let games = self.games.read().expect("not poisoned");
        if let Some(game_id) = games.by_user.get(&username)
            && let Some(entry) = games.games.get(game_id)
        {
            let _ = entry
                .inbound_tx
                .send(InboundEvent::Disconnected(username.clone()));
        }
    }

    /// Handles one text frame. Malformed frames are logged and dropped; the
    /// connection stays open.
    pub fn handle_frame(&self, id: ConnectionId, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("ROUTER: {} from connection {}", err, id);
                return;
            }
        };
        match envelope.command.as_str() {
            "initialize" => self.handle_initialize(id, &envelope),
            "init_game" => self.handle_init_game(id, &envelope),
            _ => self.forward_to_game(&envelope),
        }
    }

    /// Handles one binary frame: an audio upload `"<filename>$<bytes>"`.
    pub fn handle_binary(&self, id: ConnectionId, frame: &[u8]) {
        let (filename, payload) = match parse_binary_upload(frame) {
            Ok(parts) => parts,
            Err(err) => {
                log::warn!("ROUTER: {} from connection {}", err, id);
                return;
            }
        };
        let Some(username) = self.username_of(id) else {
            log::warn!("ROUTER: upload from unnamed connection {}", id);
            return;
        };
        let dir = self.base_path.join("data/user-files").join(&username);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            log::error!("ROUTER: cannot create {:?}: {}", dir, err);
            return;
        }
        let path = dir.join(&filename);
        match std::fs::write(&path, payload) {
            Ok(()) => log::info!("ROUTER: stored upload at {:?}", path),
            Err(err) => log::error!("ROUTER: cannot store {:?}: {}", path, err),
        }
    }

    /// Games currently waiting for more players.
    pub fn lobby(&self) -> Lobby {
        let games = self.games.read().expect("not poisoned");
        let mut lobby = Lobby::new();
        for entry in games.games.values() {
            if entry.info.status() == GameStatus::WaitingForPlayers {
                lobby.add_entry(
                    &entry.info.id,
                    entry.info.max_players,
                    entry.info.cur_players(),
                    &entry.info.audio_map_name(),
                );
            }
        }
        lobby
    }

    fn handle_initialize(&self, id: ConnectionId, envelope: &Envelope) {
        let username = &envelope.username;
        let username_taken = {
            let connections = self.connections.read().expect("not poisoned");
            connections
                .iter()
                .any(|(&other, c)| other != id && c.username.as_deref() == Some(username))
        };
        if username_taken {
            self.send(id, Response::kill("Username exists!"));
            return;
        }
        let has_running_game = {
            let games = self.games.read().expect("not poisoned");
            games.by_user.contains_key(username)
        };
        if has_running_game {
            self.send(
                id,
                Response::kill("A game for this username is currently running!"),
            );
            return;
        }
        {
            let mut connections = self.connections.write().expect("not poisoned");
            if let Some(connection) = connections.get_mut(&id) {
                connection.username = Some(username.clone());
            } else {
                log::warn!("ROUTER: initialize for unknown connection {}", id);
                return;
            }
        }
        self.send(id, Response::select_mode());
    }

    fn handle_init_game(&self, id: ConnectionId, envelope: &Envelope) {
        let data = &envelope.data;
        let username = envelope.username.clone();
        let Some(mode) = data.get("mode").and_then(Value::as_u64).and_then(GameMode::from_code)
        else {
            log::warn!("ROUTER: init_game with bad mode: {}", data);
            return;
        };
        let lines = data.get("lines").and_then(Value::as_i64).unwrap_or(DEFAULT_LINES) as i32;
        let cols = data.get("cols").and_then(Value::as_i64).unwrap_or(DEFAULT_COLS) as i32;

        if mode == GameMode::MultiPlayerClient {
            self.join_waiting_game(id, &username);
            return;
        }

        let max_players = match mode {
            GameMode::MultiPlayer => data
                .get("num_players")
                .and_then(Value::as_u64)
                .unwrap_or(2) as u32,
            _ => 2,
        };
        let out_tx = {
            let connections = self.connections.read().expect("not poisoned");
            connections.get(&id).map(|c| c.out_tx.clone())
        };

        let game = ServerGame::new(&username, mode, lines, cols, max_players, self.base_path.clone());
        let info = game.info();
        let (inbound_tx, inbound_rx) = unbounded();
        game::spawn(game, inbound_rx);
        let _ = inbound_tx.send(InboundEvent::Join {
            username: username.clone(),
            kind: SlotKind::Human,
            out_tx,
        });

        {
            let mut games = self.games.write().expect("not poisoned");
            games.by_user.insert(username.clone(), info.id.clone());
            games.games.insert(info.id.clone(), GameEntry { info, inbound_tx });
        }
        log::info!("ROUTER: new {:?} game for {}", mode, username);
        self.send(id, Response::select_audio());
    }

    fn join_waiting_game(&self, id: ConnectionId, username: &str) {
        let out_tx = {
            let connections = self.connections.read().expect("not poisoned");
            connections.get(&id).map(|c| c.out_tx.clone())
        };
        let joined = {
            let mut games = self.games.write().expect("not poisoned");
            let waiting = games
                .games
                .values()
                .find(|e| e.info.status() == GameStatus::WaitingForPlayers)
                .map(|e| (e.info.id.clone(), e.inbound_tx.clone()));
            if let Some((game_id, inbound_tx)) = waiting {
                games.by_user.insert(username.to_string(), game_id);
                let _ = inbound_tx.send(InboundEvent::Join {
                    username: username.to_string(),
                    kind: SlotKind::Human,
                    out_tx,
                });
                true
            } else {
                false
            }
        };
        if joined {
            self.send(id, Response::print_msg("Waiting for other players"));
        } else {
            let lobby = self.lobby();
            self.send(
                id,
                Response::new("lobby", serde_json::to_value(&lobby).unwrap_or(json!([]))),
            );
            self.send(id, Response::print_msg("No Game Found"));
        }
    }

    fn forward_to_game(&self, envelope: &Envelope) {
        let games = self.games.read().expect("not poisoned");
        let Some(game_id) = games.by_user.get(&envelope.username) else {
            log::warn!(
                "ROUTER: {:?} from {} without a game",
                envelope.command,
                envelope.username
            );
            return;
        };
        if let Some(entry) = games.games.get(game_id) {
            let _ = entry
                .inbound_tx
                .send(InboundEvent::Command(envelope.clone()));
        }
    }

    fn username_of(&self, id: ConnectionId) -> Option<String> {
        let connections = self.connections.read().expect("not poisoned");
        connections.get(&id).and_then(|c| c.username.clone())
    }

    fn send(&self, id: ConnectionId, response: Response) {
        let failed = {
            let connections = self.connections.read().expect("not poisoned");
            match connections.get(&id) {
                Some(connection) => connection.out_tx.send(response).is_err(),
                None => false,
            }
        };
        if failed {
            log::warn!(
                "ROUTER: {} to connection {}",
                GameError::DisconnectedClient,
                id
            );
            self.disconnect(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(command: &str, username: &str, data: Value) -> String {
        serde_json::to_string(&Envelope::new(command, username, data)).unwrap()
    }

    fn temp_base(tag: &str) -> PathBuf {
        let base = std::env::temp_dir().join(format!("dissonance-router-{}", tag));
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn test_initialize_assigns_username() {
        let router = Router::new(temp_base("init"));
        let client = router.connect();
        router.handle_frame(client.id, &frame("initialize", "alice", json!({})));
        let response = client.responses.try_recv().unwrap();
        assert_eq!(response.command, "select_mode");
    }

    #[test]
    fn test_duplicate_username_killed() {
        let router = Router::new(temp_base("dup"));
        let first = router.connect();
        let second = router.connect();
        router.handle_frame(first.id, &frame("initialize", "alice", json!({})));
        router.handle_frame(second.id, &frame("initialize", "alice", json!({})));
        let response = second.responses.try_recv().unwrap();
        assert_eq!(response.command, "kill");
    }

    #[test]
    fn test_malformed_frame_keeps_connection() {
        let router = Router::new(temp_base("malformed"));
        let client = router.connect();
        router.handle_frame(client.id, "{\"command\": \"initialize\"");
        assert!(client.responses.try_recv().is_err(), "frame was dropped");
        // The connection still works.
        router.handle_frame(client.id, &frame("initialize", "alice", json!({})));
        assert_eq!(client.responses.try_recv().unwrap().command, "select_mode");
    }

    #[test]
    fn test_init_game_prompts_audio_selection() {
        let router = Router::new(temp_base("game"));
        let client = router.connect();
        router.handle_frame(client.id, &frame("initialize", "alice", json!({})));
        client.responses.try_recv().unwrap();
        router.handle_frame(
            client.id,
            &frame("init_game", "alice", json!({ "mode": 0 })),
        );
        assert_eq!(client.responses.try_recv().unwrap().command, "select_audio");
    }

    #[test]
    fn test_lobby_lists_waiting_multiplayer_game() {
        let router = Router::new(temp_base("lobby"));
        let host = router.connect();
        router.handle_frame(host.id, &frame("initialize", "host", json!({})));
        host.responses.try_recv().unwrap();
        router.handle_frame(
            host.id,
            &frame("init_game", "host", json!({ "mode": 1, "num_players": 2 })),
        );
        // The game worker picks up the join asynchronously.
        std::thread::sleep(Duration::from_millis(300));
        let lobby = router.lobby();
        assert_eq!(lobby.entries.len(), 1);
        assert_eq!(lobby.entries[0].game_id, "host");
        assert_eq!(lobby.entries[0].cur_players, 1);
    }

    #[test]
    fn test_binary_upload_stored_under_user_dir() {
        let base = temp_base("upload");
        let router = Router::new(base.clone());
        let client = router.connect();
        router.handle_frame(client.id, &frame("initialize", "alice", json!({})));
        client.responses.try_recv().unwrap();

        router.handle_binary(client.id, b"tune.mp3$abc");
        let stored = base.join("data/user-files/alice/tune.mp3");
        assert_eq!(std::fs::read(&stored).unwrap(), b"abc");
        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_game_command_without_game_is_dropped() {
        let router = Router::new(temp_base("nogame"));
        let client = router.connect();
        router.handle_frame(client.id, &frame("initialize", "alice", json!({})));
        client.responses.try_recv().unwrap();
        router.handle_frame(client.id, &frame("add_iron", "alice", json!({})));
        assert!(client.responses.try_recv().is_err());
    }
}
