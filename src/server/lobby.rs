//! Lobby listing of games waiting for players.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyEntry {
    pub max_players: u32,
    pub cur_players: u32,
    pub game_id: String,
    pub audio_map_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lobby {
    pub entries: Vec<LobbyEntry>,
}

impl Lobby {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(
        &mut self,
        game_id: &str,
        max_players: u32,
        cur_players: u32,
        audio_map_name: &str,
    ) {
        self.entries.push(LobbyEntry {
            max_players,
            cur_players,
            game_id: game_id.to_string(),
            audio_map_name: audio_map_name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_json_round_trip() {
        let mut lobby = Lobby::new();
        lobby.add_entry("game-1", 2, 1, "some-song");
        let json = serde_json::to_string(&lobby).unwrap();
        let parsed: Lobby = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, lobby);
    }
}
