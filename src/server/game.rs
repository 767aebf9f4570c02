//! The authoritative game: one tick loop owns all simulation state.
//!
//! Every mutation funnels through this worker. Clients talk to it through an
//! inbound channel of parsed envelopes; it talks back through per-client
//! outbound channels. The loop runs at a 50ms cadence, consumes analysis
//! beats as the audio cursor passes them, and publishes one snapshot per
//! connected player each tick.

use crate::audio;
use crate::audio::analysis::{AnalyzedAudio, MusicRng};
use crate::game::ai::MusicAi;
use crate::game::field::{Cell, Field};
use crate::game::player::{Player, Statistics};
use crate::game::resources::ResourceKind;
use crate::game::units::{NeuronKind, PotentialKind};
use crate::shared::error::GameError;
use crate::shared::messages::{self, Envelope, GameMode, Response};
use crate::shared::snapshot::{
    COLOR_DEFAULT, COLOR_ENEMY, COLOR_RESOURCE, COLOR_SELF, ResourceView, Snapshot, SymbolCell,
    TechnologyView,
};
use crate::util::{self, Position};
use crossbeam_channel::{Receiver, Sender};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Tick cadence of the authoritative loop.
pub const TICK_MS: f64 = 50.0;
/// Map generation attempts before the song is declared unplayable.
pub const MAP_BUILD_RETRIES: u32 = 5;
/// Hill density of the first map attempt; retries get sparser.
const INITIAL_DENSENESS: i32 = 4;
/// How long a closing game keeps draining before full teardown.
const CLOSING_GRACE_MS: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Waiting,
    WaitingForPlayers,
    SettingUp,
    Running,
    Closing,
    Closed,
}

impl GameStatus {
    fn code(self) -> u8 {
        match self {
            GameStatus::Waiting => 0,
            GameStatus::WaitingForPlayers => 1,
            GameStatus::SettingUp => 2,
            GameStatus::Running => 3,
            GameStatus::Closing => 4,
            GameStatus::Closed => 5,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => GameStatus::Waiting,
            1 => GameStatus::WaitingForPlayers,
            2 => GameStatus::SettingUp,
            3 => GameStatus::Running,
            4 => GameStatus::Closing,
            _ => GameStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Human,
    MusicControlled,
    Observer,
}

/// Shared, read-only view of a game for the router and lobby listing.
pub struct GameInfo {
    pub id: String,
    pub max_players: u32,
    status: AtomicU8,
    cur_players: AtomicU32,
    audio_map_name: std::sync::Mutex<String>,
}

impl GameInfo {
    fn new(id: String, max_players: u32) -> Self {
        Self {
            id,
            max_players,
            status: AtomicU8::new(GameStatus::Waiting.code()),
            cur_players: AtomicU32::new(0),
            audio_map_name: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn status(&self) -> GameStatus {
        GameStatus::from_code(self.status.load(Ordering::Relaxed))
    }

    pub fn cur_players(&self) -> u32 {
        self.cur_players.load(Ordering::Relaxed)
    }

    pub fn audio_map_name(&self) -> String {
        self.audio_map_name.lock().expect("not poisoned").clone()
    }
}

/// Events arriving on a game's inbound queue.
pub enum InboundEvent {
    Command(Envelope),
    Join {
        username: String,
        kind: SlotKind,
        out_tx: Option<Sender<Response>>,
    },
    Disconnected(String),
}

struct PlayerSlot {
    username: String,
    kind: SlotKind,
    resigned: bool,
    ready: bool,
    out_tx: Option<Sender<Response>>,
    sim_index: Option<usize>,
}

struct Simulation {
    field: Field,
    players: Vec<Player>,
    ais: Vec<Option<MusicAi>>,
}

pub struct ServerGame {
    mode: GameMode,
    lines: i32,
    cols: i32,
    base_path: PathBuf,
    info: Arc<GameInfo>,
    status: GameStatus,
    analysis: Option<AnalyzedAudio>,
    sim: Option<Simulation>,
    slots: Vec<PlayerSlot>,
    cursor_ms: f64,
    beat_index: usize,
    closing_since: Option<f64>,
}

impl ServerGame {
    pub fn new(id: &str, mode: GameMode, lines: i32, cols: i32, max_players: u32, base_path: PathBuf) -> Self {
        Self {
            mode,
            lines,
            cols,
            base_path,
            info: Arc::new(GameInfo::new(id.to_string(), max_players)),
            status: GameStatus::Waiting,
            analysis: None,
            sim: None,
            slots: Vec::new(),
            cursor_ms: 0.0,
            beat_index: 0,
            closing_since: None,
        }
    }

    pub fn info(&self) -> Arc<GameInfo> {
        self.info.clone()
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    fn set_status(&mut self, status: GameStatus) {
        log::info!("GAME {}: {:?} -> {:?}", self.info.id, self.status, status);
        self.status = status;
        self.info.status.store(status.code(), Ordering::Relaxed);
    }

    // ---- membership ----

    pub fn add_player(
        &mut self,
        username: &str,
        kind: SlotKind,
        out_tx: Option<Sender<Response>>,
    ) -> Vec<(String, Response)> {
        self.slots.push(PlayerSlot {
            username: username.to_string(),
            kind,
            resigned: false,
            ready: false,
            out_tx,
            sim_index: None,
        });
        let humans = self.slots.iter().filter(|s| s.kind == SlotKind::Human).count() as u32;
        self.info.cur_players.store(humans, Ordering::Relaxed);
        if self.analysis.is_some() {
            self.try_setup()
        } else {
            if self.mode == GameMode::MultiPlayer && humans < self.info.max_players {
                self.set_status(GameStatus::WaitingForPlayers);
            }
            Vec::new()
        }
    }

    pub fn player_disconnected(&mut self, username: &str) {
        let reached_setup = self.status.code() >= GameStatus::SettingUp.code();
        if let Some(slot) = self.slots.iter_mut().find(|s| s.username == username) {
            log::info!("GAME {}: {} resigned", self.info.id, username);
            slot.resigned = true;
            slot.out_tx = None;
        }
        let all_gone = self.slots.iter().all(|s| s.resigned || s.kind == SlotKind::MusicControlled);
        if all_gone && !reached_setup {
            // Nobody ever played: no teardown grace needed.
            self.set_status(GameStatus::Closed);
        }
    }

    // ---- command handling ----

    /// Applies one inbound command and returns the responses to route.
    pub fn handle_command(&mut self, envelope: Envelope) -> Vec<(String, Response)> {
        let username = envelope.username.clone();
        let data = envelope.data.clone();
        match envelope.command.as_str() {
            "analyse_audio" => self.handle_analyse_audio(&username, &data),
            "ready" => {
                if let Some(slot) = self.slots.iter_mut().find(|s| s.username == username) {
                    slot.ready = true;
                }
                self.maybe_start();
                Vec::new()
            }
            "resign" => {
                self.player_disconnected(&username);
                Vec::new()
            }
            "add_iron" => self.with_player(&username, |player, data| {
                let kind = messages::resource_field(data, "resource")
                    .ok_or(GameError::InvalidTarget)?;
                player.distribute_iron(kind)
            }, &data, true),
            "remove_iron" => self.with_player(&username, |player, data| {
                let kind = messages::resource_field(data, "resource")
                    .ok_or(GameError::InvalidTarget)?;
                player.remove_iron(kind)
            }, &data, true),
            "add_technology" => self.with_player(&username, |player, data| {
                let tech = messages::technology_field(data, "technology")
                    .ok_or(GameError::InvalidTarget)?;
                player.add_technology(tech)
            }, &data, false),
            "build_neuron" => self.handle_build_neuron(&username, &data),
            "add_potential" => self.handle_add_potential(&username, &data),
            "set_way_points" => self.with_player(&username, |player, data| {
                let synapse = messages::position_field(data, "pos")
                    .ok_or(GameError::InvalidTarget)?;
                let positions = data
                    .get("positions")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| {
                                let pair = v.as_array()?;
                                Some((pair.first()?.as_i64()? as i32, pair.get(1)?.as_i64()? as i32))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                player.set_way_points(synapse, positions)
            }, &data, false),
            "set_swarm" => self.with_player(&username, |player, data| {
                let synapse = messages::position_field(data, "pos")
                    .ok_or(GameError::InvalidTarget)?;
                let on = data.get("on").and_then(Value::as_bool).unwrap_or(false);
                player.set_swarm(synapse, on)
            }, &data, false),
            "set_target" => self.with_player(&username, |player, data| {
                let synapse = messages::position_field(data, "pos")
                    .ok_or(GameError::InvalidTarget)?;
                let kind = messages::potential_kind_field(data, "potential")
                    .ok_or(GameError::InvalidTarget)?;
                let target = messages::position_field(data, "target")
                    .ok_or(GameError::InvalidTarget)?;
                player.set_target(synapse, kind, target)
            }, &data, false),
            other => {
                log::warn!("GAME {}: dropping unknown command {:?}", self.info.id, other);
                Vec::new()
            }
        }
    }

    fn handle_analyse_audio(&mut self, username: &str, data: &Value) -> Vec<(String, Response)> {
        let Some(source) = data.get("source_path").and_then(Value::as_str) else {
            log::warn!("GAME {}: analyse_audio without source_path", self.info.id);
            return Vec::new();
        };
        let mut source = PathBuf::from(source);
        if source.is_relative() {
            source = self.base_path.join(source);
        }
        match audio::analyze(&source) {
            Ok(analysis) => {
                let map_name = source
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.init_with_analysis(analysis, &map_name)
            }
            Err(err) => {
                log::error!("GAME {}: audio analysis failed: {}", self.info.id, err);
                self.set_status(GameStatus::Closing);
                self.closing_since = Some(self.cursor_ms);
                vec![(username.to_string(), Response::print_msg(&err.to_string()))]
            }
        }
    }

    /// Accepts a finished analysis and, if enough players are present, builds
    /// the map and simulation.
    pub fn init_with_analysis(
        &mut self,
        analysis: AnalyzedAudio,
        map_name: &str,
    ) -> Vec<(String, Response)> {
        *self.info.audio_map_name.lock().expect("not poisoned") = map_name.to_string();
        self.analysis = Some(analysis);
        self.try_setup()
    }

    fn try_setup(&mut self) -> Vec<(String, Response)> {
        if self.sim.is_some() {
            return Vec::new();
        }
        // Modes without two humans fill the roster with music-driven slots.
        match self.mode {
            GameMode::SinglePlayer | GameMode::Tutorial => {
                if !self.slots.iter().any(|s| s.kind == SlotKind::MusicControlled) {
                    self.push_ai_slot("@ai");
                }
            }
            GameMode::Observer | GameMode::AiGame => {
                for slot in &mut self.slots {
                    if slot.kind == SlotKind::Human {
                        slot.kind = SlotKind::Observer;
                    }
                }
                while self.slots.iter().filter(|s| s.kind == SlotKind::MusicControlled).count() < 2 {
                    let name = format!("@ai-{}", self.slots.len());
                    self.push_ai_slot(&name);
                }
            }
            GameMode::MultiPlayer | GameMode::MultiPlayerClient => {}
        }

        let sim_slots: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind != SlotKind::Observer)
            .map(|(i, _)| i)
            .collect();
        if sim_slots.len() < 2 {
            self.set_status(GameStatus::WaitingForPlayers);
            return Vec::new();
        }
        let analysis = self.analysis.clone().expect("checked by caller");

        let (field, nuclei, resource_positions) = match self.build_map(&analysis) {
            Ok(parts) => parts,
            Err(err) => {
                log::error!("GAME {}: {}", self.info.id, err);
                self.set_status(GameStatus::Closing);
                self.closing_since = Some(self.cursor_ms);
                return self
                    .slots
                    .iter()
                    .filter(|s| s.out_tx.is_some())
                    .map(|s| {
                        (
                            s.username.clone(),
                            Response::print_msg(
                                "Game cannot be played with this song, the map is unplayable.",
                            ),
                        )
                    })
                    .collect();
            }
        };

        let mut players = Vec::new();
        let mut ais = Vec::new();
        for (sim_index, &slot_index) in sim_slots.iter().take(2).enumerate() {
            let mut player = Player::new(nuclei[sim_index], &resource_positions[sim_index]);
            let ai = if self.slots[slot_index].kind == SlotKind::MusicControlled {
                // The opponent starts with oxygen income, like a player who
                // knows the opening.
                let _ = player.distribute_iron(ResourceKind::Oxygen);
                let _ = player.distribute_iron(ResourceKind::Oxygen);
                Some(MusicAi::new(&analysis))
            } else {
                None
            };
            self.slots[slot_index].sim_index = Some(sim_index);
            players.push(player);
            ais.push(ai);
        }

        self.sim = Some(Simulation { field, players, ais });
        self.set_status(GameStatus::SettingUp);

        // Humans start the match by distributing their initial iron.
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Human && s.sim_index.is_some())
            .map(|s| {
                let player = &self.sim.as_ref().expect("just built").players
                    [s.sim_index.expect("filtered")];
                (s.username.clone(), distribute_iron_response(player, None))
            })
            .collect()
    }

    fn push_ai_slot(&mut self, name: &str) {
        self.slots.push(PlayerSlot {
            username: name.to_string(),
            kind: SlotKind::MusicControlled,
            resigned: false,
            ready: true,
            out_tx: None,
            sim_index: None,
        });
    }

    /// Builds field, nuclei and resource rings, thinning hills on every
    /// retry until the nuclei can reach each other.
    fn build_map(
        &self,
        analysis: &AnalyzedAudio,
    ) -> Result<(Field, Vec<Position>, Vec<BTreeMap<ResourceKind, Position>>), GameError> {
        let mut music = MusicRng::new(analysis);
        let mut rng = StdRng::seed_from_u64(analysis.average_bpm.to_bits());
        let mut denseness = INITIAL_DENSENESS;

        let section_one = (analysis.average_bpm.max(0.0) as usize) % 8;
        let mut section_two = (analysis.average_level.max(0.0) as usize) % 8;
        if section_one == section_two {
            section_two = (section_two + 1) % 8;
        }

        for attempt in 0..=MAP_BUILD_RETRIES {
            let mut field = Field::new(self.lines, self.cols);
            field.add_hills(&mut rng, denseness);
            denseness = (denseness - 1).max(0);

            let nuclei = [
                field.add_nucleus(section_one, &mut music),
                field.add_nucleus(section_two, &mut music),
            ];
            let [Some(nucleus_one), Some(nucleus_two)] = nuclei else {
                log::warn!("GAME {}: attempt {}: no room for nuclei", self.info.id, attempt);
                continue;
            };
            if let Err(err) = field.build_graph(nucleus_one, nucleus_two) {
                log::warn!("GAME {}: attempt {}: {}", self.info.id, attempt, err);
                continue;
            }
            let resources = vec![
                field.add_resources(nucleus_one, &mut music),
                field.add_resources(nucleus_two, &mut music),
            ];
            return Ok((field, vec![nucleus_one, nucleus_two], resources));
        }
        Err(GameError::UnplayableMap)
    }

    fn maybe_start(&mut self) {
        let all_ready = self
            .slots
            .iter()
            .all(|s| s.ready || s.resigned);
        if all_ready && self.sim.is_some() && self.status == GameStatus::SettingUp {
            self.cursor_ms = 0.0;
            self.beat_index = 0;
            self.set_status(GameStatus::Running);
        }
    }

    fn with_player<F>(
        &mut self,
        username: &str,
        action: F,
        data: &Value,
        iron_view: bool,
    ) -> Vec<(String, Response)>
    where
        F: FnOnce(&mut Player, &Value) -> Result<(), GameError>,
    {
        let Some(sim_index) = self.sim_index_of(username) else {
            return vec![(username.to_string(), Response::print_msg("No such player"))];
        };
        let Some(sim) = self.sim.as_mut() else {
            return Vec::new();
        };
        let player = &mut sim.players[sim_index];
        let result = action(player, data);
        let response = match (&result, iron_view) {
            (Ok(()), true) => distribute_iron_response(player, None),
            (Ok(()), false) => return Vec::new(),
            (Err(err), true) => distribute_iron_response(player, Some(&err.to_string())),
            (Err(err), false) => Response::print_msg(&err.to_string()),
        };
        vec![(username.to_string(), response)]
    }

    fn handle_build_neuron(&mut self, username: &str, data: &Value) -> Vec<(String, Response)> {
        let Some(sim_index) = self.sim_index_of(username) else {
            return Vec::new();
        };
        let Some(sim) = self.sim.as_mut() else {
            return Vec::new();
        };
        let result = (|| {
            let kind =
                messages::neuron_kind_field(data, "unit").ok_or(GameError::InvalidTarget)?;
            let pos = messages::position_field(data, "pos").ok_or(GameError::InvalidTarget)?;
            // A synapse without explicit targets aims at the enemy nucleus.
            let default_target = sim.players[1 - sim_index].nucleus_pos();
            let epsp_target =
                messages::position_field(data, "epsp_target").or(Some(default_target));
            let ipsp_target =
                messages::position_field(data, "ipsp_target").or(Some(default_target));
            sim.players[sim_index].build_neuron(kind, pos, &mut sim.field, epsp_target, ipsp_target)
        })();
        match result {
            Ok(()) => Vec::new(),
            Err(err) => vec![(username.to_string(), Response::print_msg(&err.to_string()))],
        }
    }

    fn handle_add_potential(&mut self, username: &str, data: &Value) -> Vec<(String, Response)> {
        let Some(sim_index) = self.sim_index_of(username) else {
            return Vec::new();
        };
        let Some(sim) = self.sim.as_mut() else {
            return Vec::new();
        };
        let cursor = self.cursor_ms;
        let result = (|| {
            let synapse = messages::position_field(data, "pos").ok_or(GameError::InvalidTarget)?;
            let kind = messages::potential_kind_field(data, "potential")
                .ok_or(GameError::InvalidTarget)?;
            let count = data.get("count").and_then(Value::as_u64).unwrap_or(1);
            for _ in 0..count.clamp(1, 9) {
                sim.players[sim_index].add_potential(synapse, kind, &sim.field, cursor)?;
            }
            Ok::<(), GameError>(())
        })();
        match result {
            Ok(()) => Vec::new(),
            Err(err) => vec![(username.to_string(), Response::print_msg(&err.to_string()))],
        }
    }

    fn sim_index_of(&self, username: &str) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.username == username && !s.resigned)
            .and_then(|s| s.sim_index)
    }

    // ---- tick ----

    /// One authoritative tick at the given audio cursor.
    pub fn tick(&mut self, cursor_ms: f64) {
        match self.status {
            GameStatus::Running => {
                self.cursor_ms = cursor_ms;
                self.consume_beats();
                self.step_simulation();
                self.resolve_collisions();
                self.check_game_over();
                self.publish_snapshots();
            }
            GameStatus::Closing => {
                if let Some(since) = self.closing_since
                    && cursor_ms - since >= CLOSING_GRACE_MS
                {
                    self.set_status(GameStatus::Closed);
                }
            }
            _ => {}
        }
    }

    /// Feeds every beat the cursor has passed to the music-driven players,
    /// exactly once.
    fn consume_beats(&mut self) {
        let Some(analysis) = self.analysis.as_ref() else {
            return;
        };
        let Some(sim) = self.sim.as_mut() else {
            return;
        };
        while self.beat_index < analysis.beats.len()
            && analysis.beats[self.beat_index].time_ms <= self.cursor_ms
        {
            let beat = analysis.beats[self.beat_index].clone();
            for index in 0..sim.players.len() {
                if sim.ais[index].is_none() {
                    continue;
                }
                let (me, opponent) = two_players(&mut sim.players, index, 1 - index);
                if let Some(ai) = sim.ais[index].as_mut() {
                    ai.act_on_beat(&beat, analysis, me, opponent, &mut sim.field, self.cursor_ms);
                }
            }
            self.beat_index += 1;
        }
        // Scheduled volleys fire once their synchronization wait passes.
        for index in 0..sim.players.len() {
            if let Some(ai) = sim.ais[index].as_mut() {
                ai.drain_pending(&mut sim.players[index], &sim.field, self.cursor_ms);
            }
        }
    }

    /// Tick handlers in the fixed order: resources, potentials,
    /// interceptions, iron.
    fn step_simulation(&mut self) {
        let Some(sim) = self.sim.as_mut() else {
            return;
        };
        for player in &mut sim.players {
            player.tick_resources();
        }
        for index in 0..sim.players.len() {
            let (me, opponent) = two_players(&mut sim.players, index, 1 - index);
            me.tick_potentials(self.cursor_ms, opponent, &mut sim.field);
        }
        for index in 0..sim.players.len() {
            let (me, opponent) = two_players(&mut sim.players, index, 1 - index);
            me.tick_interceptions(opponent);
        }
        for player in &mut sim.players {
            player.tick_iron_drip(self.cursor_ms);
        }
    }

    /// Opposed potential kinds meeting on one cell annihilate each other.
    fn resolve_collisions(&mut self) {
        let Some(sim) = self.sim.as_mut() else {
            return;
        };
        if sim.players.len() < 2 {
            return;
        }
        let moving: Vec<Vec<(String, Position, PotentialKind)>> = sim
            .players
            .iter()
            .map(|p| {
                p.potentials()
                    .values()
                    .filter(|pot| pot.expiry_deadline.is_none())
                    .map(|pot| (pot.id.clone(), pot.position, pot.kind))
                    .collect()
            })
            .collect();

        let mut doomed: Vec<(usize, String)> = Vec::new();
        for (id_a, pos_a, kind_a) in &moving[0] {
            for (id_b, pos_b, kind_b) in &moving[1] {
                if pos_a == pos_b && kind_a != kind_b {
                    doomed.push((0, id_a.clone()));
                    doomed.push((1, id_b.clone()));
                }
            }
        }
        for (owner, id) in doomed {
            sim.players[owner].annihilate_potential(&id);
        }
    }

    fn check_game_over(&mut self) {
        let Some(sim) = self.sim.as_ref() else {
            return;
        };
        let losers: Vec<usize> = sim
            .players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.nucleus_destroyed())
            .map(|(i, _)| i)
            .collect();
        if losers.is_empty() {
            return;
        }

        let statistics = self.statistics_json();
        for slot in &self.slots {
            let Some(tx) = &slot.out_tx else { continue };
            let msg = match slot.sim_index {
                Some(index) if losers.contains(&index) => "You lost.",
                Some(_) => "You won!",
                None => "Game over.",
            };
            let _ = tx.send(Response::game_over(msg, statistics.clone()));
        }
        log::info!("GAME {}: over, losers {:?}", self.info.id, losers);
        self.closing_since = Some(self.cursor_ms);
        self.set_status(GameStatus::Closing);
    }

    fn statistics_json(&self) -> Value {
        let Some(sim) = self.sim.as_ref() else {
            return Value::Null;
        };
        let per_player: BTreeMap<String, Value> = self
            .slots
            .iter()
            .filter_map(|s| {
                s.sim_index
                    .map(|i| (s.username.clone(), statistics_to_json(&sim.players[i].statistics)))
            })
            .collect();
        json!(per_player)
    }

    // ---- snapshots ----

    fn publish_snapshots(&mut self) {
        let mut dead = Vec::new();
        for slot_index in 0..self.slots.len() {
            let slot = &self.slots[slot_index];
            let Some(tx) = slot.out_tx.clone() else { continue };
            let snapshot = self.build_snapshot(slot.sim_index.unwrap_or(0));
            if tx.send(Response::snapshot(&snapshot)).is_err() {
                log::warn!(
                    "GAME {}: {} unreachable: {}",
                    self.info.id,
                    self.slots[slot_index].username,
                    GameError::DisconnectedClient
                );
                dead.push(self.slots[slot_index].username.clone());
            }
        }
        for username in dead {
            self.player_disconnected(&username);
        }
    }

    /// Builds the frame one player sees.
    pub fn build_snapshot(&self, viewer: usize) -> Snapshot {
        let Some(sim) = self.sim.as_ref() else {
            return Snapshot {
                field: Vec::new(),
                players: String::new(),
                resources: BTreeMap::new(),
                technologies: BTreeMap::new(),
                potentials: BTreeMap::new(),
                audio_played: self.cursor_ms / 1000.0,
            };
        };

        let mut field_view = Vec::with_capacity(sim.field.lines() as usize);
        for l in 0..sim.field.lines() {
            let mut row = Vec::with_capacity(sim.field.cols() as usize);
            for c in 0..sim.field.cols() {
                let pos = (l, c);
                let cell = sim.field.cell(pos);
                let color = match cell {
                    Cell::Resource(_) => COLOR_RESOURCE,
                    Cell::Neuron(_) => {
                        let owned_by_viewer = sim.players[viewer].neuron_at(pos).is_some();
                        if owned_by_viewer { COLOR_SELF } else { COLOR_ENEMY }
                    }
                    _ => COLOR_DEFAULT,
                };
                row.push(SymbolCell {
                    symbol: cell.symbol().to_string(),
                    color,
                });
            }
            field_view.push(row);
        }

        // Potentials stack: several on one cell render as their count.
        let mut counts: BTreeMap<String, (usize, &'static str, u8)> = BTreeMap::new();
        for (index, player) in sim.players.iter().enumerate() {
            let color = if index == viewer { COLOR_SELF } else { COLOR_ENEMY };
            for potential in player.potentials().values() {
                let key = util::position_to_string(potential.position);
                let entry = counts.entry(key).or_insert((0, potential.symbol(), color));
                entry.0 += 1;
            }
        }
        let potentials = counts
            .into_iter()
            .map(|(key, (count, symbol, color))| {
                let symbol = if count > 1 {
                    count.min(9).to_string()
                } else {
                    symbol.to_string()
                };
                (key, SymbolCell { symbol, color })
            })
            .collect();

        let players_summary = self
            .slots
            .iter()
            .filter_map(|s| {
                let index = s.sim_index?;
                let player = &sim.players[index];
                let voltage = player
                    .neuron_at(player.nucleus_pos())
                    .map(|n| n.voltage)
                    .unwrap_or(9);
                Some(format!("{}: {}/9", s.username, voltage))
            })
            .collect::<Vec<_>>()
            .join(" | ");

        let me = &sim.players[viewer];
        let resources = me
            .resources()
            .iter()
            .map(|(kind, resource)| {
                (
                    kind.name().to_string(),
                    ResourceView {
                        value: format!("{:.2}", resource.free()),
                        bound: format!("{:.2}", resource.bound()),
                        limit: resource.limit().to_string(),
                        iron: resource.distributed_iron(),
                        active: resource.active(),
                    },
                )
            })
            .collect();
        let technologies = me
            .technologies()
            .iter()
            .map(|(tech, &cur)| {
                (
                    tech.name().to_string(),
                    TechnologyView {
                        cur,
                        max: tech.cap(),
                        active: cur > 0,
                    },
                )
            })
            .collect();

        Snapshot {
            field: field_view,
            players: players_summary,
            resources,
            technologies,
            potentials,
            audio_played: self.cursor_ms / 1000.0,
        }
    }

    #[cfg(test)]
    fn sim_mut(&mut self) -> &mut Simulation {
        self.sim.as_mut().expect("simulation built")
    }
}

/// Disjoint mutable access to two players.
fn two_players(players: &mut [Player], a: usize, b: usize) -> (&mut Player, &mut Player) {
    assert!(a != b);
    if a < b {
        let (left, right) = players.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = players.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

fn statistics_to_json(stats: &Statistics) -> Value {
    fn named<K: Copy, V: Copy + Into<u64>>(
        map: &BTreeMap<K, V>,
        name: impl Fn(K) -> &'static str,
    ) -> BTreeMap<String, u64> {
        map.iter().map(|(&k, &v)| (name(k).to_string(), v.into())).collect()
    }
    json!({
        "neurons_built": named(&stats.neurons_built, NeuronKind::name),
        "potentials_built": named(&stats.potentials_built, potential_name),
        "potentials_killed": named(&stats.potentials_killed, potential_name),
        "potentials_lost": named(&stats.potentials_lost, potential_name),
        "epsp_swallowed": stats.epsp_swallowed,
    })
}

fn potential_name(kind: PotentialKind) -> &'static str {
    match kind {
        PotentialKind::Epsp => "epsp",
        PotentialKind::Ipsp => "ipsp",
    }
}

fn distribute_iron_response(player: &Player, error: Option<&str>) -> Response {
    let resources: BTreeMap<String, Value> = player
        .resources()
        .iter()
        .map(|(kind, resource)| {
            (
                kind.name().to_string(),
                json!({ "active": resource.active(), "iron": resource.distributed_iron() }),
            )
        })
        .collect();
    Response::new(
        "distribute_iron",
        json!({
            "help": format!("Iron (FE): {}", player.resources().get(ResourceKind::Iron).print()),
            "resources": resources,
            "error": error.is_some(),
            "error_msg": error.unwrap_or("Selected!"),
        }),
    )
}

/// Runs a game on its own worker thread, draining the inbound queue and
/// ticking at the fixed cadence until the game closes.
pub fn spawn(mut game: ServerGame, inbound_rx: Receiver<InboundEvent>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("game-{}", game.info.id))
        .spawn(move || {
            let mut started_at: Option<Instant> = None;
            let tick = Duration::from_millis(TICK_MS as u64);
            let mut next_tick = Instant::now();
            loop {
                while let Ok(event) = inbound_rx.try_recv() {
                    match event {
                        InboundEvent::Command(envelope) => {
                            let responses = game.handle_command(envelope);
                            route_responses(&game, responses);
                        }
                        InboundEvent::Join { username, kind, out_tx } => {
                            let responses = game.add_player(&username, kind, out_tx);
                            route_responses(&game, responses);
                        }
                        InboundEvent::Disconnected(username) => {
                            game.player_disconnected(&username);
                        }
                    }
                }

                // The cursor starts with the audio; a game closing before it
                // ever ran still needs a moving clock for its teardown grace.
                if started_at.is_none()
                    && matches!(game.status(), GameStatus::Running | GameStatus::Closing)
                {
                    started_at = Some(Instant::now());
                }
                let cursor = started_at
                    .map(|t| t.elapsed().as_secs_f64() * 1000.0)
                    .unwrap_or(0.0);
                game.tick(cursor);

                if game.status() == GameStatus::Closed {
                    log::info!("GAME {}: worker done", game.info.id);
                    break;
                }
                next_tick += tick;
                let now = Instant::now();
                if now < next_tick {
                    thread::sleep(next_tick - now);
                } else {
                    next_tick = now + tick;
                }
            }
        })
        .expect("failed to spawn game worker")
}

fn route_responses(game: &ServerGame, responses: Vec<(String, Response)>) {
    for (username, response) in responses {
        let Some(slot) = game.slots.iter().find(|s| s.username == username) else {
            continue;
        };
        if let Some(tx) = &slot.out_tx {
            let _ = tx.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analysis::{AnalyzedAudio, BeatPoint, Note};
    use crossbeam_channel::unbounded;
    use serde_json::json;

    fn analysis() -> AnalyzedAudio {
        let beats = (0..8)
            .map(|i| BeatPoint {
                time_ms: i as f64 * 500.0,
                bpm: 120,
                level: if i % 2 == 0 { 40 } else { 80 },
                notes: vec![Note::from_midi(60 + i)],
                interval_id: 0,
            })
            .collect();
        AnalyzedAudio::from_beats(beats)
    }

    fn running_single_player() -> (ServerGame, Receiver<Response>) {
        let (tx, rx) = unbounded();
        let mut game = ServerGame::new(
            "alice",
            GameMode::SinglePlayer,
            30,
            60,
            2,
            PathBuf::from("/tmp"),
        );
        game.add_player("alice", SlotKind::Human, Some(tx));
        let responses = game.init_with_analysis(analysis(), "test-song");
        assert_eq!(game.status(), GameStatus::SettingUp);
        // The human is prompted to distribute iron.
        assert!(responses.iter().any(|(u, r)| u == "alice" && r.command == "distribute_iron"));
        game.handle_command(Envelope::new("ready", "alice", json!({})));
        assert_eq!(game.status(), GameStatus::Running);
        (game, rx)
    }

    #[test]
    fn test_single_player_setup_and_snapshot() {
        let (mut game, rx) = running_single_player();
        game.tick(50.0);
        let response = rx.try_recv().expect("one snapshot per tick");
        assert_eq!(response.command, "snapshot");
        let snapshot: Snapshot = serde_json::from_value(response.data).unwrap();
        assert_eq!(snapshot.field.len(), 30);
        assert_eq!(snapshot.field[0].len(), 60);
        assert_eq!(snapshot.resources.len(), 7);
        assert!((snapshot.audio_played - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_beats_consumed_once() {
        let (mut game, _rx) = running_single_player();
        game.tick(1000.0);
        let consumed = game.beat_index;
        assert_eq!(consumed, 3); // beats at 0, 500, 1000
        // Re-ticking at the same cursor consumes nothing new.
        game.tick(1000.0);
        assert_eq!(game.beat_index, consumed);
    }

    #[test]
    fn test_commands_in_arrival_order_mutate_state() {
        let (mut game, _rx) = running_single_player();
        game.handle_command(Envelope::new(
            "add_iron",
            "alice",
            json!({ "resource": "potassium" }),
        ));
        game.handle_command(Envelope::new(
            "remove_iron",
            "alice",
            json!({ "resource": "potassium" }),
        ));
        let sim = game.sim_mut();
        assert_eq!(
            sim.players[0]
                .resources()
                .get(ResourceKind::Potassium)
                .distributed_iron(),
            0
        );
    }

    #[test]
    fn test_insufficient_resources_is_non_fatal() {
        let (mut game, _rx) = running_single_player();
        // Two units of starting iron, the third distribution must fail.
        for _ in 0..2 {
            game.handle_command(Envelope::new(
                "add_iron",
                "alice",
                json!({ "resource": "potassium" }),
            ));
        }
        let responses = game.handle_command(Envelope::new(
            "add_iron",
            "alice",
            json!({ "resource": "potassium" }),
        ));
        assert_eq!(responses.len(), 1);
        assert!(responses[0].1.data["error"].as_bool().unwrap());
        assert_eq!(game.status(), GameStatus::Running);
    }

    #[test]
    fn test_unknown_command_dropped() {
        let (mut game, _rx) = running_single_player();
        let responses =
            game.handle_command(Envelope::new("warp_time", "alice", json!({})));
        assert!(responses.is_empty());
        assert_eq!(game.status(), GameStatus::Running);
    }

    #[test]
    fn test_game_over_and_teardown() {
        let (mut game, rx) = running_single_player();
        // Raze the opponent's nucleus directly.
        let enemy_nucleus = game.sim_mut().players[1].nucleus_pos();
        {
            let sim = game.sim_mut();
            let (field, players) = (&mut sim.field, &mut sim.players);
            players[1].apply_damage(enemy_nucleus, 100, field);
        }
        game.tick(50.0);
        assert_eq!(game.status(), GameStatus::Closing);
        let mut saw_game_over = false;
        while let Ok(response) = rx.try_recv() {
            if response.command == "game_over" {
                saw_game_over = true;
                assert_eq!(response.data["msg"], "You won!");
            }
        }
        assert!(saw_game_over);

        // Teardown finishes after the grace period.
        game.tick(4_000.0);
        assert_eq!(game.status(), GameStatus::Closing);
        game.tick(5_100.0);
        assert_eq!(game.status(), GameStatus::Closed);
    }

    #[test]
    fn test_disconnected_client_resigns_but_game_continues() {
        let (mut game, rx) = running_single_player();
        drop(rx);
        game.tick(50.0);
        assert_eq!(game.status(), GameStatus::Running, "simulation keeps going");
        // The slot is resigned and no longer addressable.
        assert!(game.sim_index_of("alice").is_none());
    }

    #[test]
    fn test_all_disconnected_before_setup_closes_directly() {
        let (tx, rx) = unbounded();
        let mut game = ServerGame::new(
            "bob",
            GameMode::MultiPlayer,
            30,
            60,
            2,
            PathBuf::from("/tmp"),
        );
        game.add_player("bob", SlotKind::Human, Some(tx));
        assert_eq!(game.status(), GameStatus::WaitingForPlayers);
        drop(rx);
        game.player_disconnected("bob");
        assert_eq!(game.status(), GameStatus::Closed);
    }

    #[test]
    fn test_unplayable_map_surfaces() {
        let (tx, _rx) = unbounded();
        // A zero-size field can never host two nuclei.
        let mut game = ServerGame::new(
            "alice",
            GameMode::SinglePlayer,
            0,
            0,
            2,
            PathBuf::from("/tmp"),
        );
        game.add_player("alice", SlotKind::Human, Some(tx));
        let responses = game.init_with_analysis(analysis(), "test-song");
        assert_eq!(game.status(), GameStatus::Closing);
        assert!(
            responses
                .iter()
                .any(|(_, r)| r.command == "print_msg"
                    && r.data["msg"].as_str().unwrap().contains("unplayable"))
        );
    }

    #[test]
    fn test_ai_game_fills_two_music_slots() {
        let (tx, _rx) = unbounded();
        let mut game = ServerGame::new(
            "watcher",
            GameMode::AiGame,
            30,
            60,
            2,
            PathBuf::from("/tmp"),
        );
        game.add_player("watcher", SlotKind::Human, Some(tx));
        game.init_with_analysis(analysis(), "test-song");
        assert_eq!(game.status(), GameStatus::SettingUp);
        let music_slots = game
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::MusicControlled)
            .count();
        assert_eq!(music_slots, 2);
        assert!(game.slots.iter().any(|s| s.kind == SlotKind::Observer));
    }

    #[test]
    fn test_observer_snapshot_views_first_player() {
        let (tx, _rx) = unbounded();
        let mut game = ServerGame::new(
            "watcher",
            GameMode::Observer,
            30,
            60,
            2,
            PathBuf::from("/tmp"),
        );
        game.add_player("watcher", SlotKind::Human, Some(tx));
        game.init_with_analysis(analysis(), "test-song");
        game.handle_command(Envelope::new("ready", "watcher", json!({})));
        assert_eq!(game.status(), GameStatus::Running);
        let snapshot = game.build_snapshot(0);
        assert!(!snapshot.field.is_empty());
    }
}
