//! Player state: resources, neurons, in-flight potentials and research.
//!
//! All mutation happens on the game's tick worker; the server calls the
//! command methods when client messages arrive and the tick handlers once
//! per tick, in a fixed order (resources, potentials, interceptions, iron).

use crate::game::costs::{self, Purchase};
use crate::game::field::Field;
use crate::game::resources::{DEFAULT_SLOWDOWN, ResourceKind, ResourceLedger};
use crate::game::technology::Technology;
use crate::game::units::{Neuron, NeuronKind, NeuronState, Potential, PotentialKind};
use crate::shared::error::GameError;
use crate::util::{self, Position};
use std::collections::BTreeMap;

/// Base build range around the nucleus, extended by research.
pub const NUCLEUS_BUILD_RANGE: f64 = 3.0;
/// Wall-clock between free iron drips.
pub const IRON_DRIP_INTERVAL_MS: f64 = 10_000.0;
/// No more drips once this much iron has been handed out.
pub const MAX_DISTRIBUTED_IRON: u32 = 16;
/// Swarm buffer size of a fresh synapse.
pub const DEFAULT_SWARM_SIZE: u32 = 3;
/// Interception reach of an activated neuron, in cells.
pub const INTERCEPT_RANGE: f64 = 3.0;

/// Per-player end-of-game statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub neurons_built: BTreeMap<NeuronKind, u32>,
    pub potentials_built: BTreeMap<PotentialKind, u32>,
    pub potentials_killed: BTreeMap<PotentialKind, u32>,
    pub potentials_lost: BTreeMap<PotentialKind, u32>,
    pub epsp_swallowed: u32,
}

/// What a potential arrival did to the defending player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    NoNeuron,
    Damaged,
    Destroyed(NeuronKind),
}

pub struct Player {
    nucleus_pos: Position,
    resources: ResourceLedger,
    neurons: BTreeMap<Position, Neuron>,
    potentials: BTreeMap<String, Potential>,
    technologies: BTreeMap<Technology, u32>,
    resource_slowdown: f64,
    last_iron_drip_ms: f64,
    nucleus_destroyed: bool,
    pub statistics: Statistics,
}

impl Player {
    /// Creates a player with its nucleus and the resource cells the field
    /// placed for it.
    pub fn new(nucleus_pos: Position, resource_positions: &BTreeMap<ResourceKind, Position>) -> Self {
        let mut resources = ResourceLedger::new();
        let mut neurons = BTreeMap::new();
        neurons.insert(nucleus_pos, Neuron::nucleus(nucleus_pos));
        for (&kind, &pos) in resource_positions {
            resources.set_position(kind, pos);
            neurons.insert(pos, Neuron::resource(pos, kind));
        }
        Self {
            nucleus_pos,
            resources,
            neurons,
            potentials: BTreeMap::new(),
            technologies: Technology::ALL.iter().map(|&t| (t, 0)).collect(),
            resource_slowdown: DEFAULT_SLOWDOWN,
            last_iron_drip_ms: 0.0,
            nucleus_destroyed: false,
            statistics: Statistics::default(),
        }
    }

    // ---- accessors ----

    pub fn nucleus_pos(&self) -> Position {
        self.nucleus_pos
    }

    pub fn nucleus_destroyed(&self) -> bool {
        self.nucleus_destroyed
    }

    pub fn resources(&self) -> &ResourceLedger {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceLedger {
        &mut self.resources
    }

    pub fn neurons(&self) -> &BTreeMap<Position, Neuron> {
        &self.neurons
    }

    pub fn neuron_at(&self, pos: Position) -> Option<&Neuron> {
        self.neurons.get(&pos)
    }

    pub fn potentials(&self) -> &BTreeMap<String, Potential> {
        &self.potentials
    }

    pub fn technologies(&self) -> &BTreeMap<Technology, u32> {
        &self.technologies
    }

    pub fn tech_level(&self, tech: Technology) -> u32 {
        self.technologies.get(&tech).copied().unwrap_or(0)
    }

    pub fn positions_of(&self, kind: NeuronKind) -> Vec<Position> {
        self.neurons
            .values()
            .filter(|n| n.kind() == kind)
            .map(|n| n.position)
            .collect()
    }

    pub fn nucleus_range(&self) -> f64 {
        NUCLEUS_BUILD_RANGE + self.tech_level(Technology::NucleusRange) as f64
    }

    fn potential_boost(&self) -> i32 {
        self.tech_level(Technology::AtkPotential) as i32
    }

    fn speed_boost(&self) -> i32 {
        // Each level shaves 40ms off the step cooldown.
        40 * self.tech_level(Technology::AtkSpeed) as i32
    }

    fn duration_boost(&self) -> i32 {
        self.tech_level(Technology::AtkDuration) as i32
    }

    fn def_slowdown_boost(&self) -> i32 {
        self.tech_level(Technology::DefPotential) as i32
    }

    fn def_speed_boost(&self) -> i32 {
        self.tech_level(Technology::DefSpeed) as i32
    }

    // ---- commands ----

    /// Builds a neuron on a free cell within build range. The cost stays
    /// bound for as long as the neuron lives.
    pub fn build_neuron(
        &mut self,
        kind: NeuronKind,
        pos: Position,
        field: &mut Field,
        epsp_target: Option<Position>,
        ipsp_target: Option<Position>,
    ) -> Result<(), GameError> {
        if kind == NeuronKind::ResourceNeuron || !field.is_free(pos) {
            return Err(GameError::InvalidTarget);
        }
        if !util::in_range(self.nucleus_pos, pos, 0.0, self.nucleus_range()) {
            return Err(GameError::InvalidTarget);
        }
        self.resources
            .charge(&costs::scaled_cost(Purchase::Neuron(kind), 0), true)?;

        let neuron = match kind {
            NeuronKind::Nucleus => Neuron::nucleus(pos),
            NeuronKind::Synapse => Neuron::synapse(
                pos,
                DEFAULT_SWARM_SIZE,
                self.tech_level(Technology::Way),
                epsp_target,
                ipsp_target,
            ),
            NeuronKind::ActivatedNeuron => {
                Neuron::activated(pos, self.def_slowdown_boost(), self.def_speed_boost())
            }
            NeuronKind::ResourceNeuron => unreachable!("rejected above"),
        };
        self.neurons.insert(pos, neuron);
        field.set_neuron(pos, kind);
        *self.statistics.neurons_built.entry(kind).or_default() += 1;
        Ok(())
    }

    /// Fires potentials from a synapse. Swarm synapses buffer epsp requests
    /// and release them in one volley.
    pub fn add_potential(
        &mut self,
        synapse_pos: Position,
        kind: PotentialKind,
        field: &Field,
        cursor_ms: f64,
    ) -> Result<(), GameError> {
        let Some(neuron) = self.neurons.get_mut(&synapse_pos) else {
            return Err(GameError::InvalidTarget);
        };
        if neuron.blocked {
            return Err(GameError::Blocked);
        }
        let Some(synapse) = neuron.synapse_state_mut() else {
            return Err(GameError::InvalidTarget);
        };
        let way_points = synapse.way_points_for(kind);
        if way_points.is_empty() {
            return Err(GameError::InvalidTarget);
        }

        // Charge before touching the swarm buffer: a rejected request must
        // leave everything unchanged.
        self.resources
            .charge(&costs::scaled_cost(Purchase::Potential(kind), 0), false)?;

        let count = match kind {
            PotentialKind::Epsp => synapse.add_epsp(),
            PotentialKind::Ipsp => 1,
        };

        for _ in 0..count {
            let way = field.find_way(synapse_pos, &way_points)?;
            // The way starts on the synapse cell itself; the remaining path
            // holds every cell still to walk, ending on the target.
            let mut path: std::collections::VecDeque<Position> = way.into_iter().collect();
            path.pop_front();
            let mut potential = match kind {
                PotentialKind::Epsp => Potential::epsp(
                    util::create_id("epsp"),
                    synapse_pos,
                    path,
                    self.potential_boost(),
                    self.speed_boost(),
                ),
                PotentialKind::Ipsp => Potential::ipsp(
                    util::create_id("ipsp"),
                    synapse_pos,
                    path,
                    self.potential_boost(),
                    self.speed_boost(),
                    self.duration_boost(),
                ),
            };
            potential.next_step_deadline = cursor_ms + potential.step_cooldown_ms;
            *self.statistics.potentials_built.entry(kind).or_default() += 1;
            self.potentials.insert(potential.id.clone(), potential);
        }
        Ok(())
    }

    /// Researches one technology level; cost grows with the current level.
    pub fn add_technology(&mut self, tech: Technology) -> Result<(), GameError> {
        let level = self.tech_level(tech);
        if level >= tech.cap() {
            return Err(GameError::InvalidTarget);
        }
        self.resources
            .charge(&costs::scaled_cost(Purchase::Technology(tech), level), false)?;
        self.technologies.insert(tech, level + 1);
        match tech {
            Technology::TotalResource => self.resources.raise_limits(10),
            Technology::Curve => {
                self.resource_slowdown = (self.resource_slowdown - 1.0).max(1.0);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn distribute_iron(&mut self, kind: ResourceKind) -> Result<(), GameError> {
        self.resources.distribute_iron(kind)
    }

    pub fn remove_iron(&mut self, kind: ResourceKind) -> Result<(), GameError> {
        self.resources.remove_iron(kind)
    }

    /// Sets the way-points of a synapse; limited by researched way levels.
    pub fn set_way_points(
        &mut self,
        synapse_pos: Position,
        positions: Vec<Position>,
    ) -> Result<(), GameError> {
        if positions.len() > self.tech_level(Technology::Way) as usize {
            return Err(GameError::InvalidTarget);
        }
        let synapse = self.synapse_mut(synapse_pos)?;
        synapse.way_points = positions;
        Ok(())
    }

    pub fn set_swarm(&mut self, synapse_pos: Position, swarm: bool) -> Result<(), GameError> {
        if self.tech_level(Technology::Swarm) == 0 {
            return Err(GameError::InvalidTarget);
        }
        let synapse = self.synapse_mut(synapse_pos)?;
        synapse.swarm = swarm;
        Ok(())
    }

    pub fn set_target(
        &mut self,
        synapse_pos: Position,
        kind: PotentialKind,
        target: Position,
    ) -> Result<(), GameError> {
        if self.tech_level(Technology::Target) == 0 {
            return Err(GameError::InvalidTarget);
        }
        let synapse = self.synapse_mut(synapse_pos)?;
        match kind {
            PotentialKind::Epsp => synapse.epsp_target = Some(target),
            PotentialKind::Ipsp => synapse.ipsp_target = Some(target),
        }
        Ok(())
    }

    /// Retargets a synapse without the research gate; used during setup and
    /// by the music-driven opponent, which plans targets itself.
    pub fn retarget_synapse(
        &mut self,
        synapse_pos: Position,
        kind: PotentialKind,
        target: Position,
    ) -> Result<(), GameError> {
        let synapse = self.synapse_mut(synapse_pos)?;
        match kind {
            PotentialKind::Epsp => synapse.epsp_target = Some(target),
            PotentialKind::Ipsp => synapse.ipsp_target = Some(target),
        }
        Ok(())
    }

    fn synapse_mut(
        &mut self,
        synapse_pos: Position,
    ) -> Result<&mut crate::game::units::SynapseState, GameError> {
        let Some(neuron) = self.neurons.get_mut(&synapse_pos) else {
            return Err(GameError::InvalidTarget);
        };
        if neuron.blocked {
            return Err(GameError::Blocked);
        }
        neuron.synapse_state_mut().ok_or(GameError::InvalidTarget)
    }

    // ---- tick handlers ----

    /// 1: active resources accumulate.
    pub fn tick_resources(&mut self) {
        self.resources.tick(self.resource_slowdown);
    }

    /// 2: potentials whose deadline passed advance; arrivals damage or block.
    pub fn tick_potentials(&mut self, cursor_ms: f64, opponent: &mut Player, field: &mut Field) {
        let ids: Vec<String> = self.potentials.keys().cloned().collect();
        for id in ids {
            loop {
                let Some(potential) = self.potentials.get_mut(&id) else {
                    break;
                };

                // A resting ipsp blocks its target until the duration ends.
                if let Some(expiry) = potential.expiry_deadline {
                    if cursor_ms >= expiry {
                        opponent.unblock_neuron(potential.position);
                        self.potentials.remove(&id);
                    }
                    break;
                }

                if potential.next_step_deadline > cursor_ms {
                    break;
                }
                potential.next_step_deadline += potential.step_cooldown_ms;
                let arrived = potential.step();
                if !arrived {
                    continue;
                }

                let pos = potential.position;
                let kind = potential.kind;
                let strength = potential.strength;
                match kind {
                    PotentialKind::Epsp => {
                        match opponent.apply_damage(pos, strength, field) {
                            DamageOutcome::Destroyed(destroyed) => {
                                log::info!("PLAYER: epsp destroyed a {}", destroyed.name());
                            }
                            DamageOutcome::Damaged | DamageOutcome::NoNeuron => {}
                        }
                        self.potentials.remove(&id);
                    }
                    PotentialKind::Ipsp => {
                        if opponent.block_neuron(pos) {
                            let duration = potential.duration_ms;
                            potential.expiry_deadline = Some(cursor_ms + duration);
                        } else {
                            self.potentials.remove(&id);
                        }
                    }
                }
                break;
            }
        }
    }

    /// 3: activated neurons intercept the closest opponent potential in
    /// reach, then cooldowns tick down.
    pub fn tick_interceptions(&mut self, opponent: &mut Player) {
        let interceptors: Vec<Position> = self
            .neurons
            .values()
            .filter(|n| {
                !n.blocked
                    && matches!(&n.state, NeuronState::Activated(a) if a.movement_cooldown == 0)
            })
            .map(|n| n.position)
            .collect();

        for pos in interceptors {
            let Some(target_id) = opponent.closest_potential_within(pos, INTERCEPT_RANGE) else {
                continue;
            };
            let slowdown = self
                .neurons
                .get(&pos)
                .and_then(|n| match &n.state {
                    NeuronState::Activated(a) => Some(a.potential_slowdown),
                    _ => None,
                })
                .unwrap_or(1);
            if let Some(killed) = opponent.weaken_potential(&target_id, slowdown) {
                *self.statistics.potentials_killed.entry(killed).or_default() += 1;
            }
            if let Some(state) = self.neurons.get_mut(&pos).and_then(|n| n.activated_state_mut()) {
                state.movement_cooldown = state.movement_reset;
            }
        }

        for neuron in self.neurons.values_mut() {
            if let NeuronState::Activated(state) = &mut neuron.state
                && state.movement_cooldown > 0
            {
                state.movement_cooldown -= 1;
            }
        }
    }

    /// 4: a unit of free iron every ten seconds, until the cap.
    pub fn tick_iron_drip(&mut self, cursor_ms: f64) {
        if cursor_ms - self.last_iron_drip_ms < IRON_DRIP_INTERVAL_MS {
            return;
        }
        self.last_iron_drip_ms = cursor_ms;
        if self.resources.total_distributed_iron() < MAX_DISTRIBUTED_IRON {
            self.resources.award(ResourceKind::Iron, 1.0);
        }
    }

    // ---- defender-side helpers ----

    /// Applies damage to the neuron at `pos`, removing it on destruction and
    /// releasing its bound cost.
    pub fn apply_damage(&mut self, pos: Position, strength: i32, field: &mut Field) -> DamageOutcome {
        let Some(neuron) = self.neurons.get_mut(&pos) else {
            return DamageOutcome::NoNeuron;
        };
        if !neuron.increase_voltage(strength) {
            return DamageOutcome::Damaged;
        }
        let kind = neuron.kind();
        self.neurons.remove(&pos);
        self.resources
            .release(&costs::scaled_cost(Purchase::Neuron(kind), 0));
        field.clear_cell(pos);
        match kind {
            NeuronKind::Nucleus => {
                self.nucleus_destroyed = true;
            }
            NeuronKind::ResourceNeuron => {
                // The deposit is gone; the account stops accumulating.
                let resource_kind = self
                    .resources
                    .iter()
                    .find(|(_, r)| r.position() == Some(pos))
                    .map(|(k, _)| k);
                if let Some(resource_kind) = resource_kind {
                    self.resources.get_mut(resource_kind).set_blocked(true);
                }
            }
            _ => {}
        }
        DamageOutcome::Destroyed(kind)
    }

    /// Blocks the neuron at `pos`; returns whether one was there.
    pub fn block_neuron(&mut self, pos: Position) -> bool {
        let Some(neuron) = self.neurons.get_mut(&pos) else {
            return false;
        };
        neuron.blocked = true;
        if let Some(kind) = neuron.resource_kind() {
            self.resources.get_mut(kind).set_blocked(true);
        }
        true
    }

    pub fn unblock_neuron(&mut self, pos: Position) {
        if let Some(neuron) = self.neurons.get_mut(&pos) {
            neuron.blocked = false;
            if let Some(kind) = neuron.resource_kind() {
                self.resources.get_mut(kind).set_blocked(false);
            }
        }
    }

    fn closest_potential_within(&self, pos: Position, range: f64) -> Option<String> {
        self.potentials
            .values()
            .filter(|p| p.expiry_deadline.is_none())
            .map(|p| (util::dist(pos, p.position), p.id.clone()))
            .filter(|(d, _)| *d <= range)
            .min_by(|(a, _), (b, _)| a.partial_cmp(b).expect("distances are finite"))
            .map(|(_, id)| id)
    }

    /// Reduces a potential's strength; destroys it at zero and reports the
    /// destroyed kind.
    fn weaken_potential(&mut self, id: &str, amount: i32) -> Option<PotentialKind> {
        let potential = self.potentials.get_mut(id)?;
        potential.strength -= amount;
        if potential.strength <= 0 {
            let kind = potential.kind;
            self.potentials.remove(id);
            *self.statistics.potentials_lost.entry(kind).or_default() += 1;
            return Some(kind);
        }
        None
    }

    /// Removes a potential annihilated by an opposing one.
    pub fn annihilate_potential(&mut self, id: &str) {
        if let Some(potential) = self.potentials.remove(id) {
            *self
                .statistics
                .potentials_lost
                .entry(potential.kind)
                .or_default() += 1;
            if potential.kind == PotentialKind::Epsp {
                self.statistics.epsp_swallowed += 1;
            }
        }
    }
}
