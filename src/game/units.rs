//! Neurons (stationary) and potentials (moving) with their state machines.
//!
//! Both are tagged variants around a common core instead of a trait object
//! hierarchy; the only behavior shared across variants is voltage damage and
//! path stepping.

use crate::game::resources::ResourceKind;
use crate::util::Position;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NeuronKind {
    Nucleus,
    Synapse,
    ActivatedNeuron,
    ResourceNeuron,
}

impl NeuronKind {
    pub fn name(self) -> &'static str {
        match self {
            NeuronKind::Nucleus => "nucleus",
            NeuronKind::Synapse => "synapse",
            NeuronKind::ActivatedNeuron => "activated-neuron",
            NeuronKind::ResourceNeuron => "resource-neuron",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PotentialKind {
    Epsp,
    Ipsp,
}

/// Synapse-only state: targets, way-points and the swarm buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseState {
    pub swarm: bool,
    pub max_stored: u32,
    pub stored: u32,
    pub epsp_target: Option<Position>,
    pub ipsp_target: Option<Position>,
    pub way_points: Vec<Position>,
    pub num_available_ways: u32,
}

impl SynapseState {
    /// Way-points for the next potential launch: the configured stops plus
    /// the target matching the potential kind.
    pub fn way_points_for(&self, kind: PotentialKind) -> Vec<Position> {
        let mut way = self.way_points.clone();
        let target = match kind {
            PotentialKind::Epsp => self.epsp_target,
            PotentialKind::Ipsp => self.ipsp_target,
        };
        if let Some(target) = target {
            way.push(target);
        }
        way
    }

    /// How many epsps this request should spawn. Without swarm, one per
    /// request; with swarm, requests are buffered and released together once
    /// `max_stored` is reached.
    pub fn add_epsp(&mut self) -> u32 {
        if !self.swarm {
            return 1;
        }
        self.stored += 1;
        if self.stored >= self.max_stored {
            self.stored = 0;
            return self.max_stored;
        }
        0
    }
}

/// Activated-neuron-only state: the interception cooldown.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivatedState {
    pub movement_cooldown: i32,
    pub movement_reset: i32,
    pub potential_slowdown: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NeuronState {
    Nucleus,
    Synapse(SynapseState),
    Activated(ActivatedState),
    Resource(ResourceKind),
}

/// A stationary entity with voltage. Reaching `max_voltage` destroys it.
#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    pub position: Position,
    pub max_voltage: i32,
    pub voltage: i32,
    pub blocked: bool,
    pub state: NeuronState,
}

impl Neuron {
    pub fn nucleus(position: Position) -> Self {
        Self {
            position,
            max_voltage: 9,
            voltage: 0,
            blocked: false,
            state: NeuronState::Nucleus,
        }
    }

    pub fn synapse(
        position: Position,
        max_stored: u32,
        num_available_ways: u32,
        epsp_target: Option<Position>,
        ipsp_target: Option<Position>,
    ) -> Self {
        Self {
            position,
            max_voltage: 5,
            voltage: 0,
            blocked: false,
            state: NeuronState::Synapse(SynapseState {
                swarm: false,
                max_stored,
                stored: 0,
                epsp_target,
                ipsp_target,
                way_points: Vec::new(),
                num_available_ways,
            }),
        }
    }

    pub fn activated(position: Position, slowdown_boost: i32, speed_boost: i32) -> Self {
        Self {
            position,
            max_voltage: 17,
            voltage: 0,
            blocked: false,
            state: NeuronState::Activated(ActivatedState {
                movement_cooldown: 0,
                movement_reset: 5 - speed_boost,
                potential_slowdown: 1 + slowdown_boost,
            }),
        }
    }

    pub fn resource(position: Position, kind: ResourceKind) -> Self {
        Self {
            position,
            max_voltage: 0,
            voltage: 0,
            blocked: false,
            state: NeuronState::Resource(kind),
        }
    }

    pub fn kind(&self) -> NeuronKind {
        match self.state {
            NeuronState::Nucleus => NeuronKind::Nucleus,
            NeuronState::Synapse(_) => NeuronKind::Synapse,
            NeuronState::Activated(_) => NeuronKind::ActivatedNeuron,
            NeuronState::Resource(_) => NeuronKind::ResourceNeuron,
        }
    }

    /// Raises voltage and reports destruction. Non-positive amounts never
    /// change or destroy anything.
    pub fn increase_voltage(&mut self, amount: i32) -> bool {
        if amount <= 0 {
            return false;
        }
        self.voltage += amount;
        self.voltage >= self.max_voltage
    }

    pub fn synapse_state(&self) -> Option<&SynapseState> {
        match &self.state {
            NeuronState::Synapse(s) => Some(s),
            _ => None,
        }
    }

    pub fn synapse_state_mut(&mut self) -> Option<&mut SynapseState> {
        match &mut self.state {
            NeuronState::Synapse(s) => Some(s),
            _ => None,
        }
    }

    pub fn activated_state_mut(&mut self) -> Option<&mut ActivatedState> {
        match &mut self.state {
            NeuronState::Activated(s) => Some(s),
            _ => None,
        }
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self.state {
            NeuronState::Resource(kind) => Some(kind),
            _ => None,
        }
    }

    /// Field symbol for this neuron.
    pub fn symbol(&self) -> &'static str {
        match &self.state {
            NeuronState::Nucleus => "\u{03A7}",
            NeuronState::Synapse(_) => "\u{039E}",
            NeuronState::Activated(_) => "\u{03A6}",
            NeuronState::Resource(kind) => kind.symbol(),
        }
    }
}

/// A moving projectile following a precomputed path.
///
/// `path` holds the remaining cells up to and including the target; stepping
/// pops the next cell into `position`, and an empty path means the potential
/// has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Potential {
    pub id: String,
    pub kind: PotentialKind,
    pub position: Position,
    pub strength: i32,
    pub step_cooldown_ms: f64,
    pub next_step_deadline: f64,
    pub path: VecDeque<Position>,
    /// How long an ipsp blocks its target after arrival.
    pub duration_ms: f64,
    /// Set once an ipsp arrives; the block lifts at this time.
    pub expiry_deadline: Option<f64>,
}

impl Potential {
    pub fn epsp(
        id: String,
        position: Position,
        path: VecDeque<Position>,
        potential_boost: i32,
        speed_boost: i32,
    ) -> Self {
        Self {
            id,
            kind: PotentialKind::Epsp,
            position,
            strength: 2 + potential_boost,
            step_cooldown_ms: (370 - speed_boost) as f64,
            next_step_deadline: 0.0,
            path,
            duration_ms: 0.0,
            expiry_deadline: None,
        }
    }

    pub fn ipsp(
        id: String,
        position: Position,
        path: VecDeque<Position>,
        potential_boost: i32,
        speed_boost: i32,
        duration_boost: i32,
    ) -> Self {
        Self {
            id,
            kind: PotentialKind::Ipsp,
            position,
            strength: 3 + potential_boost,
            step_cooldown_ms: (420 - speed_boost) as f64,
            next_step_deadline: 0.0,
            path,
            duration_ms: (4000 + duration_boost * 1000) as f64,
            expiry_deadline: None,
        }
    }

    /// Advances one cell; returns `true` when the potential has just arrived.
    pub fn step(&mut self) -> bool {
        if let Some(next) = self.path.pop_front() {
            self.position = next;
        }
        self.path.is_empty()
    }

    pub fn arrived(&self) -> bool {
        self.path.is_empty()
    }

    pub fn symbol(&self) -> &'static str {
        match self.kind {
            PotentialKind::Epsp => "e",
            PotentialKind::Ipsp => "i",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nucleus_destroyed_at_max_voltage() {
        let mut nucleus = Neuron::nucleus((1, 1));
        assert!(!nucleus.increase_voltage(8));
        // One below max; a strength-1 hit finishes it.
        assert!(nucleus.increase_voltage(1));
    }

    #[test]
    fn test_zero_strength_never_destroys() {
        let mut nucleus = Neuron::nucleus((1, 1));
        nucleus.increase_voltage(8);
        assert!(!nucleus.increase_voltage(0));
        assert!(!nucleus.increase_voltage(-5));
        assert_eq!(nucleus.voltage, 8);
    }

    #[test]
    fn test_swarm_buffer_cycles() {
        let mut synapse = Neuron::synapse((0, 0), 3, 0, None, None);
        let state = synapse.synapse_state_mut().unwrap();
        state.swarm = true;
        let emitted: Vec<u32> = (0..6).map(|_| state.add_epsp()).collect();
        assert_eq!(emitted, vec![0, 0, 3, 0, 0, 3]);
    }

    #[test]
    fn test_no_swarm_emits_one() {
        let mut synapse = Neuron::synapse((0, 0), 3, 0, None, None);
        let state = synapse.synapse_state_mut().unwrap();
        assert_eq!(state.add_epsp(), 1);
        assert_eq!(state.add_epsp(), 1);
    }

    #[test]
    fn test_way_points_append_matching_target() {
        let epsp_target = (2, 2);
        let ipsp_target = (4, 4);
        let synapse = Neuron::synapse((1, 1), 0, 0, Some(epsp_target), Some(ipsp_target));
        let state = synapse.synapse_state().unwrap();
        assert_eq!(state.way_points_for(PotentialKind::Epsp), vec![epsp_target]);
        assert_eq!(state.way_points_for(PotentialKind::Ipsp), vec![ipsp_target]);
    }

    #[test]
    fn test_boosted_constructors() {
        let epsp = Potential::epsp("e1".into(), (0, 0), VecDeque::new(), 1, 40);
        assert_eq!(epsp.strength, 3);
        assert_eq!(epsp.step_cooldown_ms, 330.0);

        let ipsp = Potential::ipsp("i1".into(), (0, 0), VecDeque::new(), 0, 0, 2);
        assert_eq!(ipsp.strength, 3);
        assert_eq!(ipsp.step_cooldown_ms, 420.0);
        assert_eq!(ipsp.duration_ms, 6000.0);
    }

    #[test]
    fn test_step_consumes_path() {
        let path: VecDeque<Position> = VecDeque::from([(0, 1), (0, 2)]);
        let mut potential = Potential::epsp("e1".into(), (0, 0), path, 0, 0);
        assert!(!potential.step());
        assert_eq!(potential.position, (0, 1));
        assert!(potential.step());
        assert_eq!(potential.position, (0, 2));
        assert!(potential.arrived());
    }

    #[test]
    fn test_activated_neuron_bakes_boosts() {
        let neuron = Neuron::activated((0, 0), 2, 1);
        let NeuronState::Activated(state) = &neuron.state else {
            panic!("not an activated neuron");
        };
        assert_eq!(neuron.max_voltage, 17);
        assert_eq!(state.movement_reset, 4);
        assert_eq!(state.potential_slowdown, 3);
    }
}
