//! The music-driven opponent.
//!
//! Every consumed beat is turned into concrete player commands. Tactic
//! weights are seeded once from the analysis (key, darkness, level peaks);
//! each beat the highest-scored tactic of a category wins, acts, and pays
//! for it with a score decrement, so preferences rotate instead of locking
//! in.

use crate::audio::analysis::{AnalyzedAudio, BeatPoint};
use crate::game::field::Field;
use crate::game::player::Player;
use crate::game::resources::ResourceKind;
use crate::game::technology::Technology;
use crate::game::units::{NeuronKind, PotentialKind};
use crate::util::{self, Position};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tactic {
    // attack focus
    EpspFocused,
    IpspFocused,
    // epsp targets
    AimNucleus,
    DestroyActivatedNeurons,
    DestroySynapses,
    DestroyResources,
    // ipsp targets
    BlockActivatedNeuron,
    BlockSynapses,
    BlockResources,
    // activated-neuron placement
    DefFrontFocus,
    DefSurroundFocus,
    // defensive reaction
    DefIpspBlock,
    DefAnBlock,
}

/// A launch waiting for its synchronization delay to pass.
#[derive(Debug, Clone)]
struct PendingLaunch {
    due_ms: f64,
    synapse_pos: Position,
    kind: PotentialKind,
    count: u32,
}

pub struct MusicAi {
    average_level: f64,
    darkness_threshold: usize,
    max_activated_neurons: usize,
    /// pitch-class → weight votes, five entries per attack strategy.
    attack_pitches: BTreeMap<Tactic, BTreeMap<usize, i64>>,
    attack_strategies: BTreeMap<Tactic, i64>,
    epsp_target_strategies: BTreeMap<Tactic, i64>,
    ipsp_target_strategies: BTreeMap<Tactic, i64>,
    activated_neuron_strategies: BTreeMap<Tactic, i64>,
    def_strategies: BTreeMap<Tactic, i64>,
    technology_order: Vec<Technology>,
    pending: Vec<PendingLaunch>,
}

impl MusicAi {
    /// Seeds all tactic tables from the analysis.
    pub fn new(analysis: &AnalyzedAudio) -> Self {
        let main_interval = analysis.intervals.first();
        let root = main_interval.map(|i| i.key_note).unwrap_or(0);
        let major = main_interval.map(|i| i.major).unwrap_or(true);

        // Scale degrees vote for the aggressive focus, off-degrees for the
        // blocking focus.
        let mut attack_pitches = BTreeMap::new();
        attack_pitches.insert(
            Tactic::EpspFocused,
            [0, 2, 4, 7, 9]
                .iter()
                .enumerate()
                .map(|(i, &step)| ((root + step) % 12, 5 - i as i64))
                .collect(),
        );
        attack_pitches.insert(
            Tactic::IpspFocused,
            [1, 3, 5, 8, 10]
                .iter()
                .enumerate()
                .map(|(i, &step)| ((root + step) % 12, 5 - i as i64))
                .collect(),
        );

        // How spiky the song is: a heavily reduced level curve means long
        // flat stretches, favoring patient ipsp play.
        let level_curve: Vec<(i32, f64)> = analysis
            .beats
            .iter()
            .enumerate()
            .map(|(i, b)| (i as i32, b.level as f64))
            .collect();
        let epsilon = util::peucker_epsilon(level_curve.len(), analysis.max_peak.max(1));
        let peaks = util::douglas_peucker(&level_curve, epsilon).len();
        let spiky = peaks * 4 > level_curve.len().max(1);

        let mut attack_strategies = BTreeMap::new();
        attack_strategies.insert(Tactic::EpspFocused, if spiky { 6 } else { 3 });
        attack_strategies.insert(Tactic::IpspFocused, if spiky { 3 } else { 6 });

        let avg_darkness = if analysis.intervals.is_empty() {
            0
        } else {
            analysis.intervals.iter().map(|i| i.darkness).sum::<usize>()
                / analysis.intervals.len()
        };

        let mut epsp_target_strategies = BTreeMap::new();
        epsp_target_strategies.insert(Tactic::AimNucleus, 4);
        epsp_target_strategies.insert(
            Tactic::DestroyActivatedNeurons,
            if major { 2 } else { 3 },
        );
        epsp_target_strategies.insert(Tactic::DestroySynapses, 2);
        epsp_target_strategies.insert(
            Tactic::DestroyResources,
            if avg_darkness > 4 { 3 } else { 1 },
        );

        let mut ipsp_target_strategies = BTreeMap::new();
        ipsp_target_strategies.insert(Tactic::BlockActivatedNeuron, 3);
        ipsp_target_strategies.insert(Tactic::BlockSynapses, if major { 1 } else { 3 });
        ipsp_target_strategies.insert(Tactic::BlockResources, 2);

        let mut activated_neuron_strategies = BTreeMap::new();
        activated_neuron_strategies.insert(
            Tactic::DefFrontFocus,
            if analysis.max_peak > 4 { 4 } else { 2 },
        );
        activated_neuron_strategies.insert(Tactic::DefSurroundFocus, 3);

        let mut def_strategies = BTreeMap::new();
        def_strategies.insert(Tactic::DefIpspBlock, 3);
        def_strategies.insert(Tactic::DefAnBlock, 2);

        // Research order: rotate a fixed list by the key root so different
        // songs research differently.
        let mut technology_order: Vec<Technology> = Technology::ALL.to_vec();
        technology_order.rotate_left(root % Technology::ALL.len());

        Self {
            average_level: analysis.average_level,
            darkness_threshold: avg_darkness,
            max_activated_neurons: 3 + analysis.max_peak.min(5),
            attack_pitches,
            attack_strategies,
            epsp_target_strategies,
            ipsp_target_strategies,
            activated_neuron_strategies,
            def_strategies,
            technology_order,
            pending: Vec::new(),
        }
    }

    /// Applies every rule that fits the current beat.
    pub fn act_on_beat(
        &mut self,
        beat: &BeatPoint,
        analysis: &AnalyzedAudio,
        me: &mut Player,
        opponent: &Player,
        field: &mut Field,
        cursor_ms: f64,
    ) {
        // Beat notes vote on the attack focus.
        for note in &beat.notes {
            for (tactic, pitches) in &self.attack_pitches {
                if let Some(weight) = pitches.get(&note.pitch_class) {
                    *self.attack_strategies.entry(*tactic).or_default() += weight;
                }
            }
        }

        if self.should_attack(beat, me) {
            self.launch_attack(analysis, me, opponent, field, cursor_ms);
        }
        if me.positions_of(NeuronKind::Synapse).is_empty() || analysis.all_notes_in_key(beat) {
            self.create_synapse(me, opponent, field);
        }
        if me.positions_of(NeuronKind::ActivatedNeuron).len() < self.max_activated_neurons
            && beat.level as f64 >= self.average_level
        {
            self.create_activated_neuron(me, opponent, field);
        }
        if !opponent.potentials().is_empty() {
            self.defend(me, opponent, field, cursor_ms);
        }
        if analysis.interval_of(beat).darkness > self.darkness_threshold {
            self.new_technology(me);
        }
        self.keep_oxygen_low(me, field, cursor_ms);
        self.handle_iron(beat, me);
    }

    /// Fires launches whose synchronization wait has passed.
    pub fn drain_pending(&mut self, me: &mut Player, field: &Field, cursor_ms: f64) {
        let (due, rest): (Vec<PendingLaunch>, Vec<PendingLaunch>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|launch| launch.due_ms <= cursor_ms);
        self.pending = rest;
        for launch in due {
            for _ in 0..launch.count {
                if let Err(err) = me.add_potential(launch.synapse_pos, launch.kind, field, cursor_ms)
                {
                    log::debug!("AI: launch from {:?} skipped: {}", launch.synapse_pos, err);
                    break;
                }
            }
        }
    }

    fn should_attack(&self, beat: &BeatPoint, me: &Player) -> bool {
        if (beat.level as f64) < self.average_level {
            return false;
        }
        let epsp_cost = 4.4;
        let ipsps = self.ipsps_to_create(me).max(1) as f64;
        let swarm_factor = 3.0;
        me.resources().get(ResourceKind::Potassium).free() >= epsp_cost * ipsps * swarm_factor
    }

    fn ipsps_to_create(&self, me: &Player) -> u32 {
        let chloride = me.resources().get(ResourceKind::Chloride).free();
        ((chloride / 6.8) as u32).min(2)
    }

    /// Picks targets and synapses, then schedules epsp and ipsp volleys so
    /// both arrive within one step of each other. The whole attack holds
    /// until the music next turns off-key.
    fn launch_attack(
        &mut self,
        analysis: &AnalyzedAudio,
        me: &mut Player,
        opponent: &Player,
        field: &mut Field,
        cursor_ms: f64,
    ) {
        let synapses = me.positions_of(NeuronKind::Synapse);
        if synapses.is_empty() {
            return;
        }

        let beat_ms = 60_000.0 / analysis.average_bpm.max(40.0);
        let hold_ms = analysis.next_off_key_beat_in(cursor_ms).min(8) as f64 * beat_ms;
        let cursor_ms = cursor_ms + hold_ms;

        let focus = best_tactic(&mut self.attack_strategies);
        let epsp_target = self.pick_epsp_target(opponent);
        let ipsp_target = self.pick_ipsp_target(opponent);

        // Shortest-path synapse for the epsp volley.
        let Some((epsp_synapse, epsp_way)) = shortest_launch(field, &synapses, epsp_target) else {
            return;
        };
        let _ = me.retarget_synapse(epsp_synapse, PotentialKind::Epsp, epsp_target);

        let ipsps = if focus == Tactic::IpspFocused {
            self.ipsps_to_create(me)
        } else {
            self.ipsps_to_create(me).min(1)
        };

        let epsp_step = 370.0;
        let ipsp_step = 420.0;
        let mut epsp_due = cursor_ms;
        if ipsps > 0
            && let Some((ipsp_synapse, ipsp_way)) = shortest_launch(field, &synapses, ipsp_target)
        {
            let _ = me.retarget_synapse(ipsp_synapse, PotentialKind::Ipsp, ipsp_target);
            // Whichever volley travels longer starts first; the other waits
            // out the difference so both arrive within one step.
            let wait = epsp_way.len() as f64 * epsp_step - ipsp_way.len() as f64 * ipsp_step;
            let ipsp_due = if wait >= 0.0 {
                epsp_due = cursor_ms;
                cursor_ms + wait
            } else {
                epsp_due = cursor_ms - wait;
                cursor_ms
            };
            self.pending.push(PendingLaunch {
                due_ms: ipsp_due,
                synapse_pos: ipsp_synapse,
                kind: PotentialKind::Ipsp,
                count: ipsps,
            });
        }

        self.pending.push(PendingLaunch {
            due_ms: epsp_due,
            synapse_pos: epsp_synapse,
            kind: PotentialKind::Epsp,
            count: 3,
        });
        log::debug!(
            "AI: attack scheduled ({:?} focus) at {:?} -> {:?}",
            focus,
            epsp_synapse,
            epsp_target
        );
    }

    fn pick_epsp_target(&mut self, opponent: &Player) -> Position {
        let tactic = best_tactic(&mut self.epsp_target_strategies);
        let fallback = opponent.nucleus_pos();
        let candidates = match tactic {
            Tactic::DestroyActivatedNeurons => opponent.positions_of(NeuronKind::ActivatedNeuron),
            Tactic::DestroySynapses => opponent.positions_of(NeuronKind::Synapse),
            Tactic::DestroyResources => opponent.positions_of(NeuronKind::ResourceNeuron),
            _ => vec![],
        };
        nearest_to(fallback, &candidates).unwrap_or(fallback)
    }

    fn pick_ipsp_target(&mut self, opponent: &Player) -> Position {
        let tactic = best_tactic(&mut self.ipsp_target_strategies);
        let fallback = opponent.nucleus_pos();
        let candidates = match tactic {
            Tactic::BlockActivatedNeuron => opponent.positions_of(NeuronKind::ActivatedNeuron),
            Tactic::BlockSynapses => opponent.positions_of(NeuronKind::Synapse),
            Tactic::BlockResources => opponent.positions_of(NeuronKind::ResourceNeuron),
            _ => vec![],
        };
        nearest_to(fallback, &candidates).unwrap_or(fallback)
    }

    fn create_synapse(&mut self, me: &mut Player, opponent: &Player, field: &mut Field) {
        let Some(pos) = field.find_free(me.nucleus_pos(), 1, 5) else {
            return;
        };
        let target = opponent.nucleus_pos();
        match me.build_neuron(NeuronKind::Synapse, pos, field, Some(target), Some(target)) {
            Ok(()) => log::debug!("AI: synapse built at {:?}", pos),
            Err(err) => log::debug!("AI: synapse skipped: {}", err),
        }
    }

    fn create_activated_neuron(&mut self, me: &mut Player, opponent: &Player, field: &mut Field) {
        let tactic = best_tactic(&mut self.activated_neuron_strategies);
        let nucleus = me.nucleus_pos();
        let anchor = match tactic {
            Tactic::DefFrontFocus => {
                // A step toward the enemy: guard the likely attack lane.
                let enemy = opponent.nucleus_pos();
                (
                    nucleus.0 + (enemy.0 - nucleus.0).signum() * 2,
                    nucleus.1 + (enemy.1 - nucleus.1).signum() * 2,
                )
            }
            _ => nucleus,
        };
        let Some(pos) = field.find_free(anchor, 1, 3) else {
            return;
        };
        // Placement must stay inside build range of the nucleus.
        if !util::in_range(nucleus, pos, 0.0, me.nucleus_range()) {
            return;
        }
        match me.build_neuron(NeuronKind::ActivatedNeuron, pos, field, None, None) {
            Ok(()) => log::debug!("AI: activated neuron built at {:?}", pos),
            Err(err) => log::debug!("AI: activated neuron skipped: {}", err),
        }
    }

    /// Reaction to incoming potentials: dry up the attacking synapse with an
    /// ipsp, or add another interceptor.
    fn defend(&mut self, me: &mut Player, opponent: &Player, field: &mut Field, cursor_ms: f64) {
        match best_tactic(&mut self.def_strategies) {
            Tactic::DefIpspBlock => {
                let synapses = me.positions_of(NeuronKind::Synapse);
                let targets = opponent.positions_of(NeuronKind::Synapse);
                let (Some(&from), Some(target)) =
                    (synapses.first(), nearest_to(me.nucleus_pos(), &targets))
                else {
                    return;
                };
                let _ = me.retarget_synapse(from, PotentialKind::Ipsp, target);
                if let Err(err) = me.add_potential(from, PotentialKind::Ipsp, field, cursor_ms) {
                    log::debug!("AI: defensive ipsp skipped: {}", err);
                }
            }
            _ => self.create_activated_neuron(me, opponent, field),
        }
    }

    fn new_technology(&mut self, me: &mut Player) {
        for tech in self.technology_order.clone() {
            match me.add_technology(tech) {
                Ok(()) => {
                    log::debug!("AI: researched {}", tech.name());
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Oxygen sitting at its limit is wasted; convert it into pressure.
    fn keep_oxygen_low(&mut self, me: &mut Player, field: &Field, cursor_ms: f64) {
        let oxygen = me.resources().get(ResourceKind::Oxygen);
        if oxygen.free() + oxygen.bound() < oxygen.limit() as f64 - 5.0 {
            return;
        }
        let synapses = me.positions_of(NeuronKind::Synapse);
        if let Some(&synapse) = synapses.first()
            && let Err(err) = me.add_potential(synapse, PotentialKind::Epsp, field, cursor_ms)
        {
            log::debug!("AI: oxygen-pressure launch skipped: {}", err);
        }
    }

    /// Iron goes to oxygen until it accumulates, then follows the beat's
    /// dominant pitch class.
    fn handle_iron(&mut self, beat: &BeatPoint, me: &mut Player) {
        let oxygen_iron = me.resources().get(ResourceKind::Oxygen).distributed_iron();
        if oxygen_iron < 2 {
            if let Err(err) = me.distribute_iron(ResourceKind::Oxygen) {
                log::debug!("AI: iron to oxygen skipped: {}", err);
            }
            return;
        }

        let mut counts = [0usize; 12];
        for note in &beat.notes {
            counts[note.pitch_class] += 1;
        }
        let Some(dominant) = (0..12).max_by_key(|&c| (counts[c], 12 - c)) else {
            return;
        };
        if counts[dominant] == 0 {
            return;
        }
        let kind = ResourceKind::PLACEABLE[dominant % ResourceKind::PLACEABLE.len()];
        if let Err(err) = me.distribute_iron(kind) {
            log::debug!("AI: iron to {} skipped: {}", kind.name(), err);
        }
    }
}

/// Highest-scored tactic wins and pays one point for it.
fn best_tactic(scores: &mut BTreeMap<Tactic, i64>) -> Tactic {
    let best = scores
        .iter()
        .max_by_key(|&(_, score)| *score)
        .map(|(&tactic, _)| tactic)
        .expect("tactic tables are never empty");
    *scores.get_mut(&best).expect("just found") -= 1;
    best
}

fn nearest_to(anchor: Position, candidates: &[Position]) -> Option<Position> {
    candidates
        .iter()
        .min_by(|a, b| {
            util::dist(anchor, **a)
                .partial_cmp(&util::dist(anchor, **b))
                .expect("distances are finite")
        })
        .copied()
}

/// The synapse whose path to `target` is shortest, with that path.
fn shortest_launch(
    field: &Field,
    synapses: &[Position],
    target: Position,
) -> Option<(Position, Vec<Position>)> {
    synapses
        .iter()
        .filter_map(|&pos| field.find_way(pos, &[target]).ok().map(|way| (pos, way)))
        .min_by_key(|(_, way)| way.len())
}
