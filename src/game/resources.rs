//! Per-player resource accounts with saturating accumulation and iron boosts.

use crate::shared::error::GameError;
use crate::util::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default limit of `free + bound` per resource.
pub const DEFAULT_LIMIT: u32 = 100;
/// Iron units a resource needs before it accumulates.
pub const ACTIVATION_IRON: u32 = 2;
/// Iron the ledger starts with.
pub const INITIAL_IRON: f64 = 2.0;
/// Oxygen the ledger starts with, enough for an early structure.
pub const INITIAL_OXYGEN: f64 = 5.5;
/// Default divisor applied to every gain; lowered by research.
pub const DEFAULT_SLOWDOWN: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Iron,
    Oxygen,
    Potassium,
    Chloride,
    Glutamate,
    Dopamine,
    Serotonin,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Iron,
        ResourceKind::Oxygen,
        ResourceKind::Potassium,
        ResourceKind::Chloride,
        ResourceKind::Glutamate,
        ResourceKind::Dopamine,
        ResourceKind::Serotonin,
    ];

    /// The six resources that occupy field cells (everything but iron).
    pub const PLACEABLE: [ResourceKind; 6] = [
        ResourceKind::Oxygen,
        ResourceKind::Potassium,
        ResourceKind::Chloride,
        ResourceKind::Glutamate,
        ResourceKind::Dopamine,
        ResourceKind::Serotonin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Iron => "iron",
            ResourceKind::Oxygen => "oxygen",
            ResourceKind::Potassium => "potassium",
            ResourceKind::Chloride => "chloride",
            ResourceKind::Glutamate => "glutamate",
            ResourceKind::Dopamine => "dopamine",
            ResourceKind::Serotonin => "serotonin",
        }
    }

    /// One-character field symbol (greek letters, like the resource names on
    /// a periodic table squint).
    pub fn symbol(self) -> &'static str {
        match self {
            ResourceKind::Iron => "\u{03B6}",
            ResourceKind::Oxygen => "\u{03BF}",
            ResourceKind::Potassium => "\u{03BA}",
            ResourceKind::Chloride => "\u{03B3}",
            ResourceKind::Glutamate => "\u{03B7}",
            ResourceKind::Dopamine => "\u{03B4}",
            ResourceKind::Serotonin => "\u{03C3}",
        }
    }
}

/// Running gathering statistics, kept as sums so they cost nothing per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStats {
    pub total: f64,
    pub spent: f64,
    boost_sum: f64,
    bound_sum: f64,
    neg_factor_sum: f64,
    samples: u64,
    active_ticks: u64,
    ticks: u64,
}

impl ResourceStats {
    pub fn average_boost(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.boost_sum / self.samples as f64
        }
    }

    pub fn average_bound(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.bound_sum / self.samples as f64
        }
    }

    pub fn average_neg_factor(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.neg_factor_sum / self.samples as f64
        }
    }

    pub fn active_percent(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.active_ticks as f64 / self.ticks as f64
        }
    }
}

/// One resource account.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    free: f64,
    bound: f64,
    limit: u32,
    distributed_iron: u32,
    blocked: bool,
    position: Option<Position>,
    to_int: bool,
    stats: ResourceStats,
}

impl Resource {
    fn new(init: f64, limit: u32, to_int: bool) -> Self {
        Self {
            free: init,
            bound: 0.0,
            limit,
            distributed_iron: 0,
            blocked: false,
            position: None,
            to_int,
            stats: ResourceStats {
                total: init,
                ..ResourceStats::default()
            },
        }
    }

    pub fn free(&self) -> f64 {
        if self.to_int { self.free.floor() } else { self.free }
    }

    pub fn bound(&self) -> f64 {
        self.bound
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn distributed_iron(&self) -> u32 {
        self.distributed_iron
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn stats(&self) -> &ResourceStats {
        &self.stats
    }

    /// A resource accumulates only with at least [`ACTIVATION_IRON`] iron.
    pub fn active(&self) -> bool {
        self.distributed_iron >= ACTIVATION_IRON
    }

    pub fn raise_limit(&mut self, percent: u32) {
        self.limit += self.limit * percent / 100;
    }

    /// `[cur]+[bound]/[limit]` display form.
    pub fn print(&self) -> String {
        format!("{:.2}+{:.2}/{}", self.free(), self.bound, self.limit)
    }

    /// Adds `(1 + iron/10) * gain * (1 - (free+bound)/limit) / slowdown`,
    /// rejecting any update that would exceed the limit.
    pub fn increase(&mut self, gain: f64, slowdown: f64) {
        let boost = 1.0 + self.distributed_iron as f64 / 10.0;
        let neg_factor = 1.0 - (self.free + self.bound) / self.limit as f64;
        let delta = boost * gain * neg_factor / slowdown;
        if delta < 0.0 {
            log::error!(
                "RESOURCE: negative gain (boost {} gain {} neg {})",
                boost,
                gain,
                neg_factor
            );
            return;
        }
        if delta + self.free + self.bound > self.limit as f64 {
            return;
        }
        self.free += delta;
        self.stats.total += delta;
        self.stats.boost_sum += boost;
        self.stats.bound_sum += self.bound;
        self.stats.neg_factor_sum += neg_factor;
        self.stats.samples += 1;
    }

    /// Subtracts from `free`; with `bind` the amount stays committed in
    /// `bound` until the consuming structure dies.
    pub fn decrease(&mut self, amount: f64, bind: bool) {
        if amount < 0.0 {
            log::error!("RESOURCE: decreasing by negative value {}", amount);
            return;
        }
        self.free -= amount;
        self.stats.spent += amount;
        if bind {
            self.bound += amount;
        }
    }

    fn release_bound(&mut self, amount: f64) {
        self.bound = (self.bound - amount).max(0.0);
    }

    fn record_tick(&mut self) {
        self.stats.ticks += 1;
        if self.active() {
            self.stats.active_ticks += 1;
        }
    }
}

/// All resource accounts of one player.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLedger {
    resources: BTreeMap<ResourceKind, Resource>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        let mut resources = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let init = match kind {
                ResourceKind::Iron => INITIAL_IRON,
                ResourceKind::Oxygen => INITIAL_OXYGEN,
                _ => 0.0,
            };
            resources.insert(kind, Resource::new(init, DEFAULT_LIMIT, kind == ResourceKind::Iron));
        }
        Self { resources }
    }

    pub fn get(&self, kind: ResourceKind) -> &Resource {
        &self.resources[&kind]
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut Resource {
        self.resources.get_mut(&kind).expect("all kinds present")
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &Resource)> {
        self.resources.iter().map(|(&k, r)| (k, r))
    }

    pub fn set_position(&mut self, kind: ResourceKind, pos: Position) {
        self.get_mut(kind).position = Some(pos);
    }

    pub fn total_distributed_iron(&self) -> u32 {
        self.resources.values().map(|r| r.distributed_iron).sum()
    }

    /// Moves one unit of iron onto `kind`. Gated on the iron actually
    /// available for charging.
    pub fn distribute_iron(&mut self, kind: ResourceKind) -> Result<(), GameError> {
        if kind == ResourceKind::Iron {
            return Err(GameError::InvalidTarget);
        }
        if self.get(ResourceKind::Iron).free < 1.0 {
            return Err(GameError::InsufficientResources {
                missing: vec![ResourceKind::Iron],
            });
        }
        self.get_mut(ResourceKind::Iron).free -= 1.0;
        self.get_mut(kind).distributed_iron += 1;
        Ok(())
    }

    /// Takes one unit of iron back from `kind`; exact inverse of
    /// [`Self::distribute_iron`].
    pub fn remove_iron(&mut self, kind: ResourceKind) -> Result<(), GameError> {
        if kind == ResourceKind::Iron || self.get(kind).distributed_iron == 0 {
            return Err(GameError::InvalidTarget);
        }
        self.get_mut(kind).distributed_iron -= 1;
        self.get_mut(ResourceKind::Iron).free += 1.0;
        Ok(())
    }

    /// The resources lacking free funds for the given costs.
    pub fn missing_for(&self, costs: &[(ResourceKind, f64)]) -> Vec<ResourceKind> {
        costs
            .iter()
            .filter(|&&(kind, amount)| self.get(kind).free() < amount)
            .map(|&(kind, _)| kind)
            .collect()
    }

    /// Charges all costs or nothing.
    pub fn charge(&mut self, costs: &[(ResourceKind, f64)], bind: bool) -> Result<(), GameError> {
        let missing = self.missing_for(costs);
        if !missing.is_empty() {
            return Err(GameError::InsufficientResources { missing });
        }
        for &(kind, amount) in costs {
            self.get_mut(kind).decrease(amount, bind);
        }
        Ok(())
    }

    /// Grants free units outright (iron drip, setup grants), capped at the
    /// resource limit.
    pub fn award(&mut self, kind: ResourceKind, amount: f64) {
        let resource = self.get_mut(kind);
        let headroom = (resource.limit as f64 - resource.free - resource.bound).max(0.0);
        resource.free += amount.min(headroom);
    }

    /// Releases the bound share of previously charged costs.
    pub fn release(&mut self, costs: &[(ResourceKind, f64)]) {
        for &(kind, amount) in costs {
            self.get_mut(kind).release_bound(amount);
        }
    }

    /// Per-tick accumulation; inactive and blocked resources gain nothing.
    pub fn tick(&mut self, slowdown: f64) {
        for resource in self.resources.values_mut() {
            resource.record_tick();
            if resource.active() && !resource.blocked {
                resource.increase(1.0, slowdown);
            }
        }
    }

    pub fn raise_limits(&mut self, percent: u32) {
        for resource in self.resources.values_mut() {
            resource.raise_limit(percent);
        }
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_formula() {
        let mut r = Resource::new(0.0, 100, false);
        r.distributed_iron = 2;
        r.increase(10.0, 1.0);
        // (1 + 2/10) * 10 * (1 - 0/100) / 1 = 12
        assert!((r.free() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_increase_at_limit_is_noop() {
        let mut r = Resource::new(10.0, 10, false);
        r.increase(1.0, 1.0);
        assert_eq!(r.free(), 10.0);
    }

    #[test]
    fn test_increase_never_exceeds_limit() {
        let mut r = Resource::new(0.0, 10, false);
        r.distributed_iron = 10;
        for _ in 0..10_000 {
            r.increase(5.0, 1.0);
            assert!(r.free() + r.bound() <= r.limit() as f64 + 1e-9);
        }
    }

    #[test]
    fn test_inactive_resource_never_accumulates() {
        let mut ledger = ResourceLedger::new();
        ledger.distribute_iron(ResourceKind::Potassium).unwrap();
        let before = ledger.get(ResourceKind::Potassium).free();
        for _ in 0..100 {
            ledger.tick(1.0);
        }
        // One iron is not enough for activation.
        assert_eq!(ledger.get(ResourceKind::Potassium).free(), before);
    }

    #[test]
    fn test_blocked_resource_never_accumulates() {
        let mut ledger = ResourceLedger::new();
        ledger.distribute_iron(ResourceKind::Potassium).unwrap();
        ledger.distribute_iron(ResourceKind::Potassium).unwrap();
        ledger.get_mut(ResourceKind::Potassium).set_blocked(true);
        let before = ledger.get(ResourceKind::Potassium).free();
        ledger.tick(1.0);
        assert_eq!(ledger.get(ResourceKind::Potassium).free(), before);
    }

    #[test]
    fn test_distribute_then_remove_is_identity() {
        let ledger = ResourceLedger::new();
        let mut mutated = ledger.clone();
        mutated.distribute_iron(ResourceKind::Oxygen).unwrap();
        mutated.remove_iron(ResourceKind::Oxygen).unwrap();
        assert_eq!(mutated, ledger);
    }

    #[test]
    fn test_distribute_without_iron_fails() {
        let mut ledger = ResourceLedger::new();
        ledger.distribute_iron(ResourceKind::Oxygen).unwrap();
        ledger.distribute_iron(ResourceKind::Oxygen).unwrap();
        assert_eq!(
            ledger.distribute_iron(ResourceKind::Oxygen),
            Err(GameError::InsufficientResources {
                missing: vec![ResourceKind::Iron]
            })
        );
    }

    #[test]
    fn test_charge_is_atomic() {
        let mut ledger = ResourceLedger::new();
        let costs = [(ResourceKind::Oxygen, 2.0), (ResourceKind::Potassium, 5.0)];
        let before_oxygen = ledger.get(ResourceKind::Oxygen).free();
        let err = ledger.charge(&costs, false).unwrap_err();
        assert_eq!(
            err,
            GameError::InsufficientResources {
                missing: vec![ResourceKind::Potassium]
            }
        );
        // Nothing was deducted.
        assert_eq!(ledger.get(ResourceKind::Oxygen).free(), before_oxygen);
    }

    #[test]
    fn test_charge_bind_and_release() {
        let mut ledger = ResourceLedger::new();
        let costs = [(ResourceKind::Oxygen, 4.0)];
        ledger.charge(&costs, true).unwrap();
        assert_eq!(ledger.get(ResourceKind::Oxygen).bound(), 4.0);
        ledger.release(&costs);
        assert_eq!(ledger.get(ResourceKind::Oxygen).bound(), 0.0);
    }

    #[test]
    fn test_iron_display_is_whole_units() {
        let mut ledger = ResourceLedger::new();
        ledger.get_mut(ResourceKind::Iron).free = 2.8;
        assert_eq!(ledger.get(ResourceKind::Iron).free(), 2.0);
    }

    #[test]
    fn test_raise_limits() {
        let mut ledger = ResourceLedger::new();
        ledger.raise_limits(10);
        assert_eq!(ledger.get(ResourceKind::Oxygen).limit(), 110);
    }
}
