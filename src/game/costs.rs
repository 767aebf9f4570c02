//! Static cost tables for units and technologies.

use crate::game::resources::ResourceKind;
use crate::game::technology::Technology;
use crate::game::units::{NeuronKind, PotentialKind};

/// Anything a player can spend resources on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchase {
    Neuron(NeuronKind),
    Potential(PotentialKind),
    Technology(Technology),
}

use ResourceKind::*;

/// Base cost of a purchase. Technology costs scale linearly with the level
/// already researched; that scaling is applied by the caller.
pub fn cost_of(purchase: Purchase) -> &'static [(ResourceKind, f64)] {
    match purchase {
        Purchase::Neuron(NeuronKind::Nucleus) => &[
            (Iron, 1.0),
            (Oxygen, 30.0),
            (Potassium, 30.0),
            (Chloride, 30.0),
            (Glutamate, 30.0),
            (Dopamine, 30.0),
            (Serotonin, 30.0),
        ],
        Purchase::Neuron(NeuronKind::ActivatedNeuron) => &[(Oxygen, 8.9), (Glutamate, 19.1)],
        Purchase::Neuron(NeuronKind::Synapse) => &[(Oxygen, 13.4), (Potassium, 6.6)],
        // Resource neurons come with the map, they are never bought.
        Purchase::Neuron(NeuronKind::ResourceNeuron) => &[],
        Purchase::Potential(PotentialKind::Epsp) => &[(Potassium, 4.4)],
        Purchase::Potential(PotentialKind::Ipsp) => &[(Potassium, 3.4), (Chloride, 6.8)],
        Purchase::Technology(Technology::Way) => &[(Iron, 1.0), (Dopamine, 17.7)],
        Purchase::Technology(Technology::Swarm) => &[(Iron, 1.0), (Dopamine, 19.9)],
        Purchase::Technology(Technology::Target) => &[(Iron, 1.0), (Dopamine, 16.5)],
        Purchase::Technology(Technology::TotalResource) => {
            &[(Iron, 1.0), (Dopamine, 18.5), (Serotonin, 17.9)]
        }
        Purchase::Technology(Technology::Curve) => {
            &[(Iron, 1.0), (Dopamine, 21.0), (Serotonin, 21.2)]
        }
        Purchase::Technology(Technology::AtkPotential) => {
            &[(Iron, 1.0), (Potassium, 10.0), (Dopamine, 16.0), (Serotonin, 11.2)]
        }
        Purchase::Technology(Technology::AtkSpeed) => {
            &[(Iron, 1.0), (Potassium, 10.0), (Dopamine, 19.0), (Serotonin, 13.2)]
        }
        Purchase::Technology(Technology::AtkDuration) => {
            &[(Iron, 1.0), (Potassium, 10.0), (Dopamine, 17.5), (Serotonin, 12.2)]
        }
        Purchase::Technology(Technology::DefPotential) => {
            &[(Iron, 1.0), (Glutamate, 15.9), (Dopamine, 14.5), (Serotonin, 17.6)]
        }
        Purchase::Technology(Technology::DefSpeed) => {
            &[(Iron, 1.0), (Glutamate, 15.8), (Dopamine, 16.5), (Serotonin, 6.6)]
        }
        Purchase::Technology(Technology::NucleusRange) => {
            &[(Iron, 1.0), (Oxygen, 10.0), (Dopamine, 13.5), (Serotonin, 17.9)]
        }
    }
}

/// Cost of a purchase with the technology level scaling applied.
pub fn scaled_cost(purchase: Purchase, tech_level: u32) -> Vec<(ResourceKind, f64)> {
    let factor = match purchase {
        Purchase::Technology(_) => (tech_level + 1) as f64,
        _ => 1.0,
    };
    cost_of(purchase)
        .iter()
        .map(|&(kind, amount)| (kind, amount * factor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_technology_costs_iron() {
        for tech in Technology::ALL {
            let costs = cost_of(Purchase::Technology(tech));
            assert!(
                costs.iter().any(|&(kind, amount)| kind == Iron && amount > 0.0),
                "{:?} should consume iron",
                tech
            );
        }
    }

    #[test]
    fn test_tech_cost_scales_with_level() {
        let base = scaled_cost(Purchase::Technology(Technology::Way), 0);
        let next = scaled_cost(Purchase::Technology(Technology::Way), 1);
        for (b, n) in base.iter().zip(&next) {
            assert_eq!(b.1 * 2.0, n.1);
        }
    }

    #[test]
    fn test_unit_cost_does_not_scale() {
        let epsp = scaled_cost(Purchase::Potential(PotentialKind::Epsp), 3);
        assert_eq!(epsp, vec![(Potassium, 4.4)]);
    }
}
