//! Researchable technologies and their level caps.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Technology {
    /// Way-points per synapse.
    Way,
    /// Swarm attacks and their size.
    Swarm,
    /// Choosing epsp/ipsp targets per synapse.
    Target,
    /// Raises resource limits by 10% per level.
    TotalResource,
    /// Lowers the resource gain slowdown.
    Curve,
    /// Epsp/ipsp strength.
    AtkPotential,
    /// Epsp/ipsp speed.
    AtkSpeed,
    /// Ipsp block duration.
    AtkDuration,
    /// Activated-neuron interception strength.
    DefPotential,
    /// Activated-neuron cooldown.
    DefSpeed,
    /// Build range around the nucleus.
    NucleusRange,
}

impl Technology {
    pub const ALL: [Technology; 11] = [
        Technology::Way,
        Technology::Swarm,
        Technology::Target,
        Technology::TotalResource,
        Technology::Curve,
        Technology::AtkPotential,
        Technology::AtkSpeed,
        Technology::AtkDuration,
        Technology::DefPotential,
        Technology::DefSpeed,
        Technology::NucleusRange,
    ];

    /// Maximum researchable level.
    pub fn cap(self) -> u32 {
        match self {
            Technology::Way | Technology::Swarm => 3,
            Technology::Target => 2,
            Technology::TotalResource => 3,
            Technology::Curve => 2,
            Technology::AtkPotential
            | Technology::AtkSpeed
            | Technology::AtkDuration
            | Technology::DefPotential
            | Technology::DefSpeed
            | Technology::NucleusRange => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Technology::Way => "choose way",
            Technology::Swarm => "swarm attack",
            Technology::Target => "choose target",
            Technology::TotalResource => "resource limits++",
            Technology::Curve => "resource slowdown--",
            Technology::AtkPotential => "epsp/ipsp potential++",
            Technology::AtkSpeed => "epsp/ipsp speed++",
            Technology::AtkDuration => "ipsp duration++",
            Technology::DefPotential => "activated-neuron potential++",
            Technology::DefSpeed => "activated-neuron cooldown++",
            Technology::NucleusRange => "range of nucleus++",
        }
    }
}
