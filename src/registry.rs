//! Single-writer ownership of actuators.
//!
//! Every actuator belongs to exactly one loop for the lifetime of the
//! controller. Emergency shutdown actuators belong to the safety monitor.

use crate::config::EngineConfig;
use crate::error::{ControlError, ControlResult};
use crate::hal::ActuatorId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LoopId {
    Throttle,
    Sequencer,
    SafetyMonitor,
}

impl LoopId {
    pub fn name(self) -> &'static str {
        match self {
            LoopId::Throttle => "throttle",
            LoopId::Sequencer => "sequencer",
            LoopId::SafetyMonitor => "safety-monitor",
        }
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ActuatorRegistry {
    owners: BTreeMap<ActuatorId, LoopId>,
    emergency: BTreeSet<ActuatorId>,
}

impl ActuatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ownership table implied by a full engine configuration.
    pub fn from_config(config: &EngineConfig) -> ControlResult<Self> {
        let mut registry = Self::new();
        registry.assign(config.throttle.throttle_actuator, LoopId::Throttle)?;

        let sequencer_actuators: BTreeSet<ActuatorId> = config
            .sequencer
            .phases
            .iter()
            .flat_map(|p| p.entry_actions.iter())
            .chain(config.sequencer.abort_actions.iter())
            .map(|s| s.actuator)
            .collect();
        for actuator in sequencer_actuators {
            registry.assign(actuator, LoopId::Sequencer)?;
        }

        for &actuator in &config.monitor.shutdown_actuators {
            registry.assign(actuator, LoopId::SafetyMonitor)?;
            registry.mark_emergency(actuator)?;
        }
        Ok(registry)
    }

    pub fn assign(&mut self, actuator: ActuatorId, owner: LoopId) -> ControlResult<()> {
        if let Some(&existing) = self.owners.get(&actuator) {
            return Err(ControlError::OwnershipViolation {
                actuator,
                owner: existing.to_string(),
                requester: owner.to_string(),
            });
        }
        self.owners.insert(actuator, owner);
        Ok(())
    }

    /// Emergency actuators must already belong to the safety monitor.
    pub fn mark_emergency(&mut self, actuator: ActuatorId) -> ControlResult<()> {
        self.check(actuator, LoopId::SafetyMonitor)?;
        self.emergency.insert(actuator);
        Ok(())
    }

    pub fn owner(&self, actuator: ActuatorId) -> Option<LoopId> {
        self.owners.get(&actuator).copied()
    }

    pub fn is_emergency(&self, actuator: ActuatorId) -> bool {
        self.emergency.contains(&actuator)
    }

    pub fn owned_by(&self, owner: LoopId) -> impl Iterator<Item = ActuatorId> + '_ {
        self.owners.iter().filter(move |(_, o)| **o == owner).map(|(a, _)| *a)
    }

    pub fn check(&self, actuator: ActuatorId, requester: LoopId) -> ControlResult<()> {
        match self.owner(actuator) {
            Some(owner) if owner == requester => Ok(()),
            Some(owner) => Err(ControlError::OwnershipViolation {
                actuator,
                owner: owner.to_string(),
                requester: requester.to_string(),
            }),
            None => Err(ControlError::OwnershipViolation {
                actuator,
                owner: "nobody".to_string(),
                requester: requester.to_string(),
            }),
        }
    }

    /// Verify that `requester` was wired exactly the actuators it owns.
    pub fn check_wiring(&self, requester: LoopId, wired: impl IntoIterator<Item = ActuatorId>) -> ControlResult<()> {
        let wired: BTreeSet<ActuatorId> = wired.into_iter().collect();
        for &actuator in &wired {
            self.check(actuator, requester)?;
        }
        if let Some(missing) = self.owned_by(requester).find(|a| !wired.contains(a)) {
            return Err(ControlError::InvalidConfig(format!("{requester} owns {missing} but it is not wired")));
        }
        Ok(())
    }
}
