//! Machine maintenance state.
//!
//! A machine is a host that may run several agents. Operators schedule
//! unavailability windows against machines; the master deactivates
//! agents when their machine goes down and re-activates them when it
//! comes back up.

use crate::ids::MachineId;
use crate::messages::Unavailability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maintenance mode of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceMode {
    /// Normal operation.
    Up,
    /// An unavailability window is scheduled; frameworks receive inverse
    /// offers but the machine still runs tasks.
    Draining,
    /// The operator took the machine down; its agents are deactivated.
    Down,
}

impl fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceMode::Up => write!(f, "UP"),
            MaintenanceMode::Draining => write!(f, "DRAINING"),
            MaintenanceMode::Down => write!(f, "DOWN"),
        }
    }
}

/// One machine's maintenance state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub mode: MaintenanceMode,
    pub unavailability: Option<Unavailability>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            mode: MaintenanceMode::Up,
            unavailability: None,
        }
    }
}

/// One entry of a maintenance schedule: a set of machines sharing an
/// unavailability window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub machines: Vec<MachineId>,
    pub unavailability: Unavailability,
}

/// The maintenance schedule, as given by the operator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub windows: Vec<ScheduleWindow>,
}

impl Schedule {
    /// A machine may appear at most once across all windows.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for window in &self.windows {
            for machine in &window.machines {
                if !seen.insert(machine) {
                    return Err(format!("machine {} appears in multiple windows", machine));
                }
            }
        }
        Ok(())
    }
}

/// Maintenance state for all known machines.
#[derive(Clone, Debug, Default)]
pub struct Maintenance {
    pub schedule: Schedule,
    pub machines: HashMap<MachineId, Machine>,
}

impl Maintenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self, machine_id: &MachineId) -> MaintenanceMode {
        self.machines
            .get(machine_id)
            .map(|machine| machine.mode)
            .unwrap_or(MaintenanceMode::Up)
    }

    pub fn unavailability(&self, machine_id: &MachineId) -> Option<Unavailability> {
        self.machines
            .get(machine_id)
            .and_then(|machine| machine.unavailability)
    }

    /// Install a new schedule. Machines entering a window start
    /// draining; machines leaving the schedule go back up, unless they
    /// are already down (the operator must bring those up explicitly).
    /// Returns machines whose unavailability changed.
    pub fn apply_schedule(&mut self, schedule: Schedule) -> Result<Vec<MachineId>, String> {
        schedule.validate()?;

        let mut changed = Vec::new();

        let mut scheduled: HashMap<MachineId, Unavailability> = HashMap::new();
        for window in &schedule.windows {
            for machine_id in &window.machines {
                scheduled.insert(machine_id.clone(), window.unavailability);
            }
        }

        // Machines dropped from the schedule.
        let known: Vec<MachineId> = self.machines.keys().cloned().collect();
        for machine_id in known {
            if !scheduled.contains_key(&machine_id) {
                let machine = self
                    .machines
                    .get_mut(&machine_id)
                    .expect("iterating known machines");
                if machine.mode == MaintenanceMode::Draining {
                    machine.mode = MaintenanceMode::Up;
                    machine.unavailability = None;
                    changed.push(machine_id);
                }
            }
        }

        // Machines entering or moving within the schedule.
        for (machine_id, unavailability) in scheduled {
            let machine = self.machines.entry(machine_id.clone()).or_default();
            if machine.mode == MaintenanceMode::Down {
                // A down machine keeps its window; the schedule change
                // takes effect when it comes back up.
                continue;
            }
            if machine.unavailability != Some(unavailability) {
                machine.mode = MaintenanceMode::Draining;
                machine.unavailability = Some(unavailability);
                changed.push(machine_id);
            }
        }

        self.schedule = schedule;
        Ok(changed)
    }

    /// Operator takes a machine down. Only draining machines may go
    /// down.
    pub fn machine_down(&mut self, machine_id: &MachineId) -> Result<(), String> {
        let machine = self
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| format!("machine {} is not in the schedule", machine_id))?;

        match machine.mode {
            MaintenanceMode::Draining => {
                machine.mode = MaintenanceMode::Down;
                Ok(())
            }
            MaintenanceMode::Down => Ok(()),
            MaintenanceMode::Up => Err(format!(
                "machine {} must be draining before going down",
                machine_id
            )),
        }
    }

    /// Operator brings a machine back up; it leaves the schedule.
    pub fn machine_up(&mut self, machine_id: &MachineId) -> Result<(), String> {
        let machine = self
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| format!("machine {} is not in the schedule", machine_id))?;

        if machine.mode == MaintenanceMode::Up {
            return Err(format!("machine {} is already up", machine_id));
        }

        machine.mode = MaintenanceMode::Up;
        machine.unavailability = None;
        for window in &mut self.schedule.windows {
            window.machines.retain(|id| id != machine_id);
        }
        self.schedule.windows.retain(|window| !window.machines.is_empty());
        Ok(())
    }
}
