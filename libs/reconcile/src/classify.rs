//! The join between the fleet provider's view and the coordinator's view.
//!
//! A machine exists as soon as the provider returns its id, but the
//! coordinator only learns about it once the machine has booted and
//! registered. The join is keyed by instance id (runner names are the
//! instance id behind an optional prefix) and yields one of three states:
//! registered, still booting, or orphaned.

use chrono::{DateTime, Duration, Utc};
use fleet_events::RunnerType;

/// A machine as reported by the fleet provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    pub instance_id: String,

    /// `None` when the provider did not report one.
    pub launch_time: Option<DateTime<Utc>>,

    /// Owner tag: organization, or `owner/repo`.
    pub owner: String,

    pub runner_type: RunnerType,

    /// Set by the scale-down pass once the machine is found unregistered
    /// past its boot allowance.
    pub orphan: bool,

    pub environment: String,

    /// Coordinator runner id recorded when a JIT config was issued.
    pub runner_id: Option<u64>,
}

impl MachineRecord {
    /// True when the machine was launched more than `allowance` ago.
    ///
    /// Unknown launch times never exceed anything, and neither does an
    /// allowance reaching past the representable range.
    pub fn running_longer_than(&self, allowance: Duration, now: DateTime<Utc>) -> bool {
        self.launch_time
            .and_then(|launched| launched.checked_add_signed(allowance))
            .is_some_and(|deadline| deadline < now)
    }
}

/// Registration status reported by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Online,
    Offline,
}

/// A runner registration as reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
    pub busy: bool,
    pub status: RunnerStatus,
}

impl RegisteredRunner {
    /// True when the registration belongs to `instance_id`.
    pub fn belongs_to(&self, instance_id: &str, name_prefix: &str) -> bool {
        self.name.strip_prefix(name_prefix) == Some(instance_id)
    }

    pub fn is_idle(&self) -> bool {
        !self.busy && self.status == RunnerStatus::Online
    }
}

/// Where a machine stands relative to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineClass {
    /// At least one registration matches. `idle` holds when every matching
    /// registration is online and not busy.
    Registered { runner_ids: Vec<u64>, idle: bool },

    /// No registration yet, still within the boot allowance.
    Booting,

    /// No registration and the boot allowance has passed.
    Orphan,
}

/// Classifies one machine against the owner's registrations.
pub fn classify_machine(
    machine: &MachineRecord,
    runners: &[RegisteredRunner],
    name_prefix: &str,
    boot_allowance: Duration,
    now: DateTime<Utc>,
) -> MachineClass {
    let matching: Vec<&RegisteredRunner> = runners
        .iter()
        .filter(|r| r.belongs_to(&machine.instance_id, name_prefix))
        .collect();

    if !matching.is_empty() {
        return MachineClass::Registered {
            runner_ids: matching.iter().map(|r| r.id).collect(),
            idle: matching.iter().all(|r| r.is_idle()),
        };
    }

    if machine.running_longer_than(boot_allowance, now) {
        MachineClass::Orphan
    } else {
        MachineClass::Booting
    }
}

/// Classifies every machine against one set of registrations.
pub fn join_views(
    machines: Vec<MachineRecord>,
    runners: &[RegisteredRunner],
    name_prefix: &str,
    boot_allowance: Duration,
    now: DateTime<Utc>,
) -> Vec<(MachineRecord, MachineClass)> {
    machines
        .into_iter()
        .map(|machine| {
            let class = classify_machine(&machine, runners, name_prefix, boot_allowance, now);
            (machine, class)
        })
        .collect()
}

/// Counts machines that can take a job now or soon: registered and idle, or
/// still booting.
pub fn pool_idle_count<'a, I>(classes: I) -> usize
where
    I: IntoIterator<Item = &'a MachineClass>,
{
    classes
        .into_iter()
        .filter(|class| {
            matches!(
                class,
                MachineClass::Registered { idle: true, .. } | MachineClass::Booting
            )
        })
        .count()
}
