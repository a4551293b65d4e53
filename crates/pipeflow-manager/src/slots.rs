//! Worker slots as seen by the Manager.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use pipeflow_core::{Rank, RunId, SlotStatus, UnitId};

/// A unit handed to a worker and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub run_id: RunId,
    pub unit_id: UnitId,
}

/// Manager-side record of one worker rank.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub rank: Rank,
    pub status: SlotStatus,

    /// At most one unit per slot.
    pub assignment: Option<Assignment>,

    /// Last hello or heartbeat, or when the Manager started waiting.
    pub last_seen: Instant,

    /// Reported in the worker's hello.
    pub hostname: Option<String>,
}

/// All worker slots of the cluster, keyed by rank.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: BTreeMap<Rank, WorkerSlot>,
}

impl SlotTable {
    /// One Connecting slot for every worker rank of a cluster of `size`.
    pub fn new(size: usize, now: Instant) -> Self {
        let slots = Rank::workers(size)
            .map(|rank| {
                let slot = WorkerSlot {
                    rank,
                    status: SlotStatus::Connecting,
                    assignment: None,
                    last_seen: now,
                    hostname: None,
                };
                (rank, slot)
            })
            .collect();
        Self { slots }
    }

    pub fn get(&self, rank: Rank) -> Option<&WorkerSlot> {
        self.slots.get(&rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    /// A worker (re)joined. Returns the unit it held before, which the
    /// restarted worker no longer knows about.
    pub fn hello(&mut self, rank: Rank, hostname: String, now: Instant) -> Option<Assignment> {
        let slot = self.slots.get_mut(&rank)?;
        slot.status = SlotStatus::Idle;
        slot.last_seen = now;
        slot.hostname = Some(hostname);
        slot.assignment.take()
    }

    /// Refresh liveness. Heartbeats from dead or unknown ranks are ignored.
    pub fn heartbeat(&mut self, rank: Rank, now: Instant) -> bool {
        match self.slots.get_mut(&rank) {
            Some(slot) if slot.status.is_live() => {
                slot.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Idle ranks, lowest first.
    pub fn idle(&self) -> Vec<Rank> {
        self.slots
            .values()
            .filter(|s| s.status == SlotStatus::Idle)
            .map(|s| s.rank)
            .collect()
    }

    pub fn assign(&mut self, rank: Rank, assignment: Assignment) {
        if let Some(slot) = self.slots.get_mut(&rank) {
            slot.status = SlotStatus::Busy;
            slot.assignment = Some(assignment);
        }
    }

    /// Whether the worker at `rank` currently holds `unit_id` of `run_id`.
    pub fn holds(&self, rank: Rank, run_id: &RunId, unit_id: &UnitId) -> bool {
        self.slots
            .get(&rank)
            .and_then(|s| s.assignment.as_ref())
            .is_some_and(|a| &a.run_id == run_id && &a.unit_id == unit_id)
    }

    /// Free the slot after the worker reported on its unit.
    pub fn release(&mut self, rank: Rank) -> Option<Assignment> {
        let slot = self.slots.get_mut(&rank)?;
        let assignment = slot.assignment.take();
        if slot.status == SlotStatus::Busy {
            slot.status = SlotStatus::Idle;
        }
        assignment
    }

    /// Ranks holding a unit of `run_id`.
    pub fn holders_of(&self, run_id: &RunId) -> Vec<Rank> {
        self.slots
            .values()
            .filter(|s| s.assignment.as_ref().is_some_and(|a| &a.run_id == run_id))
            .map(|s| s.rank)
            .collect()
    }

    /// Declare the worker dead. Returns the unit it was holding.
    pub fn mark_dead(&mut self, rank: Rank) -> Option<Assignment> {
        let slot = self.slots.get_mut(&rank)?;
        slot.status = SlotStatus::Dead;
        slot.assignment.take()
    }

    /// Declare dead every slot silent for longer than `timeout`, including
    /// slots that never said hello.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(Rank, Option<Assignment>)> {
        let expired: Vec<Rank> = self
            .slots
            .values()
            .filter(|s| s.status != SlotStatus::Dead && now.duration_since(s.last_seen) > timeout)
            .map(|s| s.rank)
            .collect();
        expired
            .into_iter()
            .map(|rank| (rank, self.mark_dead(rank)))
            .collect()
    }

    /// Whether any slot may still take work now or later.
    pub fn has_prospects(&self) -> bool {
        self.slots.values().any(|s| s.status != SlotStatus::Dead)
    }

    /// Number of slots in each status.
    pub fn count(&self, status: SlotStatus) -> usize {
        self.slots.values().filter(|s| s.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(unit: &str) -> Assignment {
        Assignment {
            run_id: RunId::new("r1"),
            unit_id: UnitId::new(unit),
        }
    }

    #[test]
    fn test_slots_start_connecting() {
        let table = SlotTable::new(3, Instant::now());
        assert_eq!(table.count(SlotStatus::Connecting), 2);
        assert!(table.get(Rank::MANAGER).is_none());
        assert!(table.idle().is_empty());
    }

    #[test]
    fn test_assign_and_release() {
        let now = Instant::now();
        let mut table = SlotTable::new(3, now);
        table.hello(Rank::new(2), "b".into(), now);
        table.hello(Rank::new(1), "a".into(), now);
        assert_eq!(table.idle(), vec![Rank::new(1), Rank::new(2)]);

        table.assign(Rank::new(1), assignment("r1/a"));
        assert!(table.holds(Rank::new(1), &RunId::new("r1"), &UnitId::new("r1/a")));
        assert_eq!(table.idle(), vec![Rank::new(2)]);
        assert_eq!(table.holders_of(&RunId::new("r1")), vec![Rank::new(1)]);

        assert_eq!(table.release(Rank::new(1)), Some(assignment("r1/a")));
        assert_eq!(table.idle(), vec![Rank::new(1), Rank::new(2)]);
        assert!(table.holders_of(&RunId::new("r1")).is_empty());
    }

    #[test]
    fn test_holds_matches_run_and_unit() {
        let now = Instant::now();
        let mut table = SlotTable::new(2, now);
        table.hello(Rank::new(1), "a".into(), now);
        // Run "a/b" step "c" and run "a" step "b/c" share the unit id "a/b/c".
        table.assign(
            Rank::new(1),
            Assignment {
                run_id: RunId::new("a/b"),
                unit_id: UnitId::new("a/b/c"),
            },
        );

        assert!(table.holds(Rank::new(1), &RunId::new("a/b"), &UnitId::new("a/b/c")));
        assert!(!table.holds(Rank::new(1), &RunId::new("a"), &UnitId::new("a/b/c")));
    }

    #[test]
    fn test_expire_and_revive() {
        let start = Instant::now();
        let mut table = SlotTable::new(3, start);
        table.hello(Rank::new(1), "a".into(), start);
        table.hello(Rank::new(2), "b".into(), start);
        table.assign(Rank::new(1), assignment("r1/a"));

        let later = start + Duration::from_secs(10);
        assert!(table.heartbeat(Rank::new(2), later));

        let expired = table.expire(start + Duration::from_secs(46), Duration::from_secs(45));
        assert_eq!(expired, vec![(Rank::new(1), Some(assignment("r1/a")))]);
        assert_eq!(table.get(Rank::new(1)).unwrap().status, SlotStatus::Dead);
        assert!(!table.heartbeat(Rank::new(1), later));
        assert!(table.has_prospects());

        assert_eq!(table.hello(Rank::new(1), "a".into(), later), None);
        assert_eq!(table.get(Rank::new(1)).unwrap().status, SlotStatus::Idle);
    }

    #[test]
    fn test_silent_slots_expire() {
        let start = Instant::now();
        let mut table = SlotTable::new(2, start);
        let expired = table.expire(start + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(expired, vec![(Rank::new(1), None)]);
        assert!(!table.has_prospects());
    }

    #[test]
    fn test_hello_returns_forgotten_assignment() {
        let now = Instant::now();
        let mut table = SlotTable::new(2, now);
        table.hello(Rank::new(1), "a".into(), now);
        table.assign(Rank::new(1), assignment("r1/a"));
        assert_eq!(table.hello(Rank::new(1), "a".into(), now), Some(assignment("r1/a")));
        assert_eq!(table.get(Rank::new(1)).unwrap().status, SlotStatus::Idle);
    }
}
