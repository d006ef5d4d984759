//! In-memory flight log
//!
//! One record per completed tick, kept in a bounded ring buffer so a long
//! episode never grows memory without limit.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::solver::SolverStatus;

/// What happened on one control tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub tick: u64,
    /// Measured drone position
    pub pos: Vector3<f64>,
    /// Action sent to the vehicle
    pub action: [f64; 4],
    pub reward: f64,
    /// Status of the tick's solve, `None` if no solve ran
    pub status: Option<SolverStatus>,
    pub gates_passed: usize,
    /// Whether the reference was replaced on this tick
    pub replanned: bool,
    /// Distance to the current reference sample [m]
    pub tracking_error: f64,
}

/// Bounded log of recent ticks
#[derive(Debug, Clone, PartialEq)]
pub struct FlightLog {
    records: VecDeque<TickRecord>,
    capacity: usize,
}

impl FlightLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&mut self, record: TickRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&TickRecord> {
        self.records.back()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &TickRecord> {
        self.records.iter()
    }

    /// Number of logged ticks whose solve did not succeed
    pub fn failed_solves(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, Some(s) if !s.is_success()))
            .count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
