use ulid::Ulid;

use crate::model::{BookingInterval, Span};

/// Read access to a set of booking intervals, as seen by the overlap checker.
pub trait BookingSchedule {
    /// Intervals whose span intersects `query`. Order is unspecified.
    fn overlapping<'a>(&'a self, query: &Span) -> Box<dyn Iterator<Item = &'a BookingInterval> + 'a>;
}

/// A plain slice is a schedule too: a full linear scan.
impl BookingSchedule for [BookingInterval] {
    fn overlapping<'a>(&'a self, query: &Span) -> Box<dyn Iterator<Item = &'a BookingInterval> + 'a> {
        let query = *query;
        Box::new(self.iter().filter(move |b| b.span.overlaps(&query)))
    }
}

impl BookingSchedule for Vec<BookingInterval> {
    fn overlapping<'a>(&'a self, query: &Span) -> Box<dyn Iterator<Item = &'a BookingInterval> + 'a> {
        self.as_slice().overlapping(query)
    }
}

/// The engine's booking store: intervals of every booking that occupies time,
/// sorted by `span.start`.
#[derive(Debug, Default)]
pub struct ScheduleIndex {
    intervals: Vec<BookingInterval>,
}

impl ScheduleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &BookingInterval> {
        self.intervals.iter()
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, interval: BookingInterval) {
        let pos = self
            .intervals
            .partition_point(|i| i.span.start <= interval.span.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BookingInterval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Replace (or drop, with `None`) the interval stored under `id`.
    pub fn replace(&mut self, id: Ulid, interval: Option<BookingInterval>) {
        self.remove(id);
        if let Some(i) = interval {
            self.insert(i);
        }
    }
}

impl BookingSchedule for ScheduleIndex {
    /// Everything starting at or after `query.end` is skipped by binary search;
    /// the prefix is filtered on `end > query.start`.
    fn overlapping<'a>(&'a self, query: &Span) -> Box<dyn Iterator<Item = &'a BookingInterval> + 'a> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        let start = query.start;
        Box::new(
            self.intervals[..right_bound]
                .iter()
                .filter(move |i| i.span.end > start),
        )
    }
}
