use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_span};
use super::{Engine, EngineError};

/// Rows of one table, optionally narrowed to a single id, in id order.
pub(super) fn select_rows<T: Clone>(map: &DashMap<Ulid, T>, id: Option<Ulid>) -> Vec<T> {
    if let Some(id) = id {
        return map.get(&id).map(|e| e.value().clone()).into_iter().collect();
    }
    let mut rows: Vec<(Ulid, T)> = map
        .iter()
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, row)| row).collect()
}

impl Engine {
    pub fn list_users(&self, id: Option<Ulid>) -> Vec<User> {
        select_rows(&self.users, id)
    }

    pub fn list_services(&self, id: Option<Ulid>) -> Vec<Service> {
        select_rows(&self.services, id)
    }

    pub fn list_staff(&self, id: Option<Ulid>) -> Vec<StaffMember> {
        select_rows(&self.staff, id)
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.read().await.rows.get(id).cloned()
    }

    /// Bookings matching every set field of `filter`, ordered by start time.
    /// The time window keeps bookings that overlap `[from, to)`; either end
    /// may be open.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from >= to {
                return Err(EngineError::InvalidSpan { start: from, end: to });
            }
            if to - from > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }

        let book = self.bookings.read().await;
        let mut rows: Vec<Booking> = match filter.id {
            Some(id) => book.rows.get(&id).cloned().into_iter().collect(),
            None => book.rows.values().cloned().collect(),
        };
        drop(book);

        rows.retain(|b| {
            filter.staff_id.is_none_or(|s| b.staff_id == Some(s))
                && filter.service_id.is_none_or(|s| b.service_id == s)
                && filter.status.is_none_or(|s| b.status == s)
                && filter.from.is_none_or(|from| b.span.end > from)
                && filter.to.is_none_or(|to| b.span.start < to)
        });
        rows.sort_by_key(|b| (b.span.start, b.id));
        Ok(rows)
    }

    /// Read-only overlap check: the first booking that would block
    /// `[start, end)`, ignoring `exclude`.
    pub async fn check_conflict(
        &self,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, EngineError> {
        let span = validate_span(start, end)?;
        let book = self.bookings.read().await;
        Ok(find_conflict(book.schedule(), &span, exclude))
    }

    /// Number of bookings currently occupying the schedule.
    pub async fn active_booking_count(&self) -> usize {
        self.bookings.read().await.schedule.len()
    }
}
