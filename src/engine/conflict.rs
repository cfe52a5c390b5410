use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::schedule::BookingSchedule;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// First stored interval that intersects `candidate`, ignoring `exclude`.
pub fn find_conflict<S>(schedule: &S, candidate: &Span, exclude: Option<Ulid>) -> Option<Ulid>
where
    S: BookingSchedule + ?Sized,
{
    schedule
        .overlapping(candidate)
        .find(|b| Some(b.id) != exclude && b.span.overlaps(candidate))
        .map(|b| b.id)
}

/// True means the write must be rejected.
pub fn has_conflict<S>(schedule: &S, candidate: &Span, exclude: Option<Ulid>) -> bool
where
    S: BookingSchedule + ?Sized,
{
    find_conflict(schedule, candidate, exclude).is_some()
}

/// Turn raw client timestamps into a span the checker can trust.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Pairwise check inside one batch. Returns the id of the later draft of the
/// first overlapping pair.
pub(crate) fn find_batch_conflict(batch: &[BookingInterval]) -> Option<Ulid> {
    for (i, a) in batch.iter().enumerate() {
        if let Some(b) = batch[i + 1..].iter().find(|b| a.span.overlaps(&b.span)) {
            return Some(b.id);
        }
    }
    None
}
