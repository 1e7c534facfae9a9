//! Conflict validation: pure predicates over a consistent read of the store.
//!
//! Nothing here locks. Callers hold the room guard (reservations) or the
//! professor's ownership lock (room assignment) while calling in and until
//! the resulting event is committed.

use ulid::Ulid;

use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

/// Reject assigning `professor` to a room when any *other* room already has them.
/// `excluding` is the room's own id on update.
pub fn validate_room_assignment<'a>(
    rooms: impl IntoIterator<Item = &'a Room>,
    professor: Ulid,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    for room in rooms {
        if Some(room.id) == excluding {
            continue;
        }
        if room.professor == professor {
            return Err(EngineError::Conflict(ConflictReason::ProfessorOwnsRoom {
                professor,
                room: room.id,
            }));
        }
    }
    Ok(())
}

/// Reject an empty/inverted interval, then any half-open overlap with another
/// reservation of the same room. `excluding` is the reservation's own id on update.
pub fn validate_reservation<'a>(
    existing: impl IntoIterator<Item = &'a Reservation>,
    candidate: &Reservation,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    if candidate.end <= candidate.start {
        return Err(EngineError::InvalidInterval);
    }
    let span = candidate.span();
    for other in existing {
        if other.room != candidate.room || Some(other.id) == excluding {
            continue;
        }
        if other.span().overlaps(&span) {
            return Err(EngineError::Conflict(ConflictReason::RoomReserved {
                room: candidate.room,
                reservation: other.id,
            }));
        }
    }
    Ok(())
}

/// Range checks that keep timestamps sane. Runs after the interval check.
pub(crate) fn validate_window(candidate: &Reservation) -> Result<(), EngineError> {
    use crate::limits::*;
    if candidate.start < MIN_VALID_TIMESTAMP_MS || candidate.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if candidate.end - candidate.start > MAX_RESERVATION_SPAN_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}
