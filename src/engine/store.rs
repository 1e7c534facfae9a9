use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::Engine;

/// Write guards held for one event, keyed (and therefore acquired) in id order.
pub(super) type RoomGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<RoomState>>;

/// Which rooms an event mutates. `None` means every room (cascading deletes).
pub(super) fn rooms_touched_by(event: &Event) -> Option<Vec<Ulid>> {
    match event {
        Event::UserDeleted { .. } | Event::CourseDeleted { .. } => None,
        Event::RoomUpdated { room } => Some(vec![room.id]),
        Event::RoomDeleted { id } => Some(vec![*id]),
        Event::ReservationCreated { reservation } => Some(vec![reservation.room]),
        Event::ReservationUpdated {
            reservation,
            previous_room,
        } => {
            let mut ids = vec![*previous_room, reservation.room];
            ids.sort();
            ids.dedup();
            Some(ids)
        }
        Event::ReservationDeleted { room_id, .. } => Some(vec![*room_id]),
        Event::UserCreated { .. }
        | Event::UserUpdated { .. }
        | Event::CourseCreated { .. }
        | Event::CourseUpdated { .. }
        | Event::RoomCreated { .. } => Some(Vec::new()),
    }
}

impl Engine {
    /// Apply a committed event. The caller holds the write guard of every room
    /// `rooms_touched_by` names; rooms missing from `guards` are skipped.
    pub(super) fn apply(&self, event: &Event, guards: &mut RoomGuards) {
        match event {
            Event::UserCreated { user } | Event::UserUpdated { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                for mut course in self.courses.iter_mut() {
                    if course.professor == Some(*id) {
                        course.professor = None;
                    }
                }
                for (room_id, guard) in guards.iter_mut() {
                    if guard.room.professor == *id {
                        self.retire_room(*room_id, guard);
                    } else {
                        self.drop_reservations(guard, |r| r.professor == *id);
                    }
                }
            }
            Event::CourseCreated { course } | Event::CourseUpdated { course } => {
                self.courses.insert(course.id, course.clone());
            }
            Event::CourseDeleted { id } => {
                self.courses.remove(id);
                for guard in guards.values_mut() {
                    self.drop_reservations(guard, |r| r.course == *id);
                }
            }
            Event::RoomCreated { room } => {
                let state = RoomState::new(room.clone());
                self.rooms.insert(room.id, Arc::new(RwLock::new(state)));
            }
            Event::RoomUpdated { room } => {
                if let Some(guard) = guards.get_mut(&room.id) {
                    guard.room = room.clone();
                }
            }
            Event::RoomDeleted { id } => {
                if let Some(guard) = guards.get_mut(id) {
                    self.retire_room(*id, guard);
                }
            }
            Event::ReservationCreated { reservation } => {
                if let Some(guard) = guards.get_mut(&reservation.room) {
                    guard.insert_reservation(reservation.clone());
                    self.reservation_to_room.insert(reservation.id, reservation.room);
                }
            }
            Event::ReservationUpdated {
                reservation,
                previous_room,
            } => {
                if let Some(guard) = guards.get_mut(previous_room) {
                    guard.remove_reservation(reservation.id);
                }
                if let Some(guard) = guards.get_mut(&reservation.room) {
                    guard.insert_reservation(reservation.clone());
                    self.reservation_to_room.insert(reservation.id, reservation.room);
                }
            }
            Event::ReservationDeleted { id, room_id } => {
                if let Some(guard) = guards.get_mut(room_id) {
                    guard.remove_reservation(*id);
                }
                self.reservation_to_room.remove(id);
            }
        }
    }

    /// Remove a room and everything reserved against it. Anyone already queued
    /// on the lock sees `removed` once they get in.
    fn retire_room(&self, room_id: Ulid, guard: &mut RoomState) {
        for r in guard.reservations.drain(..) {
            self.reservation_to_room.remove(&r.id);
        }
        guard.removed = true;
        self.rooms.remove(&room_id);
    }

    fn drop_reservations(&self, guard: &mut RoomState, doomed: impl Fn(&Reservation) -> bool) {
        let mapping = &self.reservation_to_room;
        guard.reservations.retain(|r| {
            let keep = !doomed(r);
            if !keep {
                mapping.remove(&r.id);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(room: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            start: 0,
            end: 1,
            period: Period::Afternoon,
            room,
            professor: Ulid::new(),
            course: Ulid::new(),
        }
    }

    #[test]
    fn moving_reservation_touches_both_rooms_in_order() {
        let a = Ulid::new();
        let b = Ulid::new();
        let mut r = reservation(b);
        r.room = a;
        let event = Event::ReservationUpdated {
            reservation: r,
            previous_room: b,
        };
        let touched = rooms_touched_by(&event).unwrap_or_default();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(touched, expected);
    }

    #[test]
    fn same_room_update_touches_one_room() {
        let a = Ulid::new();
        let event = Event::ReservationUpdated {
            reservation: reservation(a),
            previous_room: a,
        };
        assert_eq!(rooms_touched_by(&event), Some(vec![a]));
    }

    #[test]
    fn cascading_deletes_touch_everything() {
        assert_eq!(rooms_touched_by(&Event::UserDeleted { id: Ulid::new() }), None);
        assert_eq!(rooms_touched_by(&Event::CourseDeleted { id: Ulid::new() }), None);
        let room = Room {
            id: Ulid::new(),
            name: "B12".into(),
            capacity: 10,
            professor: Ulid::new(),
            period: None,
        };
        assert_eq!(rooms_touched_by(&Event::RoomCreated { room }), Some(Vec::new()));
    }
}
