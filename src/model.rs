use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Who a user is to the system. Closed set; anything else is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Manager,
    Professor,
}

impl Role {
    /// Single-letter code used on the wire (`G` for gestor, `P` for professor).
    pub fn code(&self) -> &'static str {
        match self {
            Role::Manager => "G",
            Role::Professor => "P",
        }
    }

    /// Accepts both the short codes and the full words, case-insensitively.
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_lowercase().as_str() {
            "g" | "gestor" | "manager" => Some(Role::Manager),
            "p" | "professor" => Some(Role::Professor),
            _ => None,
        }
    }
}

/// Period of the day a room or reservation is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    Morning,
    Afternoon,
    Night,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Morning, Period::Afternoon, Period::Night];

    pub fn code(&self) -> &'static str {
        match self {
            Period::Morning => "M",
            Period::Afternoon => "T",
            Period::Night => "N",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::Morning => "Manhã",
            Period::Afternoon => "Tarde",
            Period::Night => "Noite",
        }
    }

    pub fn parse(s: &str) -> Option<Period> {
        match s.trim().to_lowercase().as_str() {
            "m" | "manha" | "manhã" | "morning" => Some(Period::Morning),
            "t" | "tarde" | "afternoon" => Some(Period::Afternoon),
            "n" | "noite" | "night" => Some(Period::Night),
            _ => None,
        }
    }
}

/// The four kinds of record the store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Course,
    Room,
    Reservation,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::User => "user",
            EntityKind::Course => "course",
            EntityKind::Room => "room",
            EntityKind::Reservation => "reservation",
        };
        f.write_str(name)
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    /// Institutional id, unique per tenant.
    pub ni: u32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    /// `YYYY-MM-DD`
    pub birth_date: Option<String>,
    /// `YYYY-MM-DD`
    pub hire_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: Ulid,
    pub name: String,
    /// Program / institution the course belongs to.
    pub program: String,
    pub description: Option<String>,
    pub workload_hours: u32,
    pub professor: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub professor: Ulid,
    pub period: Option<Period>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub period: Period,
    pub room: Ulid,
    pub professor: Ulid,
    pub course: Ulid,
}

impl Reservation {
    /// Only meaningful once `start < end` has been validated.
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// A room plus every reservation made against it. One lock guards both, so
/// checking for overlap and inserting happen under the same guard.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `start`.
    pub reservations: Vec<Reservation>,
    /// Set when the room is deleted while someone was queued on its lock.
    pub removed: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
            removed: false,
        }
    }

    /// Insert reservation maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.start, |r| r.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps `[start, end)`.
    /// Uses binary search to skip reservations starting at or after `end`.
    pub fn overlapping(&self, start: Ms, end: Ms) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.start < end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end > start)
    }
}

/// The event types. This is the WAL record format.
///
/// Cascades are not written out: `UserDeleted` and `CourseDeleted` are applied
/// deterministically against the state, both live and on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated { user: User },
    UserUpdated { user: User },
    UserDeleted { id: Ulid },
    CourseCreated { course: Course },
    CourseUpdated { course: Course },
    CourseDeleted { id: Ulid },
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    RoomDeleted { id: Ulid },
    ReservationCreated { reservation: Reservation },
    ReservationUpdated {
        reservation: Reservation,
        previous_room: Ulid,
    },
    ReservationDeleted { id: Ulid, room_id: Ulid },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            start,
            end,
            period: Period::Morning,
            room: Ulid::new(),
            professor: Ulid::new(),
            course: Ulid::new(),
        }
    }

    fn room_state() -> RoomState {
        RoomState::new(Room {
            id: Ulid::new(),
            name: "Lab 1".into(),
            capacity: 30,
            professor: Ulid::new(),
            period: None,
        })
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration_ms(), 100);
    }

    #[test]
    fn role_parse_accepts_codes_and_words() {
        assert_eq!(Role::parse("G"), Some(Role::Manager));
        assert_eq!(Role::parse("gestor"), Some(Role::Manager));
        assert_eq!(Role::parse("PROFESSOR"), Some(Role::Professor));
        assert_eq!(Role::parse("p"), Some(Role::Professor));
        assert_eq!(Role::parse("aluno"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn period_codes() {
        for p in Period::ALL {
            assert_eq!(Period::parse(p.code()), Some(p));
        }
        assert_eq!(Period::parse("Noite"), Some(Period::Night));
        assert_eq!(Period::parse("x"), None);
    }

    #[test]
    fn reservations_kept_sorted() {
        let mut rs = room_state();
        rs.insert_reservation(reservation(300, 400));
        rs.insert_reservation(reservation(100, 200));
        rs.insert_reservation(reservation(200, 300));
        let starts: Vec<Ms> = rs.reservations.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = room_state();
        let items: Vec<Reservation> = (0..3).map(|i| reservation(i * 100, i * 100 + 50)).collect();
        for r in &items {
            rs.insert_reservation(r.clone());
        }
        assert_eq!(rs.remove_reservation(items[1].id), Some(items[1].clone()));
        assert_eq!(rs.reservations.len(), 2);
        assert_eq!(rs.reservations[0].id, items[0].id);
        assert_eq!(rs.reservations[1].id, items[2].id);
        assert!(rs.remove_reservation(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = room_state();
        rs.insert_reservation(reservation(100, 200));
        rs.insert_reservation(reservation(450, 600));
        rs.insert_reservation(reservation(1000, 1100));

        let hits: Vec<_> = rs.overlapping(500, 800).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, 450);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = room_state();
        rs.insert_reservation(reservation(100, 200));
        assert_eq!(rs.overlapping(200, 300).count(), 0);
        assert_eq!(rs.overlapping(0, 100).count(), 0);
        assert_eq!(rs.overlapping(199, 300).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationUpdated {
            reservation: reservation(1000, 2000),
            previous_room: Ulid::new(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
