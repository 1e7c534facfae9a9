//! Authorization gate: (actor role, ownership) → allowed operations.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// The user a request runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    /// Listing scoped to the caller's own records.
    ListOwn,
    Create,
    Retrieve,
    Update,
    Delete,
}

/// An existing record, tagged by kind, for object-level checks.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    User(&'a User),
    Course(&'a Course),
    Room(&'a Room),
    Reservation(&'a Reservation),
}

impl Record<'_> {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::User(_) => EntityKind::User,
            Record::Course(_) => EntityKind::Course,
            Record::Room(_) => EntityKind::Room,
            Record::Reservation(_) => EntityKind::Reservation,
        }
    }

    /// The professor responsible for the record, if the record has one.
    pub fn owner(&self) -> Option<Ulid> {
        match self {
            Record::User(_) => None,
            Record::Course(c) => c.professor,
            Record::Room(r) => Some(r.professor),
            Record::Reservation(r) => Some(r.professor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(&'static str),
}

impl Access {
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            Access::Allowed => Ok(()),
            Access::Denied(reason) => Err(EngineError::Forbidden(reason)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    AnyActor,
    ManagerOnly,
    ProfessorOnly,
    ProfessorOrManager,
    OwnerOrManager,
}

fn policy(kind: EntityKind, op: Operation) -> Policy {
    use EntityKind::*;
    use Operation::*;
    match (kind, op) {
        (_, ListOwn) => Policy::ProfessorOnly,
        (User, _) => Policy::ManagerOnly,
        (Course | Room, List | Retrieve) => Policy::ProfessorOrManager,
        (Course | Room, Create | Update | Delete) => Policy::ManagerOnly,
        (Reservation, List | Retrieve) => Policy::AnyActor,
        (Reservation, Create) => Policy::ManagerOnly,
        (Reservation, Update | Delete) => Policy::OwnerOrManager,
    }
}

/// Decide whether `actor` may perform `op` on `kind`.
///
/// With `existing = None` only the role-level part is evaluated (an owner check
/// can't fail without a record); object-level writes call again with the record
/// read under the write guard.
pub fn authorize(
    actor: &Actor,
    op: Operation,
    kind: EntityKind,
    existing: Option<Record<'_>>,
) -> Access {
    debug_assert!(existing.is_none_or(|r| r.kind() == kind));
    match policy(kind, op) {
        Policy::AnyActor => Access::Allowed,
        Policy::ManagerOnly => match actor.role {
            Role::Manager => Access::Allowed,
            Role::Professor => Access::Denied("managers only"),
        },
        Policy::ProfessorOnly => match actor.role {
            Role::Professor => Access::Allowed,
            Role::Manager => Access::Denied("professors only"),
        },
        Policy::ProfessorOrManager => Access::Allowed,
        Policy::OwnerOrManager => match (actor.role, existing) {
            (Role::Manager, _) => Access::Allowed,
            (Role::Professor, None) => Access::Allowed,
            (Role::Professor, Some(record)) if record.owner() == Some(actor.id) => Access::Allowed,
            (Role::Professor, Some(_)) => Access::Denied("not the responsible professor"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: Role) -> Actor {
        Actor {
            id: Ulid::new(),
            role,
        }
    }

    fn reservation_of(professor: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            start: 0,
            end: 1,
            period: Period::Night,
            room: Ulid::new(),
            professor,
            course: Ulid::new(),
        }
    }

    #[test]
    fn users_are_manager_only() {
        let manager = actor(Role::Manager);
        let professor = actor(Role::Professor);
        for op in [
            Operation::List,
            Operation::Create,
            Operation::Retrieve,
            Operation::Update,
            Operation::Delete,
        ] {
            assert_eq!(authorize(&manager, op, EntityKind::User, None), Access::Allowed);
            assert!(matches!(
                authorize(&professor, op, EntityKind::User, None),
                Access::Denied(_)
            ));
        }
    }

    #[test]
    fn professors_read_but_do_not_write_rooms_and_courses() {
        let professor = actor(Role::Professor);
        for kind in [EntityKind::Room, EntityKind::Course] {
            assert_eq!(authorize(&professor, Operation::List, kind, None), Access::Allowed);
            assert_eq!(authorize(&professor, Operation::Retrieve, kind, None), Access::Allowed);
            for op in [Operation::Create, Operation::Update, Operation::Delete] {
                assert!(matches!(authorize(&professor, op, kind, None), Access::Denied(_)));
            }
        }
    }

    #[test]
    fn only_managers_create_reservations() {
        assert_eq!(
            authorize(&actor(Role::Manager), Operation::Create, EntityKind::Reservation, None),
            Access::Allowed
        );
        assert!(matches!(
            authorize(&actor(Role::Professor), Operation::Create, EntityKind::Reservation, None),
            Access::Denied(_)
        ));
    }

    #[test]
    fn owner_or_manager_updates_reservation() {
        let p = actor(Role::Professor);
        let q = actor(Role::Professor);
        let manager = actor(Role::Manager);
        let owned_by_q = reservation_of(q.id);
        let record = Some(Record::Reservation(&owned_by_q));

        assert!(matches!(
            authorize(&p, Operation::Update, EntityKind::Reservation, record),
            Access::Denied(_)
        ));
        assert_eq!(
            authorize(&q, Operation::Update, EntityKind::Reservation, record),
            Access::Allowed
        );
        assert_eq!(
            authorize(&manager, Operation::Delete, EntityKind::Reservation, record),
            Access::Allowed
        );
        // Role-level pass only; the owner check runs once the record is locked.
        assert_eq!(
            authorize(&p, Operation::Update, EntityKind::Reservation, None),
            Access::Allowed
        );
    }

    #[test]
    fn list_own_is_for_professors() {
        assert_eq!(
            authorize(&actor(Role::Professor), Operation::ListOwn, EntityKind::Room, None),
            Access::Allowed
        );
        assert!(matches!(
            authorize(&actor(Role::Manager), Operation::ListOwn, EntityKind::Reservation, None),
            Access::Denied(_)
        ));
    }

    #[test]
    fn anyone_reads_reservations() {
        for role in [Role::Manager, Role::Professor] {
            assert_eq!(
                authorize(&actor(role), Operation::List, EntityKind::Reservation, None),
                Access::Allowed
            );
        }
    }

    #[test]
    fn record_owner_accessor() {
        let p = Ulid::new();
        let course = Course {
            id: Ulid::new(),
            name: "Redes".into(),
            program: "ADS".into(),
            description: None,
            workload_hours: 60,
            professor: None,
        };
        assert_eq!(Record::Course(&course).owner(), None);
        let r = reservation_of(p);
        assert_eq!(Record::Reservation(&r).owner(), Some(p));
        assert_eq!(Record::Reservation(&r).kind(), EntityKind::Reservation);
    }
}
