use ulid::Ulid;

use crate::model::*;

use super::authz::{authorize, Actor, Operation, Record};
use super::locks::timed;
use super::{Engine, EngineError};

/// Optional equality filters for reservation listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room: Option<Ulid>,
    pub professor: Option<Ulid>,
    pub course: Option<Ulid>,
    pub period: Option<Period>,
}

impl ReservationFilter {
    fn matches(&self, r: &Reservation) -> bool {
        self.room.is_none_or(|id| r.room == id)
            && self.professor.is_none_or(|id| r.professor == id)
            && self.course.is_none_or(|id| r.course == id)
            && self.period.is_none_or(|p| r.period == p)
    }
}

fn allowed(
    actor: &Actor,
    op: Operation,
    kind: EntityKind,
    record: Option<Record<'_>>,
) -> Result<(), EngineError> {
    authorize(actor, op, kind, record).into_result()
}

impl Engine {
    /// Map a login name to the user it runs as.
    pub fn resolve_actor(&self, username: &str) -> Result<Actor, EngineError> {
        self.users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(|u| Actor::from_user(u.value()))
            .ok_or_else(|| EngineError::UnknownLogin(username.to_string()))
    }

    // ── Users ────────────────────────────────────────────────

    pub fn list_users(&self, actor: &Actor) -> Result<Vec<User>, EngineError> {
        allowed(actor, Operation::List, EntityKind::User, None)?;
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    pub fn get_user(&self, actor: &Actor, id: Ulid) -> Result<User, EngineError> {
        allowed(actor, Operation::Retrieve, EntityKind::User, None)?;
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(EntityKind::User, id))
    }

    // ── Courses ──────────────────────────────────────────────

    pub fn list_courses(
        &self,
        actor: &Actor,
        professor: Option<Ulid>,
    ) -> Result<Vec<Course>, EngineError> {
        allowed(actor, Operation::List, EntityKind::Course, None)?;
        Ok(self.collect_courses(|c| professor.is_none_or(|p| c.professor == Some(p))))
    }

    pub fn get_course(&self, actor: &Actor, id: Ulid) -> Result<Course, EngineError> {
        allowed(actor, Operation::Retrieve, EntityKind::Course, None)?;
        let course = self
            .courses
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(EntityKind::Course, id))?;
        allowed(actor, Operation::Retrieve, EntityKind::Course, Some(Record::Course(&course)))?;
        Ok(course)
    }

    /// Courses taught by the professor with institutional id `ni`.
    pub fn courses_by_professor_ni(&self, actor: &Actor, ni: u32) -> Result<Vec<Course>, EngineError> {
        allowed(actor, Operation::List, EntityKind::Course, None)?;
        let Some(professor) = self.users.iter().find(|u| u.ni == ni).map(|u| u.id) else {
            return Ok(Vec::new());
        };
        Ok(self.collect_courses(|c| c.professor == Some(professor)))
    }

    /// Courses the calling professor is responsible for.
    pub fn own_courses(&self, actor: &Actor) -> Result<Vec<Course>, EngineError> {
        allowed(actor, Operation::ListOwn, EntityKind::Course, None)?;
        Ok(self.collect_courses(|c| c.professor == Some(actor.id)))
    }

    fn collect_courses(&self, keep: impl Fn(&Course) -> bool) -> Vec<Course> {
        let mut courses: Vec<Course> = self
            .courses
            .iter()
            .filter(|c| keep(c.value()))
            .map(|c| c.value().clone())
            .collect();
        courses.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        courses
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn list_rooms(
        &self,
        actor: &Actor,
        professor: Option<Ulid>,
    ) -> Result<Vec<Room>, EngineError> {
        allowed(actor, Operation::List, EntityKind::Room, None)?;
        let mut rooms = self.room_records().await?;
        rooms.retain(|r| professor.is_none_or(|p| r.professor == p));
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rooms)
    }

    pub async fn get_room_record(&self, actor: &Actor, id: Ulid) -> Result<Room, EngineError> {
        allowed(actor, Operation::Retrieve, EntityKind::Room, None)?;
        let room = self.room_record(id).await?;
        allowed(actor, Operation::Retrieve, EntityKind::Room, Some(Record::Room(&room)))?;
        Ok(room)
    }

    /// The room the calling professor is responsible for, if any.
    pub async fn own_rooms(&self, actor: &Actor) -> Result<Vec<Room>, EngineError> {
        allowed(actor, Operation::ListOwn, EntityKind::Room, None)?;
        let mut rooms = self.room_records().await?;
        rooms.retain(|r| r.professor == actor.id);
        Ok(rooms)
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn list_reservations(
        &self,
        actor: &Actor,
        filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        allowed(actor, Operation::List, EntityKind::Reservation, None)?;
        self.collect_reservations(filter).await
    }

    pub async fn get_reservation(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        allowed(actor, Operation::Retrieve, EntityKind::Reservation, None)?;
        let room_id = self
            .room_for_reservation(&id)
            .ok_or(EngineError::NotFound(EntityKind::Reservation, id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(EntityKind::Reservation, id))?;
        let guard = timed(self.lock_timeout, "room", rs.read()).await?;
        let reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(EntityKind::Reservation, id))?;
        allowed(
            actor,
            Operation::Retrieve,
            EntityKind::Reservation,
            Some(Record::Reservation(&reservation)),
        )?;
        Ok(reservation)
    }

    /// Reservations made by the calling professor.
    pub async fn own_reservations(&self, actor: &Actor) -> Result<Vec<Reservation>, EngineError> {
        allowed(actor, Operation::ListOwn, EntityKind::Reservation, None)?;
        let filter = ReservationFilter {
            professor: Some(actor.id),
            ..Default::default()
        };
        self.collect_reservations(filter).await
    }

    async fn collect_reservations(
        &self,
        filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let ids = filter.room.map(|id| vec![id]);
        let mut out = Vec::new();
        for (_, rs) in self.room_arcs(ids) {
            let guard = timed(self.lock_timeout, "room", rs.read()).await?;
            if guard.removed {
                continue;
            }
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.start, r.id));
        Ok(out)
    }

    /// The fixed set of day periods.
    pub fn periods(&self) -> &'static [Period] {
        &Period::ALL
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
