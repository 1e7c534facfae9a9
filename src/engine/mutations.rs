use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFLICTS_TOTAL, DENIALS_TOTAL};

use super::authz::{authorize, Actor, Operation, Record};
use super::conflict::{validate_reservation, validate_room_assignment, validate_window};
use super::fields::{CourseFields, ReservationFields, RoomFields, UpdateMode, UserFields};
use super::store::RoomGuards;
use super::{Engine, EngineError};

/// Authorization with a denial counter attached.
fn gate(
    actor: &Actor,
    op: Operation,
    kind: EntityKind,
    existing: Option<Record<'_>>,
) -> Result<(), EngineError> {
    authorize(actor, op, kind, existing).into_result().inspect_err(|_| {
        metrics::counter!(DENIALS_TOTAL, "entity" => kind.to_string()).increment(1);
    })
}

fn note_conflict(e: &EngineError) {
    if let EngineError::Conflict(reason) = e {
        metrics::counter!(CONFLICTS_TOTAL, "reason" => reason.label()).increment(1);
    }
}

impl Engine {
    /// Seed an empty tenant with one manager so someone can log in.
    pub async fn ensure_admin(&self, username: &str) -> Result<Option<User>, EngineError> {
        let _catalog = self.catalog_exclusive().await?;
        if !self.users.is_empty() {
            return Ok(None);
        }
        let fields = UserFields {
            username: Some(username.to_string()),
            role: Some(Role::Manager.code().to_string()),
            ni: Some(0),
            ..Default::default()
        };
        let user = self.build_user(fields, None, None)?;
        self.commit(Event::UserCreated { user: user.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(Some(user))
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(&self, actor: &Actor, fields: UserFields) -> Result<User, EngineError> {
        gate(actor, Operation::Create, EntityKind::User, None)?;
        let _catalog = self.catalog_exclusive().await?;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if let Some(id) = fields.id
            && self.users.contains_key(&id)
        {
            return Err(EngineError::AlreadyExists(EntityKind::User, id));
        }
        let user = self.build_user(fields, None, None)?;
        self.commit(Event::UserCreated { user: user.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(user)
    }

    pub async fn update_user(
        &self,
        actor: &Actor,
        id: Ulid,
        fields: UserFields,
        mode: UpdateMode,
    ) -> Result<User, EngineError> {
        gate(actor, Operation::Update, EntityKind::User, None)?;
        let _catalog = self.catalog_exclusive().await?;
        let existing = self
            .users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(EntityKind::User, id))?;
        gate(actor, Operation::Update, EntityKind::User, Some(Record::User(&existing)))?;
        let user = self.build_user(fields, Some(&existing), Some(mode))?;
        if user.role != existing.role && self.is_referenced(id).await? {
            return Err(EngineError::invalid(
                "tipo",
                "role cannot change while the user is responsible for courses, rooms or reservations",
            ));
        }
        self.commit(Event::UserUpdated { user: user.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(user)
    }

    /// Deleting a user deletes the rooms and reservations they are responsible
    /// for and clears them from their courses.
    pub async fn delete_user(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        gate(actor, Operation::Delete, EntityKind::User, None)?;
        if id == actor.id {
            return Err(EngineError::invalid(
                super::GENERAL_FIELD,
                "a user cannot delete themselves",
            ));
        }
        let _catalog = self.catalog_exclusive().await?;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(EntityKind::User, id));
        }
        let mut guards = self.lock_rooms(None).await?;
        self.commit(Event::UserDeleted { id }, &mut guards).await
    }

    /// Whether any course, room or reservation names `user` as its professor.
    /// Caller holds the catalog exclusively.
    async fn is_referenced(&self, user: Ulid) -> Result<bool, EngineError> {
        if self.courses.iter().any(|c| c.professor == Some(user)) {
            return Ok(true);
        }
        for (_, rs) in self.room_arcs(None) {
            let guard = super::locks::timed(self.lock_timeout, "room", rs.read()).await?;
            if guard.removed {
                continue;
            }
            if guard.room.professor == user || guard.reservations.iter().any(|r| r.professor == user) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Courses ──────────────────────────────────────────────

    pub async fn create_course(
        &self,
        actor: &Actor,
        fields: CourseFields,
    ) -> Result<Course, EngineError> {
        gate(actor, Operation::Create, EntityKind::Course, None)?;
        let _catalog = self.catalog_exclusive().await?;
        if self.courses.len() >= MAX_COURSES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many courses"));
        }
        if let Some(id) = fields.id
            && self.courses.contains_key(&id)
        {
            return Err(EngineError::AlreadyExists(EntityKind::Course, id));
        }
        let course = self.build_course(fields, None, None)?;
        self.commit(Event::CourseCreated { course: course.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(course)
    }

    pub async fn update_course(
        &self,
        actor: &Actor,
        id: Ulid,
        fields: CourseFields,
        mode: UpdateMode,
    ) -> Result<Course, EngineError> {
        gate(actor, Operation::Update, EntityKind::Course, None)?;
        let _catalog = self.catalog_exclusive().await?;
        let existing = self
            .courses
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(EntityKind::Course, id))?;
        gate(actor, Operation::Update, EntityKind::Course, Some(Record::Course(&existing)))?;
        let course = self.build_course(fields, Some(&existing), Some(mode))?;
        self.commit(Event::CourseUpdated { course: course.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(course)
    }

    /// Deleting a course deletes every reservation made for it.
    pub async fn delete_course(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        gate(actor, Operation::Delete, EntityKind::Course, None)?;
        let _catalog = self.catalog_exclusive().await?;
        if !self.courses.contains_key(&id) {
            return Err(EngineError::NotFound(EntityKind::Course, id));
        }
        let mut guards = self.lock_rooms(None).await?;
        self.commit(Event::CourseDeleted { id }, &mut guards).await
    }

    // ── Rooms ────────────────────────────────────────────────

    /// Holds the catalog exclusively, so the room cap and the id check see
    /// every other room write.
    pub async fn create_room(&self, actor: &Actor, fields: RoomFields) -> Result<Room, EngineError> {
        gate(actor, Operation::Create, EntityKind::Room, None)?;
        let _catalog = self.catalog_exclusive().await?;
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if let Some(id) = fields.id
            && self.rooms.contains_key(&id)
        {
            return Err(EngineError::AlreadyExists(EntityKind::Room, id));
        }
        let room = self.build_room(fields, None, None)?;

        let rooms = self.room_records().await?;
        validate_room_assignment(&rooms, room.professor, None).inspect_err(note_conflict)?;

        self.commit(Event::RoomCreated { room: room.clone() }, &mut RoomGuards::new())
            .await?;
        Ok(room)
    }

    pub async fn update_room(
        &self,
        actor: &Actor,
        id: Ulid,
        fields: RoomFields,
        mode: UpdateMode,
    ) -> Result<Room, EngineError> {
        gate(actor, Operation::Update, EntityKind::Room, None)?;
        let _catalog = self.catalog_shared().await?;
        for _ in 0..MAX_LOCK_RETRIES {
            let existing = self.room_record(id).await?;
            gate(actor, Operation::Update, EntityKind::Room, Some(Record::Room(&existing)))?;
            let room = self.build_room(fields.clone(), Some(&existing), Some(mode))?;

            // Scan before taking our own room's write lock: holding it while
            // reading the others could deadlock against a concurrent update.
            let _professor = self.lock_professor(room.professor).await?;
            let rooms = self.room_records().await?;
            validate_room_assignment(&rooms, room.professor, Some(id)).inspect_err(note_conflict)?;

            let mut guards = self.lock_rooms(Some(vec![id])).await?;
            match guards.get(&id) {
                None => return Err(EngineError::NotFound(EntityKind::Room, id)),
                Some(guard) if guard.room != existing => continue,
                Some(_) => {}
            }
            self.commit(Event::RoomUpdated { room: room.clone() }, &mut guards)
                .await?;
            return Ok(room);
        }
        Err(EngineError::Unavailable("room changed concurrently"))
    }

    /// Deleting a room deletes its reservations.
    pub async fn delete_room(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        gate(actor, Operation::Delete, EntityKind::Room, None)?;
        let _catalog = self.catalog_shared().await?;
        let mut guards = self.lock_rooms(Some(vec![id])).await?;
        let Some(existing) = guards.get(&id).map(|g| g.room.clone()) else {
            return Err(EngineError::NotFound(EntityKind::Room, id));
        };
        gate(actor, Operation::Delete, EntityKind::Room, Some(Record::Room(&existing)))?;
        self.commit(Event::RoomDeleted { id }, &mut guards).await
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn create_reservation(
        &self,
        actor: &Actor,
        fields: ReservationFields,
    ) -> Result<Reservation, EngineError> {
        gate(actor, Operation::Create, EntityKind::Reservation, None)?;
        let _catalog = self.catalog_shared().await?;
        let _claim = match fields.id {
            Some(id) => Some(self.claim_id(id).await?),
            None => None,
        };
        if let Some(id) = fields.id
            && self.reservation_to_room.contains_key(&id)
        {
            return Err(EngineError::AlreadyExists(EntityKind::Reservation, id));
        }
        let reservation = self.build_reservation(fields, None, None)?;

        let mut guards = self.lock_rooms(Some(vec![reservation.room])).await?;
        let room = guards
            .get(&reservation.room)
            .ok_or(EngineError::NotFound(EntityKind::Room, reservation.room))?;
        validate_reservation(
            room.overlapping(reservation.start, reservation.end),
            &reservation,
            None,
        )
        .inspect_err(note_conflict)?;
        validate_window(&reservation)?;
        if room.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        self.commit(
            Event::ReservationCreated {
                reservation: reservation.clone(),
            },
            &mut guards,
        )
        .await?;
        Ok(reservation)
    }

    /// Moving a reservation to another room locks both rooms in id order and
    /// re-checks that nothing moved it in between.
    pub async fn update_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        fields: ReservationFields,
        mode: UpdateMode,
    ) -> Result<Reservation, EngineError> {
        gate(actor, Operation::Update, EntityKind::Reservation, None)?;
        let _catalog = self.catalog_shared().await?;
        for _ in 0..MAX_LOCK_RETRIES {
            let old_room = self
                .room_for_reservation(&id)
                .ok_or(EngineError::NotFound(EntityKind::Reservation, id))?;
            let Some(existing) = self.reservation_in(old_room, id).await? else {
                continue;
            };
            gate(
                actor,
                Operation::Update,
                EntityKind::Reservation,
                Some(Record::Reservation(&existing)),
            )?;
            let candidate = self.build_reservation(fields.clone(), Some(&existing), Some(mode))?;

            let mut guards = self.lock_rooms(Some(vec![old_room, candidate.room])).await?;
            let unchanged = guards
                .get(&old_room)
                .and_then(|g| g.reservation(id))
                .is_some_and(|r| *r == existing);
            if !unchanged {
                continue;
            }
            let target = guards
                .get(&candidate.room)
                .ok_or(EngineError::NotFound(EntityKind::Room, candidate.room))?;
            validate_reservation(
                target.overlapping(candidate.start, candidate.end),
                &candidate,
                Some(id),
            )
            .inspect_err(note_conflict)?;
            validate_window(&candidate)?;
            if candidate.room != old_room && target.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many reservations on room"));
            }

            let event = Event::ReservationUpdated {
                reservation: candidate.clone(),
                previous_room: old_room,
            };
            self.commit(event, &mut guards).await?;
            return Ok(candidate);
        }
        Err(EngineError::Unavailable("reservation changed concurrently"))
    }

    pub async fn delete_reservation(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        gate(actor, Operation::Delete, EntityKind::Reservation, None)?;
        let _catalog = self.catalog_shared().await?;
        for _ in 0..MAX_LOCK_RETRIES {
            let room_id = self
                .room_for_reservation(&id)
                .ok_or(EngineError::NotFound(EntityKind::Reservation, id))?;
            let mut guards = self.lock_rooms(Some(vec![room_id])).await?;
            let Some(existing) = guards
                .get(&room_id)
                .and_then(|g| g.reservation(id))
                .cloned()
            else {
                continue;
            };
            gate(
                actor,
                Operation::Delete,
                EntityKind::Reservation,
                Some(Record::Reservation(&existing)),
            )?;
            return self
                .commit(Event::ReservationDeleted { id, room_id }, &mut guards)
                .await;
        }
        Err(EngineError::Unavailable("reservation changed concurrently"))
    }

    /// Copy of one reservation, read under its room's lock.
    async fn reservation_in(
        &self,
        room_id: Ulid,
        id: Ulid,
    ) -> Result<Option<Reservation>, EngineError> {
        let Some(rs) = self.get_room(&room_id) else {
            return Ok(None);
        };
        let guard = super::locks::timed(self.lock_timeout, "room", rs.read()).await?;
        Ok(guard.reservation(id).cloned())
    }
}
