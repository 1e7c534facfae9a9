//! Incoming field sets and the structural validation that turns them into records.
//!
//! Field names in error bodies are the public column names (`nome`,
//! `data_inicio`, ...), since that is what clients sent.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::FieldErrors;
use super::{Engine, EngineError};

/// PUT vs PATCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Every required field must be supplied.
    Full,
    /// Missing fields keep their current value.
    Partial,
}

/// `None` = not supplied. For nullable columns `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFields {
    pub id: Option<Ulid>,
    pub username: Option<String>,
    pub email: Option<Option<String>>,
    pub role: Option<String>,
    pub ni: Option<i64>,
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub birth_date: Option<Option<String>>,
    pub hire_date: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseFields {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub program: Option<String>,
    pub description: Option<Option<String>>,
    pub workload_hours: Option<i64>,
    pub professor: Option<Option<Ulid>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFields {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub professor: Option<Ulid>,
    pub period: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFields {
    pub id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub period: Option<String>,
    pub room: Option<Ulid>,
    pub professor: Option<Ulid>,
    pub course: Option<Ulid>,
}

const REQUIRED: &str = "this field is required";

/// Collects per-field messages so a client sees every problem at once.
#[derive(Default)]
struct Problems(FieldErrors);

impl Problems {
    fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    fn finish(self) -> Result<(), EngineError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Invalid(self.0))
        }
    }

    /// Supplied value, else the current one unless the mode demands it.
    fn required<T: Clone>(
        &mut self,
        field: &str,
        supplied: Option<T>,
        current: Option<&T>,
        mode: Option<UpdateMode>,
    ) -> Option<T> {
        match (supplied, current, mode) {
            (Some(v), _, _) => Some(v),
            (None, Some(c), Some(UpdateMode::Partial)) => Some(c.clone()),
            _ => {
                self.add(field, REQUIRED);
                None
            }
        }
    }

    fn text(&mut self, field: &str, value: &str, max: usize) {
        if value.trim().is_empty() {
            self.add(field, "this field may not be blank");
        } else if value.len() > max {
            self.add(field, format!("ensure this field has no more than {max} characters"));
        }
    }

    fn non_negative_u32(&mut self, field: &str, value: i64) -> Option<u32> {
        match u32::try_from(value) {
            Ok(v) => Some(v),
            Err(_) => {
                self.add(field, "ensure this value is a non-negative integer");
                None
            }
        }
    }
}

/// Optional value: supplied (possibly cleared) or kept.
fn optional<T: Clone>(supplied: Option<Option<T>>, current: Option<&Option<T>>) -> Option<T> {
    match supplied {
        Some(v) => v,
        None => current.cloned().flatten(),
    }
}

/// `YYYY-MM-DD` naming a real calendar day.
fn is_iso_date(s: &str) -> bool {
    s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn check_id(problems: &mut Problems, supplied: Option<Ulid>, current: Option<Ulid>) -> Ulid {
    match (supplied, current) {
        (Some(s), Some(c)) if s != c => {
            problems.add("id", "this field is read-only");
            c
        }
        (_, Some(c)) => c,
        (Some(s), None) => s,
        (None, None) => Ulid::new(),
    }
}

impl Engine {
    /// A professor reference must name an existing user whose role is Professor.
    fn check_professor(&self, problems: &mut Problems, field: &str, id: Ulid) {
        match self.users.get(&id) {
            None => problems.add(field, format!("invalid pk \"{id}\" - object does not exist")),
            Some(user) if user.role != Role::Professor => {
                problems.add(field, "the user must be a professor")
            }
            Some(_) => {}
        }
    }

    pub(super) fn build_user(
        &self,
        fields: UserFields,
        current: Option<&User>,
        mode: Option<UpdateMode>,
    ) -> Result<User, EngineError> {
        let mut p = Problems::default();
        let id = check_id(&mut p, fields.id, current.map(|u| u.id));

        let username = p.required("username", fields.username, current.map(|u| &u.username), mode);
        if let Some(ref name) = username {
            p.text("username", name, MAX_NAME_LEN);
            let taken = self
                .users
                .iter()
                .any(|u| u.id != id && u.username.eq_ignore_ascii_case(name));
            if taken {
                p.add("username", "a user with that username already exists");
            }
        }

        let current_role = current.map(|u| u.role.code().to_string());
        let role = p
            .required("tipo", fields.role, current_role.as_ref(), mode)
            .and_then(|raw| match Role::parse(&raw) {
                Some(role) => Some(role),
                None => {
                    p.add("tipo", format!("\"{raw}\" is not a valid choice; use 'P' (professor) or 'G' (gestor)"));
                    None
                }
            });

        let current_ni = current.map(|u| i64::from(u.ni));
        let ni = p
            .required("ni", fields.ni, current_ni.as_ref(), mode)
            .and_then(|v| p.non_negative_u32("ni", v));
        if let Some(ni) = ni
            && self.users.iter().any(|u| u.id != id && u.ni == ni)
        {
            p.add("ni", "a user with this ni already exists");
        }

        let email = optional(fields.email, current.map(|u| &u.email));
        if let Some(ref e) = email {
            if !e.contains('@') || e.len() > MAX_TEXT_LEN {
                p.add("email", "enter a valid email address");
            } else if self
                .users
                .iter()
                .any(|u| u.id != id && u.email.as_deref().is_some_and(|o| o.eq_ignore_ascii_case(e)))
            {
                p.add("email", "a user with this email already exists");
            }
        }

        let phone = optional(fields.phone, current.map(|u| &u.phone));
        if phone.as_ref().is_some_and(|ph| ph.len() > MAX_PHONE_LEN) {
            p.add("telefone", format!("ensure this field has no more than {MAX_PHONE_LEN} characters"));
        }
        let birth_date = optional(fields.birth_date, current.map(|u| &u.birth_date));
        if birth_date.as_deref().is_some_and(|d| !is_iso_date(d)) {
            p.add("data_nascimento", "date has wrong format; use YYYY-MM-DD");
        }
        let hire_date = optional(fields.hire_date, current.map(|u| &u.hire_date));
        if hire_date.as_deref().is_some_and(|d| !is_iso_date(d)) {
            p.add("data_contratacao", "date has wrong format; use YYYY-MM-DD");
        }
        let first_name = optional(fields.first_name, current.map(|u| &u.first_name));
        let last_name = optional(fields.last_name, current.map(|u| &u.last_name));
        for (field, value) in [("first_name", &first_name), ("last_name", &last_name)] {
            if value.as_ref().is_some_and(|v| v.len() > MAX_NAME_LEN) {
                p.add(field, format!("ensure this field has no more than {MAX_NAME_LEN} characters"));
            }
        }

        p.finish()?;
        match (username, role, ni) {
            (Some(username), Some(role), Some(ni)) => Ok(User {
                id,
                username,
                email,
                role,
                ni,
                first_name,
                last_name,
                phone,
                birth_date,
                hire_date,
            }),
            _ => Err(EngineError::invalid("non_field_errors", "incomplete user")),
        }
    }

    pub(super) fn build_course(
        &self,
        fields: CourseFields,
        current: Option<&Course>,
        mode: Option<UpdateMode>,
    ) -> Result<Course, EngineError> {
        let mut p = Problems::default();
        let id = check_id(&mut p, fields.id, current.map(|c| c.id));

        let name = p.required("nome", fields.name, current.map(|c| &c.name), mode);
        if let Some(ref n) = name {
            p.text("nome", n, MAX_NAME_LEN);
        }
        let program = p.required("curso", fields.program, current.map(|c| &c.program), mode);
        if let Some(ref c) = program {
            p.text("curso", c, MAX_NAME_LEN);
        }
        let description = optional(fields.description, current.map(|c| &c.description));
        if description.as_ref().is_some_and(|d| d.len() > MAX_TEXT_LEN) {
            p.add("descricao", format!("ensure this field has no more than {MAX_TEXT_LEN} characters"));
        }
        let current_hours = current.map(|c| i64::from(c.workload_hours));
        let workload_hours = p
            .required("carga_horaria", fields.workload_hours, current_hours.as_ref(), mode)
            .and_then(|v| p.non_negative_u32("carga_horaria", v));
        let professor = optional(fields.professor, current.map(|c| &c.professor));
        if let Some(pid) = professor {
            self.check_professor(&mut p, "professor", pid);
        }

        p.finish()?;
        match (name, program, workload_hours) {
            (Some(name), Some(program), Some(workload_hours)) => Ok(Course {
                id,
                name,
                program,
                description,
                workload_hours,
                professor,
            }),
            _ => Err(EngineError::invalid("non_field_errors", "incomplete course")),
        }
    }

    pub(super) fn build_room(
        &self,
        fields: RoomFields,
        current: Option<&Room>,
        mode: Option<UpdateMode>,
    ) -> Result<Room, EngineError> {
        let mut p = Problems::default();
        let id = check_id(&mut p, fields.id, current.map(|r| r.id));

        let name = p.required("nome", fields.name, current.map(|r| &r.name), mode);
        if let Some(ref n) = name {
            p.text("nome", n, MAX_NAME_LEN);
        }
        let current_capacity = current.map(|r| i64::from(r.capacity));
        let capacity = p
            .required("capacidade", fields.capacity, current_capacity.as_ref(), mode)
            .and_then(|v| p.non_negative_u32("capacidade", v));
        if capacity == Some(0) {
            p.add("capacidade", "ensure this value is greater than 0");
        }
        let professor = p.required("professor", fields.professor, current.map(|r| &r.professor), mode);
        if let Some(pid) = professor {
            self.check_professor(&mut p, "professor", pid);
        }
        let current_period = current.map(|r| r.period.map(|x| x.code().to_string()));
        let period = optional(fields.period, current_period.as_ref()).and_then(|raw| {
            let parsed = Period::parse(&raw);
            if parsed.is_none() {
                p.add("periodo", format!("\"{raw}\" is not a valid choice"));
            }
            parsed
        });

        p.finish()?;
        match (name, capacity, professor) {
            (Some(name), Some(capacity), Some(professor)) => Ok(Room {
                id,
                name,
                capacity,
                professor,
                period,
            }),
            _ => Err(EngineError::invalid("non_field_errors", "incomplete room")),
        }
    }

    pub(super) fn build_reservation(
        &self,
        fields: ReservationFields,
        current: Option<&Reservation>,
        mode: Option<UpdateMode>,
    ) -> Result<Reservation, EngineError> {
        let mut p = Problems::default();
        let id = check_id(&mut p, fields.id, current.map(|r| r.id));

        let start = p.required("data_inicio", fields.start, current.map(|r| &r.start), mode);
        let end = p.required("data_termino", fields.end, current.map(|r| &r.end), mode);
        let current_period = current.map(|r| r.period.code().to_string());
        let period = p
            .required("periodo", fields.period, current_period.as_ref(), mode)
            .and_then(|raw| {
                let parsed = Period::parse(&raw);
                if parsed.is_none() {
                    p.add("periodo", format!("\"{raw}\" is not a valid choice"));
                }
                parsed
            });
        let room = p.required("sala", fields.room, current.map(|r| &r.room), mode);
        if let Some(rid) = room
            && self.get_room(&rid).is_none()
        {
            p.add("sala", format!("invalid pk \"{rid}\" - object does not exist"));
        }
        let professor = p.required("professor", fields.professor, current.map(|r| &r.professor), mode);
        if let Some(pid) = professor {
            self.check_professor(&mut p, "professor", pid);
        }
        let course = p.required("disciplina", fields.course, current.map(|r| &r.course), mode);
        if let Some(cid) = course
            && !self.courses.contains_key(&cid)
        {
            p.add("disciplina", format!("invalid pk \"{cid}\" - object does not exist"));
        }

        p.finish()?;
        match (start, end, period, room, professor, course) {
            (Some(start), Some(end), Some(period), Some(room), Some(professor), Some(course)) => {
                Ok(Reservation {
                    id,
                    start,
                    end,
                    period,
                    room,
                    professor,
                    course,
                })
            }
            _ => Err(EngineError::invalid("non_field_errors", "incomplete reservation")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_dates() {
        assert!(is_iso_date("1990-05-17"));
        assert!(!is_iso_date("1990-5-17"));
        assert!(!is_iso_date("1990-13-01"));
        assert!(!is_iso_date("17/05/1990"));
        assert!(!is_iso_date("2023-02-31"));
        assert!(!is_iso_date("2023-02-29"));
        assert!(is_iso_date("2024-02-29"));
    }

    #[test]
    fn required_respects_mode() {
        let mut p = Problems::default();
        assert_eq!(p.required("nome", None, Some(&1), Some(UpdateMode::Partial)), Some(1));
        assert_eq!(p.required("nome", Some(2), Some(&1), Some(UpdateMode::Full)), Some(2));
        assert_eq!(p.required::<i32>("nome", None, Some(&1), Some(UpdateMode::Full)), None);
        assert_eq!(p.required::<i32>("curso", None, None, None), None);
        let errors = match p.finish() {
            Err(EngineError::Invalid(errors)) => errors,
            other => panic!("expected Invalid, got {other:?}"),
        };
        assert_eq!(errors["nome"], vec![REQUIRED.to_string()]);
        assert_eq!(errors["curso"], vec![REQUIRED.to_string()]);
    }

    #[test]
    fn optional_supplied_cleared_or_kept() {
        let current = Some("a".to_string());
        assert_eq!(optional(None, Some(&current)), Some("a".to_string()));
        assert_eq!(optional(Some(None), Some(&current)), None);
        assert_eq!(optional(Some(Some("b".to_string())), Some(&current)), Some("b".to_string()));
        assert_eq!(optional::<String>(None, None), None);
    }

    #[test]
    fn id_is_read_only_on_update() {
        let mut p = Problems::default();
        let current = Ulid::new();
        assert_eq!(check_id(&mut p, Some(Ulid::new()), Some(current)), current);
        assert!(p.finish().is_err());
    }
}
