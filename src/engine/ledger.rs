use chrono::{Months, NaiveDateTime};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify;

use super::store::UserState;
use super::{Engine, EngineError, EntityKind};

/// Oldest `issued_at` that survives expiry at `now`.
pub fn retention_cutoff(now: NaiveDateTime) -> NaiveDateTime {
    now.checked_sub_months(Months::new(PENALTY_RETENTION_MONTHS))
        .unwrap_or(NaiveDateTime::MIN)
}

pub(crate) fn exists_for_cause(us: &UserState, description: &str) -> bool {
    us.penalties.iter().any(|p| p.description == description)
}

/// Build a new penalty unless one with the same cause already exists.
pub(crate) fn new_penalty(
    us: &UserState,
    description: String,
    when: NaiveDateTime,
) -> Result<Penalty, EngineError> {
    if exists_for_cause(us, &description) {
        return Err(EngineError::Duplicate {
            user_id: us.user.id,
            description,
        });
    }
    Ok(Penalty {
        id: Ulid::new(),
        user_id: us.user.id,
        description,
        issued_at: when,
    })
}

/// Like [`new_penalty`] but a duplicate is not an error.
pub(crate) fn penalty_once(
    us: &UserState,
    description: String,
    when: NaiveDateTime,
) -> Option<Penalty> {
    match new_penalty(us, description, when) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::debug!("{e}; skipping");
            None
        }
    }
}

fn validate_description(description: &str) -> Result<(), EngineError> {
    if description.trim().is_empty() {
        return Err(EngineError::Validation("penalty description is required"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("penalty description too long"));
    }
    Ok(())
}

/// Rewrite an existing penalty. The cause must stay unique among the user's
/// other penalties.
pub(crate) fn amended_penalty(
    us: &UserState,
    penalty_id: Ulid,
    description: String,
    issued_at: NaiveDateTime,
) -> Result<Penalty, EngineError> {
    let current = us
        .penalties
        .iter()
        .find(|p| p.id == penalty_id)
        .ok_or(EngineError::not_found(EntityKind::Penalty, penalty_id))?;
    if us
        .penalties
        .iter()
        .any(|p| p.id != penalty_id && p.description == description)
    {
        return Err(EngineError::Duplicate {
            user_id: us.user.id,
            description,
        });
    }
    Ok(Penalty {
        description,
        issued_at,
        ..current.clone()
    })
}

pub(crate) fn expired_ids(us: &UserState, cutoff: NaiveDateTime) -> Vec<Ulid> {
    us.penalties
        .iter()
        .filter(|p| p.issued_at < cutoff)
        .map(|p| p.id)
        .collect()
}

impl Engine {
    /// Record a penalty directly (staff action). Refuses duplicates.
    pub async fn issue_penalty(
        &self,
        user_id: Ulid,
        description: impl Into<String>,
        when: NaiveDateTime,
    ) -> Result<Penalty, EngineError> {
        let description = description.into();
        validate_description(&description)?;
        let mut users = self.lock_users([user_id]).await?;
        let us = &users[&user_id];
        let penalty = new_penalty(us, description, when)?;
        let user = us.user.clone();

        let event = Event::PenaltyIssued { penalty: penalty.clone() };
        self.persist_and_apply(&[event], None, &mut users).await?;
        metrics::counter!(crate::observability::PENALTIES_ISSUED_TOTAL, "cause" => "manual").increment(1);
        self.notify(notify::penalty_issued(&user, &penalty));
        Ok(penalty)
    }

    /// Correct a penalty's cause or issue date (staff action).
    pub async fn update_penalty(
        &self,
        user_id: Ulid,
        penalty_id: Ulid,
        description: impl Into<String>,
        issued_at: NaiveDateTime,
    ) -> Result<Penalty, EngineError> {
        let description = description.into();
        validate_description(&description)?;
        let mut users = self.lock_users([user_id]).await?;
        let penalty = amended_penalty(&users[&user_id], penalty_id, description, issued_at)?;

        let event = Event::PenaltyAmended { penalty: penalty.clone() };
        self.persist_and_apply(&[event], None, &mut users).await?;
        info!(%user_id, %penalty_id, "penalty amended");
        Ok(penalty)
    }

    /// Remove a penalty (staff action). Its cause can be penalized again
    /// afterwards.
    pub async fn delete_penalty(&self, user_id: Ulid, penalty_id: Ulid) -> Result<Penalty, EngineError> {
        let mut users = self.lock_users([user_id]).await?;
        let penalty = users[&user_id]
            .penalties
            .iter()
            .find(|p| p.id == penalty_id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Penalty, penalty_id))?;

        let event = Event::PenaltyRevoked { user_id, id: penalty_id };
        self.persist_and_apply(&[event], None, &mut users).await?;
        metrics::counter!(crate::observability::PENALTIES_REVOKED_TOTAL).increment(1);
        info!(%user_id, %penalty_id, "penalty revoked");
        Ok(penalty)
    }

    pub async fn penalty_exists_for_cause(&self, user_id: Ulid, description: &str) -> Result<bool, EngineError> {
        let us = self.read_user(user_id).await?;
        Ok(exists_for_cause(&us, description))
    }

    /// Delete every penalty issued strictly before `cutoff`. Returns how many
    /// were removed. Each user is its own unit of work, so a journal failure
    /// part-way leaves earlier users expired; running again finishes the job.
    pub async fn expire_penalties_older_than(&self, cutoff: NaiveDateTime) -> Result<usize, EngineError> {
        let user_ids: Vec<Ulid> = self.users.iter().map(|e| *e.key()).collect();
        let mut removed = 0usize;
        for user_id in user_ids {
            let mut users = match self.lock_users([user_id]).await {
                Ok(users) => users,
                Err(EngineError::NotFound { entity: EntityKind::User, .. }) => continue,
                Err(e) => return Err(e),
            };
            let ids = expired_ids(&users[&user_id], cutoff);
            if ids.is_empty() {
                continue;
            }
            let count = ids.len();
            let event = Event::PenaltiesExpired { user_id, ids };
            self.persist_and_apply(&[event], None, &mut users).await?;
            removed += count;
        }
        metrics::counter!(crate::observability::PENALTIES_EXPIRED_TOTAL).increment(removed as u64);
        info!(%cutoff, removed, "expired penalties");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(3, 0, 0).unwrap()
    }

    fn user_state() -> UserState {
        UserState::new(User {
            id: Ulid::new(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
        })
    }

    #[test]
    fn cutoff_is_three_calendar_months() {
        assert_eq!(retention_cutoff(at(2024, 6, 1)), at(2024, 3, 1));
        // Clamped to the end of a shorter month
        assert_eq!(retention_cutoff(at(2024, 5, 31)), at(2024, 2, 29));
    }

    #[test]
    fn duplicate_cause_refused() {
        let mut us = user_state();
        let p = new_penalty(&us, "no-show".into(), at(2024, 6, 1)).unwrap();
        us.penalties.push(p);
        let again = new_penalty(&us, "no-show".into(), at(2024, 6, 2));
        assert!(matches!(again, Err(EngineError::Duplicate { .. })));
        assert!(penalty_once(&us, "no-show".into(), at(2024, 6, 2)).is_none());
        assert!(penalty_once(&us, "other".into(), at(2024, 6, 2)).is_some());
    }

    #[test]
    fn amendment_keeps_causes_unique() {
        let mut us = user_state();
        let a = new_penalty(&us, "a".into(), at(2024, 6, 1)).unwrap();
        us.penalties.push(a.clone());
        let b = new_penalty(&us, "b".into(), at(2024, 6, 1)).unwrap();
        us.penalties.push(b.clone());

        let clash = amended_penalty(&us, b.id, "a".into(), at(2024, 6, 2));
        assert!(matches!(clash, Err(EngineError::Duplicate { .. })));

        // Keeping its own cause while moving the date is fine
        let moved = amended_penalty(&us, b.id, "b".into(), at(2024, 6, 3)).unwrap();
        assert_eq!(moved.id, b.id);
        assert_eq!(moved.issued_at, at(2024, 6, 3));

        let missing = amended_penalty(&us, Ulid::new(), "c".into(), at(2024, 6, 2));
        assert!(matches!(missing, Err(EngineError::NotFound { entity: EntityKind::Penalty, .. })));
    }

    #[test]
    fn expiry_is_strictly_before_cutoff() {
        let mut us = user_state();
        for (i, when) in [at(2024, 1, 1), at(2024, 3, 1), at(2024, 5, 1)].into_iter().enumerate() {
            let p = new_penalty(&us, format!("p{i}"), when).unwrap();
            us.penalties.push(p);
        }
        let ids = expired_ids(&us, at(2024, 3, 1));
        assert_eq!(ids, vec![us.penalties[0].id]);
    }
}
