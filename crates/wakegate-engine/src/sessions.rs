//! Site-day sessions: lazy creation with an expected wake count, outcome
//! counting with overage detection, and end-of-day locking.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use wakegate_core::ids::{SessionId, SiteId};
use wakegate_core::schedule::parse_timezone;
use wakegate_core::state::{SessionStatus, WakeOutcome};
use wakegate_core::WakeScheduler;
use wakegate_store::anomalies::{AnomalyRepo, AnomalyRow};
use wakegate_store::devices::DeviceRepo;
use wakegate_store::sessions::{NewSession, OutcomeChange, SessionRepo, SessionRow};
use wakegate_store::sites::{SiteRepo, SiteRow};
use wakegate_store::wake_cycles::{WakeCycleRepo, WakeCycleRow};
use wakegate_store::{Database, StoreError};

use crate::error::Result;

/// Late data moves forward at most this many days looking for an open session.
const MAX_FORWARD_DAYS: u32 = 2;

/// What happened to one wake's outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum OutcomeRecord {
    Counted {
        session: SessionRow,
        outcome: WakeOutcome,
        change: OutcomeChange,
    },
    /// Wake belongs to no site; nothing to count.
    Unmapped,
    /// Every candidate session was locked; logged as an anomaly instead.
    Rejected { reason: String },
}

pub struct SessionManager {
    sessions: SessionRepo,
    sites: SiteRepo,
    devices: DeviceRepo,
    wakes: WakeCycleRepo,
    anomalies: AnomalyRepo,
    scheduler: WakeScheduler,
    overage_tolerance: Duration,
}

pub(crate) fn site_timezone(site: &SiteRow) -> Tz {
    parse_timezone(&site.timezone).unwrap_or(Tz::UTC)
}

pub(crate) fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// UTC bounds of a local calendar day.
pub(crate) fn day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_of = |d: NaiveDate| {
        let midnight = d.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&midnight)
            .earliest()
            // Midnight skipped by a DST jump: the day starts an hour later.
            .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    };
    let next = date.succ_opt().unwrap_or(date);
    (start_of(date), start_of(next))
}

impl SessionManager {
    pub fn new(db: Database, scheduler: WakeScheduler, overage_tolerance: Duration) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            sites: SiteRepo::new(db.clone()),
            devices: DeviceRepo::new(db.clone()),
            wakes: WakeCycleRepo::new(db.clone()),
            anomalies: AnomalyRepo::new(db),
            scheduler,
            overage_tolerance,
        }
    }

    /// Expected wake count for the day and a fingerprint of the schedules
    /// that produced it.
    fn expectation(&self, site: &SiteRow, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(u32, String)> {
        let mut devices = self.devices.list_by_site(&site.id)?;
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = Sha256::new();
        hasher.update(site.timezone.as_bytes());
        hasher.update(b"\n");
        hasher.update(site.wake_schedule.as_deref().unwrap_or("").as_bytes());

        let mut expected = 0usize;
        for device in &devices {
            let (plan, source, _) = self.scheduler.plan(
                device.wake_schedule.as_deref(),
                site.wake_schedule.as_deref(),
                &site.timezone,
            );
            expected += plan.occurrences(start, end).len();
            hasher.update(format!("\n{}={}:{source:?}", device.id, device.wake_schedule.as_deref().unwrap_or("")));
        }
        Ok((
            u32::try_from(expected).unwrap_or(u32::MAX),
            format!("{:x}", hasher.finalize()),
        ))
    }

    /// Idempotent per (site, local date). A second call on a day whose
    /// schedules have since changed flags the expected count approximate.
    #[instrument(skip(self), fields(site_id = %site_id, %local_date))]
    pub fn get_or_create(&self, site_id: &SiteId, local_date: NaiveDate, now: DateTime<Utc>) -> Result<SessionRow> {
        let site = self.sites.get(site_id)?;
        let tz = site_timezone(&site);
        let (start, end) = day_bounds(local_date, tz);
        let (expected, fingerprint) = self.expectation(&site, start, end)?;

        let (row, created) = self.sessions.get_or_create(
            &NewSession {
                site_id: site_id.clone(),
                local_date,
                timezone: tz.name().to_string(),
                day_start_utc: start,
                day_end_utc: end,
                expected_wake_count: expected,
                schedule_fingerprint: fingerprint.clone(),
            },
            now,
        )?;

        if !created && row.schedule_fingerprint != fingerprint && !row.expected_approximate {
            info!(session_id = %row.id, "schedule changed mid-day, expected count is approximate");
            self.sessions.flag_approximate(&row.id, now)?;
            return Ok(self.sessions.get(&row.id)?);
        }
        Ok(row)
    }

    /// Count a finished wake. `failed` wakes count as failed; completed wakes
    /// claim the nearest free expected slot or count as overage.
    #[instrument(skip(self, wake), fields(wake_id = %wake.id, device_id = %wake.device_id))]
    pub fn record_wake_outcome(&self, wake: &WakeCycleRow, now: DateTime<Utc>) -> Result<OutcomeRecord> {
        let Some(site_id) = &wake.site_id else {
            return Ok(OutcomeRecord::Unmapped);
        };
        let site = self.sites.get(site_id)?;
        let tz = site_timezone(&site);
        let wake_date = local_date(wake.captured_at, tz);

        let Some(session) = self.open_session_for(site_id, wake_date, local_date(now, tz), now)? else {
            let reason = format!("session for {wake_date} is locked");
            self.anomaly(wake, "late_outcome", &reason, now)?;
            return Ok(OutcomeRecord::Rejected { reason });
        };
        if session.local_date != wake_date {
            self.anomaly(
                wake,
                "late_outcome",
                &format!("session for {wake_date} locked, counted in {}", session.local_date),
                now,
            )?;
        }

        let already = self
            .sessions
            .outcomes(&session.id)?
            .into_iter()
            .find(|o| o.wake_id == wake.id);

        let (outcome, slot_at) = if wake.state.is_failure() {
            (WakeOutcome::Failed, None)
        } else {
            match already {
                Some(prev) if prev.outcome != WakeOutcome::Failed => (prev.outcome, prev.slot_at),
                _ => self.match_slot(&site, wake, &session)?,
            }
        };

        let change = match self
            .sessions
            .record_outcome(&session.id, &wake.id, &wake.device_id, outcome, slot_at, now)
        {
            Ok(change) => change,
            Err(StoreError::Conflict(reason)) => {
                self.anomaly(wake, "late_outcome", &reason, now)?;
                return Ok(OutcomeRecord::Rejected { reason });
            }
            Err(e) => return Err(e.into()),
        };
        self.wakes.assign_session(&wake.id, &session.id)?;
        self.wakes.set_overage(&wake.id, outcome == WakeOutcome::Overage)?;
        if outcome == WakeOutcome::Overage {
            info!(session_id = %session.id, "wake outside every expected slot, counted as overage");
        }

        Ok(OutcomeRecord::Counted {
            session: self.sessions.get(&session.id)?,
            outcome,
            change,
        })
    }

    /// The session of `date`, or of a later day when it is locked. Never
    /// reaches past `today`.
    fn open_session_for(
        &self,
        site_id: &SiteId,
        date: NaiveDate,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRow>> {
        let last = today.max(date);
        let mut candidate = date;
        for _ in 0..=MAX_FORWARD_DAYS {
            if candidate > last {
                break;
            }
            let session = self.get_or_create(site_id, candidate, now)?;
            if session.status == SessionStatus::InProgress {
                return Ok(Some(session));
            }
            candidate = match candidate.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(None)
    }

    fn match_slot(
        &self,
        site: &SiteRow,
        wake: &WakeCycleRow,
        session: &SessionRow,
    ) -> Result<(WakeOutcome, Option<DateTime<Utc>>)> {
        let device = self.devices.get(&wake.device_id)?;
        let (plan, _, _) = self.scheduler.plan(
            device.wake_schedule.as_deref(),
            site.wake_schedule.as_deref(),
            &site.timezone,
        );
        let claimed = self.sessions.claimed_slots(&session.id, &wake.device_id)?;
        let nearest = plan
            .occurrences(session.day_start_utc, session.day_end_utc)
            .into_iter()
            .filter(|slot| !claimed.contains(slot))
            .filter(|slot| (*slot - wake.captured_at).abs() <= self.overage_tolerance)
            .min_by_key(|slot| (*slot - wake.captured_at).abs());
        Ok(match nearest {
            Some(slot) => (WakeOutcome::Completed, Some(slot)),
            None => (WakeOutcome::Overage, None),
        })
    }

    fn anomaly(&self, wake: &WakeCycleRow, kind: &str, detail: &str, now: DateTime<Utc>) -> Result<()> {
        let mac = self.devices.get(&wake.device_id)?.mac;
        warn!(wake_id = %wake.id, device_id = %wake.device_id, kind, detail, "session anomaly");
        self.anomalies.record(&AnomalyRow {
            device_id: Some(wake.device_id.clone()),
            mac,
            kind: kind.to_string(),
            detail: detail.to_string(),
            at: now,
        })?;
        Ok(())
    }

    /// Lock every in-progress session whose local day has ended.
    #[instrument(skip(self))]
    pub fn lock_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRow>> {
        let locked = self.sessions.lock_expired(now)?;
        for s in &locked {
            info!(
                session_id = %s.id,
                site_id = %s.site_id,
                local_date = %s.local_date,
                expected = s.expected_wake_count,
                completed = s.completed_count,
                failed = s.failed_count,
                overage = s.overage_count,
                "session locked"
            );
        }
        Ok(locked)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow> {
        Ok(self.sessions.get(id)?)
    }
}
