//! Site-state snapshots for one round of a session.
//!
//! Device values prefer readings inside the window and otherwise carry the
//! last observation forward, bounded by `max_carry_forward`. Site aggregates
//! only ever see readings from inside the window.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use wakegate_core::ids::SessionId;
use wakegate_core::state::WakeState;
use wakegate_core::telemetry::TelemetryReading;
use wakegate_core::{ProtocolError, WakeScheduler};
use wakegate_store::devices::{DeviceRepo, DeviceRow};
use wakegate_store::scores::{ImageScoreRepo, ImageScoreRow};
use wakegate_store::sessions::{SessionRepo, SessionRow};
use wakegate_store::sites::{SiteRepo, SiteRow};
use wakegate_store::snapshots::{SnapshotRepo, SnapshotRow};
use wakegate_store::wake_cycles::{WakeCycleRepo, WakeCycleRow};
use wakegate_store::{Database, StoreError};

use crate::config::SnapshotConfig;
use crate::error::Result;

/// A device-level value and where it came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reading<T> {
    /// Observed inside the window.
    #[serde(rename_all = "camelCase")]
    Fresh { value: T, observed_at: DateTime<Utc> },
    /// Last observation before the window.
    #[serde(rename_all = "camelCase")]
    Carried {
        value: T,
        observed_at: DateTime<Utc>,
        age_secs: i64,
    },
    Unknown,
}

impl<T> Reading<T> {
    pub fn fresh_value(&self) -> Option<&T> {
        match self {
            Self::Fresh { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    pub expected: u32,
    pub fulfilled: u32,
    /// None when no wake was expected.
    pub ratio: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: String,
    pub mac: String,
    pub telemetry: Reading<TelemetryReading>,
    pub score: Reading<f64>,
    pub images_captured: u32,
    pub wakes: u32,
    pub failed_wakes: u32,
    pub connectivity: Connectivity,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub count: u32,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Stat {
    fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut stat = Self::default();
        let mut sum = 0.0;
        for v in values {
            stat.count += 1;
            sum += v;
            stat.min = Some(stat.min.map_or(v, |m: f64| m.min(v)));
            stat.max = Some(stat.max.map_or(v, |m: f64| m.max(v)));
        }
        if stat.count > 0 {
            stat.avg = Some(sum / f64::from(stat.count));
        }
        stat
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteAggregates {
    pub temperature_c: Stat,
    pub humidity: Stat,
    pub pressure: Stat,
    pub gas_resistance: Stat,
    pub battery_voltage: Stat,
    pub score: Stat,
    pub images_captured: u32,
    pub wakes: u32,
    pub failed_wakes: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteState {
    pub site_id: String,
    pub local_date: String,
    pub round_index: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub devices: Vec<DeviceState>,
    pub aggregates: SiteAggregates,
}

pub struct SnapshotAggregator {
    sessions: SessionRepo,
    sites: SiteRepo,
    devices: DeviceRepo,
    wakes: WakeCycleRepo,
    scores: ImageScoreRepo,
    snapshots: SnapshotRepo,
    scheduler: WakeScheduler,
    config: SnapshotConfig,
}

/// In-window readings of one device, kept apart from carried values.
struct Observed {
    telemetry: Vec<TelemetryReading>,
    scores: Vec<f64>,
}

impl SnapshotAggregator {
    pub fn new(db: Database, scheduler: WakeScheduler, config: SnapshotConfig) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            sites: SiteRepo::new(db.clone()),
            devices: DeviceRepo::new(db.clone()),
            wakes: WakeCycleRepo::new(db.clone()),
            scores: ImageScoreRepo::new(db.clone()),
            snapshots: SnapshotRepo::new(db),
            scheduler,
            config,
        }
    }

    /// Build and upsert the snapshot for `(session_id, round_index)`.
    /// Regenerating a round overwrites the stored record.
    #[instrument(skip(self), fields(session_id = %session_id, round_index))]
    pub fn generate(
        &self,
        session_id: &SessionId,
        round_index: u32,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SnapshotRow> {
        if window_end <= window_start {
            return Err(ProtocolError::Malformed(format!(
                "snapshot window {window_start} .. {window_end} is empty"
            ))
            .into());
        }
        let session = self.sessions.get(session_id)?;
        let site = self.sites.get(&session.site_id)?;
        let state = self.site_state(&session, &site, round_index, window_start, window_end, now)?;

        let row = SnapshotRow {
            session_id: session_id.clone(),
            round_index,
            window_start,
            window_end,
            site_state: serde_json::to_value(&state).map_err(StoreError::from)?,
            generated_at: now,
        };
        self.snapshots.upsert(&row)?;
        debug!(devices = state.devices.len(), "snapshot stored");
        Ok(row)
    }

    pub fn get(&self, session_id: &SessionId, round_index: u32) -> Result<Option<SnapshotRow>> {
        Ok(self.snapshots.get(session_id, round_index)?)
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SnapshotRow>> {
        Ok(self.snapshots.list(session_id)?)
    }

    fn site_state(
        &self,
        session: &SessionRow,
        site: &SiteRow,
        round_index: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SiteState> {
        // Devices mapped here now, plus any that woke here in the window
        // before being moved elsewhere.
        let mut devices = self.devices.list_by_site(&site.id)?;
        for id in self.wakes.device_ids_at_site_between(&site.id, start, end)? {
            if !devices.iter().any(|d| d.id == id) {
                devices.push(self.devices.get(&id)?);
            }
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        let mut states = Vec::with_capacity(devices.len());
        let mut observed = Vec::with_capacity(devices.len());
        for device in &devices {
            let (state, seen) = self.device_state(device, site, start, end, now)?;
            states.push(state);
            observed.push(seen);
        }

        let fresh = || observed.iter().flat_map(|o| o.telemetry.iter());
        let aggregates = SiteAggregates {
            temperature_c: Stat::of(fresh().filter_map(|t| t.temperature_c)),
            humidity: Stat::of(fresh().filter_map(|t| t.humidity)),
            pressure: Stat::of(fresh().filter_map(|t| t.pressure)),
            gas_resistance: Stat::of(fresh().filter_map(|t| t.gas_resistance)),
            battery_voltage: Stat::of(fresh().filter_map(|t| t.battery_voltage)),
            score: Stat::of(observed.iter().flat_map(|o| o.scores.iter().copied())),
            images_captured: states.iter().map(|d| d.images_captured).sum(),
            wakes: states.iter().map(|d| d.wakes).sum(),
            failed_wakes: states.iter().map(|d| d.failed_wakes).sum(),
        };

        Ok(SiteState {
            site_id: site.id.to_string(),
            local_date: session.local_date.to_string(),
            round_index,
            window_start: start,
            window_end: end,
            devices: states,
            aggregates,
        })
    }

    fn device_state(
        &self,
        device: &DeviceRow,
        site: &SiteRow,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(DeviceState, Observed)> {
        let wakes = self.wakes.list_for_device_between(&device.id, &site.id, start, end)?;
        let in_window: Vec<&WakeCycleRow> = wakes.iter().filter(|w| !w.telemetry.is_empty()).collect();

        let telemetry = match in_window.last() {
            Some(latest) => Reading::Fresh {
                value: latest.telemetry.clone(),
                observed_at: latest.captured_at,
            },
            None => match self.wakes.latest_with_telemetry_before(&device.id, &site.id, start)? {
                Some(prior) => self.carry(prior.telemetry, prior.captured_at, start),
                None => Reading::Unknown,
            },
        };

        let mut scores = self.scores.list_between(&device.id, start, end)?;
        scores.retain(|s| s.wake_id.as_ref().map_or(true, |id| wakes.iter().any(|w| &w.id == id)));
        let score = match scores.last() {
            Some(latest) => Reading::Fresh {
                value: latest.score,
                observed_at: latest.captured_at,
            },
            None => match self.scores.latest_before(&device.id, start)? {
                Some(prior) if self.scored_at_site(&prior, site)? => {
                    self.carry(prior.score, prior.captured_at, start)
                }
                Some(_) => Reading::Unknown,
                None => Reading::Unknown,
            },
        };

        let images_captured = wakes
            .iter()
            .filter(|w| w.state == WakeState::Complete && w.image_key.is_some())
            .count();
        let failed_wakes = wakes.iter().filter(|w| w.state.is_failure()).count();

        let state = DeviceState {
            device_id: device.id.to_string(),
            mac: device.mac.clone(),
            telemetry,
            score,
            images_captured: count_u32(images_captured),
            wakes: count_u32(wakes.len()),
            failed_wakes: count_u32(failed_wakes),
            connectivity: self.connectivity(device, site, end.min(now))?,
        };
        let observed = Observed {
            telemetry: in_window.into_iter().map(|w| w.telemetry.clone()).collect(),
            scores: scores.iter().map(|s| s.score).collect(),
        };
        Ok((state, observed))
    }

    fn scored_at_site(&self, score: &ImageScoreRow, site: &SiteRow) -> Result<bool> {
        let Some(wake_id) = &score.wake_id else {
            return Ok(true);
        };
        Ok(self.wakes.get(wake_id)?.site_id.as_ref() == Some(&site.id))
    }

    fn carry<T>(&self, value: T, observed_at: DateTime<Utc>, start: DateTime<Utc>) -> Reading<T> {
        let age = start - observed_at;
        if age > self.config.max_carry_forward {
            return Reading::Unknown;
        }
        Reading::Carried {
            value,
            observed_at,
            age_secs: age.num_seconds(),
        }
    }

    /// Trailing expected wakes against observed wake activity. Derived on
    /// every call; never persisted as telemetry.
    fn connectivity(&self, device: &DeviceRow, site: &SiteRow, until: DateTime<Utc>) -> Result<Connectivity> {
        let (plan, _, _) = self.scheduler.plan(
            device.wake_schedule.as_deref(),
            site.wake_schedule.as_deref(),
            &site.timezone,
        );
        let expected = plan.trailing(until, self.config.connectivity_window);
        let (Some(first), Some(last)) = (expected.first(), expected.last()) else {
            return Ok(Connectivity {
                expected: 0,
                fulfilled: 0,
                ratio: None,
            });
        };
        let tolerance = self.config.activity_tolerance;
        let activity: Vec<DateTime<Utc>> = self
            .wakes
            .list_for_device_between(
                &device.id,
                &site.id,
                *first - tolerance,
                *last + tolerance + Duration::seconds(1),
            )?
            .iter()
            .map(|w| w.captured_at)
            .collect();
        let fulfilled = expected
            .iter()
            .filter(|slot| activity.iter().any(|at| (*at - **slot).abs() <= tolerance))
            .count();
        let expected_n = count_u32(expected.len());
        let fulfilled_n = count_u32(fulfilled);
        Ok(Connectivity {
            expected: expected_n,
            fulfilled: fulfilled_n,
            ratio: Some(f64::from(fulfilled_n) / f64::from(expected_n)),
        })
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Read a device entry back out of a stored snapshot.
pub fn device_entry<'a>(site_state: &'a Value, device_id: &str) -> Option<&'a Value> {
    site_state["devices"]
        .as_array()?
        .iter()
        .find(|d| d["deviceId"] == device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use wakegate_core::ids::{DeviceId, SiteId};
    use wakegate_store::sessions::NewSession;
    use wakegate_store::wake_cycles::NewWakeCycle;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Fixture {
        db: Database,
        aggregator: SnapshotAggregator,
        session: SessionId,
        device: DeviceId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let site = SiteId::from_raw("site_1");
        SiteRepo::new(db.clone())
            .upsert(&SiteRow {
                id: site.clone(),
                name: "Yard".into(),
                tenant_id: "acme".into(),
                timezone: "UTC".into(),
                wake_schedule: Some("0 * * * *".into()),
            })
            .unwrap();
        let devices = DeviceRepo::new(db.clone());
        let device = devices.get_or_provision("M1", utc("2024-06-01T00:00:00Z")).unwrap();
        devices.assign_site(&device.id, Some(&site), None).unwrap();
        let (session, _) = SessionRepo::new(db.clone())
            .get_or_create(
                &NewSession {
                    site_id: site,
                    local_date: utc("2024-06-01T00:00:00Z").date_naive(),
                    timezone: "UTC".into(),
                    day_start_utc: utc("2024-06-01T00:00:00Z"),
                    day_end_utc: utc("2024-06-02T00:00:00Z"),
                    expected_wake_count: 24,
                    schedule_fingerprint: "fp".into(),
                },
                utc("2024-06-01T00:00:00Z"),
            )
            .unwrap();
        let config = EngineConfig::default();
        let aggregator = SnapshotAggregator::new(
            db.clone(),
            WakeScheduler::new(config.default_cadence),
            config.snapshot,
        );
        Fixture {
            db,
            aggregator,
            session: session.id,
            device: device.id,
        }
    }

    fn wake(db: &Database, device: &DeviceId, at: &str, temp: f64, state: WakeState, image: bool) {
        wake_at(db, device, "site_1", at, temp, state, image);
    }

    fn wake_at(db: &Database, device: &DeviceId, site: &str, at: &str, temp: f64, state: WakeState, image: bool) {
        let wakes = WakeCycleRepo::new(db.clone());
        let at = utc(at);
        let row = wakes
            .create(
                &NewWakeCycle {
                    device_id: device.clone(),
                    site_id: Some(SiteId::from_raw(site)),
                    captured_at: at,
                    pending_images: 0,
                    telemetry: TelemetryReading {
                        temperature_c: Some(temp),
                        ..Default::default()
                    },
                },
                WakeState::HelloReceived,
                at,
            )
            .unwrap();
        if state != WakeState::HelloReceived {
            wakes.transition(&row.id, WakeState::HelloReceived, state, None, at).unwrap();
        }
        if image {
            wakes.set_image_key(&row.id, "acme/site_1/dev/img.jpg").unwrap();
        }
    }

    #[test]
    fn fresh_reading_inside_window() {
        let f = fixture();
        wake(&f.db, &f.device, "2024-06-01T10:00:30Z", 20.0, WakeState::Failed, false);
        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
            )
            .unwrap();
        let dev = device_entry(&row.site_state, f.device.as_str()).unwrap();
        assert_eq!(dev["telemetry"]["status"], "fresh");
        assert_eq!(dev["telemetry"]["value"]["temperatureC"], 20.0);
        assert_eq!(dev["failedWakes"], 1);
        assert_eq!(row.site_state["aggregates"]["temperatureC"]["avg"], 20.0);
    }

    #[test]
    fn carried_forward_within_age_is_marked_and_excluded_from_aggregates() {
        let f = fixture();
        wake(&f.db, &f.device, "2024-06-01T08:00:00Z", 18.5, WakeState::Failed, false);
        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
            )
            .unwrap();
        let dev = device_entry(&row.site_state, f.device.as_str()).unwrap();
        assert_eq!(dev["telemetry"]["status"], "carried");
        assert_eq!(dev["telemetry"]["value"]["temperatureC"], 18.5);
        assert_eq!(dev["telemetry"]["ageSecs"], 7200);
        assert_eq!(dev["imagesCaptured"], 0);
        let temp = &row.site_state["aggregates"]["temperatureC"];
        assert_eq!(temp["count"], 0);
        assert!(temp["avg"].is_null());
    }

    #[test]
    fn reading_older_than_carry_limit_is_unknown() {
        let f = fixture();
        wake(&f.db, &f.device, "2024-06-01T01:00:00Z", 18.5, WakeState::Failed, false);
        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
            )
            .unwrap();
        let dev = device_entry(&row.site_state, f.device.as_str()).unwrap();
        assert_eq!(dev["telemetry"]["status"], "unknown");
        assert_eq!(dev["score"]["status"], "unknown");
    }

    #[test]
    fn scores_follow_the_same_rules() {
        let f = fixture();
        let scores = ImageScoreRepo::new(f.db.clone());
        scores
            .insert(&ImageScoreRow {
                device_id: f.device.clone(),
                wake_id: None,
                captured_at: utc("2024-06-01T09:30:00Z"),
                score: 0.4,
            })
            .unwrap();
        scores
            .insert(&ImageScoreRow {
                device_id: f.device.clone(),
                wake_id: None,
                captured_at: utc("2024-06-01T10:15:00Z"),
                score: 0.9,
            })
            .unwrap();
        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
            )
            .unwrap();
        let dev = device_entry(&row.site_state, f.device.as_str()).unwrap();
        assert_eq!(dev["score"]["status"], "fresh");
        assert_eq!(dev["score"]["value"], 0.9);
        assert_eq!(row.site_state["aggregates"]["score"]["count"], 1);
    }

    #[test]
    fn connectivity_counts_slots_with_activity() {
        let f = fixture();
        // Expected hourly; activity near 08:00 and 10:00 only.
        wake(&f.db, &f.device, "2024-06-01T08:05:00Z", 18.0, WakeState::Complete, true);
        wake(&f.db, &f.device, "2024-06-01T10:02:00Z", 19.0, WakeState::Complete, true);
        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T10:30:00Z"),
            )
            .unwrap();
        let dev = device_entry(&row.site_state, f.device.as_str()).unwrap();
        // Trailing six slots before 10:30: 05:00 .. 10:00.
        assert_eq!(dev["connectivity"]["expected"], 6);
        assert_eq!(dev["connectivity"]["fulfilled"], 2);
        assert_eq!(dev["imagesCaptured"], 1);
    }

    #[test]
    fn regenerate_overwrites() {
        let f = fixture();
        let start = utc("2024-06-01T10:00:00Z");
        let end = utc("2024-06-01T11:00:00Z");
        f.aggregator.generate(&f.session, 3, start, end, end).unwrap();
        wake(&f.db, &f.device, "2024-06-01T10:20:00Z", 22.0, WakeState::Failed, false);
        f.aggregator.generate(&f.session, 3, start, end, end).unwrap();

        let all = f.aggregator.list(&f.session).unwrap();
        assert_eq!(all.len(), 1);
        let dev = device_entry(&all[0].site_state, f.device.as_str()).unwrap();
        assert_eq!(dev["telemetry"]["value"]["temperatureC"], 22.0);
    }

    #[test]
    fn remapped_device_keeps_its_wakes_at_the_old_site() {
        let f = fixture();
        let other = SiteId::from_raw("site_2");
        SiteRepo::new(f.db.clone())
            .upsert(&SiteRow {
                id: other.clone(),
                name: "Barn".into(),
                tenant_id: "acme".into(),
                timezone: "UTC".into(),
                wake_schedule: Some("0 * * * *".into()),
            })
            .unwrap();
        let devices = DeviceRepo::new(f.db.clone());
        wake(&f.db, &f.device, "2024-06-01T10:05:00Z", 20.0, WakeState::Complete, true);
        devices.assign_site(&f.device, Some(&other), None).unwrap();
        wake_at(&f.db, &f.device, "site_2", "2024-06-01T10:35:00Z", 30.0, WakeState::Failed, false);

        // A device that joined site_1 but only ever woke at site_2.
        let newcomer = devices.get_or_provision("M2", utc("2024-06-01T00:00:00Z")).unwrap();
        wake_at(&f.db, &newcomer.id, "site_2", "2024-06-01T10:10:00Z", 40.0, WakeState::Complete, true);
        devices
            .assign_site(&newcomer.id, Some(&SiteId::from_raw("site_1")), None)
            .unwrap();

        let row = f
            .aggregator
            .generate(
                &f.session,
                10,
                utc("2024-06-01T10:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
                utc("2024-06-01T11:00:00Z"),
            )
            .unwrap();
        let moved = device_entry(&row.site_state, f.device.as_str()).unwrap();
        assert_eq!(moved["wakes"], 1);
        assert_eq!(moved["failedWakes"], 0);
        assert_eq!(moved["telemetry"]["value"]["temperatureC"], 20.0);

        let joined = device_entry(&row.site_state, newcomer.id.as_str()).unwrap();
        assert_eq!(joined["wakes"], 0);
        assert_eq!(joined["telemetry"]["status"], "unknown");

        let agg = &row.site_state["aggregates"];
        assert_eq!(agg["temperatureC"]["count"], 1);
        assert_eq!(agg["wakes"], 1);
        assert_eq!(agg["imagesCaptured"], 1);
    }

    #[test]
    fn empty_window_is_rejected() {
        let f = fixture();
        let at = utc("2024-06-01T10:00:00Z");
        let err = f.aggregator.generate(&f.session, 0, at, at, at).unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }
}
