//! Wake schedule resolution.
//!
//! A schedule is a cron-like expression of which only the minute and hour
//! fields are interpreted (`m h * * *`). Each field is a wildcard, a step
//! (`*/N`), a list (`a,b,c`) or an exact value.
//!
//! Resolution runs an ordered list of independent slot matchers. The first
//! matcher that recognises the shape of the expression decides which
//! minutes and hours of a local day are wake slots; minute-granularity
//! matchers come first so `*/15 * * * *` stays a quarter-hourly schedule
//! instead of collapsing into an hourly one. Slots are laid out in the
//! site's local time and converted to UTC, so DST days get the right number
//! of wakes. An expression no matcher recognises (including `* * * * *`)
//! resolves to nothing and callers fall back to the default cadence.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ScheduleError;

/// One interpreted cron field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldSpec {
    Any,
    Step(u32),
    List(Vec<u32>),
    Exact(u32),
}

impl FieldSpec {
    fn parse(field: &'static str, raw: &str, max: u32) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidField {
            field,
            value: raw.to_string(),
            reason,
        };
        let number = |s: &str| -> Result<u32, ScheduleError> {
            let v: u32 = s
                .parse()
                .map_err(|_| invalid(format!("{s:?} is not a number")))?;
            if v > max {
                return Err(invalid(format!("{v} exceeds {max}")));
            }
            Ok(v)
        };

        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let n = number(step)?;
            if n == 0 {
                return Err(invalid("step must be positive".into()));
            }
            return Ok(Self::Step(n));
        }
        if raw.contains(',') {
            let mut values = raw
                .split(',')
                .map(|part| number(part.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            values.sort_unstable();
            values.dedup();
            return Ok(Self::List(values));
        }
        Ok(Self::Exact(number(raw)?))
    }

    /// Every value in `0..=max` the field admits.
    fn expand(&self, max: u32) -> Vec<u32> {
        match self {
            Self::Any => (0..=max).collect(),
            Self::Step(n) => (0..=max).step_by(*n as usize).collect(),
            Self::List(values) => values.clone(),
            Self::Exact(v) => vec![*v],
        }
    }
}

/// A parsed wake schedule expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: FieldSpec,
    hour: FieldSpec,
}

impl CronExpr {
    pub fn minute(&self) -> &FieldSpec {
        &self.minute
    }

    pub fn hour(&self) -> &FieldSpec {
        &self.hour
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(ScheduleError::MissingFields(trimmed.to_string()));
        }
        Ok(Self {
            source: trimmed.to_string(),
            minute: FieldSpec::parse("minute", fields[0], 59)?,
            hour: FieldSpec::parse("hour", fields[1], 23)?,
        })
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Minutes and hours of a local day at which a device should wake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slots {
    pub minutes: Vec<u32>,
    pub hours: Vec<u32>,
}

/// One entry of the ordered matcher list.
trait SlotMatcher: Sync {
    fn name(&self) -> &'static str;
    /// `None` means "not my shape, try the next matcher".
    fn slots(&self, expr: &CronExpr) -> Option<Slots>;
}

/// Minute used by hour-granularity matchers.
fn anchor_minute(minute: &FieldSpec) -> Option<Vec<u32>> {
    match minute {
        FieldSpec::Exact(m) => Some(vec![*m]),
        FieldSpec::Any => Some(vec![0]),
        _ => None,
    }
}

struct MinuteInterval;
impl SlotMatcher for MinuteInterval {
    fn name(&self) -> &'static str {
        "minute_interval"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        matches!(expr.minute, FieldSpec::Step(_)).then(|| Slots {
            minutes: expr.minute.expand(59),
            hours: expr.hour.expand(23),
        })
    }
}

struct MinuteList;
impl SlotMatcher for MinuteList {
    fn name(&self) -> &'static str {
        "minute_list"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        matches!(expr.minute, FieldSpec::List(_)).then(|| Slots {
            minutes: expr.minute.expand(59),
            hours: expr.hour.expand(23),
        })
    }
}

struct MinuteExact;
impl SlotMatcher for MinuteExact {
    fn name(&self) -> &'static str {
        "minute_exact"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        match (&expr.minute, &expr.hour) {
            (FieldSpec::Exact(m), FieldSpec::Any) => Some(Slots {
                minutes: vec![*m],
                hours: (0..=23).collect(),
            }),
            _ => None,
        }
    }
}

struct HourInterval;
impl SlotMatcher for HourInterval {
    fn name(&self) -> &'static str {
        "hour_interval"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        if !matches!(expr.hour, FieldSpec::Step(_)) {
            return None;
        }
        Some(Slots {
            minutes: anchor_minute(&expr.minute)?,
            hours: expr.hour.expand(23),
        })
    }
}

struct HourList;
impl SlotMatcher for HourList {
    fn name(&self) -> &'static str {
        "hour_list"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        if !matches!(expr.hour, FieldSpec::List(_)) {
            return None;
        }
        Some(Slots {
            minutes: anchor_minute(&expr.minute)?,
            hours: expr.hour.expand(23),
        })
    }
}

struct HourExact;
impl SlotMatcher for HourExact {
    fn name(&self) -> &'static str {
        "hour_exact"
    }
    fn slots(&self, expr: &CronExpr) -> Option<Slots> {
        if !matches!(expr.hour, FieldSpec::Exact(_)) {
            return None;
        }
        Some(Slots {
            minutes: anchor_minute(&expr.minute)?,
            hours: expr.hour.expand(23),
        })
    }
}

static MATCHERS: [&dyn SlotMatcher; 6] = [
    &MinuteInterval,
    &MinuteList,
    &MinuteExact,
    &HourInterval,
    &HourList,
    &HourExact,
];

/// Run the matcher list; returns the winning matcher's name and its slots.
pub fn match_slots(expr: &CronExpr) -> Option<(&'static str, Slots)> {
    MATCHERS
        .iter()
        .find_map(|m| m.slots(expr).map(|slots| (m.name(), slots)))
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Smallest slot instant strictly after `reference`.
fn next_slot(reference: DateTime<Utc>, slots: &Slots, tz: Tz) -> Option<DateTime<Utc>> {
    let start_date = reference.with_timezone(&tz).date_naive();
    // Three days covers any DST gap swallowing a daily slot.
    for offset in 0..=3 {
        let date = start_date.checked_add_days(Days::new(offset))?;
        let best = day_candidates(date, slots, tz)
            .filter(|t| *t > reference)
            .min();
        if best.is_some() {
            return best;
        }
    }
    None
}

fn day_candidates(
    date: NaiveDate,
    slots: &Slots,
    tz: Tz,
) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    slots.hours.iter().flat_map(move |&h| {
        slots.minutes.iter().flat_map(move |&m| {
            let local = match date.and_hms_opt(h, m, 0) {
                Some(naive) => tz.from_local_datetime(&naive),
                None => LocalResult::None,
            };
            let instants: Vec<DateTime<Utc>> = match local {
                LocalResult::Single(t) => vec![t.with_timezone(&Utc)],
                LocalResult::Ambiguous(a, b) => {
                    vec![a.with_timezone(&Utc), b.with_timezone(&Utc)]
                }
                // Nonexistent local time (spring-forward gap).
                LocalResult::None => vec![],
            };
            instants.into_iter()
        })
    })
}

/// Pure resolution: next wake strictly after `reference` for `expression`
/// interpreted in `timezone`.
pub fn resolve(
    reference: DateTime<Utc>,
    expression: &str,
    timezone: &str,
) -> Result<DateTime<Utc>, ScheduleError> {
    let expr: CronExpr = expression.parse()?;
    let tz = parse_timezone(timezone)?;
    WakePlan::Cron { expr, tz }
        .next_after(reference)
        .ok_or_else(|| ScheduleError::NoMatch(expression.to_string()))
}

/// A concrete, resolvable wake plan.
#[derive(Clone, Debug)]
pub enum WakePlan {
    Cron { expr: CronExpr, tz: Tz },
    /// Fixed cadence measured from the previous wake.
    Interval(Duration),
}

const MAX_OCCURRENCES: usize = 10_000;

impl WakePlan {
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { expr, tz } => {
                let (_, slots) = match_slots(expr)?;
                next_slot(reference, &slots, *tz)
            }
            Self::Interval(cadence) => Some(reference + *cadence),
        }
    }

    /// Expected wake instants in `[start, end)`.
    ///
    /// Fixed cadences have no anchor of their own, so their expected slots are
    /// aligned to multiples of the cadence since the Unix epoch.
    pub fn occurrences(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        if end <= start {
            return out;
        }
        match self {
            Self::Cron { expr, tz } => {
                let Some((_, slots)) = match_slots(expr) else {
                    return out;
                };
                // One pass per local day; the neighbours cover offsets either side of UTC.
                let first_day = start.with_timezone(tz).date_naive().pred_opt().unwrap_or(NaiveDate::MIN);
                let last_day = end.with_timezone(tz).date_naive();
                for date in first_day.iter_days().take_while(|d| *d <= last_day) {
                    let mut day: Vec<DateTime<Utc>> = day_candidates(date, &slots, *tz)
                        .filter(|t| *t >= start && *t < end)
                        .collect();
                    day.sort_unstable();
                    for t in day {
                        if out.last().is_some_and(|prev| *prev >= t) {
                            continue;
                        }
                        if out.len() >= MAX_OCCURRENCES {
                            return out;
                        }
                        out.push(t);
                    }
                }
            }
            Self::Interval(cadence) => {
                let step = cadence.num_seconds().max(60);
                let first = start.timestamp().div_euclid(step) * step;
                let first = if first < start.timestamp() { first + step } else { first };
                let mut ts = first;
                while ts < end.timestamp() && out.len() < MAX_OCCURRENCES {
                    if let Some(t) = DateTime::from_timestamp(ts, 0) {
                        out.push(t);
                    }
                    ts += step;
                }
            }
        }
        out
    }

    /// The last `n` expected wake instants at or before `end`, oldest first.
    pub fn trailing(&self, end: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        if n == 0 {
            return Vec::new();
        }
        let upper = end + Duration::seconds(1);
        let mut lookback_days = 1;
        loop {
            let found = self.occurrences(upper - Duration::days(lookback_days), upper);
            if found.len() >= n || lookback_days >= 16 {
                let skip = found.len().saturating_sub(n);
                return found.into_iter().skip(skip).collect();
            }
            lookback_days *= 2;
        }
    }
}

/// Which level of the precedence chain produced a wake plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    Device,
    Site,
    Default,
}

/// Outcome of resolving a device's next wake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WakeResolution {
    pub next_wake: DateTime<Utc>,
    pub source: ScheduleSource,
    /// Why a higher-precedence expression was skipped, if one was.
    pub fallback_reason: Option<String>,
}

/// Applies device → site → default precedence on top of [`WakePlan`].
#[derive(Clone, Debug)]
pub struct WakeScheduler {
    default_cadence: Duration,
}

impl WakeScheduler {
    pub fn new(default_cadence: Duration) -> Self {
        Self { default_cadence }
    }

    pub fn default_cadence(&self) -> Duration {
        self.default_cadence
    }

    pub fn default_plan(&self) -> WakePlan {
        WakePlan::Interval(self.default_cadence)
    }

    /// Pick the effective plan. A present expression that fails to parse (or
    /// that no matcher recognises) is skipped in favour of the next level.
    pub fn plan(
        &self,
        device_expr: Option<&str>,
        site_expr: Option<&str>,
        timezone: &str,
    ) -> (WakePlan, ScheduleSource, Option<String>) {
        let tz = parse_timezone(timezone).unwrap_or_else(|e| {
            warn!(error = %e, "falling back to UTC for schedule resolution");
            Tz::UTC
        });

        let mut reasons = Vec::new();
        for (source, raw) in [
            (ScheduleSource::Device, device_expr),
            (ScheduleSource::Site, site_expr),
        ] {
            let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
                continue;
            };
            match raw.parse::<CronExpr>() {
                Ok(expr) if match_slots(&expr).is_some() => {
                    let reason = (!reasons.is_empty()).then(|| reasons.join("; "));
                    return (WakePlan::Cron { expr, tz }, source, reason);
                }
                Ok(expr) => reasons.push(format!("{source:?} schedule {expr} has no wake slots")),
                Err(e) => reasons.push(format!("{source:?} schedule: {e}")),
            }
        }

        let reason = (!reasons.is_empty()).then(|| reasons.join("; "));
        if let Some(r) = &reason {
            warn!(reason = %r, "schedule unresolvable, using default cadence");
        }
        (self.default_plan(), ScheduleSource::Default, reason)
    }

    pub fn resolve(
        &self,
        reference: DateTime<Utc>,
        device_expr: Option<&str>,
        site_expr: Option<&str>,
        timezone: &str,
    ) -> WakeResolution {
        let (plan, source, fallback_reason) = self.plan(device_expr, site_expr, timezone);
        match plan.next_after(reference) {
            Some(next_wake) => WakeResolution {
                next_wake,
                source,
                fallback_reason,
            },
            None => WakeResolution {
                next_wake: reference + self.default_cadence,
                source: ScheduleSource::Default,
                fallback_reason: Some(format!("{source:?} schedule produced no future wake")),
            },
        }
    }

    /// Next wake under the default cadence only (unmapped devices).
    pub fn resolve_default(&self, reference: DateTime<Utc>) -> WakeResolution {
        WakeResolution {
            next_wake: reference + self.default_cadence,
            source: ScheduleSource::Default,
            fallback_reason: None,
        }
    }
}
