//! Recurring-schedule model: the ISO-8601 interval grammar
//! (`R[n]/start/duration`), calendar-aware interval stepping, and the
//! persisted `ScheduledCall` record with its next-run arithmetic.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Days, FixedOffset, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::models::call::{default_weight, CallId, CallRequest, CallTarget, LifecycleHooks};
use crate::models::error::{SiloError, SiloResult};
use crate::models::resource::{ResourceOperation, ResourceSet, ResourceType};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub u64);

impl Display for ScheduleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ISO-8601 duration reduced to the three step sizes that matter for
/// recurrence arithmetic. Months step calendar-aware (with end-of-month
/// clamping), days step whole days, seconds step exactly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IsoDuration {
    pub months: u32,
    pub days: u32,
    pub seconds: u64,
}

impl IsoDuration {
    pub fn is_zero(self) -> bool {
        self.months == 0 && self.days == 0 && self.seconds == 0
    }

    /// Parses `PnYnMnWnDTnHnMnS`. At least one component is required;
    /// fractional components are not supported.
    pub fn parse(value: &str) -> SiloResult<Self> {
        let body = value
            .strip_prefix('P')
            .ok_or_else(|| invalid_duration(value, "missing 'P' prefix"))?;
        if body.is_empty() {
            return Err(invalid_duration(value, "no components"));
        }

        let (date_part, time_part) = match body.split_once('T') {
            Some((_, time)) if time.is_empty() => {
                return Err(invalid_duration(value, "empty time section"));
            }
            Some((date, time)) => (date, Some(time)),
            None => (body, None),
        };

        let mut duration = IsoDuration::default();
        let mut seen = false;

        let out_of_range = || invalid_duration(value, "component out of range");

        for (number, designator) in components(date_part, value)? {
            seen = true;
            let amount = match designator {
                'Y' => checked_u32(number, value)?.checked_mul(12).ok_or_else(out_of_range)?,
                'M' => checked_u32(number, value)?,
                'W' => checked_u32(number, value)?.checked_mul(7).ok_or_else(out_of_range)?,
                'D' => checked_u32(number, value)?,
                other => {
                    return Err(invalid_duration(value, format!("unexpected designator '{other}'")));
                }
            };
            let field = match designator {
                'Y' | 'M' => &mut duration.months,
                _ => &mut duration.days,
            };
            *field = field.checked_add(amount).ok_or_else(out_of_range)?;
        }

        if let Some(time) = time_part {
            for (number, designator) in components(time, value)? {
                seen = true;
                let scale = match designator {
                    'H' => 3600,
                    'M' => 60,
                    'S' => 1,
                    other => {
                        return Err(invalid_duration(
                            value,
                            format!("unexpected time designator '{other}'"),
                        ));
                    }
                };
                let amount = number.checked_mul(scale).ok_or_else(out_of_range)?;
                duration.seconds = duration.seconds.checked_add(amount).ok_or_else(out_of_range)?;
            }
        }

        if !seen {
            return Err(invalid_duration(value, "no components"));
        }
        Ok(duration)
    }

    /// Advances an instant by one interval, preserving the zone offset.
    pub fn advance(self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let mut out = from;
        if self.months > 0 {
            out = out.checked_add_months(Months::new(self.months))?;
        }
        if self.days > 0 {
            out = out.checked_add_days(Days::new(u64::from(self.days)))?;
        }
        if self.seconds > 0 {
            out = out.checked_add_signed(chrono::Duration::seconds(i64::try_from(self.seconds).ok()?))?;
        }
        Some(out)
    }
}

impl Display for IsoDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P")?;
        if self.months >= 12 {
            write!(f, "{}Y", self.months / 12)?;
        }
        if self.months % 12 > 0 {
            write!(f, "{}M", self.months % 12)?;
        }
        if self.days > 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.seconds > 0 {
            write!(f, "T{}S", self.seconds)?;
        } else if self.months == 0 && self.days == 0 {
            write!(f, "T0S")?;
        }
        Ok(())
    }
}

fn components(section: &str, raw: &str) -> SiloResult<Vec<(u64, char)>> {
    let mut parsed = Vec::new();
    let mut digits = String::new();
    for ch in section.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if digits.is_empty() {
                return Err(invalid_duration(raw, format!("designator '{ch}' without a number")));
            }
            let number = digits
                .parse::<u64>()
                .map_err(|_| invalid_duration(raw, "component out of range"))?;
            parsed.push((number, ch));
            digits.clear();
        }
    }
    if !digits.is_empty() {
        return Err(invalid_duration(raw, "trailing digits without a designator"));
    }
    Ok(parsed)
}

fn checked_u32(number: u64, raw: &str) -> SiloResult<u32> {
    u32::try_from(number).map_err(|_| invalid_duration(raw, "component out of range"))
}

fn invalid_duration(raw: &str, detail: impl Display) -> SiloError {
    SiloError::invalid_input(format!("invalid ISO-8601 duration '{raw}': {detail}"))
}

/// Parsed form of the `R[n]/start/duration` interval grammar. `runs` is
/// `None` for unbounded recurrence (`R/` or no recurrence part at all).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub runs: Option<u32>,
    pub start: Option<DateTime<FixedOffset>>,
    pub duration: IsoDuration,
}

impl ScheduleSpec {
    pub fn parse(value: &str) -> SiloResult<Self> {
        let invalid = |detail: &str| {
            SiloError::invalid_input(format!("invalid schedule interval '{value}': {detail}"))
        };

        let parts: Vec<&str> = value.split('/').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid("expected R[n]/start/duration"));
        }

        let mut runs = None;
        let mut start = None;
        let mut duration = None;

        for (index, part) in parts.iter().enumerate() {
            if let Some(rest) = part.strip_prefix('R') {
                if index != 0 {
                    return Err(invalid("recurrence must be the first component"));
                }
                if !rest.is_empty() {
                    let count = rest
                        .parse::<u32>()
                        .map_err(|_| invalid("recurrence count is not a number"))?;
                    runs = Some(count);
                }
            } else if part.starts_with('P') {
                if duration.is_some() {
                    return Err(invalid("more than one duration component"));
                }
                duration = Some(IsoDuration::parse(part)?);
            } else {
                if start.is_some() {
                    return Err(invalid("more than one start instant"));
                }
                let instant = DateTime::parse_from_rfc3339(part)
                    .map_err(|err| invalid(&format!("bad start instant: {err}")))?;
                start = Some(instant);
            }
        }

        let duration = duration.ok_or_else(|| invalid("missing duration component"))?;
        if duration.is_zero() {
            return Err(invalid("duration must be nonzero"));
        }
        Ok(Self {
            runs,
            start,
            duration,
        })
    }

    /// First instant the schedule may fire: the declared start when given,
    /// otherwise one interval after `now`.
    pub fn first_run(&self, now: DateTime<FixedOffset>) -> SiloResult<DateTime<FixedOffset>> {
        match self.start {
            Some(start) => Ok(start),
            None => self
                .duration
                .advance(now)
                .ok_or_else(|| SiloError::invalid_input("schedule interval overflows the calendar")),
        }
    }

    /// Advances from a consumed firing instant to the next instant strictly
    /// after `now`, skipping every missed firing in between.
    pub fn advance_past(
        &self,
        from: DateTime<FixedOffset>,
        now: DateTime<FixedOffset>,
    ) -> SiloResult<DateTime<FixedOffset>> {
        let overflow =
            || SiloError::invalid_input("schedule interval overflows the calendar");
        let mut candidate = self.duration.advance(from).ok_or_else(overflow)?;
        while candidate <= now {
            candidate = self.duration.advance(candidate).ok_or_else(overflow)?;
        }
        Ok(candidate)
    }
}

/// The reusable half of a CallRequest: everything except the per-firing
/// identity. Materialized into a fresh request on every schedule firing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallTemplate {
    pub target: CallTarget,
    #[serde(default)]
    pub resources: ResourceSet,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub callbacks: LifecycleHooks,
}

impl CallTemplate {
    pub fn new(target: CallTarget) -> Self {
        Self {
            target,
            resources: ResourceSet::new(),
            tags: Vec::new(),
            weight: default_weight(),
            archive: false,
            callbacks: LifecycleHooks::new(),
        }
    }

    pub fn declaring(
        mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> Self {
        self.resources.declare(resource_type, resource_id, operation);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn materialize(&self, id: CallId, schedule_id: ScheduleId) -> CallRequest {
        let mut request = CallRequest::new(id, self.target.clone());
        request.resources = self.resources.clone();
        request.tags = self.tags.clone();
        request.tags.push(format!("schedule:{schedule_id}"));
        request.weight = self.weight;
        request.archive = self.archive;
        request.callbacks = self.callbacks.clone();
        request.schedule_id = Some(schedule_id);
        request
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: ScheduleId,
    pub template: CallTemplate,
    pub schedule: String,
    pub failure_threshold: Option<u32>,
    pub consecutive_failures: u32,
    pub enabled: bool,
    pub first_run: DateTime<FixedOffset>,
    pub last_run: Option<DateTime<FixedOffset>>,
    pub next_run: Option<DateTime<FixedOffset>>,
    pub remaining_runs: Option<u32>,
}

impl ScheduledCall {
    pub fn new(
        id: ScheduleId,
        template: CallTemplate,
        schedule: impl Into<String>,
        failure_threshold: Option<u32>,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> SiloResult<Self> {
        let schedule = schedule.into();
        let spec = ScheduleSpec::parse(&schedule)?;
        if spec.runs == Some(0) {
            return Err(SiloError::invalid_input(
                "schedule declares zero runs and would never fire",
            ));
        }
        if let Some(0) = failure_threshold {
            return Err(SiloError::invalid_input("failure_threshold must be positive"));
        }
        let first_run = spec.first_run(now.fixed_offset())?;
        Ok(Self {
            id,
            template,
            schedule,
            failure_threshold,
            consecutive_failures: 0,
            enabled,
            first_run,
            last_run: None,
            next_run: Some(first_run),
            remaining_runs: spec.runs,
        })
    }

    pub fn spec(&self) -> SiloResult<ScheduleSpec> {
        ScheduleSpec::parse(&self.schedule)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_run, Some(next) if next <= now.fixed_offset())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_runs == Some(0) || self.next_run.is_none()
    }

    /// Consumes the current `next_run` as a firing: the scheduled instant
    /// (not the wall clock) becomes `last_run` so repeated firings do not
    /// drift, the bounded run count is decremented, and `next_run` moves
    /// past every missed instant.
    pub fn advance_after_firing(&mut self, now: DateTime<Utc>) -> SiloResult<()> {
        let spec = self.spec()?;
        let fired = self
            .next_run
            .ok_or_else(|| SiloError::internal(format!("schedule {} fired without next_run", self.id)))?;
        self.last_run = Some(fired);
        if let Some(remaining) = self.remaining_runs.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        if self.remaining_runs == Some(0) {
            self.next_run = None;
            return Ok(());
        }
        self.next_run = Some(spec.advance_past(fired, now.fixed_offset())?);
        Ok(())
    }

    /// Moves a stale `next_run` past `now` without consuming a firing.
    /// Applied to disabled schedules each cycle so re-enabling them does
    /// not burst through the backlog of missed instants.
    pub fn skip_to_future(&mut self, now: DateTime<Utc>) -> SiloResult<bool> {
        let spec = self.spec()?;
        let now = now.fixed_offset();
        match self.next_run {
            Some(next) if next <= now => {
                self.next_run = Some(spec.advance_past(next, now)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.template.tags.contains(tag))
    }
}
