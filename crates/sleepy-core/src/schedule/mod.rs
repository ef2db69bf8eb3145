//! Named wake schedules evaluated in local time.
//!
//! Each [`Schedule`] holds a few rules such as "every 15 minutes" or "at 08:30", each
//! optionally limited to some weekdays and a range of hours. The [`ScheduleManager`]
//! finds the next instant any schedule fires, converting through a POSIX time zone.

use core::{fmt, str::FromStr};

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use heapless::Vec as HeaplessVec;
use log::{debug, warn};

mod tz;

pub use tz::{TimeZone, TzParseError};

pub const MAX_SCHEDULE_RULES: usize = 8;
pub const QUICK_SCHEDULE: &str = "quick";
pub const FULL_SCHEDULE: &str = "full";
pub const DATA_SCHEDULE: &str = "data";

/// Local days searched ahead of `now`.
const SEARCH_DAYS: u64 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleError {
    InvalidTime,
    InvalidIncrement,
    TooManyRules,
    TimeZone(TzParseError),
}

impl From<TzParseError> for ScheduleError {
    fn from(err: TzParseError) -> Self {
        Self::TimeZone(err)
    }
}

/// Wall-clock time of day.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Hms {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Hms {
    pub const MIDNIGHT: Self = Self::new(0, 0, 0);
    pub const END_OF_DAY: Self = Self::new(23, 59, 59);

    pub const fn new(hour: u8, minute: u8, second: u8) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    pub const fn seconds(self) -> u32 {
        self.hour as u32 * 3_600 + self.minute as u32 * 60 + self.second as u32
    }

    fn is_valid(self) -> bool {
        self.hour < 24 && self.minute < 60 && self.second < 60
    }

    fn to_naive(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }
}

/// Parses `H:MM` or `H:MM:SS`.
impl FromStr for Hms {
    type Err = ScheduleError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.trim().split(':');
        let mut field = |required: bool| -> Result<u8, ScheduleError> {
            match parts.next() {
                Some(part) if !part.is_empty() && part.len() <= 2 => {
                    part.parse().map_err(|_| ScheduleError::InvalidTime)
                }
                None if !required => Ok(0),
                _ => Err(ScheduleError::InvalidTime),
            }
        };
        let hms = Self::new(field(true)?, field(true)?, field(false)?);
        if parts.next().is_some() || !hms.is_valid() {
            return Err(ScheduleError::InvalidTime);
        }
        Ok(hms)
    }
}

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

/// Days of the week, bit 0 is Sunday.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DayOfWeekMask(u8);

impl DayOfWeekMask {
    pub const SUNDAY: Self = Self(0x01);
    pub const MONDAY: Self = Self(0x02);
    pub const TUESDAY: Self = Self(0x04);
    pub const WEDNESDAY: Self = Self(0x08);
    pub const THURSDAY: Self = Self(0x10);
    pub const FRIDAY: Self = Self(0x20);
    pub const SATURDAY: Self = Self(0x40);
    pub const WEEKDAYS: Self = Self(0x3e);
    pub const WEEKEND: Self = Self(0x41);
    pub const ALL: Self = Self(0x7f);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }
}

impl Default for DayOfWeekMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Limits a rule to some weekdays and, optionally, an inclusive range of times.
/// A range whose end is before its start spans midnight.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Restriction {
    pub weekdays: DayOfWeekMask,
    pub hours: Option<(Hms, Hms)>,
}

impl Restriction {
    pub fn weekdays(weekdays: DayOfWeekMask) -> Self {
        Self {
            weekdays,
            hours: None,
        }
    }

    pub fn hours(start: Hms, end: Hms) -> Self {
        Self {
            weekdays: DayOfWeekMask::ALL,
            hours: Some((start, end)),
        }
    }

    pub fn with_hours(mut self, start: Hms, end: Hms) -> Self {
        self.hours = Some((start, end));
        self
    }

    fn allows_day(&self, day: Weekday) -> bool {
        self.weekdays.contains(day)
    }

    fn allows_time(&self, time: Hms) -> bool {
        match self.hours {
            None => true,
            Some((start, end)) if start <= end => time >= start && time <= end,
            Some((start, end)) => time >= start || time <= end,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleRule {
    /// Every `n` minutes, on minutes divisible by `n`.
    MinuteOfHour(u8),
    /// Every `n` hours, on hours divisible by `n`.
    HourOfDay(u8),
    TimeOfDay(Hms),
}

impl ScheduleRule {
    fn validate(self) -> Result<Self, ScheduleError> {
        match self {
            Self::MinuteOfHour(n) if n == 0 || n > 60 => Err(ScheduleError::InvalidIncrement),
            Self::HourOfDay(n) if n == 0 || n > 24 => Err(ScheduleError::InvalidIncrement),
            Self::TimeOfDay(time) if !time.is_valid() => Err(ScheduleError::InvalidTime),
            rule => Ok(rule),
        }
    }

    /// Local times at which this rule fires, ascending. Minute increments restart at
    /// the top of every hour.
    fn times_of_day(self) -> impl Iterator<Item = Hms> {
        let (hour_step, minute_step, fixed) = match self {
            Self::MinuteOfHour(n) => (1, usize::from(n), None),
            Self::HourOfDay(n) => (usize::from(n), 60, None),
            Self::TimeOfDay(time) => (24, 60, Some(time)),
        };
        (0..24u8)
            .step_by(hour_step)
            .flat_map(move |hour| {
                (0..60u8)
                    .step_by(minute_step)
                    .map(move |minute| Hms::new(hour, minute, 0))
            })
            .map(move |time| fixed.unwrap_or(time))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ScheduleEntry {
    rule: ScheduleRule,
    restriction: Restriction,
}

/// Wake kinds a schedule asks for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScheduleFlags(u8);

impl ScheduleFlags {
    pub const QUICK_WAKE: Self = Self(0x01);
    pub const FULL_WAKE: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schedule {
    flags: ScheduleFlags,
    entries: HeaplessVec<ScheduleEntry, MAX_SCHEDULE_RULES>,
}

impl Schedule {
    pub fn new(flags: ScheduleFlags) -> Self {
        Self {
            flags,
            entries: HeaplessVec::new(),
        }
    }

    pub fn flags(&self) -> ScheduleFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ScheduleFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn add_rule(
        &mut self,
        rule: ScheduleRule,
        restriction: Option<Restriction>,
    ) -> Result<&mut Self, ScheduleError> {
        let entry = ScheduleEntry {
            rule: rule.validate()?,
            restriction: restriction.unwrap_or_default(),
        };
        self.entries
            .push(entry)
            .map_err(|_| ScheduleError::TooManyRules)?;
        Ok(self)
    }

    fn with_rule(&mut self, rule: ScheduleRule, restriction: Option<Restriction>) -> &mut Self {
        if let Err(err) = self.add_rule(rule, restriction) {
            warn!("schedule: rule {:?} rejected: {:?}", rule, err);
        }
        self
    }

    pub fn with_minute_of_hour(&mut self, n: u8, restriction: Option<Restriction>) -> &mut Self {
        self.with_rule(ScheduleRule::MinuteOfHour(n), restriction)
    }

    pub fn with_hour_of_day(&mut self, n: u8, restriction: Option<Restriction>) -> &mut Self {
        self.with_rule(ScheduleRule::HourOfDay(n), restriction)
    }

    pub fn with_time_of_day(&mut self, time: Hms, restriction: Option<Restriction>) -> &mut Self {
        self.with_rule(ScheduleRule::TimeOfDay(time), restriction)
    }

    /// First instant strictly after `now` at which any rule fires.
    pub fn next_after(&self, now: i64, tz: &TimeZone) -> Option<i64> {
        if self.entries.is_empty() {
            return None;
        }
        let today = tz.to_local(now)?.date();
        // The previous local day can still have instants after `now` around a fold.
        let first_day = today.pred_opt().unwrap_or(today);
        (0..=SEARCH_DAYS)
            .filter_map(|offset| first_day.checked_add_days(Days::new(offset)))
            .find_map(|day| self.earliest_on(day, now, tz))
    }

    fn earliest_on(&self, day: NaiveDate, now: i64, tz: &TimeZone) -> Option<i64> {
        let weekday = day.weekday();
        self.entries
            .iter()
            .filter(|entry| entry.restriction.allows_day(weekday))
            .flat_map(|entry| {
                entry
                    .rule
                    .times_of_day()
                    .filter(move |time| entry.restriction.allows_time(*time))
            })
            .filter_map(|time| time.to_naive().map(|time| day.and_time(time)))
            .flat_map(|local| tz.local_to_utc(local))
            .filter(|instant| *instant > now)
            .min()
    }
}

/// Result of [`ScheduleManager::next_wake`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NextWake {
    pub time: i64,
    pub full: bool,
}

/// Schedules by name plus the zone they are evaluated in.
#[derive(Clone, Debug, Default)]
pub struct ScheduleManager {
    schedules: Vec<(String, Schedule)>,
    time_zone: TimeZone,
}

impl ScheduleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_zone(&self) -> &TimeZone {
        &self.time_zone
    }

    pub fn set_time_zone(&mut self, time_zone: TimeZone) {
        self.time_zone = time_zone;
    }

    pub fn set_posix_time_zone(&mut self, posix: &str) -> Result<(), ScheduleError> {
        self.time_zone = TimeZone::parse(posix)?;
        Ok(())
    }

    /// The schedule called `name`, created empty on first use.
    pub fn schedule_mut(&mut self, name: &str) -> &mut Schedule {
        let index = match self.schedules.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.schedules
                    .push((name.to_owned(), Schedule::new(ScheduleFlags::empty())));
                self.schedules.len() - 1
            }
        };
        &mut self.schedules[index].1
    }

    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        self.schedules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, schedule)| schedule)
    }

    /// `true` when `name` is missing or has no rules.
    pub fn is_empty(&self, name: &str) -> bool {
        self.schedule(name).is_none_or(Schedule::is_empty)
    }

    /// Earliest instant after `now` across every schedule. Equal instants report a
    /// full wake.
    pub fn next_wake(&self, now: i64) -> Option<NextWake> {
        let mut best: Option<NextWake> = None;
        for (name, schedule) in self.schedules.iter() {
            let Some(time) = schedule.next_after(now, &self.time_zone) else {
                continue;
            };
            let full = schedule.flags().contains(ScheduleFlags::FULL_WAKE);
            debug!("schedule: {} next {} full={}", name, time, full);
            best = match best {
                Some(current) if current.time < time => Some(current),
                Some(current) if current.time == time => Some(NextWake {
                    time,
                    full: current.full || full,
                }),
                _ => Some(NextWake { time, full }),
            };
        }
        best
    }

    pub fn next_full_wake(&self, now: i64) -> Option<i64> {
        self.schedules
            .iter()
            .filter(|(_, schedule)| schedule.flags().contains(ScheduleFlags::FULL_WAKE))
            .filter_map(|(_, schedule)| schedule.next_after(now, &self.time_zone))
            .min()
    }

    pub fn next_data_capture(&self, now: i64) -> Option<i64> {
        self.schedule(DATA_SCHEDULE)?
            .next_after(now, &self.time_zone)
    }
}
