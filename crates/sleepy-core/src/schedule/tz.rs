//! POSIX `TZ` rule strings, e.g. `EST5EDT,M3.2.0,M11.1.0` or `<+0330>-3:30`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use heapless::Vec as HeaplessVec;

const SECONDS_PER_HOUR: i32 = 3_600;
const DEFAULT_TRANSITION_SECONDS: i32 = 2 * SECONDS_PER_HOUR;
const MAX_RULE_HOURS: i32 = 167;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TzParseError {
    InvalidName,
    InvalidOffset,
    InvalidRule,
    TrailingCharacters,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RuleDate {
    /// `Mm.w.d`: weekday `d` (0 = Sunday) of week `w` (5 = last) in month `m`.
    MonthWeekDay { month: u32, week: u32, weekday: u32 },
    /// `Jn`: day 1..=365, February 29 never counted.
    JulianNoLeap(u32),
    /// `n`: day 0..=365, February 29 counted.
    DayOfYear(u32),
}

impl RuleDate {
    fn date_in(self, year: i32) -> Option<NaiveDate> {
        match self {
            Self::MonthWeekDay {
                month,
                week,
                weekday,
            } => {
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                let first_weekday = first.weekday().num_days_from_sunday();
                let mut day = 1 + (weekday + 7 - first_weekday) % 7 + (week - 1) * 7;
                while NaiveDate::from_ymd_opt(year, month, day).is_none() {
                    day -= 7;
                }
                NaiveDate::from_ymd_opt(year, month, day)
            }
            Self::JulianNoLeap(day) => {
                let leap = NaiveDate::from_ymd_opt(year, 2, 29).is_some();
                let skip = u32::from(leap && day >= 60);
                NaiveDate::from_yo_opt(year, day + skip)
            }
            Self::DayOfYear(day) => NaiveDate::from_yo_opt(year, day + 1),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Transition {
    date: RuleDate,
    /// Local wall-clock seconds after midnight, in the offset in force before the change.
    time: i32,
}

impl Transition {
    fn local_seconds(self, year: i32) -> Option<i64> {
        let midnight = self.date.date_in(year)?.and_hms_opt(0, 0, 0)?;
        Some(midnight.and_utc().timestamp() + i64::from(self.time))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct DaylightRule {
    name: String,
    offset: i32,
    start: Transition,
    end: Transition,
}

/// Local-time rules for one zone. Offsets are seconds east of UTC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeZone {
    name: String,
    offset: i32,
    daylight: Option<DaylightRule>,
}

impl TimeZone {
    pub fn utc() -> Self {
        Self {
            name: "UTC".to_owned(),
            offset: 0,
            daylight: None,
        }
    }

    /// Parses `std offset [dst [offset] [,start[/time],end[/time]]]`. An empty string
    /// is UTC. Daylight time without explicit rules follows `M3.2.0,M11.1.0`.
    pub fn parse(posix: &str) -> Result<Self, TzParseError> {
        let posix = posix.trim();
        if posix.is_empty() {
            return Ok(Self::utc());
        }

        let mut cursor = Cursor::new(posix);
        let name = cursor.name()?;
        let offset = if cursor.at_end() {
            0
        } else {
            -cursor.offset(24).ok_or(TzParseError::InvalidOffset)?
        };

        let daylight = if cursor.at_end() {
            None
        } else {
            let dst_name = cursor.name()?;
            let dst_offset = match cursor.peek() {
                None | Some(b',') => offset + SECONDS_PER_HOUR,
                Some(_) => -cursor.offset(24).ok_or(TzParseError::InvalidOffset)?,
            };
            let (start, end) = if cursor.eat(b',') {
                let start = cursor.transition()?;
                if !cursor.eat(b',') {
                    return Err(TzParseError::InvalidRule);
                }
                (start, cursor.transition()?)
            } else {
                (
                    Transition {
                        date: RuleDate::MonthWeekDay {
                            month: 3,
                            week: 2,
                            weekday: 0,
                        },
                        time: DEFAULT_TRANSITION_SECONDS,
                    },
                    Transition {
                        date: RuleDate::MonthWeekDay {
                            month: 11,
                            week: 1,
                            weekday: 0,
                        },
                        time: DEFAULT_TRANSITION_SECONDS,
                    },
                )
            };
            Some(DaylightRule {
                name: dst_name,
                offset: dst_offset,
                start,
                end,
            })
        };

        if !cursor.at_end() {
            return Err(TzParseError::TrailingCharacters);
        }
        Ok(Self {
            name,
            offset,
            daylight,
        })
    }

    pub fn standard_name(&self) -> &str {
        &self.name
    }

    pub fn has_daylight_time(&self) -> bool {
        self.daylight.is_some()
    }

    /// Offset from UTC in force at `utc`.
    pub fn offset_at(&self, utc: i64) -> i32 {
        match self.daylight.as_ref() {
            Some(rule) if self.in_daylight_time(rule, utc) => rule.offset,
            _ => self.offset,
        }
    }

    pub fn is_daylight_time(&self, utc: i64) -> bool {
        self.daylight
            .as_ref()
            .is_some_and(|rule| self.in_daylight_time(rule, utc))
    }

    /// Abbreviation in force at `utc`.
    pub fn abbreviation_at(&self, utc: i64) -> &str {
        match self.daylight.as_ref() {
            Some(rule) if self.in_daylight_time(rule, utc) => &rule.name,
            _ => &self.name,
        }
    }

    fn in_daylight_time(&self, rule: &DaylightRule, utc: i64) -> bool {
        let year = year_of(utc + i64::from(self.offset));
        let (Some(start), Some(end)) = (rule.start.local_seconds(year), rule.end.local_seconds(year))
        else {
            return false;
        };
        let start = start - i64::from(self.offset);
        let end = end - i64::from(rule.offset);
        if start < end {
            utc >= start && utc < end
        } else {
            // Southern hemisphere: daylight time spans the new year.
            utc >= start || utc < end
        }
    }

    pub fn to_local(&self, utc: i64) -> Option<NaiveDateTime> {
        let local = utc + i64::from(self.offset_at(utc));
        DateTime::from_timestamp(local, 0).map(|time| time.naive_utc())
    }

    /// Every instant showing `local` on the wall clock, earliest first.
    ///
    /// A time repeated when clocks go back yields both instants. A time skipped when
    /// clocks go forward maps forward by the size of the gap.
    pub fn local_to_utc(&self, local: NaiveDateTime) -> HeaplessVec<i64, 2> {
        let wall = local.and_utc().timestamp();
        let mut found: HeaplessVec<i64, 2> = HeaplessVec::new();

        let mut offsets = [self.offset, self.offset];
        if let Some(rule) = self.daylight.as_ref() {
            offsets[1] = rule.offset;
        }
        for offset in offsets {
            let candidate = wall - i64::from(offset);
            if self.offset_at(candidate) == offset && !found.contains(&candidate) {
                let _ = found.push(candidate);
            }
        }

        if found.is_empty() {
            let forward = offsets
                .iter()
                .map(|offset| wall - i64::from(*offset))
                .max()
                .unwrap_or(wall);
            let _ = found.push(forward);
        }
        found.sort_unstable();
        found
    }
}

impl Default for TimeZone {
    fn default() -> Self {
        Self::utc()
    }
}

fn year_of(seconds: i64) -> i32 {
    DateTime::from_timestamp(seconds, 0).map_or(1970, |time| time.year())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn name(&mut self) -> Result<String, TzParseError> {
        let start = self.pos;
        let name = if self.eat(b'<') {
            while self.peek().is_some_and(|b| b != b'>') {
                self.pos += 1;
            }
            let name = &self.bytes[start + 1..self.pos];
            if !self.eat(b'>') {
                return Err(TzParseError::InvalidName);
            }
            name
        } else {
            while self.peek().is_some_and(|b| b.is_ascii_alphabetic()) {
                self.pos += 1;
            }
            &self.bytes[start..self.pos]
        };

        if name.len() < 3 {
            return Err(TzParseError::InvalidName);
        }
        String::from_utf8(name.to_vec()).map_err(|_| TzParseError::InvalidName)
    }

    fn number(&mut self, max_digits: usize) -> Option<i32> {
        let start = self.pos;
        let mut value = 0i32;
        while self.pos - start < max_digits
            && let Some(digit) = self.peek().filter(u8::is_ascii_digit)
        {
            value = value * 10 + i32::from(digit - b'0');
            self.pos += 1;
        }
        (self.pos > start).then_some(value)
    }

    /// `[+-]hh[:mm[:ss]]` as signed seconds, POSIX sign (positive is west of UTC).
    fn offset(&mut self, max_hours: i32) -> Option<i32> {
        let sign = if self.eat(b'-') {
            -1
        } else {
            self.eat(b'+');
            1
        };
        let hours = self.number(3).filter(|h| *h <= max_hours)?;
        let mut seconds = hours * SECONDS_PER_HOUR;
        if self.eat(b':') {
            seconds += self.number(2).filter(|m| *m < 60)? * 60;
            if self.eat(b':') {
                seconds += self.number(2).filter(|s| *s < 60)?;
            }
        }
        Some(sign * seconds)
    }

    fn transition(&mut self) -> Result<Transition, TzParseError> {
        let date = if self.eat(b'M') {
            let month = self.number(2).filter(|m| (1..=12).contains(m));
            let week = self.eat(b'.').then(|| self.number(1)).flatten();
            let weekday = self.eat(b'.').then(|| self.number(1)).flatten();
            match (month, week, weekday) {
                (Some(month), Some(week), Some(weekday))
                    if (1..=5).contains(&week) && weekday <= 6 =>
                {
                    RuleDate::MonthWeekDay {
                        month: month as u32,
                        week: week as u32,
                        weekday: weekday as u32,
                    }
                }
                _ => return Err(TzParseError::InvalidRule),
            }
        } else if self.eat(b'J') {
            match self.number(3) {
                Some(day) if (1..=365).contains(&day) => RuleDate::JulianNoLeap(day as u32),
                _ => return Err(TzParseError::InvalidRule),
            }
        } else {
            match self.number(3) {
                Some(day) if day <= 365 => RuleDate::DayOfYear(day as u32),
                _ => return Err(TzParseError::InvalidRule),
            }
        };

        let time = if self.eat(b'/') {
            // Rule times use the plain sign: `/-1` is an hour before midnight.
            let sign = if self.eat(b'-') { -1 } else { 1 };
            sign * self
                .offset(MAX_RULE_HOURS)
                .filter(|seconds| *seconds >= 0)
                .ok_or(TzParseError::InvalidRule)?
        } else {
            DEFAULT_TRANSITION_SECONDS
        };
        Ok(Transition { date, time })
    }
}
