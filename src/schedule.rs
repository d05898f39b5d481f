// Schedule resolution: (station, wall-clock instant) -> what to play, and
// how far into it.
//
// Resolution never fails. The chain is: exact block match, then a
// time-of-day match so a single authored day keeps looping, then the first
// block from its top, then a synthetic placeholder. Overlapping blocks are
// settled by definition order: the first block defined wins.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{info, warn};

use crate::station::StationLineup;

/// Path of the synthetic entry handed out when nothing can be resolved.
pub const PLACEHOLDER_PATH: &str = "placeholder";

/// Duration (seconds) of the synthetic placeholder entry.
pub const PLACEHOLDER_DURATION: f64 = 30.0;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub path: String,
    #[serde(default, deserialize_with = "de_seconds")]
    pub duration: f64,
    #[serde(default, deserialize_with = "de_seconds")]
    pub skip: f64,
    #[serde(default)]
    pub is_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduleBlock {
    #[serde(deserialize_with = "de_timestamp")]
    pub start_time: PrimitiveDateTime,
    #[serde(deserialize_with = "de_timestamp")]
    pub end_time: PrimitiveDateTime,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
}

impl ScheduleBlock {
    fn contains(&self, when: PrimitiveDateTime) -> bool {
        self.start_time <= when && when < self.end_time
    }

    fn span_seconds(&self) -> i64 {
        (self.end_time - self.start_time).whole_seconds()
    }
}

/// A resolved instruction: play `plan[index]` starting `offset` seconds in.
///
/// An empty `plan` means the instant fell in dead air and nothing can play.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayPoint {
    pub plan: Vec<PlanEntry>,
    pub index: usize,
    pub offset: f64,
}

impl PlayPoint {
    pub fn placeholder() -> Self {
        Self {
            plan: vec![PlanEntry {
                path: PLACEHOLDER_PATH.to_string(),
                duration: PLACEHOLDER_DURATION,
                skip: 0.0,
                is_stream: false,
            }],
            index: 0,
            offset: 0.0,
        }
    }

    fn unplayable() -> Self {
        Self {
            plan: Vec::new(),
            index: 0,
            offset: 0.0,
        }
    }

    pub fn current(&self) -> Option<&PlanEntry> {
        self.plan.get(self.index)
    }

    pub fn is_placeholder(&self) -> bool {
        self.plan.len() == 1 && self.plan[0].path == PLACEHOLDER_PATH
    }

    /// True when there is a real entry to put on air.
    pub fn is_playable(&self) -> bool {
        !self.is_placeholder() && self.current().is_some()
    }
}

/// Seconds since local midnight.
fn seconds_of_day(t: PrimitiveDateTime) -> i64 {
    let (h, m, s) = t.time().as_hms();
    h as i64 * 3600 + m as i64 * 60 + s as i64
}

/// Walk the block's plan from its start to find the entry on air at `when`.
fn point_in_block(block: &ScheduleBlock, when: PrimitiveDateTime) -> PlayPoint {
    let elapsed = (when - block.start_time).as_seconds_f64().max(0.0);

    let mut entry_start = 0.0;
    for (index, entry) in block.plan.iter().enumerate() {
        if entry.duration > 0.0 && elapsed < entry_start + entry.duration {
            return PlayPoint {
                plan: block.plan.clone(),
                index,
                offset: (elapsed - entry_start).max(0.0),
            };
        }
        entry_start += entry.duration.max(0.0);
    }

    PlayPoint::unplayable()
}

/// Resolve against an ordered block list. Pure; see the module notes for the
/// fallback chain.
pub fn resolve_blocks(blocks: &[ScheduleBlock], when: PrimitiveDateTime) -> PlayPoint {
    if let Some(block) = blocks.iter().find(|b| b.contains(when)) {
        return point_in_block(block, when);
    }

    let tod = seconds_of_day(when);
    for block in blocks {
        let span = block.span_seconds();
        if span <= 0 {
            continue;
        }
        let into = (tod - seconds_of_day(block.start_time)).rem_euclid(SECONDS_PER_DAY);
        if into < span {
            let synthetic =
                block.start_time + Duration::seconds(into) + Duration::nanoseconds(when.nanosecond() as i64);
            return point_in_block(block, synthetic);
        }
    }

    match blocks.first() {
        Some(first) => point_in_block(first, first.start_time),
        None => PlayPoint::placeholder(),
    }
}

/// Per-station schedules, read-only once loaded. Reload means restart.
#[derive(Debug, Default)]
pub struct ScheduleResolver {
    schedules: HashMap<String, Vec<ScheduleBlock>>,
}

impl ScheduleResolver {
    pub fn new(schedules: HashMap<String, Vec<ScheduleBlock>>) -> Self {
        Self { schedules }
    }

    /// Load every station's schedule file. A station without a readable
    /// schedule simply resolves to the placeholder.
    pub fn load(lineup: &StationLineup, dir: &Path) -> Self {
        let mut schedules = HashMap::new();
        for station in lineup.iter().filter(|s| !s.is_guide()) {
            let path = station.schedule_file(dir);
            match load_schedule_file(&path) {
                Ok(blocks) => {
                    info!(
                        "loaded {} schedule blocks for {} from {}",
                        blocks.len(),
                        station.network_name,
                        path.display()
                    );
                    schedules.insert(station.network_name.clone(), blocks);
                }
                Err(e) => warn!("no schedule for {}: {e:#}", station.network_name),
            }
        }
        Self::new(schedules)
    }

    pub fn blocks(&self, station: &str) -> &[ScheduleBlock] {
        self.schedules.get(station).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn resolve(&self, station: &str, when: PrimitiveDateTime) -> PlayPoint {
        resolve_blocks(self.blocks(station), when)
    }
}

pub fn load_schedule_file(path: &Path) -> anyhow::Result<Vec<ScheduleBlock>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let blocks = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(blocks)
}

/// Current wall-clock time as a naive local date-time. Falls back to UTC
/// when the local offset cannot be determined.
pub fn local_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    PrimitiveDateTime::new(now.date(), now.time())
}

pub fn parse_timestamp(s: &str) -> Option<PrimitiveDateTime> {
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    let s = s.trim();
    if let Ok(t) = PrimitiveDateTime::parse(s, naive) {
        return Some(t);
    }
    // Offset-qualified stamps are taken at face value on the wall clock.
    OffsetDateTime::parse(s, &Rfc3339)
        .ok()
        .map(|t| PrimitiveDateTime::new(t.date(), t.time()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Plain(String),
    Tagged {
        #[serde(rename = "__type__")]
        _kind: Option<String>,
        value: String,
    },
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<PrimitiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Plain(s) => s,
        RawTimestamp::Tagged { value, .. } => value,
    };
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn de_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}
