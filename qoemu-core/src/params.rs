//! Parameter table: the read-only store of stimulus definitions.
//!
//! The table is a semicolon-delimited text file. The first row is a header,
//! every following row is keyed by `TYPE-TABLE-ENTRY` in its first column.
//! Rows whose key does not have that shape are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::artifact::Step;

pub type ParamResult<T> = Result<T, ParamError>;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("failed to read parameter file {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("parameter file has no header row")]
    MissingHeader,
    #[error("parameter file is missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("{key}: invalid value '{value}' in column '{column}'")]
    InvalidValue {
        key: String,
        column: String,
        value: String,
    },
    #[error("{key}: duplicate row")]
    DuplicateKey { key: String },
    #[error("invalid stimulus key '{0}', expected TYPE-TABLE-ENTRY")]
    InvalidKey(String),
}

/// `(type, table, entry)`; renders as `TYPE-TABLE-ENTRY`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StimulusKey {
    pub type_id: String,
    pub table_id: String,
    pub entry_id: String,
}

impl StimulusKey {
    pub fn new(
        type_id: impl Into<String>,
        table_id: impl Into<String>,
        entry_id: impl Into<String>,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            table_id: table_id.into(),
            entry_id: entry_id.into(),
        }
    }
}

impl fmt::Display for StimulusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.type_id, self.table_id, self.entry_id)
    }
}

impl FromStr for StimulusKey {
    type Err = ParamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        let valid = |part: &&str| {
            !part.is_empty() && part.chars().all(|ch| ch.is_ascii_alphanumeric())
        };
        if parts.len() != 3 || !parts.iter().all(valid) {
            return Err(ParamError::InvalidKey(value.to_string()));
        }
        Ok(StimulusKey::new(parts[0], parts[1], parts[2]))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StimulusParameters {
    /// Initial buffering to synthesize in post, milliseconds.
    pub t_init: u64,
    /// Upstream rate cap, kbit/s.
    pub rul: f64,
    /// Downstream rate cap, kbit/s.
    pub rdl: f64,
    /// Upstream one-way delay, milliseconds.
    pub dul: f64,
    /// Downstream one-way delay, milliseconds.
    pub ddl: f64,
    pub codec: Option<String>,
    pub genbufn: u32,
    /// Duration of each synthetic mid-stream stall, milliseconds.
    pub genbuft: u64,
    pub dynamic: Option<String>,
    pub link: String,
    pub start: Duration,
    pub end: Duration,
    pub resolution: Option<String>,
}

impl StimulusParameters {
    /// Length of the recorded use case.
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    /// Whether two records may share the artifact of `step`.
    pub fn interchangeable(&self, other: &StimulusParameters, step: Step) -> bool {
        let shaping_equal = self.rul == other.rul
            && self.rdl == other.rdl
            && self.dul == other.dul
            && self.ddl == other.ddl
            && self.codec == other.codec
            && self.dynamic == other.dynamic;
        // Same recording: a different clip never yields the same capture.
        let content_equal = self.link == other.link
            && self.start == other.start
            && self.end == other.end
            && self.resolution == other.resolution;
        match step {
            Step::P0 | Step::P1 => shaping_equal && content_equal,
            Step::P2 | Step::P3 => {
                shaping_equal
                    && content_equal
                    && self.t_init == other.t_init
                    && self.genbufn == other.genbufn
                    && self.genbuft == other.genbuft
            }
        }
    }

    /// P2 only exists when there is something to synthesize.
    pub fn needs_synthetic_buffering(&self) -> bool {
        self.t_init > 0 || (self.genbufn > 0 && self.genbuft > 0)
    }
}

/// Read-only lookup from key to parameter record.
pub trait ParameterStore: Send + Sync {
    fn get(&self, key: &StimulusKey) -> Option<&StimulusParameters>;

    /// All keys of `(type, table)` in ascending entry order.
    fn entries(&self, type_id: &str, table_id: &str) -> Vec<StimulusKey>;
}

#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    rows: BTreeMap<StimulusKey, StimulusParameters>,
}

const REQUIRED_COLUMNS: [&str; 5] = ["t_init", "rul", "rdl", "dul", "ddl"];

impl ParameterTable {
    pub fn load<P: AsRef<Path>>(path: P) -> ParamResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ParamError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ParamResult<Self> {
        let mut lines = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'));
        let header_line = lines.next().ok_or(ParamError::MissingHeader)?;
        let header: Vec<String> = header_line
            .split(';')
            .map(|column| column.trim().to_ascii_lowercase())
            .collect();
        for required in REQUIRED_COLUMNS {
            if !header.iter().any(|column| column == required) {
                return Err(ParamError::MissingColumn(required));
            }
        }

        let mut rows = BTreeMap::new();
        for line in lines {
            let cells: Vec<&str> = line.split(';').map(str::trim).collect();
            let Some(Ok(key)) = cells.first().map(|cell| cell.parse::<StimulusKey>()) else {
                continue;
            };
            let row = Row {
                key: &key,
                header: &header,
                cells: &cells,
            };
            let params = row.parameters()?;
            if rows.insert(key.clone(), params).is_some() {
                return Err(ParamError::DuplicateKey {
                    key: key.to_string(),
                });
            }
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&mut self, key: StimulusKey, params: StimulusParameters) {
        self.rows.insert(key, params);
    }
}

impl ParameterStore for ParameterTable {
    fn get(&self, key: &StimulusKey) -> Option<&StimulusParameters> {
        self.rows.get(key)
    }

    fn entries(&self, type_id: &str, table_id: &str) -> Vec<StimulusKey> {
        let mut keys: Vec<StimulusKey> = self
            .rows
            .keys()
            .filter(|key| key.type_id == type_id && key.table_id == table_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| entry_order(&a.entry_id, &b.entry_id));
        keys
    }
}

fn entry_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

struct Row<'a> {
    key: &'a StimulusKey,
    header: &'a [String],
    cells: &'a [&'a str],
}

impl Row<'_> {
    fn cell(&self, column: &str) -> Option<&str> {
        let index = self.header.iter().position(|name| name == column)?;
        self.cells
            .get(index)
            .copied()
            .filter(|value| !value.is_empty())
    }

    fn invalid(&self, column: &str, value: &str) -> ParamError {
        ParamError::InvalidValue {
            key: self.key.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    fn number<T: FromStr>(&self, column: &str, default: Option<T>) -> ParamResult<T> {
        match self.cell(column) {
            Some(value) => value
                .replace(',', ".")
                .parse::<T>()
                .map_err(|_| self.invalid(column, value)),
            None => default.ok_or_else(|| self.invalid(column, "")),
        }
    }

    fn time(&self, column: &str) -> ParamResult<Duration> {
        match self.cell(column) {
            Some(value) => parse_time(value).ok_or_else(|| self.invalid(column, value)),
            None => Ok(Duration::ZERO),
        }
    }

    fn parameters(&self) -> ParamResult<StimulusParameters> {
        let params = StimulusParameters {
            t_init: self.number("t_init", None)?,
            rul: self.number("rul", None)?,
            rdl: self.number("rdl", None)?,
            dul: self.number("dul", None)?,
            ddl: self.number("ddl", None)?,
            codec: self.cell("codec").map(str::to_string),
            genbufn: self.number("genbufn", Some(0))?,
            genbuft: self.number("genbuft", Some(0))?,
            dynamic: self.cell("dynamic").map(str::to_string),
            link: self.cell("link").unwrap_or_default().to_string(),
            start: self.time("start")?,
            end: self.time("end")?,
            resolution: self.cell("resolution").map(str::to_string),
        };
        for (column, rate) in [("rul", params.rul), ("rdl", params.rdl)] {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(self.invalid(column, &rate.to_string()));
            }
        }
        for (column, delay) in [("dul", params.dul), ("ddl", params.ddl)] {
            if !(delay.is_finite() && delay >= 0.0) {
                return Err(self.invalid(column, &delay.to_string()));
            }
        }
        if params.end < params.start {
            return Err(self.invalid("end", &format!("{:?}", params.end)));
        }
        Ok(params)
    }
}

/// Parses `HH:MM:SS` or `HH:MM:SS.sss`.
pub fn parse_time(value: &str) -> Option<Duration> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    if parts.next().is_some() || minutes >= 60 {
        return None;
    }
    let (whole, fraction) = match seconds_part.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (seconds_part, None),
    };
    if whole.len() != 2 {
        return None;
    }
    let seconds: u64 = whole.parse().ok()?;
    if seconds >= 60 {
        return None;
    }
    let millis = match fraction {
        Some(fraction) if !fraction.is_empty() && fraction.len() <= 3 => {
            let digits: u64 = fraction.parse().ok()?;
            digits * 10u64.pow(3 - fraction.len() as u32)
        }
        Some(_) => return None,
        None => 0,
    };
    let total_seconds = hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)?;
    let total_millis = total_seconds.checked_mul(1000)?.checked_add(millis)?;
    Some(Duration::from_millis(total_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
ID;t_init;rul;rdl;dul;ddl;codec;genbufn;genbuft;dynamic;link;start;end
# comment rows are skipped
VS-A-1;0;1000;5000;100;100;h264;0;0;;https://youtu.be/abc;00:00:10;00:00:40
VS-A-2;2000;1000;5000;100;100;h264;2;1500;;https://youtu.be/abc;00:00:10;00:00:40.500
VS-A-10;0;800;5000;100;100;;0;0;;https://youtu.be/abc;00:00:10;00:00:40
notes;this;row;is;ignored
";

    #[test]
    fn parses_rows_and_ignores_unknown_keys() {
        let table = ParameterTable::parse(TABLE).unwrap();
        assert_eq!(table.len(), 3);
        let params = table.get(&StimulusKey::new("VS", "A", "2")).unwrap();
        assert_eq!(params.t_init, 2000);
        assert_eq!(params.rdl, 5000.0);
        assert_eq!(params.genbufn, 2);
        assert_eq!(params.codec.as_deref(), Some("h264"));
        assert_eq!(params.dynamic, None);
        assert_eq!(params.duration(), Duration::from_millis(30_500));
    }

    #[test]
    fn entries_are_ordered_numerically() {
        let table = ParameterTable::parse(TABLE).unwrap();
        let ids: Vec<String> = table
            .entries("VS", "A")
            .into_iter()
            .map(|key| key.entry_id)
            .collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
        assert!(table.entries("WB", "A").is_empty());
    }

    #[test]
    fn t_init_only_matters_after_synthetic_buffering() {
        let table = ParameterTable::parse(TABLE).unwrap();
        let first = table.get(&StimulusKey::new("VS", "A", "1")).unwrap();
        let mut second = first.clone();
        second.t_init = 4000;
        assert!(first.interchangeable(&second, Step::P0));
        assert!(first.interchangeable(&second, Step::P1));
        assert!(!first.interchangeable(&second, Step::P2));
        assert!(!first.interchangeable(&second, Step::P3));

        let other_rate = table.get(&StimulusKey::new("VS", "A", "10")).unwrap();
        assert!(!first.interchangeable(other_rate, Step::P0));
    }

    #[test]
    fn different_clips_or_stalls_are_never_shared() {
        let table = ParameterTable::parse(TABLE).unwrap();
        let first = table.get(&StimulusKey::new("VS", "A", "1")).unwrap();

        let mut other_clip = first.clone();
        other_clip.link = "https://www.youtube.com/watch?v=other".into();
        assert!(!first.interchangeable(&other_clip, Step::P0));

        let mut stalls = first.clone();
        stalls.genbufn = 2;
        stalls.genbuft = 1500;
        assert!(first.interchangeable(&stalls, Step::P1));
        assert!(!first.interchangeable(&stalls, Step::P2));
    }

    #[test]
    fn oversized_time_is_a_validation_error() {
        let content = "ID;t_init;rul;rdl;dul;ddl;start;end\n\
VS-A-1;0;1000;5000;10;10;00:00:00;9999999999999999:00:00\n";
        assert!(matches!(
            ParameterTable::parse(content),
            Err(ParamError::InvalidValue { column, .. }) if column == "end"
        ));
    }

    #[test]
    fn rejects_non_positive_rates() {
        let content = "ID;t_init;rul;rdl;dul;ddl\nVS-A-1;0;0;5000;10;10\n";
        assert!(matches!(
            ParameterTable::parse(content),
            Err(ParamError::InvalidValue { column, .. }) if column == "rul"
        ));
    }

    #[test]
    fn rejects_missing_columns_and_bad_numbers() {
        assert!(matches!(
            ParameterTable::parse("ID;t_init;rul;rdl;dul\n"),
            Err(ParamError::MissingColumn("ddl"))
        ));
        assert!(matches!(
            ParameterTable::parse("ID;t_init;rul;rdl;dul;ddl\nVS-A-1;x;1;1;1;1\n"),
            Err(ParamError::InvalidValue { .. })
        ));
        assert!(matches!(ParameterTable::parse(""), Err(ParamError::MissingHeader)));
    }

    #[test]
    fn parses_time_strings() {
        assert_eq!(parse_time("00:01:05"), Some(Duration::from_secs(65)));
        assert_eq!(parse_time("01:00:00.25"), Some(Duration::from_millis(3_600_250)));
        assert_eq!(parse_time("00:00:07.125"), Some(Duration::from_millis(7_125)));
        assert_eq!(parse_time("00:61:00"), None);
        assert_eq!(parse_time("00:00:5"), None);
        assert_eq!(parse_time("00:00:05.1234"), None);
        assert_eq!(parse_time("garbage"), None);
        assert_eq!(parse_time("9999999999999999:00:00"), None);
    }

    #[test]
    fn parses_keys() {
        let key: StimulusKey = "VS-A-1".parse().unwrap();
        assert_eq!(key.to_string(), "VS-A-1");
        assert!("VS-A".parse::<StimulusKey>().is_err());
        assert!("VS-A-1-2".parse::<StimulusKey>().is_err());
    }
}
