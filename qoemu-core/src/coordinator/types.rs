use std::fmt;
use std::path::PathBuf;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::artifact::Step;
use crate::params::StimulusKey;

/// Selection and phases of one campaign run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub types: Vec<String>,
    pub tables: Vec<String>,
    /// `None` selects every entry of each `(type, table)`.
    pub entries: Option<Vec<String>>,
    pub generate: bool,
    pub postprocess: bool,
    pub overwrite: bool,
}

impl RunRequest {
    pub fn new(types: Vec<String>, tables: Vec<String>, entries: Option<Vec<String>>) -> Self {
        Self {
            types,
            tables,
            entries,
            generate: true,
            postprocess: true,
            overwrite: false,
        }
    }

    pub fn generate(mut self, generate: bool) -> Self {
        self.generate = generate;
        self
    }

    pub fn postprocess(mut self, postprocess: bool) -> Self {
        self.postprocess = postprocess;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lookup,
    Generate,
    Trim,
    Buffering,
    Timestamps,
}

impl Stage {
    pub fn step(self) -> Option<Step> {
        match self {
            Stage::Lookup => None,
            Stage::Generate => Some(Step::P0),
            Stage::Trim => Some(Step::P1),
            Stage::Buffering => Some(Step::P2),
            Stage::Timestamps => Some(Step::P3),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Lookup => "lookup",
            Stage::Generate => "generate",
            Stage::Trim => "trim",
            Stage::Buffering => "buffering",
            Stage::Timestamps => "timestamps",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    /// Every requested artifact already existed.
    Skipped,
    Completed { produced: Vec<PathBuf> },
    Failed { stage: Stage, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryReport {
    #[serde(serialize_with = "display_key")]
    pub key: StimulusKey,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

fn display_key<S: Serializer>(key: &StimulusKey, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(key)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub entries: Vec<EntryReport>,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            entries: Vec::new(),
        }
    }

    fn count(&self, predicate: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count(|outcome| matches!(outcome, EntryOutcome::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, EntryOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, EntryOutcome::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn report(&self, key: &StimulusKey) -> Option<&EntryReport> {
        self.entries.iter().find(|entry| &entry.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_and_serializes() {
        let mut summary = RunSummary::new(Uuid::nil());
        summary.entries.push(EntryReport {
            key: StimulusKey::new("VS", "A", "1"),
            outcome: EntryOutcome::Skipped,
        });
        summary.entries.push(EntryReport {
            key: StimulusKey::new("VS", "A", "2"),
            outcome: EntryOutcome::Failed {
                stage: Stage::Generate,
                error: "boom".into(),
            },
        });
        assert_eq!((summary.skipped(), summary.failed(), summary.completed()), (1, 1, 0));
        assert!(!summary.is_success());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["entries"][0]["key"], "VS-A-1");
        assert_eq!(json["entries"][0]["outcome"], "skipped");
        assert_eq!(json["entries"][1]["stage"], "generate");
        assert_eq!(Stage::Buffering.step(), Some(Step::P2));
    }
}
