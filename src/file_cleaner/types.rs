use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CleanerError, ErrorCode};

/// Advisory severity of a category; `High` is refused by safe mode.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        })
    }
}

impl FromStr for RiskLevel {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(CleanerError::new(
                ErrorCode::ConfigInvalid,
                format!("unknown risk level {:?}", other),
            )),
        }
    }
}

/// One admitted file, captured at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

/// A named target set: where to look, what to accept, how risky.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub shred_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age_days: Option<u32>,
    #[serde(default)]
    pub selected: bool,

    // Populated by the scanner.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub file_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
}

impl Category {
    pub fn new(name: impl Into<String>, paths: Vec<String>) -> Self {
        Category {
            name: name.into(),
            paths,
            filters: Vec::new(),
            risk: RiskLevel::Low,
            shred_enabled: false,
            min_age_days: None,
            selected: false,
            size: 0,
            file_count: 0,
            files: Vec::new(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_filters(mut self, filters: &[&str]) -> Self {
        self.filters = filters.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_min_age_days(mut self, days: u32) -> Self {
        self.min_age_days = Some(days);
        self
    }

    pub fn shredded(mut self) -> Self {
        self.shred_enabled = true;
        self
    }

    pub fn selected(mut self) -> Self {
        self.selected = true;
        self
    }

    /// Copy of the description with empty accumulators.
    pub fn working_copy(&self) -> Self {
        Category {
            size: 0,
            file_count: 0,
            files: Vec::new(),
            ..self.clone()
        }
    }

    /// The only place accumulators change.
    pub fn admit(&mut self, record: FileRecord) {
        self.size = self.size.saturating_add(record.size);
        self.file_count += 1;
        self.files.push(record);
    }

    /// `size` and `file_count` agree with `files`.
    pub fn is_consistent(&self) -> bool {
        self.file_count == self.files.len()
            && self.size == self.files.iter().map(|f| f.size).sum::<u64>()
    }
}
