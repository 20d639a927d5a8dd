//! Core domain model and shared run contract for joblake.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "joblake-core";

/// One entry scraped from a paginated listing-index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub job_title: String,
    pub listing_start_date: NaiveDate,
    pub detail_link: String,
}

/// Fixed field set extracted from one detail page.
///
/// The optional fields stay `None` when the corresponding label row is
/// absent from the page's data table; they are never defaulted to an
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDetail {
    pub monthly_salary: i64,
    pub occupation: String,
    pub work_type: String,
    pub work_location: String,
    pub industry: String,
    pub job_content: Option<String>,
    pub required_skills: Option<String>,
    pub preferred_skills: Option<String>,
    pub programming_language: Option<String>,
    pub tool: Option<String>,
    pub framework: Option<String>,
    pub rate_of_work: Option<String>,
    pub number_of_recruitment_interviews: Option<String>,
    pub number_of_days_worked: Option<String>,
    pub number_of_applicants: Option<String>,
}

/// Summary joined 1:1 with its detail page, flattened in warehouse column
/// order. `detail_link` is the natural merge key and must be unique within
/// a scrape batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedListing {
    pub monthly_salary: i64,
    pub occupation: String,
    pub work_type: String,
    pub work_location: String,
    pub industry: String,
    pub job_content: Option<String>,
    pub required_skills: Option<String>,
    pub preferred_skills: Option<String>,
    pub programming_language: Option<String>,
    pub tool: Option<String>,
    pub framework: Option<String>,
    pub rate_of_work: Option<String>,
    pub number_of_recruitment_interviews: Option<String>,
    pub number_of_days_worked: Option<String>,
    pub number_of_applicants: Option<String>,
    pub job_title: String,
    pub listing_start_date: NaiveDate,
    pub detail_link: String,
}

impl JoinedListing {
    pub fn join(summary: ListingSummary, detail: ListingDetail) -> Self {
        Self {
            monthly_salary: detail.monthly_salary,
            occupation: detail.occupation,
            work_type: detail.work_type,
            work_location: detail.work_location,
            industry: detail.industry,
            job_content: detail.job_content,
            required_skills: detail.required_skills,
            preferred_skills: detail.preferred_skills,
            programming_language: detail.programming_language,
            tool: detail.tool,
            framework: detail.framework,
            rate_of_work: detail.rate_of_work,
            number_of_recruitment_interviews: detail.number_of_recruitment_interviews,
            number_of_days_worked: detail.number_of_days_worked,
            number_of_applicants: detail.number_of_applicants,
            job_title: summary.job_title,
            listing_start_date: summary.listing_start_date,
            detail_link: summary.detail_link,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    String,
    Date,
}

/// Fixed warehouse schema, in landed-CSV column order.
pub const TABLE_COLUMNS: &[(&str, ColumnType)] = &[
    ("monthly_salary", ColumnType::Integer),
    ("occupation", ColumnType::String),
    ("work_type", ColumnType::String),
    ("work_location", ColumnType::String),
    ("industry", ColumnType::String),
    ("job_content", ColumnType::String),
    ("required_skills", ColumnType::String),
    ("preferred_skills", ColumnType::String),
    ("programming_language", ColumnType::String),
    ("tool", ColumnType::String),
    ("framework", ColumnType::String),
    ("rate_of_work", ColumnType::String),
    ("number_of_recruitment_interviews", ColumnType::String),
    ("number_of_days_worked", ColumnType::String),
    ("number_of_applicants", ColumnType::String),
    ("job_title", ColumnType::String),
    ("listing_start_date", ColumnType::Date),
    ("detail_link", ColumnType::String),
];

pub const MERGE_KEY_COLUMN: &str = "detail_link";
pub const PARTITION_COLUMN: &str = "listing_start_date";
pub const CLUSTER_COLUMNS: &[&str] = &["occupation", "work_location"];

/// Body-level status taxonomy carried by every entrypoint response.
///
/// Transport status stays 2xx for almost every outcome so a retrying
/// delivery system does not redeliver; the taxonomy travels here instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Skipped,
    Invalid,
    Error,
    CriticalError,
}

/// Structured result of one entrypoint invocation or loader run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl RunReport {
    fn with_status(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            loaded_rows: None,
            warning: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Success, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Skipped, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Invalid, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Error, message)
    }

    pub fn critical_error(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::CriticalError, message)
    }

    pub fn loaded_rows(mut self, rows: u64) -> Self {
        self.loaded_rows = Some(rows);
        self
    }

    pub fn warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("environment variable {name} has an invalid value: {value}")]
    InvalidVar { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_listing_keeps_summary_key() {
        let summary = ListingSummary {
            job_title: "データ基盤エンジニア".to_string(),
            listing_start_date: NaiveDate::from_ymd_opt(2024, 12, 27).unwrap(),
            detail_link: "https://example.com/item/123/".to_string(),
        };
        let detail = ListingDetail {
            monthly_salary: 800_000,
            occupation: "データエンジニア".to_string(),
            work_type: "リモート".to_string(),
            work_location: "東京都".to_string(),
            industry: "IT".to_string(),
            job_content: Some("ETLパイプラインの構築".to_string()),
            required_skills: None,
            preferred_skills: None,
            programming_language: Some("Python".to_string()),
            tool: None,
            framework: None,
            rate_of_work: None,
            number_of_recruitment_interviews: None,
            number_of_days_worked: None,
            number_of_applicants: None,
        };
        let joined = JoinedListing::join(summary, detail);
        assert_eq!(joined.detail_link, "https://example.com/item/123/");
        assert_eq!(joined.monthly_salary, 800_000);
        assert_eq!(joined.required_skills, None);
    }

    #[test]
    fn table_schema_matches_struct_field_order() {
        assert_eq!(TABLE_COLUMNS.len(), 18);
        assert_eq!(TABLE_COLUMNS[0].0, "monthly_salary");
        assert_eq!(TABLE_COLUMNS[16], ("listing_start_date", ColumnType::Date));
        assert_eq!(TABLE_COLUMNS[17].0, MERGE_KEY_COLUMN);
    }

    #[test]
    fn run_status_serializes_snake_case() {
        let report = RunReport::critical_error("marker write failed");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "critical_error");
        assert!(json.get("loaded_rows").is_none());
    }
}
