//! Resumable-batch progress kept in a run's metadata.
//!
//! A long batch records where it is (`current_step`, `cursor`) as it goes.
//! After a crash the next execution reads that record back and re-enters the
//! processing unit at the cursor instead of starting over. The record is an
//! explicit continuation rather than call-stack state, because the resumed
//! execution may happen in another process.
//!
//! Updates merge: a field left out of a [`ProgressUpdate`] keeps its previous
//! value.

use super::run::Run;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub(crate) const CURRENT_STEP_KEY: &str = "current_step";
pub(crate) const CURSOR_KEY: &str = "cursor";
pub(crate) const RECORDS_PROCESSED_KEY: &str = "records_processed";
pub(crate) const RESUMPTIONS_KEY: &str = "resumptions";
pub(crate) const PROGRESS_UPDATED_AT_KEY: &str = "progress_updated_at";
pub(crate) const RESUMED_FROM_KEY: &str = "resumed_from";

/// A partial progress report. Only the fields that are set are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    step: Option<String>,
    cursor: Option<Value>,
    records: Option<i64>,
    resumptions: Option<i64>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn cursor(mut self, cursor: impl Into<Value>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn records(mut self, records: i64) -> Self {
        self.records = Some(records);
        self
    }

    pub fn resumptions(mut self, resumptions: i64) -> Self {
        self.resumptions = Some(resumptions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_none()
            && self.cursor.is_none()
            && self.records.is_none()
            && self.resumptions.is_none()
    }
}

/// Read-only view over the progress fields of a run's metadata.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    metadata: &'a Map<String, Value>,
}

impl<'a> Progress<'a> {
    pub fn new(metadata: &'a Map<String, Value>) -> Self {
        Self { metadata }
    }

    pub fn current_step(&self) -> Option<&'a str> {
        self.metadata.get(CURRENT_STEP_KEY).and_then(Value::as_str)
    }

    pub fn current_cursor(&self) -> Option<&'a Value> {
        self.metadata
            .get(CURSOR_KEY)
            .filter(|cursor| !cursor.is_null())
    }

    pub fn records_processed(&self) -> Option<i64> {
        self.metadata.get(RECORDS_PROCESSED_KEY).and_then(Value::as_i64)
    }

    pub fn resumptions(&self) -> Option<i64> {
        self.metadata.get(RESUMPTIONS_KEY).and_then(Value::as_i64)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(PROGRESS_UPDATED_AT_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The run this one continues, when it was created by a re-dispatch.
    pub fn resumed_from(&self) -> Option<Uuid> {
        self.metadata
            .get(RESUMED_FROM_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    /// `records_processed / total * 100`, rounded to two decimals.
    ///
    /// `None` when nothing has been counted yet or `total` is not positive.
    pub fn percentage(&self, total: i64) -> Option<f64> {
        if total <= 0 {
            return None;
        }
        let records = self.records_processed()?;
        let pct = records as f64 / total as f64 * 100.0;
        Some((pct * 100.0).round() / 100.0)
    }
}

impl Run {
    pub fn progress(&self) -> Progress<'_> {
        Progress::new(&self.metadata)
    }

    /// Merges `update` into the metadata and stamps `progress_updated_at`.
    ///
    /// A present `records` value is mirrored into [`Run::records_processed`].
    pub fn update_progress(&mut self, update: ProgressUpdate, now: DateTime<Utc>) {
        let ProgressUpdate {
            step,
            cursor,
            records,
            resumptions,
        } = update;

        if let Some(step) = step {
            self.metadata
                .insert(CURRENT_STEP_KEY.to_string(), Value::String(step));
        }
        if let Some(cursor) = cursor {
            self.metadata.insert(CURSOR_KEY.to_string(), cursor);
        }
        if let Some(records) = records {
            self.metadata
                .insert(RECORDS_PROCESSED_KEY.to_string(), records.into());
            self.records_processed = Some(records);
        }
        if let Some(resumptions) = resumptions {
            self.metadata
                .insert(RESUMPTIONS_KEY.to_string(), resumptions.into());
        }

        self.metadata.insert(
            PROGRESS_UPDATED_AT_KEY.to_string(),
            Value::String(now.to_rfc3339()),
        );
        self.updated_at = now;
    }

    /// Shorthand for `self.progress().percentage(total)`.
    pub fn progress_percentage(&self, total: i64) -> Option<f64> {
        self.progress().percentage(total)
    }
}
