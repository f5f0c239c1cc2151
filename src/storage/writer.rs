//! # Single-Table Multi-Index Storage Writer
//!
//! Fans one logical record out into a primary row plus thin index rows per
//! facet value, all in one table. The primary row is written before any
//! index row, so a reader who finds an index row can always resolve the
//! primary. Index rows are disposable and rebuildable; a record update
//! rewrites all of them rather than diffing.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::error::Result;
use crate::records::dates;
use crate::records::Record;
use crate::storage::table::{TableRow, TableStore};

/// Partition of the primary record rows
pub const PRIMARY_PARTITION: &str = "summary";
/// Partition listing every record by date
pub const ALL_RECORDS_PARTITION: &str = "record";
/// Fixed partition holding recent keyword occurrences
pub const RECENT_KEYWORD_PARTITION: &str = "keyword_recent";

/// Writes records and their derived index rows
pub struct RecordWriter {
    table: Arc<dyn TableStore>,
    retry_pause: Duration,
}

impl RecordWriter {
    pub fn new(table: Arc<dyn TableStore>, retry_pause: Duration) -> Self {
        Self { table, retry_pause }
    }

    /// Persist one record: canonicalize its date, recompute its month,
    /// write the primary row, then drain the index fan-out in bounded
    /// batches, retrying any rejected subset until all rows are accepted.
    pub async fn write(&self, record: &Record) -> Result<()> {
        let mut record = record.clone();
        record.date = dates::normalize_timestamp_str(&record.date)?;
        record.month = dates::month_bucket(&record.date)?;

        let primary = TableRow::new(
            PRIMARY_PARTITION,
            record.id.clone(),
            serde_json::to_value(&record)?,
        );
        // Primary must be visible before any index row is attempted
        self.table.put(primary).await?;

        let rows = index_rows(&record);
        let total = rows.len();
        let mut pending: VecDeque<TableRow> = rows.into();
        while !pending.is_empty() {
            let take = pending.len().min(self.table.max_batch());
            let batch: Vec<TableRow> = pending.drain(..take).collect();
            let rejected = self.table.batch_put(batch).await?;
            if !rejected.is_empty() {
                debug!(
                    record_id = %record.id,
                    rejected = rejected.len(),
                    "index batch partially rejected, pausing before retry"
                );
                sleep(self.retry_pause).await;
                pending.extend(rejected);
            }
        }

        info!(record_id = %record.id, index_rows = total, "record persisted");
        Ok(())
    }
}

/// Sort key ordering index rows chronologically under lexicographic
/// comparison: `year#month#canonicalDate#id`.
pub fn sort_key(record: &Record) -> String {
    let year = &record.month[..4.min(record.month.len())];
    format!("{year}#{}#{}#{}", record.month, record.date, record.id)
}

/// Listing-relevant projection carried by every index row
fn thin_projection(record: &Record) -> Value {
    json!({
        "id": record.id,
        "title": record.title,
        "date": record.date,
        "month": record.month,
        "kind": record.kind,
        "session": record.session,
        "house": record.house,
        "meetingName": record.meeting_name,
        "description": record.description,
    })
}

/// All index rows derived from one record. Zero-valued facets (empty
/// strings, empty lists) produce no rows; kind and session always do.
pub fn index_rows(record: &Record) -> Vec<TableRow> {
    let sk = sort_key(record);
    let thin = thin_projection(record);
    let mut rows = Vec::new();

    let facet = |partition: String| TableRow::new(partition, sk.clone(), thin.clone());

    for category in record.categories.iter().filter(|c| !c.is_empty()) {
        rows.push(facet(format!("category#{category}")));
    }
    for participant in record.participants.iter().filter(|p| !p.is_empty()) {
        rows.push(facet(format!("participant#{participant}")));
    }
    for keyword in record.keywords.iter().filter(|k| !k.is_empty()) {
        rows.push(facet(format!("keyword#{keyword}")));
        let mut payload = thin.clone();
        payload["keyword"] = json!(keyword);
        rows.push(TableRow::new(
            RECENT_KEYWORD_PARTITION,
            format!("{sk}#{keyword}"),
            payload,
        ));
    }
    rows.push(facet(format!("kind#{}", record.kind.as_str())));
    rows.push(facet(format!("session#{:04}", record.session)));
    if !record.house.is_empty() {
        rows.push(facet(format!("house#{}", record.house)));
    }
    if !record.meeting_name.is_empty() {
        rows.push(facet(format!("meeting#{}", record.meeting_name)));
    }

    // Global listings: all records by date, and the month bucket
    rows.push(facet(ALL_RECORDS_PARTITION.to_string()));
    rows.push(facet(format!("month#{}", record.month)));

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordKind;
    use crate::storage::table::MemoryTableStore;

    fn sample_record() -> Record {
        Record {
            id: "issue-123".to_string(),
            title: "Budget deliberation".to_string(),
            date: "2024-01-15".to_string(),
            month: String::new(),
            kind: RecordKind::Committee,
            session: 212,
            house: "lower".to_string(),
            meeting_name: "Budget Committee".to_string(),
            categories: vec!["finance".to_string(), "economy".to_string()],
            description: "desc".to_string(),
            summary: "sum".to_string(),
            soft_summary: "soft".to_string(),
            middle_summary: vec![],
            dialogs: vec![],
            participants: vec!["Tanaka".to_string(), "Sato".to_string()],
            keywords: vec!["tax".to_string()],
            terms: vec![],
        }
    }

    fn canonical(mut record: Record) -> Record {
        record.date = dates::normalize_timestamp_str(&record.date).unwrap();
        record.month = dates::month_bucket(&record.date).unwrap();
        record
    }

    #[test]
    fn test_fan_out_row_set() {
        let record = canonical(sample_record());
        let rows = index_rows(&record);

        // 2 categories + 2 participants + 1 keyword + 1 recent keyword
        // + kind + session + house + meeting + 2 global listings
        assert_eq!(rows.len(), 12);

        let partitions: Vec<&str> = rows.iter().map(|r| r.pk.as_str()).collect();
        assert!(partitions.contains(&"category#finance"));
        assert!(partitions.contains(&"participant#Sato"));
        assert!(partitions.contains(&"keyword#tax"));
        assert!(partitions.contains(&"keyword_recent"));
        assert!(partitions.contains(&"kind#committee"));
        assert!(partitions.contains(&"session#0212"));
        assert!(partitions.contains(&"house#lower"));
        assert!(partitions.contains(&"meeting#Budget Committee"));
        assert!(partitions.contains(&"record"));
        assert!(partitions.contains(&"month#2024-01"));
    }

    #[test]
    fn test_zero_valued_facets_produce_no_rows() {
        let mut record = canonical(sample_record());
        record.categories.clear();
        record.participants.clear();
        record.keywords.clear();
        record.house.clear();
        record.meeting_name.clear();

        let rows = index_rows(&record);
        // kind + session + the two global listings remain
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_sort_key_shape() {
        let record = canonical(sample_record());
        assert_eq!(
            sort_key(&record),
            "2024#2024-01#2024-01-15T00:00:00.000Z#issue-123"
        );
    }

    #[tokio::test]
    async fn test_write_persists_primary_and_indexes() {
        let store = Arc::new(MemoryTableStore::new());
        let writer = RecordWriter::new(store.clone(), Duration::from_millis(1));

        writer.write(&sample_record()).await.unwrap();

        // 1 primary + 12 index rows
        assert_eq!(store.len().await, 13);
        let primary = store.get(PRIMARY_PARTITION, "issue-123").await.unwrap();
        assert_eq!(primary["date"], "2024-01-15T00:00:00.000Z");
        assert_eq!(primary["month"], "2024-01");
    }

    #[tokio::test]
    async fn test_write_is_idempotent_overwrite() {
        let store = Arc::new(MemoryTableStore::new());
        let writer = RecordWriter::new(store.clone(), Duration::from_millis(1));

        writer.write(&sample_record()).await.unwrap();
        writer.write(&sample_record()).await.unwrap();

        // Same keys, same count: exactly one primary row per id
        assert_eq!(store.len().await, 13);
        assert_eq!(store.partition(PRIMARY_PARTITION).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_rows_are_retried_until_drained() {
        let store = Arc::new(MemoryTableStore::new());
        store.reject_next(5).await;
        let writer = RecordWriter::new(store.clone(), Duration::from_millis(1));

        writer.write(&sample_record()).await.unwrap();
        assert_eq!(store.len().await, 13);
    }

    #[tokio::test]
    async fn test_unparseable_date_fails_before_any_write() {
        let store = Arc::new(MemoryTableStore::new());
        let writer = RecordWriter::new(store.clone(), Duration::from_millis(1));

        let mut record = sample_record();
        record.date = "someday soon".to_string();
        assert!(writer.write(&record).await.is_err());
        assert!(store.is_empty().await);
    }
}
