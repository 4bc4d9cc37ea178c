//! Recipient Ingestion Pipeline.
//!
//! parse -> normalize -> validate -> dedupe -> stage. Every stage before the
//! bulk insert is a pure function over [`RawRow`]s; a row either becomes a
//! [`NewRecipient`] or a [`RowRejection`], and nothing is written until the
//! whole file has been staged.
use crate::db::{self, Pool};
use crate::email::{dedupe_key, is_valid_email};
use crate::error::{Error, Result};
use crate::model::NewRecipient;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use tracing::{info, instrument};

/// Upper bound on the rejection examples carried back in an [`ImportSummary`].
pub const MAX_REPORTED_ERRORS: usize = 10;

const REQUIRED_COLUMNS: &str = "name, email";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Xlsx,
}

impl FileFormat {
    /// Classify by extension, case-insensitively.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => Ok(FileFormat::Csv),
            Some("xlsx") => Ok(FileFormat::Xlsx),
            _ => Err(Error::UnsupportedFormat(format!(
                "{} (expected .csv or .xlsx)",
                path.display()
            ))),
        }
    }

    /// Only CSV has a reader; spreadsheets are refused before any parsing.
    fn ensure_readable(self) -> Result<()> {
        match self {
            FileFormat::Csv => Ok(()),
            FileFormat::Xlsx => Err(Error::UnsupportedFormat(
                "xlsx spreadsheets are not supported, export the sheet as .csv".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingField,
    InvalidEmail,
    Duplicate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingField => "Missing name or email",
            RejectReason::InvalidEmail => "Invalid email format",
            RejectReason::Duplicate => "Duplicate email",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RejectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One skipped row. `row` is the 1-based data row (header excluded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub row: usize,
    pub email: String,
    pub reason: RejectReason,
}

/// A data row as read from the file, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: usize,
    pub name: String,
    pub email: String,
}

impl RawRow {
    pub fn new(line: usize, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            line,
            name: name.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Staged {
    /// Accepted rows, paired with their 1-based row number.
    pub accepted: Vec<(usize, NewRecipient)>,
    pub rejections: Vec<RowRejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub total: usize,
    pub errors: Vec<RowRejection>,
}

/// Read `name` and `email` columns from CSV. Header names are matched
/// case-insensitively after trimming; extra columns are ignored and short
/// rows yield empty fields.
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<RawRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let position = |wanted: &str| {
        headers.iter().position(|h| {
            h.trim_start_matches('\u{feff}')
                .trim()
                .eq_ignore_ascii_case(wanted)
        })
    };
    let (Some(name_idx), Some(email_idx)) = (position("name"), position("email")) else {
        return Err(Error::Schema(REQUIRED_COLUMNS.into()));
    };

    let mut rows = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        rows.push(RawRow::new(
            i + 1,
            record.get(name_idx).unwrap_or_default(),
            record.get(email_idx).unwrap_or_default(),
        ));
    }
    Ok(rows)
}

/// Normalize, validate and dedupe. `existing` holds [`dedupe_key`]s of emails that
/// are already stored; the first occurrence of an email in the batch wins.
pub fn stage(rows: Vec<RawRow>, existing: &HashSet<String>) -> Staged {
    let mut staged = Staged::default();
    let mut seen: HashSet<String> = HashSet::new();

    for raw in rows {
        let name = raw.name.trim();
        let email = raw.email.trim();
        let reject = |reason| RowRejection {
            row: raw.line,
            email: email.to_string(),
            reason,
        };

        if name.is_empty() || email.is_empty() {
            staged.rejections.push(reject(RejectReason::MissingField));
            continue;
        }
        if !is_valid_email(email) {
            staged.rejections.push(reject(RejectReason::InvalidEmail));
            continue;
        }
        let key = dedupe_key(email);
        if existing.contains(&key) || !seen.insert(key) {
            staged.rejections.push(reject(RejectReason::Duplicate));
            continue;
        }
        staged.accepted.push((
            raw.line,
            NewRecipient {
                name: name.to_string(),
                email: email.to_string(),
            },
        ));
    }
    staged
}

/// Stage `rows` against the current store and bulk insert what survives.
#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn import_rows(pool: &Pool, rows: Vec<RawRow>) -> Result<ImportSummary> {
    let total = rows.len();
    let existing = db::existing_emails(pool).await?;
    let Staged {
        accepted,
        mut rejections,
    } = stage(rows, &existing);

    let batch: Vec<NewRecipient> = accepted.iter().map(|(_, r)| r.clone()).collect();
    let dropped = db::bulk_insert_recipients(pool, &batch).await?;
    for idx in &dropped {
        let (row, recipient) = &accepted[*idx];
        rejections.push(RowRejection {
            row: *row,
            email: recipient.email.clone(),
            reason: RejectReason::Duplicate,
        });
    }
    if !dropped.is_empty() {
        info!(
            dropped = dropped.len(),
            "rows collided with concurrent inserts"
        );
    }
    rejections.sort_by_key(|r| r.row);

    let inserted = batch.len() - dropped.len();
    let skipped = rejections.len();
    rejections.truncate(MAX_REPORTED_ERRORS);
    info!(inserted, skipped, total, "recipient import finished");
    Ok(ImportSummary {
        inserted,
        skipped,
        total,
        errors: rejections,
    })
}

pub async fn import_reader<R: Read>(pool: &Pool, reader: R) -> Result<ImportSummary> {
    let rows = read_csv(reader)?;
    import_rows(pool, rows).await
}

/// Entry point for uploads: `filename` selects the format.
pub async fn import_bytes(pool: &Pool, filename: &str, bytes: &[u8]) -> Result<ImportSummary> {
    FileFormat::from_path(filename)?.ensure_readable()?;
    import_reader(pool, bytes).await
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn import_file(pool: &Pool, path: impl AsRef<Path>) -> Result<ImportSummary> {
    let path = path.as_ref();
    FileFormat::from_path(path)?.ensure_readable()?;
    let bytes = tokio::fs::read(path).await?;
    import_reader(pool, bytes.as_slice()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasons(staged: &Staged) -> Vec<RejectReason> {
        staged.rejections.iter().map(|r| r.reason).collect()
    }

    #[test]
    fn duplicate_and_missing_rows_are_skipped() {
        let rows = vec![
            RawRow::new(1, "A", "a@x.com"),
            RawRow::new(2, "B", "a@x.com"),
            RawRow::new(3, "C", ""),
        ];
        let staged = stage(rows, &HashSet::new());
        assert_eq!(staged.accepted.len(), 1);
        assert_eq!(staged.accepted[0].1.name, "A");
        assert_eq!(
            reasons(&staged),
            vec![RejectReason::Duplicate, RejectReason::MissingField]
        );
    }

    #[test]
    fn fields_are_trimmed_before_checks() {
        let rows = vec![
            RawRow::new(1, "  Ann ", "  ann@x.com "),
            RawRow::new(2, "   ", "bob@x.com"),
        ];
        let staged = stage(rows, &HashSet::new());
        assert_eq!(
            staged.accepted[0].1,
            NewRecipient {
                name: "Ann".into(),
                email: "ann@x.com".into()
            }
        );
        assert_eq!(reasons(&staged), vec![RejectReason::MissingField]);
    }

    #[test]
    fn existing_and_case_variant_emails_are_duplicates() {
        let existing: HashSet<String> = ["old@x.com".to_string()].into();
        let rows = vec![
            RawRow::new(1, "Old", "OLD@x.com"),
            RawRow::new(2, "New", "new@x.com"),
            RawRow::new(3, "New again", "New@X.com"),
            RawRow::new(4, "Bad", "not-an-email"),
        ];
        let staged = stage(rows, &existing);
        assert_eq!(staged.accepted.len(), 1);
        assert_eq!(staged.accepted[0].0, 2);
        assert_eq!(
            reasons(&staged),
            vec![
                RejectReason::Duplicate,
                RejectReason::Duplicate,
                RejectReason::InvalidEmail
            ]
        );
    }

    #[test]
    fn headers_match_case_insensitively() {
        let data = "\u{feff}Email , NAME,extra\na@x.com,A,1\nb@x.com\n";
        let rows = read_csv(data.as_bytes()).unwrap();
        assert_eq!(
            rows,
            vec![RawRow::new(1, "A", "a@x.com"), RawRow::new(2, "", "b@x.com")]
        );
    }

    #[test]
    fn missing_email_column_is_a_schema_error() {
        let err = read_csv("name,mail\nA,a@x.com\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert_eq!(err.to_string(), "file must contain columns: name, email");
    }

    #[test]
    fn formats_are_classified_by_extension() {
        assert_eq!(FileFormat::from_path("list.CSV").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_path("list.xlsx").unwrap(), FileFormat::Xlsx);
        assert!(matches!(
            FileFormat::Xlsx.ensure_readable(),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FileFormat::from_path("list.txt"),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FileFormat::from_path("list"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn reasons_serialize_as_messages() {
        let rejection = RowRejection {
            row: 3,
            email: String::new(),
            reason: RejectReason::MissingField,
        };
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["reason"], "Missing name or email");
    }
}
