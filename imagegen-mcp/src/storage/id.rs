//! Image ids.
//!
//! Format: `img_<YYYYMMDDHHMMSSmmm>_<12 hex>`. The timestamp is the creation
//! time in UTC with millisecond precision, so ids sort by creation time and
//! name the date directory the artifact lives in.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use imagegen_mcp_common::error::StorageError;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

const PREFIX: &str = "img_";
const TIMESTAMP_LEN: usize = 17;
const SUFFIX_LEN: usize = 12;

/// Last timestamp handed out, so generated ids never go backwards.
static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    value: String,
    created_at: DateTime<Utc>,
}

impl ImageId {
    /// A fresh id stamped with the current time.
    ///
    /// Timestamps are clamped to be non-decreasing across calls even if the
    /// wall clock steps backwards.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let previous = LAST_MILLIS.fetch_max(now, Ordering::SeqCst);
        let millis = previous.max(now);
        let created_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now);
        Self::at(created_at)
    }

    /// An id stamped with `created_at`.
    pub fn at(created_at: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let value = format!(
            "{PREFIX}{}_{}",
            created_at.format("%Y%m%d%H%M%S%3f"),
            &suffix[..SUFFIX_LEN]
        );
        let created_at = truncate_to_millis(created_at);
        Self { value, created_at }
    }

    /// Parse and validate an id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidId` for anything not produced by
    /// [`ImageId::generate`].
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidId(value.to_string());
        let rest = value.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (timestamp, suffix) = rest.split_once('_').ok_or_else(invalid)?;
        if timestamp.len() != TIMESTAMP_LEN || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let lower_hex = |b: u8| matches!(b, b'0'..=b'9' | b'a'..=b'f');
        if suffix.len() != SUFFIX_LEN || !suffix.bytes().all(lower_hex) {
            return Err(invalid());
        }
        let naive = NaiveDateTime::parse_from_str(&timestamp[..14], "%Y%m%d%H%M%S")
            .map_err(|_| invalid())?;
        let millis: i64 = timestamp[14..].parse().map_err(|_| invalid())?;
        let created_at = Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis);
        Ok(Self {
            value: value.to_string(),
            created_at,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `YYYY/MM/DD` directory, relative to the image root.
    pub fn date_dir(&self) -> PathBuf {
        date_dir(self.created_at)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

pub(crate) fn date_dir(at: DateTime<Utc>) -> PathBuf {
    PathBuf::from(at.format("%Y").to_string())
        .join(at.format("%m").to_string())
        .join(at.format("%d").to_string())
}

fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis()).single().unwrap_or(at)
}
