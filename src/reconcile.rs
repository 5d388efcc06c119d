//!
//! photowall activity reconciler
//! -----------------------------
//! Translates a batch of provider activity records into the subset that
//! represents genuinely new images, appends those into the registry, and
//! decides the next poll cursor.
//!
//! Candidates are published under a stable derived URL `/proxy/image/{id}`
//! rather than the provider's direct link: direct links can expire or demand
//! re-authentication, while the proxy indirection lets the serving layer
//! re-fetch bytes on demand using the stored file id.
//!
//! The reconciler performs no I/O. The caller hands it an already
//! successfully fetched batch; a failed fetch must never reach this module,
//! so a transient provider outage is retried against the same window.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{ImageRef, ImageRegistry};

/// Route prefix under which the serving layer proxies provider bytes.
pub const PROXY_PREFIX: &str = "/proxy/image";

/// Timestamp boundary of the last processed activity window. `None` means
/// "reconcile from the provider's default window".
pub type ActivityCursor = Option<DateTime<Utc>>;

/// A provider-reported event describing a change to a file or folder.
/// Unknown fields are ignored; only image-file targets are relevant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Vec<ActivityTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityTarget {
    #[serde(default)]
    pub file: Option<FileTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileTarget {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "mimeType")]
    pub mime_type: String,
    #[serde(default)]
    pub name: String,
}

/// An activity target claims an image mime type but carries no usable file id.
/// One bad record is skipped and logged; it never aborts a pass.
#[derive(Debug, Error)]
#[error("activity target has an image mime type but no file id")]
pub struct MalformedRecord;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// References not previously known, in batch arrival order.
    pub new_refs: Vec<ImageRef>,
    /// Cursor for the next pass; always >= the cursor passed in.
    pub next_cursor: DateTime<Utc>,
    /// Number of malformed targets skipped.
    pub skipped: usize,
}

/// Build the stable derived URL for a provider file id.
pub fn proxy_url(file_id: &str) -> String {
    format!("{}/{}", PROXY_PREFIX, file_id)
}

fn image_candidate(target: &ActivityTarget) -> Result<Option<ImageRef>, MalformedRecord> {
    let Some(file) = &target.file else { return Ok(None) };
    if !file.mime_type.starts_with("image/") {
        return Ok(None);
    }
    if file.id.is_empty() {
        return Err(MalformedRecord);
    }
    Ok(Some(ImageRef { id: file.id.clone(), url: proxy_url(&file.id) }))
}

/// Reconcile one successfully fetched activity batch against the registry.
///
/// New image references are appended into `registry` (so duplicates within
/// the batch and against existing entries are both rejected by the same URL
/// check) and returned in arrival order; the batch is never reordered here.
/// The next cursor is "now", clamped to never move backwards, and advances
/// even for an empty batch so a quiet period does not grow the scan window
/// without bound.
pub fn reconcile(
    records: &[ActivityRecord],
    registry: &ImageRegistry,
    cursor: ActivityCursor,
) -> Reconciled {
    let mut new_refs: Vec<ImageRef> = Vec::new();
    let mut skipped = 0usize;

    for record in records {
        for target in &record.targets {
            match image_candidate(target) {
                Ok(Some(candidate)) => {
                    if registry.append_if_absent(candidate.clone()) {
                        new_refs.push(candidate);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping activity target: {e}");
                    skipped += 1;
                }
            }
        }
    }

    let now = Utc::now();
    let next_cursor = match cursor {
        Some(prev) if prev > now => prev,
        _ => now,
    };

    debug!(
        new = new_refs.len(),
        skipped,
        next_cursor = %next_cursor,
        "reconciled activity batch"
    );

    Reconciled { new_refs, next_cursor, skipped }
}

/// Store `next` in the shared cursor unless a concurrent pass already moved
/// it further. Two interleaved refreshes can finish out of order; the write
/// must not rewind the cursor a later pass has stored.
pub fn advance_cursor(cursor: &Mutex<ActivityCursor>, next: DateTime<Utc>) {
    let mut guard = cursor.lock();
    if guard.map_or(true, |prev| prev < next) {
        *guard = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_record(id: &str, mime: &str) -> ActivityRecord {
        ActivityRecord {
            timestamp: None,
            targets: vec![ActivityTarget {
                file: Some(FileTarget {
                    id: id.to_string(),
                    mime_type: mime.to_string(),
                    name: format!("{id}.jpg"),
                }),
            }],
        }
    }

    #[test]
    fn new_image_target_yields_proxy_ref() {
        let reg = ImageRegistry::new();
        let out = reconcile(&[image_record("F1", "image/jpeg")], &reg, None);
        assert_eq!(out.new_refs.len(), 1);
        assert_eq!(out.new_refs[0].id, "F1");
        assert_eq!(out.new_refs[0].url, "/proxy/image/F1");
        assert_eq!(out.skipped, 0);
        assert_eq!(reg.urls(), vec!["/proxy/image/F1"]);
    }

    #[test]
    fn second_pass_with_same_records_is_empty() {
        let reg = ImageRegistry::new();
        let records = vec![image_record("F1", "image/jpeg")];
        let first = reconcile(&records, &reg, None);
        assert_eq!(first.new_refs.len(), 1);
        let second = reconcile(&records, &reg, Some(first.next_cursor));
        assert!(second.new_refs.is_empty());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn non_image_target_is_ignored() {
        let reg = ImageRegistry::new();
        let out = reconcile(&[image_record("D1", "text/plain")], &reg, None);
        assert!(out.new_refs.is_empty());
        assert_eq!(out.skipped, 0);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn record_without_file_target_is_ignored() {
        let reg = ImageRegistry::new();
        let records = vec![ActivityRecord {
            timestamp: None,
            targets: vec![ActivityTarget { file: None }],
        }];
        let out = reconcile(&records, &reg, None);
        assert!(out.new_refs.is_empty());
        assert_eq!(out.skipped, 0);
    }

    #[test]
    fn malformed_target_is_skipped_without_aborting() {
        let reg = ImageRegistry::new();
        let records = vec![image_record("", "image/png"), image_record("F2", "image/png")];
        let out = reconcile(&records, &reg, None);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.new_refs.len(), 1);
        assert_eq!(out.new_refs[0].id, "F2");
    }

    #[test]
    fn duplicates_within_batch_collapse() {
        let reg = ImageRegistry::new();
        let records = vec![image_record("F1", "image/jpeg"), image_record("F1", "image/jpeg")];
        let out = reconcile(&records, &reg, None);
        assert_eq!(out.new_refs.len(), 1);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn cursor_advances_on_empty_batch() {
        let reg = ImageRegistry::new();
        let before = Utc::now();
        let out = reconcile(&[], &reg, None);
        assert!(out.new_refs.is_empty());
        assert!(out.next_cursor >= before);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let reg = ImageRegistry::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        let out = reconcile(&[], &reg, Some(future));
        assert_eq!(out.next_cursor, future);

        let past = Utc::now() - chrono::Duration::hours(1);
        let out = reconcile(&[], &reg, Some(past));
        assert!(out.next_cursor >= past);
    }

    #[test]
    fn stored_cursor_never_moves_backwards() {
        let cursor: Mutex<ActivityCursor> = Mutex::new(None);
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);
        // The later pass lands first; the earlier one must not rewind it.
        advance_cursor(&cursor, t2);
        advance_cursor(&cursor, t1);
        assert_eq!(*cursor.lock(), Some(t2));
    }

    #[test]
    fn advance_cursor_moves_forward_from_empty() {
        let cursor: Mutex<ActivityCursor> = Mutex::new(None);
        let t1 = Utc::now();
        advance_cursor(&cursor, t1);
        assert_eq!(*cursor.lock(), Some(t1));
        let t2 = t1 + chrono::Duration::seconds(1);
        advance_cursor(&cursor, t2);
        assert_eq!(*cursor.lock(), Some(t2));
    }

    #[test]
    fn batch_order_is_preserved() {
        let reg = ImageRegistry::new();
        let records = vec![
            image_record("F3", "image/jpeg"),
            image_record("F1", "image/jpeg"),
            image_record("F2", "image/jpeg"),
        ];
        let out = reconcile(&records, &reg, None);
        let ids: Vec<&str> = out.new_refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["F3", "F1", "F2"]);
        assert_eq!(
            reg.urls(),
            vec!["/proxy/image/F3", "/proxy/image/F1", "/proxy/image/F2"]
        );
    }

    #[test]
    fn activity_record_parses_provider_json() {
        let raw = serde_json::json!({
            "timestamp": "2026-08-30T12:00:00Z",
            "primaryActionDetail": { "create": {} },
            "targets": [
                { "file": { "id": "F9", "mimeType": "image/png", "name": "party.png" } },
                { "driveItem": { "name": "items/other" } }
            ]
        });
        let rec: ActivityRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(rec.targets.len(), 2);
        assert_eq!(rec.targets[0].file.as_ref().unwrap().id, "F9");
        assert!(rec.targets[1].file.is_none());
        assert!(rec.timestamp.is_some());
    }
}
