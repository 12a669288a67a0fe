//! Record and file fixtures.

use serde_json::json;
use std::path::{Path, PathBuf};

use crate::pipeline::Record;

/// A learner activity record for content `n`.
#[must_use]
pub fn course_record(n: u32) -> Record {
    json!({
        "userId": format!("user-{n}"),
        "firstName": "Ada",
        "lastName": "Lovelace",
        "emailAddress": format!("user{n}@example.com"),
        "contentUuid": format!("00000000-0000-0000-0000-{n:012}"),
        "contentTitle": format!("Course {n}"),
        "contentType": "Course",
        "languageCode": "en-US",
        "status": "Completed",
        "completedDate": "2024-03-01T10:00:00Z",
    })
}

/// `count` learner activity records numbered from 1.
#[must_use]
pub fn course_records(count: u32) -> Vec<Record> {
    (1..=count).map(course_record).collect()
}

/// A lookup file entry mapping the content of [`course_record`] `n` to an
/// activity object.
#[must_use]
pub fn lookup_entry(n: u32) -> Record {
    json!({
        "contentUuid": format!("00000000-0000-0000-0000-{n:012}"),
        "xapiobject": {
            "objectType": "Activity",
            "id": format!("https://lms.example.com/activities/{n}"),
            "definition": {"name": {"en-US": format!("Mapped course {n}")}},
        },
    })
}

/// Writes `value` as JSON to `dir/name` and returns the path.
///
/// # Panics
///
/// Panics if the file cannot be written.
#[allow(clippy::expect_used)]
pub fn write_json_file(dir: &Path, name: &str, value: &serde_json::Value) -> PathBuf {
    let path = dir.join(name);
    let text = serde_json::to_string_pretty(value).expect("fixture serializes");
    std::fs::write(&path, text).expect("fixture is writable");
    path
}
