//! Dump command implementation.

use super::{nodes_of, open_frozen};
use kcache_core::{CacheEntry, ConditionSpec, CursorFactory, DeltaType, Evaluation, Filter};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// One printed entry.
#[derive(Debug, Serialize)]
pub struct DumpRecord {
    /// Partition offset.
    pub offset: i64,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Key, lossily decoded.
    pub key: Option<String>,
    /// Value or patch, lossily decoded; `None` for tombstones.
    pub value: Option<String>,
    /// Offset of the entry the value is a patch against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_of: Option<i64>,
    /// Headers in order.
    pub headers: Vec<HeaderRecord>,
    /// Raw entry flags.
    pub flags: i32,
}

/// One printed header.
#[derive(Debug, Serialize)]
pub struct HeaderRecord {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: Option<String>,
}

impl DumpRecord {
    fn of(entry: &CacheEntry<'_>) -> Self {
        let ancestor = entry.ancestor();
        Self {
            offset: entry.offset(),
            timestamp: entry.timestamp(),
            key: entry.key().map(lossy),
            value: entry.value().map(lossy),
            patch_of: (ancestor >= 0).then_some(ancestor),
            headers: entry
                .headers()
                .map(|h| HeaderRecord {
                    name: lossy(h.name),
                    value: h.value.map(lossy),
                })
                .collect(),
            flags: entry.flags().0,
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses a `name=value` header filter.
pub fn parse_header(spec: &str) -> Result<ConditionSpec, String> {
    spec.split_once('=')
        .map(|(name, value)| ConditionSpec::header(name, value))
        .ok_or_else(|| format!("header filter must be name=value, got {:?}", spec))
}

/// Builds the filter set for the given key and header flags.
pub fn filters(key: Option<&str>, headers: &[String]) -> Result<Vec<Filter>, String> {
    let mut conditions = Vec::new();
    if let Some(key) = key {
        conditions.push(ConditionSpec::key(Some(key.as_bytes())));
    }
    for header in headers {
        conditions.push(parse_header(header)?);
    }
    Ok(if conditions.is_empty() {
        Vec::new()
    } else {
        vec![Filter::new(conditions)]
    })
}

/// Reads matching entries of the frozen segments in `path`.
pub fn collect(
    path: &Path,
    offset: i64,
    filters: &[Filter],
    limit: Option<usize>,
    deltas: bool,
) -> Result<Vec<DumpRecord>, Box<dyn std::error::Error>> {
    let (_, segments) = open_frozen(path)?;
    let latest = segments.last().map_or(offset, |s| s.last_offset());
    let nodes = nodes_of(&segments);

    let factory = CursorFactory::new();
    let condition = factory.as_condition(filters, Evaluation::Lazy)?;
    let delta_type = if deltas {
        DeltaType::JsonPatch
    } else {
        DeltaType::None
    };
    let mut cursor = factory.new_cursor(condition, delta_type);
    let start = nodes.read(|list| {
        let node = list.seek_not_after(offset);
        if node.is_sentinel() {
            list.first()
        } else {
            node
        }
    });
    cursor.init(&nodes, start, offset, latest);
    debug!(cursor = %cursor, "dumping partition");

    let mut records = Vec::new();
    while limit.map_or(true, |limit| records.len() < limit) {
        let Some(buf) = cursor.next(&nodes) else {
            break;
        };
        let entry = buf.entry();
        records.push(DumpRecord::of(&entry));
        cursor.advance(&nodes, entry.offset() + 1);
    }
    cursor.close();
    Ok(records)
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    offset: i64,
    key: Option<&str>,
    headers: &[String],
    limit: Option<usize>,
    deltas: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let filters = filters(key, headers)?;
    let records = collect(path, offset, &filters, limit, deltas)?;

    for record in &records {
        match format {
            "json" => println!("{}", serde_json::to_string(record)?),
            _ => print_text_record(record),
        }
    }

    Ok(())
}

fn print_text_record(record: &DumpRecord) {
    let headers: Vec<String> = record
        .headers
        .iter()
        .map(|h| format!("{}={}", h.name, h.value.as_deref().unwrap_or("null")))
        .collect();
    let value = match (&record.value, record.patch_of) {
        (None, _) => "<tombstone>".to_string(),
        (Some(value), Some(ancestor)) => format!("patch of {}: {}", ancestor, value),
        (Some(value), None) => value.clone(),
    };
    println!(
        "{:>10} ts={} key={} value={} headers=[{}] flags={:#x}",
        record.offset,
        record.timestamp,
        record.key.as_deref().unwrap_or("null"),
        value,
        headers.join(", "),
        record.flags
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn builds_one_group_from_flags() {
        assert!(filters(None, &[]).unwrap().is_empty());

        let set = filters(Some("a"), &["type=created".to_string()]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].conditions.len(), 2);
        assert!(filters(None, &["no-separator".to_string()]).is_err());
    }

    #[test]
    fn dumps_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let location = testing::partition(dir.path());

        let all = collect(&location, 0, &[], None, false).unwrap();
        assert_eq!(all.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(all[0].headers[0].name, "type");

        let keyed = filters(Some("a"), &[]).unwrap();
        let found = collect(&location, 1, &keyed, None, false).unwrap();
        assert_eq!(found.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2]);

        let limited = collect(&location, 0, &[], Some(2), false).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
