//! Inspect command implementation.

use super::{format_size, open_frozen, partition_name};
use kcache_core::entry::for_each_entry;
use kcache_core::{segment_path, Segment, StoredSegment};
use serde::Serialize;
use std::path::Path;

/// Partition inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Partition directory.
    pub path: String,
    /// Topic name, from the directory name.
    pub topic: String,
    /// Partition id, from the directory name.
    pub partition: i32,
    /// Per-segment statistics, in base offset order.
    pub segments: Vec<SegmentStats>,
    /// Entries across frozen segments.
    pub entries: usize,
    /// Log bytes across frozen segments.
    pub log_bytes: u64,
    /// Dirty bytes across frozen segments.
    pub dirty_bytes: u64,
}

/// Statistics for a single segment.
#[derive(Debug, Default, Serialize)]
pub struct SegmentStats {
    /// Base offset.
    pub base_offset: i64,
    /// Whether the segment has its sorted indexes.
    pub frozen: bool,
    /// Last offset, for frozen segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_offset: Option<i64>,
    /// Log bytes in use.
    pub log_bytes: u64,
    /// Delta bytes in use.
    pub delta_bytes: u64,
    /// Entries in the log.
    pub entries: usize,
    /// Entries with a null value.
    pub tombstones: usize,
    /// Entries flagged dirty.
    pub dirty_entries: usize,
    /// Bytes of dirty entries.
    pub dirty_bytes: u64,
    /// Entries flagged aborted.
    pub aborted: usize,
    /// Hash index records.
    pub hash_records: u32,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics for the partition in `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let (topic, partition) = partition_name(path);
    let (stored, segments) = open_frozen(path)?;

    let mut result = InspectResult {
        path: path.display().to_string(),
        topic,
        partition,
        segments: Vec::with_capacity(stored.len()),
        entries: 0,
        log_bytes: 0,
        dirty_bytes: 0,
    };

    let mut frozen = segments.iter();
    for stored in &stored {
        let stats = if stored.frozen {
            let segment = frozen
                .next()
                .ok_or("frozen segment disappeared while inspecting")?;
            segment_stats(segment)?
        } else {
            unfrozen_stats(path, stored)
        };
        if stats.frozen {
            result.entries += stats.entries;
            result.log_bytes += stats.log_bytes;
            result.dirty_bytes += stats.dirty_bytes;
        }
        result.segments.push(stats);
    }

    Ok(result)
}

fn segment_stats(segment: &Segment) -> Result<SegmentStats, Box<dyn std::error::Error>> {
    let mut stats = SegmentStats {
        base_offset: segment.base_offset(),
        frozen: true,
        last_offset: Some(segment.last_offset()),
        log_bytes: u64::from(segment.log_file().capacity()),
        delta_bytes: u64::from(segment.delta_file().capacity()),
        hash_records: segment.hash_file().entries(),
        ..SegmentStats::default()
    };

    segment.log_file().read_bytes(0, |bytes| {
        for_each_entry(bytes, |entry| {
            stats.entries += 1;
            if entry.is_tombstone() {
                stats.tombstones += 1;
            }
            if entry.flags().is_dirty() {
                stats.dirty_entries += 1;
                stats.dirty_bytes += entry.sizeof() as u64;
            }
            if entry.flags().is_aborted() {
                stats.aborted += 1;
            }
            Ok(())
        })
    })?;

    Ok(stats)
}

fn unfrozen_stats(path: &Path, stored: &StoredSegment) -> SegmentStats {
    // appendable logs are preallocated, so only the file size is known
    let log_bytes = std::fs::metadata(segment_path(path, stored.base_offset, "log"))
        .map(|m| m.len())
        .unwrap_or(0);
    SegmentStats {
        base_offset: stored.base_offset,
        log_bytes,
        ..SegmentStats::default()
    }
}

fn print_text_output(result: &InspectResult) {
    println!("kcache Partition Inspection");
    println!("===========================");
    println!();
    println!("Path:      {}", result.path);
    println!("Partition: {}[{}]", result.topic, result.partition);
    println!();
    println!("Totals (frozen segments):");
    println!("  Entries:     {}", result.entries);
    println!("  Log size:    {} bytes", format_size(result.log_bytes));
    println!("  Dirty size:  {} bytes", format_size(result.dirty_bytes));
    println!();
    println!("Segments:");
    for segment in &result.segments {
        if !segment.frozen {
            println!(
                "  @{} unfrozen, {} bytes allocated",
                segment.base_offset,
                format_size(segment.log_bytes)
            );
            continue;
        }
        println!(
            "  @{}..{} {} entries, {} tombstones, {} dirty ({} bytes), {} aborted, log {} bytes, delta {} bytes",
            segment.base_offset,
            segment.last_offset.unwrap_or(segment.base_offset),
            segment.entries,
            segment.tombstones,
            segment.dirty_entries,
            format_size(segment.dirty_bytes),
            segment.aborted,
            format_size(segment.log_bytes),
            format_size(segment.delta_bytes)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn counts_frozen_entries() {
        let dir = tempfile::tempdir().unwrap();
        let location = testing::partition(dir.path());

        let result = inspect(&location).unwrap();
        assert_eq!(result.topic, "orders");
        assert_eq!(result.partition, 2);
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.entries, 3);

        let frozen = &result.segments[0];
        assert_eq!(frozen.last_offset, Some(2));
        assert_eq!(frozen.dirty_entries, 1);
        assert_eq!(frozen.dirty_bytes, result.dirty_bytes);
        assert_eq!(frozen.tombstones, 0);
        assert!(!result.segments[1].frozen);
    }
}
