//! Clean command implementation.

use super::{format_size, open_frozen, partition_name};
use kcache_core::{CleanResult, NodeId, Partition, TopicConfig};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// A segment that holds dirty entries.
#[derive(Debug, Serialize)]
pub struct CleanCandidate {
    /// Base offset.
    pub base_offset: i64,
    /// Dirty bytes.
    pub dirty_bytes: u64,
    /// Dirty share of the log.
    pub dirty_ratio: f64,
}

/// Lists the frozen segments in `path` with dirty entries, without
/// modifying the directory.
pub fn candidates(path: &Path) -> Result<Vec<CleanCandidate>, Box<dyn std::error::Error>> {
    let (_, segments) = open_frozen(path)?;
    Ok(segments
        .iter()
        .filter(|s| s.dirty_bytes() > 0)
        .map(|s| CleanCandidate {
            base_offset: s.base_offset(),
            dirty_bytes: s.dirty_bytes(),
            dirty_ratio: s.cleanable_dirty_ratio(),
        })
        .collect())
}

/// Compacts every frozen segment in `path` that holds dirty entries.
///
/// Opening the partition discards unfrozen segments.
pub fn clean(path: &Path) -> Result<Vec<CleanResult>, Box<dyn std::error::Error>> {
    let (topic, id) = partition_name(path);
    let config = rewrite_config(path)?;
    let mut partition = Partition::open_dir(path.to_path_buf(), &topic, id, config)?;

    let dirty: Vec<NodeId> = partition.nodes().read(|list| {
        list.iter()
            .filter(|(_, segment)| segment.dirty_bytes() > 0)
            .map(|(node, _)| node)
            .collect()
    });

    let mut results = Vec::with_capacity(dirty.len());
    for node in dirty {
        if let Some(result) = partition.clean(node, i64::MAX)? {
            results.push(result);
        }
    }
    partition.close();
    Ok(results)
}

/// Sizes rewritten segments after the largest existing files, which a
/// cleaned segment never outgrows.
fn rewrite_config(path: &Path) -> Result<TopicConfig, Box<dyn std::error::Error>> {
    let (_, segments) = open_frozen(path)?;
    let mut log = 1u32;
    let mut index = 8u32;
    for segment in &segments {
        log = log
            .max(segment.log_file().capacity())
            .max(segment.delta_file().capacity());
        for file in [
            segment.index_file(),
            segment.hash_file(),
            segment.keys_file(),
            segment.nulls_file(),
        ] {
            index = index.max(file.file().capacity());
        }
    }
    let config = TopicConfig::new()
        .segment_bytes(log)
        .segment_index_bytes(index.next_multiple_of(8));
    config.validate()?;
    Ok(config)
}

/// Runs the clean command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if dry_run {
        let candidates = candidates(path)?;
        println!("Dry run - no changes will be made");
        println!();
        if candidates.is_empty() {
            println!("No segments hold dirty entries");
        }
        for candidate in &candidates {
            println!(
                "  @{} would reclaim {} bytes ({:.1}% dirty)",
                candidate.base_offset,
                format_size(candidate.dirty_bytes),
                candidate.dirty_ratio * 100.0
            );
        }
        return Ok(());
    }

    let results = clean(path)?;
    let reclaimed: u64 = results.iter().map(|r| r.bytes_saved).sum();
    for result in &results {
        println!(
            "  @{} kept {} of {} entries, reclaimed {} bytes{}",
            result.base_offset,
            result.output_entries,
            result.input_entries,
            format_size(result.bytes_saved),
            if result.node_removed {
                ", segment removed"
            } else {
                ""
            }
        );
    }
    info!(
        segments = results.len(),
        bytes_saved = reclaimed,
        "cleaned partition"
    );
    println!();
    println!(
        "✓ Cleaned {} segment(s), reclaimed {} bytes",
        results.len(),
        format_size(reclaimed)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{dump, testing};

    #[test]
    fn dry_run_leaves_directory_alone() {
        let dir = tempfile::tempdir().unwrap();
        let location = testing::partition(dir.path());

        let listed = candidates(&location).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].base_offset, 0);
        assert!(listed[0].dirty_ratio > 0.0);

        let (stored, _) = open_frozen(&location).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn clean_drops_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let location = testing::partition(dir.path());

        let results = clean(&location).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dirty_removed(), 1);

        let remaining = dump::collect(&location, 0, &[], None, false).unwrap();
        assert_eq!(remaining.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert!(candidates(&location).unwrap().is_empty());
    }
}
