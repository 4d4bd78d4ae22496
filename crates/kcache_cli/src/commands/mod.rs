//! CLI command implementations.

pub mod clean;
pub mod dump;
pub mod inspect;
pub mod verify;

use kcache_core::{stored_segments, PartitionNodes, Segment, StoredSegment};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

/// Splits a partition directory name into topic and partition id.
///
/// Recognizes `{topic}-{id}` and `{topic}-{id}-{index}`; any other name is
/// taken as the topic of partition 0.
pub fn partition_name(path: &Path) -> (String, i32) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some((rest, last)) = name.rsplit_once('-') else {
        return (name, 0);
    };
    let Ok(last) = last.parse::<i32>() else {
        return (name, 0);
    };
    match rest.rsplit_once('-') {
        Some((topic, id)) if !topic.is_empty() => match id.parse::<i32>() {
            Ok(id) => (topic.to_string(), id),
            Err(_) => (rest.to_string(), last),
        },
        _ => (rest.to_string(), last),
    }
}

/// Opens every frozen segment in `path` without touching unfrozen ones.
pub fn open_frozen(
    path: &Path,
) -> Result<(Vec<StoredSegment>, Vec<Arc<Segment>>), Box<dyn Error>> {
    if !path.is_dir() {
        return Err(format!("No partition directory at {:?}", path).into());
    }
    let (topic, id) = partition_name(path);
    let stored = stored_segments(path)?;
    let segments = stored
        .iter()
        .filter(|s| s.frozen)
        .map(|s| Segment::open(path, &topic, id, s.base_offset))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((stored, segments))
}

/// Links `segments` into a node list cursors can read.
pub fn nodes_of(segments: &[Arc<Segment>]) -> PartitionNodes {
    let nodes = PartitionNodes::new();
    nodes.write(|list| {
        for segment in segments {
            list.push_back(Arc::clone(segment));
        }
    });
    nodes
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
