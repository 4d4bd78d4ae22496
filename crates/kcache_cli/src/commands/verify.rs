//! Verify command implementation.

use super::open_frozen;
use kcache_core::entry::{compute_hash, for_each_entry};
use kcache_core::{CacheEntry, Segment};
use kcache_storage::{index_key, index_value};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Segments checked.
    pub segments_checked: usize,
    /// Unfrozen segments skipped.
    pub segments_skipped: usize,
    /// Log entries parsed.
    pub entries_checked: usize,
    /// Offset and hash index records checked.
    pub records_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying partition at {:?}", path);
    println!();

    let result = verify(path)?;
    println!("Segments checked: {}", result.segments_checked);
    println!("Segments skipped: {} (unfrozen)", result.segments_skipped);
    println!("Entries checked:  {}", result.entries_checked);
    println!("Index records:    {}", result.records_checked);
    for error in &result.errors {
        println!("  - {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Partition verification passed");
        Ok(())
    } else {
        println!("✗ Partition verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every frozen segment in `path`.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let (stored, segments) = open_frozen(path)?;
    let mut result = VerifyResult {
        segments_skipped: stored.iter().filter(|s| !s.frozen).count(),
        ..VerifyResult::default()
    };
    for segment in &segments {
        verify_segment(segment, &mut result);
        result.segments_checked += 1;
    }
    Ok(result)
}

fn verify_segment(segment: &Segment, result: &mut VerifyResult) {
    let base = segment.base_offset();

    let mut entries = 0usize;
    let parsed = segment.log_file().read_bytes(0, |bytes| {
        for_each_entry(bytes, |_| {
            entries += 1;
            Ok(())
        })
    });
    result.entries_checked += entries;
    if let Err(e) = parsed {
        result.errors.push(format!("segment @{}: {}", base, e));
        return;
    }

    let index = segment.index_file().to_vec();
    if index.len() != entries {
        result.errors.push(format!(
            "segment @{}: {} offset index records for {} entries",
            base,
            index.len(),
            entries
        ));
    }
    let mut previous: Option<u32> = None;
    for record in index {
        result.records_checked += 1;
        let (delta, position) = (index_key(record), index_value(record));
        if previous.is_some_and(|p| p >= delta) {
            result.errors.push(format!(
                "segment @{}: offset index not increasing at delta {}",
                base, delta
            ));
        }
        previous = Some(delta);

        let offset = entry_at(segment, position, |entry| entry.offset());
        let expected = base + i64::from(delta);
        match offset {
            Some(offset) if offset == expected => {}
            Some(offset) => result.errors.push(format!(
                "segment @{}: offset {} indexed at {} holds offset {}",
                base, expected, position, offset
            )),
            None => result.errors.push(format!(
                "segment @{}: offset {} points at unparseable position {}",
                base, expected, position
            )),
        }
    }

    let hashes = segment.hash_file().to_vec();
    if hashes.windows(2).any(|pair| pair[0] > pair[1]) {
        result
            .errors
            .push(format!("segment @{}: hash index is not sorted", base));
    }
    for record in hashes {
        result.records_checked += 1;
        let (hash, position) = (index_key(record), index_value(record));
        let matched = entry_at(segment, position, |entry| {
            compute_hash(entry.key_bytes()) == hash
                || entry.headers().any(|h| compute_hash(h.encoded()) == hash)
        });
        match matched {
            Some(true) => {}
            Some(false) => result.errors.push(format!(
                "segment @{}: hash {:08x} matches neither key nor headers at {}",
                base, hash, position
            )),
            None => result.errors.push(format!(
                "segment @{}: hash {:08x} points at unparseable position {}",
                base, hash, position
            )),
        }
    }
}

fn entry_at<T>(segment: &Segment, position: u32, f: impl FnOnce(&CacheEntry<'_>) -> T) -> Option<T> {
    segment
        .log_file()
        .read_bytes(position, |bytes| CacheEntry::try_wrap(bytes, position).map(|e| f(&e)))
}
