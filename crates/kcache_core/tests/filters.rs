//! Filter algebra checked against a naive scan of every entry.

use kcache_core::{
    CacheEntry, ConditionSpec, CursorFactory, DeltaType, EntryBuf, Evaluation, Filter, Header,
    Partition, Record, Skip, TopicConfig, ValueMatch,
};
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

#[derive(Debug, Clone)]
struct Input {
    key: Option<Vec<u8>>,
    headers: Vec<Header>,
}

fn populate(inputs: &[Input]) -> (TempDir, Partition) {
    let dir = tempdir().unwrap();
    let config = TopicConfig::new().segment_bytes(2048).segment_index_bytes(1024);
    let mut partition = Partition::new(dir.path(), "filters", 0, config).unwrap();
    for (offset, input) in inputs.iter().enumerate() {
        partition
            .write_entry(
                &Record::new(offset as i64, input.key.as_deref(), Some(b"value"))
                    .headers(&input.headers),
                None,
                DeltaType::None,
            )
            .unwrap();
    }
    (dir, partition)
}

/// Returns every `(offset, mask)` the cursor reports.
fn run(partition: &Partition, filters: &[Filter], evaluation: Evaluation) -> Vec<(i64, u64)> {
    let factory = CursorFactory::new();
    let condition = factory.as_condition(filters, evaluation).unwrap();
    let mut cursor = factory.new_cursor(condition, DeltaType::None);
    cursor.init(partition.nodes(), partition.first(), 0, partition.progress());
    let mut matches = Vec::new();
    while let Some(entry) = cursor.next(partition.nodes()) {
        let offset = entry.entry().offset();
        matches.push((offset, cursor.filters()));
        cursor.advance(partition.nodes(), offset + 1);
    }
    matches
}

fn holds(spec: &ConditionSpec, entry: &CacheEntry<'_>) -> bool {
    match spec {
        ConditionSpec::Key(key) => entry.key() == key.as_deref(),
        ConditionSpec::Header(header) => entry
            .headers()
            .any(|h| h.name == header.name.as_slice() && h.value == header.value.as_deref()),
        ConditionSpec::Not(nested) => !holds(nested, entry),
        ConditionSpec::Headers { name, matches } => {
            let values: Vec<_> = entry
                .headers()
                .filter(|h| h.name == name.as_slice())
                .map(|h| h.value)
                .collect();
            sequence_holds(matches, &values)
        }
    }
}

fn sequence_holds(matches: &[ValueMatch], values: &[Option<&[u8]>]) -> bool {
    let mut at = 0;
    for m in matches {
        match m {
            ValueMatch::Skip(Skip::Many) => return true,
            ValueMatch::Skip(Skip::One) if at < values.len() => at += 1,
            ValueMatch::Value(v) if at < values.len() && values[at] == Some(v.as_slice()) => at += 1,
            _ => return false,
        }
    }
    at == values.len()
}

fn expected(
    partition: &Partition,
    filters: &[Filter],
    evaluation: Evaluation,
) -> Vec<(i64, u64)> {
    let mut matches = Vec::new();
    for buf in factory_scan(partition) {
        let entry = buf.entry();
        let mut mask = 0u64;
        for (bit, group) in filters.iter().enumerate() {
            if group.conditions.iter().all(|c| holds(c, &entry)) {
                mask |= 1 << bit;
            }
        }
        if filters.is_empty() {
            mask = 1;
        } else if filters.len() == 1 {
            mask = u64::from(mask != 0);
        } else if evaluation == Evaluation::Lazy {
            mask &= mask.wrapping_neg();
        }
        if mask != 0 {
            matches.push((entry.offset(), mask));
        }
    }
    matches
}

fn factory_scan(partition: &Partition) -> Vec<EntryBuf> {
    let factory = CursorFactory::new();
    let condition = factory.as_condition(&[], Evaluation::Lazy).unwrap();
    let mut cursor = factory.new_cursor(condition, DeltaType::None);
    cursor.init(partition.nodes(), partition.first(), 0, partition.progress());
    let mut entries = Vec::new();
    while let Some(entry) = cursor.next(partition.nodes()) {
        let offset = entry.entry().offset();
        entries.push(entry);
        cursor.advance(partition.nodes(), offset + 1);
    }
    entries
}

fn fixture() -> Vec<Input> {
    let h = |n: &str, v: &str| Header::new(n, v);
    let rows = vec![
        (Some("a"), vec![h("x", "1")]),
        (Some("b"), vec![h("x", "2"), h("y", "1")]),
        (None, vec![]),
        (Some("a"), vec![h("x", "1"), h("x", "2")]),
        (Some("c"), vec![h("y", "2")]),
        (Some("b"), vec![h("x", "1"), h("y", "2"), h("x", "1")]),
    ];
    rows.into_iter()
        .cycle()
        .take(60)
        .map(|(key, headers)| Input {
            key: key.map(|k: &str| k.as_bytes().to_vec()),
            headers,
        })
        .collect()
}

fn offsets(matches: &[(i64, u64)]) -> Vec<i64> {
    matches.iter().map(|(offset, _)| *offset).collect()
}

#[test]
fn fixture_spans_several_segments() {
    let (_dir, partition) = populate(&fixture());
    assert!(partition.nodes().read(|list| list.len()) >= 2);
    assert_eq!(factory_scan(&partition).len(), 60);
}

#[test]
fn conjunction_is_idempotent() {
    let (_dir, partition) = populate(&fixture());
    let a = ConditionSpec::header("x", "1");
    let single = run(&partition, &[Filter::of(a.clone())], Evaluation::Lazy);
    let doubled = run(&partition, &[Filter::new(vec![a.clone(), a])], Evaluation::Lazy);
    assert!(!single.is_empty());
    assert_eq!(offsets(&doubled), offsets(&single));
}

#[test]
fn single_group_or_is_the_group() {
    let (_dir, partition) = populate(&fixture());
    let group = Filter::new(vec![
        ConditionSpec::key(Some(b"b")),
        ConditionSpec::header("y", "2"),
    ]);
    let lazy = run(&partition, &[group.clone()], Evaluation::Lazy);
    let eager = run(&partition, &[group], Evaluation::Eager);
    assert_eq!(lazy, eager);
    assert_eq!(offsets(&lazy), (0..10).map(|i| i * 6 + 5).collect::<Vec<_>>());
}

#[test]
fn double_negation_is_identity() {
    let (_dir, partition) = populate(&fixture());
    let a = ConditionSpec::key(Some(b"a"));
    let plain = run(&partition, &[Filter::of(a.clone())], Evaluation::Lazy);
    let negated = run(
        &partition,
        &[Filter::of(ConditionSpec::not(ConditionSpec::not(a)))],
        Evaluation::Lazy,
    );
    assert_eq!(negated, plain);
}

#[test]
fn negation_partitions_the_log() {
    let (_dir, partition) = populate(&fixture());
    let a = ConditionSpec::header("y", "1");
    let yes = offsets(&run(&partition, &[Filter::of(a.clone())], Evaluation::Lazy));
    let no = offsets(&run(&partition, &[Filter::of(ConditionSpec::not(a))], Evaluation::Lazy));
    let mut all: Vec<i64> = yes.iter().chain(&no).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..60).collect::<Vec<_>>());
    assert!(yes.iter().all(|o| !no.contains(o)));
}

#[test]
fn eager_reports_every_matching_group() {
    let (_dir, partition) = populate(&fixture());
    let filters = [
        Filter::of(ConditionSpec::key(Some(b"a"))),
        Filter::of(ConditionSpec::header("x", "1")),
    ];
    let eager = run(&partition, &filters, Evaluation::Eager);
    let lazy = run(&partition, &filters, Evaluation::Lazy);
    assert_eq!(offsets(&eager), offsets(&lazy));
    assert_eq!(eager[0], (0, 0b11));
    assert_eq!(lazy[0], (0, 0b01));
    assert!(eager.contains(&(5, 0b10)));
}

#[test]
fn header_sequences_follow_header_order() {
    let (_dir, partition) = populate(&fixture());
    let exact = ConditionSpec::headers("x", vec![ValueMatch::value("1"), ValueMatch::value("2")]);
    assert_eq!(
        offsets(&run(&partition, &[Filter::of(exact)], Evaluation::Lazy))[..2],
        [3, 9]
    );

    let open = ConditionSpec::headers("x", vec![ValueMatch::value("1"), ValueMatch::Skip(Skip::Many)]);
    let found = offsets(&run(&partition, &[Filter::of(open)], Evaluation::Lazy));
    assert_eq!(found[..3], [0, 3, 5]);
}

fn key_strategy() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop_oneof![
        Just(None),
        prop::sample::select(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]).prop_map(Some),
    ]
}

fn name_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["x", "y"])
}

fn value_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["1", "2"])
}

fn header_strategy() -> impl Strategy<Value = Header> {
    (name_strategy(), value_strategy()).prop_map(|(name, value)| Header::new(name, value))
}

fn input_strategy() -> impl Strategy<Value = Input> {
    (key_strategy(), prop::collection::vec(header_strategy(), 0..4))
        .prop_map(|(key, headers)| Input { key, headers })
}

fn sequence_strategy() -> impl Strategy<Value = ConditionSpec> {
    let element = prop_oneof![
        value_strategy().prop_map(ValueMatch::value),
        Just(ValueMatch::Skip(Skip::One)),
    ];
    (name_strategy(), prop::collection::vec(element, 0..3), any::<bool>()).prop_map(
        |(name, mut matches, open)| {
            if open {
                matches.push(ValueMatch::Skip(Skip::Many));
            }
            ConditionSpec::headers(name, matches)
        },
    )
}

fn condition_strategy() -> impl Strategy<Value = ConditionSpec> {
    let leaf = prop_oneof![
        key_strategy().prop_map(ConditionSpec::Key),
        header_strategy().prop_map(ConditionSpec::Header),
        sequence_strategy(),
    ];
    leaf.prop_recursive(2, 8, 1, |inner| inner.prop_map(ConditionSpec::not))
}

fn filters_strategy() -> impl Strategy<Value = Vec<Filter>> {
    prop::collection::vec(
        prop::collection::vec(condition_strategy(), 1..3).prop_map(Filter::new),
        0..4,
    )
}

fn evaluation_strategy() -> impl Strategy<Value = Evaluation> {
    prop_oneof![Just(Evaluation::Lazy), Just(Evaluation::Eager)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn cursor_matches_naive_scan(
        inputs in prop::collection::vec(input_strategy(), 1..40),
        filters in filters_strategy(),
        evaluation in evaluation_strategy(),
    ) {
        let (_dir, partition) = populate(&inputs);
        prop_assert_eq!(
            run(&partition, &filters, evaluation),
            expected(&partition, &filters, evaluation)
        );
    }
}
