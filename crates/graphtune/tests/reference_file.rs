use graphtune::graph::SubgraphKey;
use graphtune::reference::{load_records, save_records, ReferenceRecord};
use graphtune::schedule::ScheduleEntity;

#[test]
fn records_round_trip_through_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reference.txt");

    let records = vec![
        ReferenceRecord {
            key: SubgraphKey(0),
            entity: ScheduleEntity::new("tile=16;vec=4;unroll=2").unwrap(),
            gflops: Some(12.5),
            elapsed_ms: Some(0.08),
        },
        ReferenceRecord {
            key: SubgraphKey(3),
            entity: ScheduleEntity::new("tile=1;vec=1;unroll=1").unwrap(),
            gflops: None,
            elapsed_ms: None,
        },
    ];
    save_records(&path, &records).expect("save");

    let loaded = load_records(&path).expect("load");
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].key, SubgraphKey(0));
    assert_eq!(loaded[0].entity.as_str(), "tile=16;vec=4;unroll=2");
    assert_eq!(loaded[0].gflops, Some(12.5));
    assert_eq!(loaded[0].elapsed_ms, Some(0.08));
    assert_eq!(loaded[1].key, SubgraphKey(3));
    assert_eq!(loaded[1].gflops, None);
}

#[test]
fn fields_beyond_entity_are_optional_on_read() {
    let record: ReferenceRecord = "7|tile=2;vec=2;unroll=1".parse().expect("two fields parse");
    assert_eq!(record.key, SubgraphKey(7));
    assert_eq!(record.gflops, None);

    let record: ReferenceRecord = "7|tile=2;vec=2;unroll=1|3.5".parse().expect("three fields");
    assert_eq!(record.gflops, Some(3.5));
    assert_eq!(record.elapsed_ms, None);
}

#[test]
fn malformed_lines_are_rejected() {
    assert!("".parse::<ReferenceRecord>().is_err());
    assert!("notakey|tile=1;vec=1;unroll=1".parse::<ReferenceRecord>().is_err());
    assert!("5".parse::<ReferenceRecord>().is_err());
}

#[test]
fn entities_reject_record_separators() {
    assert!(ScheduleEntity::new("tile=1|vec=1").is_err());
    assert!(ScheduleEntity::new("tile=1\nvec=1").is_err());
    assert!(ScheduleEntity::new("").is_err());
}
