//! Tests for workspace bookkeeping
//!
//! These tests verify:
//! - Delete, move and clear invalidate handles opened before them
//! - Moved objects keep their data under the new name
//! - Directory listing and object types
//! - Fragment summaries and recovery of interrupted writes

use std::fs;

use tempfile::TempDir;
use tilestore::{
    ArrayMode, ArraySchema, Config, Datatype, DirType, ReadStatus, StorageManager, SyncStrategy,
    TileError,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_manager() -> (TempDir, StorageManager) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .workspace(temp_dir.path())
        .sync_strategy(SyncStrategy::None)
        .aio_workers(1)
        .build();
    let manager = StorageManager::open(config).unwrap();
    (temp_dir, manager)
}

fn sparse_1d(manager: &StorageManager, name: &str) {
    let schema = ArraySchema::builder(name)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["d1"])
        .domain(&[(0, 99)])
        .capacity(4)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();
}

fn i32_buffer(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i64_buffer(values: impl IntoIterator<Item = i64>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn write_range(manager: &StorageManager, name: &str, start: i64, end: i64) {
    let array = manager.array_init(name, ArrayMode::Write, None, &[]).unwrap();
    array
        .write(&[
            &i32_buffer((start..end).map(|v| v as i32)),
            &i64_buffer(start..end),
        ])
        .unwrap();
    array.finalize().unwrap();
}

fn read_values(manager: &StorageManager, name: &str) -> Vec<i32> {
    let array = manager.array_init(name, ArrayMode::Read, None, &["a1"]).unwrap();
    let mut buf = vec![0u8; 4096];
    let mut buffers: Vec<&mut [u8]> = vec![buf.as_mut_slice()];
    let outcome = array.read(&mut buffers).unwrap();
    assert_eq!(outcome.status, ReadStatus::Complete);
    array.finalize().unwrap();
    buf[..outcome.sizes[0]]
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// =============================================================================
// Invalidation Tests
// =============================================================================

#[test]
fn test_delete_invalidates_open_handles() {
    let (temp, manager) = setup_manager();
    sparse_1d(&manager, "arr");
    write_range(&manager, "arr", 0, 10);

    let reader = manager.array_init("arr", ArrayMode::Read, None, &[]).unwrap();
    let writer = manager.array_init("arr", ArrayMode::Write, None, &[]).unwrap();
    manager.delete("arr").unwrap();

    let mut buf = vec![0u8; 64];
    let mut coords = vec![0u8; 64];
    let mut buffers: Vec<&mut [u8]> = vec![buf.as_mut_slice(), coords.as_mut_slice()];
    assert!(matches!(reader.read(&mut buffers), Err(TileError::InvalidHandle(_))));
    assert!(matches!(
        writer.write(&[&i32_buffer([1]), &i64_buffer([1])]),
        Err(TileError::InvalidHandle(_))
    ));
    assert!(matches!(reader.finalize(), Err(TileError::InvalidHandle(_))));
    assert!(matches!(writer.finalize(), Err(TileError::InvalidHandle(_))));

    assert!(!temp.path().join("arr").exists());
    assert_eq!(manager.dir_type("arr"), DirType::None);
    assert!(matches!(
        manager.array_init("arr", ArrayMode::Read, None, &[]),
        Err(TileError::NotFound(_))
    ));
}

#[test]
fn test_delete_missing_object() {
    let (_temp, manager) = setup_manager();
    assert!(matches!(manager.delete("nothing"), Err(TileError::NotFound(_))));
}

#[test]
fn test_move_keeps_data_under_new_name() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "old");
    write_range(&manager, "old", 0, 5);

    let reader = manager.array_init("old", ArrayMode::Read, None, &[]).unwrap();
    manager.move_object("old", "group/new").unwrap();
    assert!(matches!(reader.is_complete(), Err(TileError::InvalidHandle(_))));

    assert_eq!(manager.dir_type("old"), DirType::None);
    assert_eq!(manager.dir_type("group/new"), DirType::Array);
    assert_eq!(manager.array_schema("group/new").unwrap().name(), "group/new");
    assert_eq!(read_values(&manager, "group/new"), vec![0, 1, 2, 3, 4]);

    // New writes land next to the moved fragments
    write_range(&manager, "group/new", 5, 8);
    assert_eq!(read_values(&manager, "group/new"), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_move_onto_existing_name_fails() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "a");
    sparse_1d(&manager, "b");

    assert!(matches!(
        manager.move_object("a", "b"),
        Err(TileError::AlreadyExists(_))
    ));
    assert_eq!(manager.dir_type("a"), DirType::Array);
}

#[test]
fn test_clear_keeps_schema_and_drops_fragments() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "arr");
    write_range(&manager, "arr", 0, 10);

    let writer = manager.array_init("arr", ArrayMode::Write, None, &[]).unwrap();
    manager.clear("arr").unwrap();
    assert!(matches!(
        writer.write(&[&i32_buffer([1]), &i64_buffer([1])]),
        Err(TileError::InvalidHandle(_))
    ));

    assert!(manager.fragment_info("arr").unwrap().is_empty());
    assert_eq!(manager.dir_type("arr"), DirType::Array);
    assert!(read_values(&manager, "arr").is_empty());

    // The stale writer no longer blocks a new one
    write_range(&manager, "arr", 3, 4);
    drop(writer);
    let second = manager.array_init("arr", ArrayMode::Write, None, &[]).unwrap();
    second.finalize().unwrap();
    assert_eq!(read_values(&manager, "arr"), vec![3]);
}

#[test]
fn test_clear_metadata() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::metadata_builder("meta")
        .attributes(&["v"])
        .types(&[Datatype::Int32])
        .build()
        .unwrap();
    manager.metadata_create(&schema).unwrap();

    let metadata = manager.metadata_init("meta", ArrayMode::Write, &[]).unwrap();
    metadata.write(b"k\0", &[&i32_buffer([1])]).unwrap();
    metadata.finalize().unwrap();
    assert_eq!(manager.fragment_info("meta").unwrap().len(), 1);

    manager.clear("meta").unwrap();
    assert!(manager.fragment_info("meta").unwrap().is_empty());
    assert_eq!(manager.dir_type("meta"), DirType::Metadata);
}

// =============================================================================
// Listing Tests
// =============================================================================

#[test]
fn test_ls_reports_object_types() {
    let (temp, manager) = setup_manager();
    sparse_1d(&manager, "arr");
    let schema = ArraySchema::metadata_builder("meta")
        .attributes(&["v"])
        .types(&[Datatype::Int32])
        .build()
        .unwrap();
    manager.metadata_create(&schema).unwrap();
    fs::create_dir(temp.path().join("plain")).unwrap();

    let listing = manager.ls("").unwrap();
    assert_eq!(
        listing,
        vec![
            ("arr".to_string(), DirType::Array),
            ("meta".to_string(), DirType::Metadata),
            ("plain".to_string(), DirType::None),
        ]
    );
    assert!(matches!(manager.ls("missing"), Err(TileError::NotFound(_))));
}

#[test]
fn test_ls_sorted_by_name() {
    let (temp, manager) = setup_manager();
    sparse_1d(&manager, "zeta");
    fs::create_dir(temp.path().join("mid")).unwrap();
    sparse_1d(&manager, "alpha");

    let names: Vec<String> = manager.ls("").unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

// =============================================================================
// Fragment Tests
// =============================================================================

#[test]
fn test_fragment_info_in_creation_order() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "arr");
    write_range(&manager, "arr", 0, 10);
    write_range(&manager, "arr", 50, 53);

    let info = manager.fragment_info("arr").unwrap();
    assert_eq!(info.len(), 2);
    assert!(info[0].id < info[1].id);
    assert_eq!(info[0].cell_num, 10);
    assert_eq!(info[0].tile_num, 3);
    assert_eq!(info[0].non_empty_domain, Some(vec![(0, 9)]));
    assert_eq!(info[1].cell_num, 3);
    assert_eq!(info[1].non_empty_domain, Some(vec![(50, 52)]));
}

#[test]
fn test_temp_fragments_removed_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manager = StorageManager::open_path(temp_dir.path()).unwrap();
        sparse_1d(&manager, "arr");
        write_range(&manager, "arr", 0, 4);
    }

    // Leftover of an interrupted writer
    let stale = temp_dir.path().join("arr").join(".__tmp_frag_000000000009_0000");
    fs::create_dir(&stale).unwrap();
    fs::write(stale.join("a1.tdb"), b"partial").unwrap();

    let manager = StorageManager::open_path(temp_dir.path()).unwrap();
    assert_eq!(read_values(&manager, "arr"), vec![0, 1, 2, 3]);
    assert!(!stale.exists());
    assert_eq!(manager.fragment_info("arr").unwrap().len(), 1);
}
