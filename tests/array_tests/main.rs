//! Tests for the buffer read/write protocol
//!
//! These tests verify:
//! - Round-trips of dense and sparse arrays (fixed and variable-length)
//! - Overflow is resumable and never loses or repeats cells
//! - Last-writer-wins across fragments
//! - Empty cells of dense arrays read back as the fill value
//! - Write validation errors leave the fragment untouched
//! - Fragment visibility (finalize, sync, dropped handles)
//! - Column-major and Hilbert orders, space tiles on sparse arrays

use tempfile::TempDir;
use tilestore::{
    Array, ArrayMode, ArraySchema, CellValNum, Compressor, Config, Datatype, Layout, ReadStatus,
    StorageManager, SyncStrategy, TileError,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_manager() -> (TempDir, StorageManager) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .workspace(temp_dir.path())
        .sync_strategy(SyncStrategy::None)
        .aio_workers(2)
        .build();
    let manager = StorageManager::open(config).unwrap();
    (temp_dir, manager)
}

/// One int32 attribute over [0, 99], tile extent 10
fn dense_1d(manager: &StorageManager, name: &str) {
    let schema = ArraySchema::builder(name)
        .dense(true)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["d1"])
        .domain(&[(0, 99)])
        .tile_extents(&[10])
        .capacity(10)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();
}

/// One int32 attribute over [0, 99], sparse
fn sparse_1d(manager: &StorageManager, name: &str, capacity: u64) {
    let schema = ArraySchema::builder(name)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["d1"])
        .domain(&[(0, 99)])
        .capacity(capacity)
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

fn decode_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn decode_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            i64::from_le_bytes(raw)
        })
        .collect()
}

fn write_all(manager: &StorageManager, name: &str, buffers: &[&[u8]]) {
    let array = manager.array_init(name, ArrayMode::Write, None, &[]).unwrap();
    array.write(buffers).unwrap();
    array.finalize().unwrap();
}

/// Read fixed-size slots until complete, concatenating each slot
fn read_to_end(array: &Array, capacities: &[usize]) -> Vec<Vec<u8>> {
    let mut storage: Vec<Vec<u8>> = capacities.iter().map(|&c| vec![0u8; c]).collect();
    let mut result = vec![Vec::new(); capacities.len()];

    for _ in 0..10_000 {
        let mut buffers: Vec<&mut [u8]> = storage.iter_mut().map(|b| b.as_mut_slice()).collect();
        let outcome = array.read(&mut buffers).unwrap();
        for (slot, &size) in outcome.sizes.iter().enumerate() {
            result[slot].extend_from_slice(&storage[slot][..size]);
        }
        if outcome.status == ReadStatus::Complete {
            return result;
        }
    }
    panic!("read never completed");
}

fn read_all(manager: &StorageManager, name: &str, subarray: Option<&[(i64, i64)]>, capacities: &[usize]) -> Vec<Vec<u8>> {
    let array = manager.array_init(name, ArrayMode::Read, subarray, &[]).unwrap();
    let result = read_to_end(&array, capacities);
    array.finalize().unwrap();
    result
}

// =============================================================================
// Dense Tests
// =============================================================================

#[test]
fn test_dense_read_in_four_exact_buffers() {
    let (_temp, manager) = setup_manager();
    dense_1d(&manager, "dense");
    write_all(&manager, "dense", &[&i32_buffer(0..100)]);

    let array = manager.array_init("dense", ArrayMode::Read, None, &[]).unwrap();
    let mut storage = vec![0u8; 25 * 4];
    let mut seen = Vec::new();

    for round in 0..4 {
        let mut buffers: Vec<&mut [u8]> = vec![storage.as_mut_slice()];
        let outcome = array.read(&mut buffers).unwrap();

        assert_ne!(outcome.status, ReadStatus::Overflow);
        assert_eq!(outcome.sizes, vec![100]);
        let values = decode_i32(&storage);
        assert_eq!(values, (round * 25..round * 25 + 25).collect::<Vec<_>>());
        seen.extend(values);

        if round == 3 {
            assert_eq!(outcome.status, ReadStatus::Complete);
        }
    }
    assert!(!array.overflow("a1").unwrap());
    assert_eq!(seen, (0..100).collect::<Vec<_>>());

    // Complete is terminal
    let mut buffers: Vec<&mut [u8]> = vec![storage.as_mut_slice()];
    let outcome = array.read(&mut buffers).unwrap();
    assert_eq!(outcome.sizes, vec![0]);
    assert_eq!(outcome.status, ReadStatus::Complete);
    array.finalize().unwrap();
}

#[test]
fn test_dense_unwritten_cells_read_as_fill_value() {
    let (_temp, manager) = setup_manager();
    dense_1d(&manager, "dense");

    let array = manager
        .array_init("dense", ArrayMode::Write, Some(&[(10, 19)]), &[])
        .unwrap();
    array.write(&[&i32_buffer(100..110)]).unwrap();
    array.finalize().unwrap();

    let result = read_all(&manager, "dense", Some(&[(5, 24)]), &[4096]);
    let values = decode_i32(&result[0]);

    let mut expected = vec![i32::MAX; 5];
    expected.extend(100..110);
    expected.extend(vec![i32::MAX; 5]);
    assert_eq!(values, expected);
}

#[test]
fn test_dense_2d_global_order_and_coordinates() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::builder("grid")
        .dense(true)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["rows", "cols"])
        .domain(&[(0, 3), (0, 3)])
        .tile_extents(&[2, 2])
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();
    write_all(&manager, "grid", &[&i32_buffer(0..16)]);

    let array = manager
        .array_init("grid", ArrayMode::Read, None, &["a1", "__coords"])
        .unwrap();
    let result = read_to_end(&array, &[4096, 4096]);
    array.finalize().unwrap();

    assert_eq!(decode_i32(&result[0]), (0..16).collect::<Vec<_>>());
    // Tile (0,0) in row-major cell order, then tile (0,1)
    let coords = decode_i64(&result[1]);
    assert_eq!(
        &coords[..16],
        &[0, 0, 0, 1, 1, 0, 1, 1, 0, 2, 0, 3, 1, 2, 1, 3]
    );
}

#[test]
fn test_dense_write_past_subarray_rejected() {
    let (_temp, manager) = setup_manager();
    dense_1d(&manager, "dense");

    let array = manager
        .array_init("dense", ArrayMode::Write, Some(&[(0, 9)]), &[])
        .unwrap();
    array.write(&[&i32_buffer(0..8)]).unwrap();

    let err = array.write(&[&i32_buffer(0..3)]).unwrap_err();
    assert!(matches!(err, TileError::BufferMismatch(_)));

    // The rejected call left the fragment as it was
    array.write(&[&i32_buffer(8..10)]).unwrap();
    array.finalize().unwrap();

    let result = read_all(&manager, "dense", Some(&[(0, 9)]), &[4096]);
    assert_eq!(decode_i32(&result[0]), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_dense_rejects_coordinates_buffer() {
    let (_temp, manager) = setup_manager();
    dense_1d(&manager, "dense");

    let err = manager
        .array_init("dense", ArrayMode::Write, None, &["a1", "__coords"])
        .err()
        .unwrap();
    assert!(matches!(err, TileError::InvalidArgument(_)));
}

#[test]
fn test_dense_write_over_huge_domain_rejected() {
    let (_temp, manager) = setup_manager();
    let side = (1i64 << 33) - 1;
    let schema = ArraySchema::builder("huge")
        .dense(true)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["x", "y"])
        .domain(&[(0, side), (0, side)])
        .tile_extents(&[1 << 20, 1 << 20])
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();

    // 2^66 cells cannot be counted
    let err = manager
        .array_init("huge", ArrayMode::Write, None, &[])
        .err()
        .unwrap();
    assert!(matches!(err, TileError::InvalidArgument(_)));

    // The rejected writer released its slot; a small region still writes
    let array = manager
        .array_init("huge", ArrayMode::Write, Some(&[(0, 1), (0, 1)]), &[])
        .unwrap();
    array.write(&[&i32_buffer(0..4)]).unwrap();
    array.finalize().unwrap();
    assert_eq!(manager.fragment_info("huge").unwrap()[0].cell_num, 4);
}

// =============================================================================
// Layout Tests
// =============================================================================

/// Cells of a 4x6 domain with 2x3 tiles, both orders column-major
fn col_major_order() -> Vec<(i64, i64)> {
    let mut cells = Vec::new();
    for ty in 0..2 {
        for tx in 0..2 {
            for y in 0..3 {
                for x in 0..2 {
                    cells.push((tx * 2 + x, ty * 3 + y));
                }
            }
        }
    }
    cells
}

fn pairs(coords: &[i64]) -> Vec<(i64, i64)> {
    coords.chunks_exact(2).map(|c| (c[0], c[1])).collect()
}

#[test]
fn test_dense_col_major_round_trip() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::builder("cols")
        .dense(true)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["x", "y"])
        .domain(&[(0, 3), (0, 5)])
        .tile_extents(&[2, 3])
        .cell_order(Layout::ColMajor)
        .tile_order(Layout::ColMajor)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();
    write_all(&manager, "cols", &[&i32_buffer(0..24)]);

    let order = col_major_order();
    let array = manager
        .array_init("cols", ArrayMode::Read, None, &["a1", "__coords"])
        .unwrap();
    let result = read_to_end(&array, &[4096, 4096]);
    array.finalize().unwrap();
    assert_eq!(decode_i32(&result[0]), (0..24).collect::<Vec<_>>());
    assert_eq!(pairs(&decode_i64(&result[1])), order);

    // Overwrite a region spanning all four tiles
    let region = [(1, 2), (2, 3)];
    let inside = |&(x, y): &(i64, i64)| (1..=2).contains(&x) && (2..=3).contains(&y);
    let array = manager
        .array_init("cols", ArrayMode::Write, Some(&region[..]), &[])
        .unwrap();
    array.write(&[&i32_buffer(100..104)]).unwrap();
    array.finalize().unwrap();

    let mut next = 100;
    let expected: Vec<i32> = order
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            if inside(cell) {
                next += 1;
                next - 1
            } else {
                i as i32
            }
        })
        .collect();
    let result = read_all(&manager, "cols", None, &[4096]);
    assert_eq!(decode_i32(&result[0]), expected);

    // A subarray read keeps the global order
    let array = manager
        .array_init("cols", ArrayMode::Read, Some(&region[..]), &["__coords"])
        .unwrap();
    let result = read_to_end(&array, &[4096]);
    array.finalize().unwrap();
    let in_region: Vec<(i64, i64)> = order.iter().copied().filter(inside).collect();
    assert_eq!(pairs(&decode_i64(&result[0])), in_region);
}

fn hilbert_schema(name: &str, capacity: u64) -> ArraySchema {
    ArraySchema::builder(name)
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["x", "y"])
        .domain(&[(0, 7), (0, 7)])
        .cell_order(Layout::Hilbert)
        .capacity(capacity)
        .build()
        .unwrap()
}

fn write_cells(manager: &StorageManager, name: &str, cells: &[(i64, i64)], value: impl Fn(i64, i64) -> i32) {
    let values = i32_buffer(cells.iter().map(|&(x, y)| value(x, y)));
    let coords = i64_buffer(cells.iter().flat_map(|&(x, y)| [x, y]));
    write_all(manager, name, &[&values, &coords]);
}

#[test]
fn test_sparse_hilbert_order() {
    let (_temp, manager) = setup_manager();
    // One tile: the write sorts every cell along the curve
    manager.array_create(&hilbert_schema("curve", 64)).unwrap();
    let row_major: Vec<(i64, i64)> = (0..8).flat_map(|x| (0..8).map(move |y| (x, y))).collect();
    write_cells(&manager, "curve", &row_major, |x, y| (x * 8 + y) as i32);

    let result = read_all(&manager, "curve", None, &[4096, 4096]);
    let order = pairs(&decode_i64(&result[1]));
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(sorted, row_major);
    for step in order.windows(2) {
        let dist = (step[0].0 - step[1].0).abs() + (step[0].1 - step[1].1).abs();
        assert_eq!(dist, 1, "curve jumps from {:?} to {:?}", step[0], step[1]);
    }
    let values = decode_i32(&result[0]);
    let expected: Vec<i32> = order.iter().map(|&(x, y)| (x * 8 + y) as i32).collect();
    assert_eq!(values, expected);

    // Cells arriving in curve order fill several tiles
    manager.array_create(&hilbert_schema("curve_tiles", 4)).unwrap();
    write_cells(&manager, "curve_tiles", &order, |x, y| (x * 8 + y) as i32);
    assert_eq!(read_all(&manager, "curve_tiles", None, &[4096, 4096]), result);
    assert_eq!(manager.fragment_info("curve_tiles").unwrap()[0].tile_num, 16);

    // Subarray reads and newer fragments follow the same order
    write_cells(&manager, "curve", &[(3, 3), (4, 4)], |_, _| -1);
    let result = read_all(&manager, "curve", Some(&[(2, 5), (2, 5)]), &[4096, 4096]);
    let in_region: Vec<(i64, i64)> = order
        .iter()
        .copied()
        .filter(|&(x, y)| (2..=5).contains(&x) && (2..=5).contains(&y))
        .collect();
    assert_eq!(pairs(&decode_i64(&result[1])), in_region);
    let expected: Vec<i32> = in_region
        .iter()
        .map(|&(x, y)| if x == y && (x == 3 || x == 4) { -1 } else { (x * 8 + y) as i32 })
        .collect();
    assert_eq!(decode_i32(&result[0]), expected);
}

#[test]
fn test_sparse_space_tiles_order_cells() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::builder("tiled")
        .attributes(&["a1"])
        .types(&[Datatype::Int32, Datatype::Int64])
        .dimensions(&["x", "y"])
        .domain(&[(0, 7), (0, 7)])
        .tile_extents(&[4, 4])
        .capacity(16)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();

    let cells = [(0, 5), (1, 1), (5, 0), (2, 6), (6, 6), (3, 3)];
    write_cells(&manager, "tiled", &cells, |x, y| (x * 10 + y) as i32);

    // Space tile (0,0), then (0,1), (1,0), (1,1); row-major inside each
    let expected = vec![(1, 1), (3, 3), (0, 5), (2, 6), (5, 0), (6, 6)];
    let result = read_all(&manager, "tiled", None, &[4096, 4096]);
    assert_eq!(pairs(&decode_i64(&result[1])), expected);
    assert_eq!(decode_i32(&result[0]), vec![11, 33, 5, 26, 50, 66]);

    let result = read_all(&manager, "tiled", Some(&[(0, 3), (0, 7)]), &[4096, 4096]);
    assert_eq!(
        pairs(&decode_i64(&result[1])),
        vec![(1, 1), (3, 3), (0, 5), (2, 6)]
    );
}

// =============================================================================
// Sparse Tests
// =============================================================================

#[test]
fn test_sparse_round_trip_2d() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::builder("points")
        .attributes(&["a1", "a2"])
        .types(&[Datatype::Int32, Datatype::Float64, Datatype::Int64])
        .compressors(&[Compressor::Gzip, Compressor::Zstd, Compressor::None])
        .dimensions(&["x", "y"])
        .domain(&[(0, 9), (0, 9)])
        .capacity(3)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();

    // Row-major order
    let coords: Vec<(i64, i64)> = vec![(0, 1), (0, 7), (2, 2), (3, 0), (5, 5), (9, 9), (9, 0)];
    let mut sorted = coords.clone();
    sorted.sort();
    let a1 = i32_buffer(sorted.iter().map(|&(x, y)| (x * 10 + y) as i32));
    let a2: Vec<u8> = sorted
        .iter()
        .flat_map(|&(x, y)| ((x * 10 + y) as f64 / 2.0).to_le_bytes())
        .collect();
    let coord_buf = i64_buffer(sorted.iter().flat_map(|&(x, y)| [x, y]));
    write_all(&manager, "points", &[&a1, &a2, &coord_buf]);

    let result = read_all(&manager, "points", None, &[4096, 4096, 4096]);
    assert_eq!(result[0], a1);
    assert_eq!(result[1], a2);
    assert_eq!(result[2], coord_buf);

    // Subarray restricts the cells
    let result = read_all(&manager, "points", Some(&[(2, 5), (0, 9)]), &[4096, 4096, 4096]);
    assert_eq!(decode_i32(&result[0]), vec![22, 30, 55]);
}

#[test]
fn test_sparse_last_writer_wins() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 10);

    write_all(&manager, "sparse", &[&i32_buffer([1]), &i64_buffer([5])]);
    write_all(&manager, "sparse", &[&i32_buffer([2]), &i64_buffer([5])]);

    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert_eq!(decode_i32(&result[0]), vec![2]);
    assert_eq!(decode_i64(&result[1]), vec![5]);
}

#[test]
fn test_sparse_overlapping_fragments_merge_in_order() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 4);

    write_all(
        &manager,
        "sparse",
        &[&i32_buffer([10, 30, 50, 70]), &i64_buffer([1, 3, 5, 7])],
    );
    write_all(
        &manager,
        "sparse",
        &[&i32_buffer([200, 300, 800]), &i64_buffer([2, 3, 8])],
    );

    let result = read_all(&manager, "sparse", None, &[4096, 4096]);
    assert_eq!(decode_i64(&result[1]), vec![1, 2, 3, 5, 7, 8]);
    assert_eq!(decode_i32(&result[0]), vec![10, 200, 300, 50, 70, 800]);
}

#[test]
fn test_sparse_cells_sorted_within_a_tile() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 10);

    write_all(&manager, "sparse", &[&i32_buffer([3, 1, 2]), &i64_buffer([30, 10, 20])]);

    let result = read_all(&manager, "sparse", None, &[4096, 4096]);
    assert_eq!(decode_i32(&result[0]), vec![1, 2, 3]);
    assert_eq!(decode_i64(&result[1]), vec![10, 20, 30]);
}

#[test]
fn test_sparse_coordinates_outside_domain_rejected() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 10);

    let array = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();
    let err = array
        .write(&[&i32_buffer([1]), &i64_buffer([100])])
        .unwrap_err();
    assert!(matches!(err, TileError::InvalidArgument(_)));
    array.finalize().unwrap();
}

#[test]
fn test_sparse_write_requires_coordinates() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 10);

    let err = manager
        .array_init("sparse", ArrayMode::Write, None, &["a1"])
        .err()
        .unwrap();
    assert!(matches!(err, TileError::InvalidArgument(_)));
}

// =============================================================================
// Overflow Tests
// =============================================================================

#[test]
fn test_overflow_resumes_where_it_stopped() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);
    write_all(&manager, "sparse", &[&i32_buffer(0..50), &i64_buffer(0..50)]);

    let whole = read_all(&manager, "sparse", None, &[4096, 4096]);

    // 30 bytes hold 7 whole int32 cells with room to spare
    let array = manager.array_init("sparse", ArrayMode::Read, None, &[]).unwrap();
    let mut storage = vec![vec![0u8; 30], vec![0u8; 4096]];
    let mut pieces = vec![Vec::new(), Vec::new()];
    let mut overflowed = false;
    loop {
        let mut buffers: Vec<&mut [u8]> = storage.iter_mut().map(|b| b.as_mut_slice()).collect();
        let outcome = array.read(&mut buffers).unwrap();
        for slot in 0..2 {
            pieces[slot].extend_from_slice(&storage[slot][..outcome.sizes[slot]]);
        }
        if outcome.status == ReadStatus::Overflow {
            overflowed = true;
            assert!(array.overflow("a1").unwrap());
            assert!(!array.overflow("__coords").unwrap());
        }
        if outcome.status == ReadStatus::Complete {
            break;
        }
    }
    array.finalize().unwrap();

    assert!(overflowed);
    assert_eq!(pieces, whole);
}

#[test]
fn test_zero_cells_fit_is_overflow() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);
    write_all(&manager, "sparse", &[&i32_buffer([7]), &i64_buffer([1])]);

    let array = manager.array_init("sparse", ArrayMode::Read, None, &["a1"]).unwrap();
    let mut small = vec![0u8; 2];
    let mut buffers: Vec<&mut [u8]> = vec![small.as_mut_slice()];
    let outcome = array.read(&mut buffers).unwrap();
    assert_eq!(outcome.status, ReadStatus::Overflow);
    assert_eq!(outcome.sizes, vec![0]);

    // A larger buffer continues from the same cell
    let mut big = vec![0u8; 16];
    let mut buffers: Vec<&mut [u8]> = vec![big.as_mut_slice()];
    let outcome = array.read(&mut buffers).unwrap();
    assert_eq!(outcome.status, ReadStatus::Complete);
    assert_eq!(decode_i32(&big[..outcome.sizes[0]]), vec![7]);
    array.finalize().unwrap();
}

#[test]
fn test_var_attribute_round_trip_with_overflow() {
    let (_temp, manager) = setup_manager();
    let schema = ArraySchema::builder("names")
        .attributes(&["name"])
        .types(&[Datatype::Char, Datatype::Int64])
        .cell_val_nums(&[CellValNum::Var])
        .compressors(&[Compressor::Zstd, Compressor::None])
        .dimensions(&["d1"])
        .domain(&[(0, 99)])
        .capacity(3)
        .build()
        .unwrap();
    manager.array_create(&schema).unwrap();

    let names = ["a", "bb", "ccc", "dddd", "eeeee", "ffffff", "g"];
    let mut offsets = Vec::new();
    let mut values = Vec::new();
    for name in names {
        offsets.extend_from_slice(&(values.len() as u64).to_le_bytes());
        values.extend_from_slice(name.as_bytes());
    }
    let coords = i64_buffer(0..names.len() as i64);
    write_all(&manager, "names", &[&offsets, &values, &coords]);

    // Value buffer of 8 bytes forces several overflowing reads
    let array = manager.array_init("names", ArrayMode::Read, None, &["name"]).unwrap();
    let mut offset_buf = vec![0u8; 64];
    let mut value_buf = vec![0u8; 8];
    let mut read_back: Vec<String> = Vec::new();
    loop {
        let mut buffers: Vec<&mut [u8]> = vec![offset_buf.as_mut_slice(), value_buf.as_mut_slice()];
        let outcome = array.read(&mut buffers).unwrap();
        let starts: Vec<usize> = offset_buf[..outcome.sizes[0]]
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as usize)
            .collect();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(outcome.sizes[1]);
            read_back.push(String::from_utf8(value_buf[start..end].to_vec()).unwrap());
        }
        if outcome.status == ReadStatus::Complete {
            break;
        }
    }
    array.finalize().unwrap();

    assert_eq!(read_back, names);
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_mode_violations() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);

    let reader = manager.array_init("sparse", ArrayMode::Read, None, &[]).unwrap();
    let err = reader
        .write(&[&i32_buffer([1]), &i64_buffer([1])])
        .unwrap_err();
    assert!(matches!(err, TileError::ModeViolation(_)));
    reader.finalize().unwrap();

    let writer = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();
    let mut buf = vec![0u8; 16];
    let mut buffers: Vec<&mut [u8]> = vec![buf.as_mut_slice()];
    let err = writer.read(&mut buffers).unwrap_err();
    assert!(matches!(err, TileError::ModeViolation(_)));
    writer.finalize().unwrap();
}

#[test]
fn test_buffer_errors_are_distinct() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);
    let array = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();

    // Empty buffer
    let err = array.write(&[&[], &i64_buffer([1])]).unwrap_err();
    assert!(matches!(err, TileError::EmptyBuffer(_)));

    // Wrong number of buffers
    let err = array.write(&[&i32_buffer([1])]).unwrap_err();
    assert!(matches!(err, TileError::BufferMismatch(_)));

    // Partial cell
    let err = array.write(&[&[1, 2, 3], &i64_buffer([1])]).unwrap_err();
    assert!(matches!(err, TileError::BufferMismatch(_)));

    // Cell counts disagree
    let err = array
        .write(&[&i32_buffer([1, 2]), &i64_buffer([1])])
        .unwrap_err();
    assert!(matches!(err, TileError::BufferMismatch(_)));

    // None of the failed calls left anything behind
    array.write(&[&i32_buffer([9]), &i64_buffer([4])]).unwrap();
    array.finalize().unwrap();

    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert_eq!(decode_i32(&result[0]), vec![9]);
}

#[test]
fn test_read_buffer_count_checked() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);

    let array = manager.array_init("sparse", ArrayMode::Read, None, &[]).unwrap();
    let mut buf = vec![0u8; 16];
    let mut buffers: Vec<&mut [u8]> = vec![buf.as_mut_slice()];
    let err = array.read(&mut buffers).unwrap_err();
    assert!(matches!(err, TileError::BufferMismatch(_)));
}

#[test]
fn test_unknown_attribute_and_bad_subarray() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);

    assert!(matches!(
        manager.array_init("sparse", ArrayMode::Read, None, &["nope"]),
        Err(TileError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.array_init("sparse", ArrayMode::Read, Some(&[(50, 200)]), &[]),
        Err(TileError::InvalidArgument(_))
    ));
}

// =============================================================================
// Visibility Tests
// =============================================================================

#[test]
fn test_fragment_invisible_until_finalize() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 2);

    let writer = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();
    writer
        .write(&[&i32_buffer([1, 2, 3]), &i64_buffer([1, 2, 3])])
        .unwrap();

    // Two tiles are already cut, yet nothing is published
    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert!(result[0].is_empty());

    writer.finalize().unwrap();
    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert_eq!(decode_i32(&result[0]), vec![1, 2, 3]);
}

#[test]
fn test_sync_publishes_and_keeps_writing() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);

    let reader = manager.array_init("sparse", ArrayMode::Read, None, &[]).unwrap();
    let writer = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();

    writer.write(&[&i32_buffer([1]), &i64_buffer([1])]).unwrap();
    manager.array_sync(&writer).unwrap();
    manager.array_sync_attribute(&writer, "a1").unwrap();
    writer.write(&[&i32_buffer([2]), &i64_buffer([2])]).unwrap();

    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert_eq!(decode_i32(&result[0]), vec![1]);

    // The older handle keeps its snapshot until it is reset
    let before = read_to_end(&reader, &[64, 64]);
    assert!(before[0].is_empty());
    reader.reset_subarray(&[(0, 99)]).unwrap();
    let after = read_to_end(&reader, &[64, 64]);
    assert_eq!(decode_i32(&after[0]), vec![1]);

    writer.finalize().unwrap();
    let result = read_all(&manager, "sparse", None, &[64, 64]);
    assert_eq!(decode_i32(&result[0]), vec![1, 2]);
    assert_eq!(manager.fragment_info("sparse").unwrap().len(), 2);
    reader.finalize().unwrap();
}

#[test]
fn test_sync_attribute_rejects_unknown_attribute() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);

    let writer = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();
    assert!(matches!(
        writer.sync_attribute("nope"),
        Err(TileError::InvalidArgument(_))
    ));
    writer.finalize().unwrap();
}

#[test]
fn test_dropped_writer_discards_cells() {
    let (temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 1);

    {
        let writer = manager.array_init("sparse", ArrayMode::Write, None, &[]).unwrap();
        writer
            .write(&[&i32_buffer([1, 2]), &i64_buffer([1, 2])])
            .unwrap();
    }

    assert!(manager.fragment_info("sparse").unwrap().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("sparse"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    assert!(leftovers.is_empty());

    // The writer slot was released
    manager
        .array_init("sparse", ArrayMode::Write, None, &[])
        .unwrap()
        .finalize()
        .unwrap();
}

#[test]
fn test_reset_attributes_selects_subset() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 8);
    write_all(&manager, "sparse", &[&i32_buffer([4, 5]), &i64_buffer([40, 50])]);

    let array = manager.array_init("sparse", ArrayMode::Read, None, &[]).unwrap();
    array.reset_attributes(&["__coords"]).unwrap();
    let result = read_to_end(&array, &[64]);
    assert_eq!(decode_i64(&result[0]), vec![40, 50]);

    array.reset_attributes(&["a1"]).unwrap();
    let result = read_to_end(&array, &[64]);
    assert_eq!(decode_i32(&result[0]), vec![4, 5]);
    array.finalize().unwrap();
}

#[test]
fn test_many_fragments_stay_readable() {
    let (_temp, manager) = setup_manager();
    sparse_1d(&manager, "sparse", 4);

    for i in 0..600i64 {
        write_all(&manager, "sparse", &[&i32_buffer([i as i32]), &i64_buffer([i % 100])]);
    }
    assert_eq!(manager.fragment_info("sparse").unwrap().len(), 600);

    let result = read_all(&manager, "sparse", None, &[4096, 4096]);
    assert_eq!(decode_i64(&result[1]), (0..100).collect::<Vec<_>>());
    assert_eq!(decode_i32(&result[0]), (500..600).collect::<Vec<_>>());
}

#[test]
fn test_data_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manager = StorageManager::open_path(temp_dir.path()).unwrap();
        sparse_1d(&manager, "sparse", 4);
        write_all(&manager, "sparse", &[&i32_buffer(0..10), &i64_buffer(0..10)]);
    }

    let manager = StorageManager::open_path(temp_dir.path()).unwrap();
    let result = read_all(&manager, "sparse", None, &[4096, 4096]);
    assert_eq!(decode_i32(&result[0]), (0..10).collect::<Vec<_>>());
}
