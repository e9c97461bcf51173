//! On-disk format compatibility: header layouts, sidecar recovery and padding

use ctvault::format::{
    load_labels, load_volume, load_volume_raw, save_labels, save_volume, Backing, LoadOptions,
    EXTENDED_HEADER_SIZE, LEGACY_HEADER_SIZE,
};
use ctvault::{
    ChunkLayout, ChunkStore, HeaderFormat, LabelChunkStore, MapMode, RecoveryPath, RetryPolicy,
    VolError, VoxelAccess,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PIXEL: f64 = 2.5e-5;

/// 40x20x18 volume with 16^3 chunks: partial chunks on every axis
fn sample_store() -> ChunkStore {
    let layout = ChunkLayout::new(40, 20, 18, 16).unwrap();
    let mut store = ChunkStore::new(layout);
    for z in 0..18 {
        let mut slice = vec![0u8; 40 * 20];
        for y in 0..20 {
            for x in 0..40 {
                slice[y * 40 + x] = ((x * 7 + y * 3 + z * 11) % 251) as u8;
            }
        }
        store.write_slice(z, &slice).unwrap();
    }
    store
}

fn assert_same_voxels(a: &ChunkStore, b: &ChunkStore) {
    assert_eq!(a.dimensions(), b.dimensions());
    let (w, h, d) = a.dimensions();
    let mut left = vec![0u8; w * h];
    let mut right = vec![0u8; w * h];
    for z in 0..d {
        a.read_slice(z, &mut left).unwrap();
        b.read_slice(z, &mut right).unwrap();
        assert_eq!(left, right, "slice {} differs", z);
    }
}

fn save(store: &ChunkStore, path: &Path, format: HeaderFormat) {
    save_volume(store, PIXEL, path, format, &RetryPolicy::default()).unwrap();
}

#[test]
fn test_large_layout_arithmetic() {
    let layout = ChunkLayout::new(300, 300, 300, 256).unwrap();
    assert_eq!(layout.chunk_counts(), [2, 2, 2]);
    assert_eq!(layout.total_chunks(), 8);
    assert_eq!(layout.raw_data_size(), 134_217_728);
}

#[test]
fn test_round_trip_memory_and_mapped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bin");
    let store = sample_store();
    save(&store, &path, HeaderFormat::Extended);

    for backing in [Backing::Memory, Backing::Mapped] {
        let options = LoadOptions::default().with_backing(backing);
        let (loaded, info) = load_volume(&path, &options).unwrap();
        assert_eq!(loaded.is_mapped(), backing == Backing::Mapped);
        assert_eq!(info.pixel_size, PIXEL);
        assert_eq!(info.layout, *store.layout());
        assert_same_voxels(&store, &loaded);
    }
}

#[test]
fn test_padding_is_zeroed_on_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bin");
    let mut store = sample_store();
    let layout = *store.layout();
    // Last chunk covers x 32..40, y 16..20, z 16..18
    let last = layout.total_chunks() - 1;
    store.replace_chunk(last, &vec![0xFF; layout.chunk_volume()]).unwrap();
    save(&store, &path, HeaderFormat::Legacy);

    let options = LoadOptions::default().with_backing(Backing::Memory);
    let (loaded, _) = load_volume(&path, &options).unwrap();
    let chunk = loaded.chunk(last).unwrap();
    for lz in 0..16 {
        for ly in 0..16 {
            for lx in 0..16 {
                let inside = lx < 8 && ly < 4 && lz < 2;
                let expected = if inside { 0xFF } else { 0 };
                assert_eq!(chunk[lz * 256 + ly * 16 + lx], expected, "({lx},{ly},{lz})");
            }
        }
    }
    assert_eq!(loaded.get(39, 19, 17).unwrap(), 0xFF);
}

#[test]
fn test_raw_and_both_header_lengths_decode_identically() {
    let dir = TempDir::new().unwrap();
    let store = sample_store();
    let layout = *store.layout();
    let raw = layout.raw_data_size();

    let cases = [
        (HeaderFormat::None, 0),
        (HeaderFormat::Legacy, LEGACY_HEADER_SIZE),
        (HeaderFormat::Extended, EXTENDED_HEADER_SIZE),
    ];
    for (format, header) in cases {
        let path = dir.path().join(format!("{:?}.bin", format));
        save(&store, &path, format);
        assert_eq!(fs::metadata(&path).unwrap().len(), raw + header as u64);

        let options = LoadOptions::default().with_backing(Backing::Memory);
        let loaded = load_volume_raw(&path, &layout, &options).unwrap();
        assert_same_voxels(&store, &loaded);

        // The header path resolves the headerless file through its sidecar
        let (loaded, info) = load_volume(&path, &options).unwrap();
        assert_eq!(info.layout, layout);
        assert_same_voxels(&store, &loaded);
    }
}

#[test]
fn test_unexpected_length_is_size_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bin");
    let store = sample_store();
    save(&store, &path, HeaderFormat::None);

    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0u8; 7]);
    fs::write(&path, bytes).unwrap();

    let err = load_volume_raw(&path, store.layout(), &LoadOptions::default()).unwrap_err();
    match err {
        VolError::SizeMismatch { actual, expected } => {
            assert_eq!(actual, store.layout().raw_data_size() + 7);
            assert_eq!(expected.len(), 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_corrupt_header_falls_back_to_sidecar() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bin");
    let store = sample_store();
    save(&store, &path, HeaderFormat::Extended);

    // Negative width in the embedded header
    let mut bytes = fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
    fs::write(&path, bytes).unwrap();

    let options = LoadOptions::default().with_backing(Backing::Memory);
    let (loaded, info) = load_volume(&path, &options).unwrap();
    assert_eq!(info.layout, *store.layout());
    assert_eq!(info.pixel_size, PIXEL);
    assert_same_voxels(&store, &loaded);

    // Without a usable sidecar the error names the attempted recovery
    fs::write(dir.path().join("volume.chk"), [0u8; 10]).unwrap();
    match load_volume(&path, &options).unwrap_err() {
        VolError::CorruptHeader { recovery, .. } => {
            assert_eq!(recovery, RecoveryPath::SidecarFallback)
        }
        other => panic!("unexpected error: {other}"),
    }

    fs::remove_file(dir.path().join("volume.chk")).unwrap();
    match load_volume(&path, &options).unwrap_err() {
        VolError::CorruptHeader { recovery, .. } => assert_eq!(recovery, RecoveryPath::None),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_default_mapped_loads_share_one_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bin");
    let store = sample_store();
    save(&store, &path, HeaderFormat::Extended);

    let options = LoadOptions::default().with_backing(Backing::Mapped);
    assert_eq!(options.map_mode, MapMode::ReadOnly);
    let (mut first, _) = load_volume(&path, &options).unwrap();
    let (second, _) = load_volume(&path, &options).unwrap();
    assert!(first.is_mapped() && second.is_mapped());
    assert_same_voxels(&first, &second);
    assert!(matches!(first.set(0, 0, 0, 1), Err(VolError::Configuration(_))));

    // A writer can still open the file while both readers hold it
    let writable = options.clone().with_map_mode(MapMode::ReadWrite);
    let (mut editor, _) = load_volume(&path, &writable).unwrap();
    editor.set(39, 19, 17, 201).unwrap();
    editor.flush().unwrap();
    assert_eq!(second.get(39, 19, 17).unwrap(), 201);
}

#[test]
fn test_labels_round_trip_through_padding() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("labels.bin");
    let layout = ChunkLayout::new(40, 20, 18, 16).unwrap();
    let mut labels = LabelChunkStore::new(layout);
    assert_eq!(labels.dimensions(), (48, 32, 32));
    labels.set(3, 4, 5, 2).unwrap();
    labels.set(47, 31, 31, 9).unwrap();
    save_labels(&labels, &path, &RetryPolicy::default()).unwrap();

    for backing in [Backing::Memory, Backing::Mapped] {
        let options = LoadOptions::default().with_backing(backing);
        let mut loaded = load_labels(&path, &options).unwrap();
        assert_eq!(loaded.dimensions(), (48, 32, 32));
        assert_eq!(loaded.get(3, 4, 5).unwrap(), 2);
        assert_eq!(loaded.get(47, 31, 31).unwrap(), 9);
        assert_eq!(loaded.get(0, 0, 0).unwrap(), 0);

        loaded.release_file_lock().unwrap();
        if backing == Backing::Mapped {
            assert!(matches!(loaded.get(0, 0, 0), Err(VolError::Configuration(_))));
            fs::remove_file(&path).unwrap();
            save_labels(&labels, &path, &RetryPolicy::default()).unwrap();
        }
    }
}
