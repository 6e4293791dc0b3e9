//! The arena is generic over its backing buffer; these tests run it over a
//! memory-mapped region instead of heap memory.

use memmap2::MmapMut;
use talus::{Arena, TalusError};

#[test]
fn arena_over_anonymous_mapping() {
    let map = MmapMut::map_anon(4096).expect("anonymous map");
    let arena = Arena::new(map).expect("arena");

    let hello = arena.write(b"hello").expect("write");
    let world = arena.write(b"world").expect("write");
    assert_eq!(arena.read(hello).expect("read"), b"hello");
    arena.free(hello).expect("free");
    assert!(matches!(
        arena.read(hello),
        Err(TalusError::WrongReadPosition)
    ));
    assert_eq!(arena.read(world).expect("read"), b"world");
}

#[test]
fn arena_over_file_backed_mapping() {
    // 16 records of 80 bytes tile the mapping, leaving 4 spare bytes
    let file = tempfile::tempfile().expect("temp file");
    file.set_len(16 * 80 + 4).expect("size file");
    let map = unsafe { MmapMut::map_mut(&file) }.expect("map file");
    let arena = Arena::new(map).expect("arena");

    let mut keys = Vec::new();
    for i in 0..16u8 {
        keys.push(arena.write(&[i; 64]).expect("write"));
    }
    for (i, key) in keys.iter().enumerate() {
        if i % 2 == 0 {
            arena.free(*key).expect("free");
        }
    }
    // no single 80-byte hole fits this; several must fuse
    let big = arena.write(&[0xAB; 300]).expect("compacting write");
    assert_eq!(arena.read(big).expect("read"), vec![0xAB; 300]);
    for (i, key) in keys.iter().enumerate() {
        if i % 2 == 1 {
            assert_eq!(arena.read(*key).expect("read survivor"), vec![i as u8; 64]);
        }
    }

    let map = arena.into_inner();
    map.flush().expect("flush mapping");
}
