#![cfg(feature = "hibernate")]

mod common;

use nebula_mempool::hibernate::COMPACT_RECORD_SIZE;
use nebula_mempool::{MemConfig, MemSystem, MemoryError, ObjRef, PoolRef};
use pretty_assertions::assert_eq;

use common::{has_stamp, stamp, with_arena};

fn snapshot(system: &MemSystem, pools: &[PoolRef]) -> Vec<(usize, usize)> {
    pools
        .iter()
        .map(|&pool| {
            let stats = system.stats(pool);
            (system.object_count(pool), stats.num_blocks_in_use)
        })
        .collect()
}

/// Allocate every block of `pool` and return them in address order.
fn drain(system: &MemSystem, pool: PoolRef) -> Vec<ObjRef> {
    let mut objects = Vec::new();
    while let Some(object) = system.try_alloc(pool) {
        objects.push(object);
    }
    objects.sort_unstable();
    objects
}

#[test]
fn test_hibernate_resume_preserves_objects() {
    let system = with_arena(16 * 1024);
    let small = system.init_static_pool("sleep.small", 20, 24).unwrap();
    let large = system.init_static_pool("sleep.large", 8, 200).unwrap();
    let tiny = system.create_reduced_pool(large, "sleep.tiny", 6, 16);
    let pools = [small, large, tiny];

    // Free a scattering of blocks in each pool.
    let mut live = Vec::new();
    for pool in pools {
        for (i, object) in drain(&system, pool).into_iter().enumerate() {
            if i % 3 == 1 || i % 5 == 0 {
                system.release(object);
            } else {
                live.push(object);
            }
        }
    }
    for (seed, &object) in live.iter().enumerate() {
        stamp(&system, object, seed as u8);
    }
    let before = snapshot(&system, &pools);

    let unused = system.hibernate().unwrap();
    assert!(system.is_hibernated());
    assert_eq!(unused.end, system.arena_len());
    assert!(unused.start < system.arena_used());

    system.resume().unwrap();
    assert!(!system.is_hibernated());
    assert_eq!(snapshot(&system, &pools), before);
    for (seed, &object) in live.iter().enumerate() {
        assert!(has_stamp(&system, object, seed as u8), "object {object} corrupted");
    }
    for info in system.pools() {
        assert_eq!(info.total_blocks, info.blocks_in_use + info.free_blocks);
    }

    // The restored free blocks are usable again.
    for pool in pools {
        let free = system.pool_info(pool).free_blocks;
        let objects = drain(&system, pool);
        assert_eq!(objects.len(), free);
        for object in objects {
            system.release(object);
        }
    }
    for object in live {
        system.release(object);
    }
}

#[test]
fn test_hibernate_accounts_for_every_arena_byte() {
    let system = with_arena(4096);
    let pool = system.init_static_pool("accounting", 10, 48).unwrap();
    let block_size = system.object_full_size(pool);
    let objects = drain(&system, pool);

    // Two free runs: blocks 2..=4 and block 7.
    for &index in &[2, 3, 4, 7] {
        system.release(objects[index]);
    }

    let unused = system.hibernate().unwrap();
    let carved = system.arena_used();
    assert_eq!(carved, 10 * block_size);
    let preserved = carved - 4 * block_size + 2 * COMPACT_RECORD_SIZE;
    assert_eq!(unused.start, preserved);
    assert_eq!(unused.start + unused.len(), system.arena_len());

    // While hibernated the free blocks are off the free list.
    assert_eq!(system.pool_info(pool).free_blocks, 0);
    system.resume().unwrap();
    assert_eq!(system.pool_info(pool).free_blocks, 4);

    let mut reused = drain(&system, pool);
    reused.sort_unstable();
    let expected: Vec<ObjRef> = [2, 3, 4, 7].iter().map(|&i| objects[i]).collect();
    assert_eq!(reused, expected);
}

#[test]
fn test_heap_free_blocks_stay_on_free_list() {
    let system = with_arena(2048);
    let pool = system.init_static_pool("mixed", 4, 32).unwrap();
    system.expand_pool(pool, 3);

    let objects = drain(&system, pool);
    assert_eq!(objects.len(), 7);
    // Arena blocks sort before heap chunks.
    let (arena, heap): (Vec<ObjRef>, Vec<ObjRef>) = objects
        .iter()
        .copied()
        .partition(|object| object.chunk() == objects[0].chunk());
    assert_eq!(arena.len(), 4);
    system.release(arena[1]);
    system.release(heap[0]);
    system.release(heap[2]);

    system.hibernate().unwrap();
    assert_eq!(system.pool_info(pool).free_blocks, 2);
    system.resume().unwrap();
    assert_eq!(system.pool_info(pool).free_blocks, 3);
}

#[test]
fn test_fully_used_arena_compacts_to_itself() {
    let system = with_arena(1024);
    let pool = system.init_static_pool("full", 4, 16).unwrap();
    let objects = drain(&system, pool);
    for (seed, &object) in objects.iter().enumerate() {
        stamp(&system, object, seed as u8);
    }

    let unused = system.hibernate().unwrap();
    assert_eq!(unused.start, system.arena_used());
    system.resume().unwrap();
    for (seed, &object) in objects.iter().enumerate() {
        assert!(has_stamp(&system, object, seed as u8));
    }
}

#[test]
fn test_hibernate_state_errors() {
    let system = with_arena(1024);
    system.init_static_pool("state", 2, 16).unwrap();

    assert_eq!(
        system.resume(),
        Err(MemoryError::invalid_state("arena is not hibernated"))
    );
    system.hibernate().unwrap();
    let error = system.hibernate().unwrap_err();
    assert_eq!(error.code(), "MEM:SYSTEM:STATE");
    system.resume().unwrap();
}

#[test]
fn test_hibernate_without_arena() {
    let system = MemSystem::new(MemConfig::production()).unwrap();
    assert_eq!(system.hibernate(), Err(MemoryError::NoArena));
}

#[test]
fn test_static_pool_errors() {
    let system = with_arena(256);
    let error = system.init_static_pool("too.big", 100, 64).unwrap_err();
    assert!(matches!(error, MemoryError::ArenaExhausted { available: 256, .. }));
    assert_eq!(system.arena_used(), 0);

    let no_arena = MemSystem::new(MemConfig::production()).unwrap();
    assert_eq!(
        no_arena.init_static_pool("nowhere", 1, 8),
        Err(MemoryError::NoArena)
    );
}

#[test]
fn test_guarded_objects_survive_hibernation() {
    let system = MemSystem::new(MemConfig::debug().with_arena_size(8192)).unwrap();
    let pool = system.init_static_pool("guarded", 12, 40).unwrap();
    let objects = drain(&system, pool);
    for (i, &object) in objects.iter().enumerate() {
        if i % 2 == 0 {
            system.release(object);
        } else {
            stamp(&system, object, i as u8);
        }
    }

    system.hibernate().unwrap();
    system.resume().unwrap();

    for (i, &object) in objects.iter().enumerate() {
        if i % 2 == 1 {
            assert!(has_stamp(&system, object, i as u8));
            // Guard bands are checked on add-ref and release.
            system.add_ref(object);
            system.release(object);
            system.release(object);
        }
    }
}

#[test]
#[should_panic(expected = "hibernate called while the allocator is in use")]
fn test_hibernate_from_payload_callback_is_fatal() {
    let system = with_arena(1024);
    let pool = system.init_static_pool("busy", 2, 16).unwrap();
    let object = system.force_alloc(pool);
    system.with_payload(object, |_| {
        let _ = system.hibernate();
    });
}

#[test]
#[should_panic(expected = "resume called while the allocator is in use")]
fn test_resume_from_payload_callback_is_fatal() {
    let system = with_arena(1024);
    let pool = system.init_static_pool("busy", 2, 16).unwrap();
    let object = system.force_alloc(pool);
    system.with_payload(object, |_| {
        let _ = system.resume();
    });
}
