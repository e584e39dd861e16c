use archetype_ecs_core::World;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pos {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vel {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Health(u32);

#[test]
fn concurrent_spawns_hand_out_distinct_live_entities() {
    let world: Arc<World<1>> = Arc::new(World::new());
    let total = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        for _ in 0..8 {
            let world = Arc::clone(&world);
            let total = Arc::clone(&total);
            s.spawn(move || {
                for _ in 0..2000 {
                    let e = world.spawn().unwrap();
                    world.add_component(e, Pos { x: 0.0, y: 0.0 }).unwrap();
                    total.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(total.load(Ordering::Relaxed), 8 * 2000);
}

#[test]
fn concurrent_add_remove_migrations_preserve_shared_components() {
    let world: Arc<World<1>> = Arc::new(World::new());
    let mut handles = Vec::new();
    for i in 0..500 {
        let e = world.spawn().unwrap();
        world
            .add_component(e, Pos { x: i as f32, y: 0.0 })
            .unwrap();
        handles.push(e);
    }

    thread::scope(|s| {
        for chunk in handles.chunks(50) {
            let world = Arc::clone(&world);
            let chunk = chunk.to_vec();
            s.spawn(move || {
                for e in chunk {
                    world.add_component(e, Vel { x: 1.0, y: 1.0 }).unwrap();
                    world.remove_component::<Vel>(e).unwrap();
                }
            });
        }
    });

    for (i, e) in handles.iter().enumerate() {
        assert!(world.is_alive(*e));
        assert_eq!(
            world.get::<Pos>(*e),
            Some(Pos { x: i as f32, y: 0.0 })
        );
        assert!(!world.has_component::<Vel>(*e));
    }
}

#[test]
fn despawn_during_concurrent_reads_never_corrupts_survivors() {
    let world: Arc<World<1>> = Arc::new(World::new());
    let mut survivors = Vec::new();
    let mut doomed = Vec::new();
    for i in 0..1000 {
        let e = world.spawn().unwrap();
        world
            .add_component(e, Health(i))
            .unwrap();
        if i % 2 == 0 {
            doomed.push(e);
        } else {
            survivors.push(e);
        }
    }

    let reader_world = Arc::clone(&world);
    let survivors_check = survivors.clone();
    thread::scope(|s| {
        s.spawn(move || {
            for _ in 0..50 {
                for e in &survivors_check {
                    assert!(reader_world.is_alive(*e));
                }
            }
        });

        let writer_world = Arc::clone(&world);
        s.spawn(move || {
            for e in doomed {
                writer_world.despawn(e);
            }
        });
    });

    for e in &survivors {
        assert!(world.is_alive(*e));
    }
}

#[test]
fn query_observes_new_archetypes_created_while_iterating_concurrently() {
    let world: Arc<World<1>> = Arc::new(World::new());
    for _ in 0..100 {
        let e = world.spawn().unwrap();
        world.add_component(e, Pos { x: 0.0, y: 0.0 }).unwrap();
    }

    thread::scope(|s| {
        let spawner = Arc::clone(&world);
        s.spawn(move || {
            for i in 0..100 {
                let e = spawner.spawn().unwrap();
                spawner
                    .add_component(e, Pos { x: i as f32, y: 0.0 })
                    .unwrap();
                spawner.add_component(e, Vel { x: 0.0, y: 0.0 }).unwrap();
            }
        });
    });

    use archetype_ecs_core::{ChunkView, QueryDescription};
    use archetype_ecs_core::mask::Mask64;
    let mut all = Mask64::empty();
    // Position is always the first component registered in this test, id 0.
    all.set(0).unwrap();
    let description = QueryDescription::builder().all(all).build();
    let query = world.query(description);
    let matched = query.matched_archetypes();
    assert!(matched.len() >= 2, "expected both the Pos-only and Pos+Vel archetypes");
    let views: Vec<ChunkView> = query.iter_chunks(world.chunk_allocator());
    let total_entities: usize = views.iter().map(|v| v.len).sum();
    assert_eq!(total_entities, 200);
}
