//! Integration tests for the slot pool.
//!
//! These tests drive the pool the way a recording does (capture picks and
//! fills slots, compression shrinks them, the writer frees them in order)
//! and check that the arena tiling survives every step.

use rawrec::memory::{
    ArenaRegion, FramePrediction, SlotLayout, SlotPool, SlotStatus, WRITE_ALIGNMENT,
    predict_frames,
};
use std::collections::VecDeque;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn assert_sound(pool: &SlotPool, held: &VecDeque<(usize, u32)>) {
    pool.check_tiling().unwrap();
    for slot in pool.slots() {
        if slot.status != SlotStatus::Reserved {
            assert!(slot.total_size >= WRITE_ALIGNMENT, "{slot:?}");
            assert_eq!(slot.total_size % WRITE_ALIGNMENT, 0, "{slot:?}");
        }
    }
    for &(index, frame) in held {
        let slot = pool.slot(index).unwrap();
        assert_eq!(slot.status, SlotStatus::Full);
        assert_eq!(slot.frame_number, frame);
    }
}

/// Capture/compress/write cycle driven by `seed`.
fn run_cycle(
    arenas: &[ArenaRegion],
    layout: SlotLayout,
    frame_size: usize,
    seed: u64,
    steps: usize,
) {
    let mut pool = SlotPool::initialize(arenas, layout, frame_size).unwrap();
    let mut rng = Lcg(seed);
    let mut held: VecDeque<(usize, u32)> = VecDeque::new();
    let mut previous = None;
    let mut frame = 0u32;

    for _ in 0..steps {
        if rng.below(10) < 6 {
            let Some(index) = pool.choose_next_slot(previous) else {
                pool.request_new_buffer();
                continue;
            };
            frame += 1;
            pool.claim(index, frame).unwrap();
            if rng.below(3) > 0 {
                let payload = 1 + rng.below(frame_size);
                let slot = pool.shrink(index, payload).unwrap();
                assert_eq!(slot.payload_size, payload);
                assert!(slot.total_size >= layout.slot_size(payload));
            }
            held.push_back((index, frame));
            previous = Some(index);
        } else if let Some((index, _)) = held.pop_front() {
            pool.mark_writing(index).unwrap();
            pool.free(index).unwrap();
        }
        assert_sound(&pool, &held);
    }

    while let Some((index, _)) = held.pop_front() {
        pool.free(index).unwrap();
    }
    assert_sound(&pool, &held);
    assert_eq!(pool.count(SlotStatus::Full), 0);
    assert_eq!(pool.count(SlotStatus::Writing), 0);
}

// ============================================================================
// Tiling Tests
// ============================================================================

#[test]
fn test_tiling_survives_compressed_recording() {
    let arenas = [ArenaRegion::new(0x1000_0000, 8 * MIB)];
    for seed in 1..=8 {
        run_cycle(&arenas, SlotLayout::default(), 200 * KIB, seed, 600);
    }
}

#[test]
fn test_tiling_survives_multiple_arenas() {
    let arenas = [
        ArenaRegion::new(0x1000_0000, 3 * MIB + 777),
        ArenaRegion::new(0x2000_0010, 5 * MIB),
        ArenaRegion::new(0x3000_0000, MIB + 100 * KIB),
    ];
    for seed in [7, 42, 1234] {
        run_cycle(&arenas, SlotLayout::default(), 96 * KIB, seed, 800);
    }
}

#[test]
fn test_tiling_survives_small_burst_groups() {
    let layout = SlotLayout::default().with_burst_ceiling(64 * KIB);
    let arenas = [ArenaRegion::new(0x1000_0000, 2 * MIB)];
    for seed in [3, 99] {
        run_cycle(&arenas, layout, 10 * KIB, seed, 800);
    }
}

#[test]
fn test_free_all_restores_standard_slots() {
    let arenas = [ArenaRegion::new(0x1000_0000, 4 * MIB)];
    let mut pool = SlotPool::initialize(&arenas, SlotLayout::default(), 100 * KIB).unwrap();
    let initial = pool.free_count();

    // shrink a run of frames, then free them in capture order
    let mut used = Vec::new();
    let mut previous = None;
    for frame in 1..=10u32 {
        let index = pool.choose_next_slot(previous).unwrap();
        pool.claim(index, frame).unwrap();
        pool.shrink(index, 30 * KIB).unwrap();
        used.push(index);
        previous = Some(index);
    }
    // compression made room for more slots than before
    assert!(pool.free_count() + used.len() > initial);
    pool.check_tiling().unwrap();

    for index in used.into_iter().rev() {
        pool.free(index).unwrap();
    }
    pool.check_tiling().unwrap();
    assert_eq!(pool.free_count(), initial);
}

// ============================================================================
// Slot Selection Tests
// ============================================================================

#[test]
fn test_buffer_runs_out_after_every_slot() {
    // 4 slots of 1 MiB
    let layout = SlotLayout::default();
    let slot_size = layout.slot_size(MIB);
    let arenas = [ArenaRegion::new(0x1000_0000, 4 * slot_size + 64)];
    let mut pool = SlotPool::initialize(&arenas, layout, MIB).unwrap();
    assert_eq!(pool.free_count(), 4);

    let mut previous = None;
    for frame in 1..=4 {
        let index = pool.choose_next_slot(previous).unwrap();
        pool.claim(index, frame).unwrap();
        previous = Some(index);
    }
    assert_eq!(pool.choose_next_slot(previous), None);
}

#[test]
fn test_contiguous_frames_within_group() {
    let layout = SlotLayout::default().with_burst_ceiling(16 * KIB);
    let arenas = [ArenaRegion::new(0x1000_0000, 256 * KIB)];
    let mut pool = SlotPool::initialize(&arenas, layout, 3 * KIB).unwrap();

    let mut previous = None;
    let mut chosen = Vec::new();
    while let Some(index) = pool.choose_next_slot(previous) {
        pool.claim(index, chosen.len() as u32 + 1).unwrap();
        chosen.push(index);
        previous = Some(index);
    }

    for pair in chosen.windows(2) {
        let a = pool.slot(pair[0]).unwrap();
        let b = pool.slot(pair[1]).unwrap();
        if a.is_followed_by(b) {
            assert_eq!(a.group, b.group);
        }
    }
    // no contiguous run is longer than the ceiling
    let mut run = 0;
    let mut last: Option<usize> = None;
    for &index in &chosen {
        let slot = pool.slot(index).unwrap();
        let linked = last.is_some_and(|l| pool.slot(l).unwrap().is_followed_by(slot));
        run = if linked { run + slot.total_size } else { slot.total_size };
        assert!(run <= 16 * KIB);
        last = Some(index);
    }
}

// ============================================================================
// Prediction Tests
// ============================================================================

#[test]
fn test_prediction_non_increasing_as_speed_drops() {
    let table = [32 * MIB, 32 * MIB, 16 * MIB, 8 * MIB];
    let slot_size = SlotLayout::default().slot_size(2 * MIB);
    let mut last = FramePrediction::Continuous;
    for step in (0..=120).rev() {
        let speed = step as f64 * 0.5 * MIB as f64;
        let prediction = predict_frames(&table, slot_size, 24.0, speed);
        assert!(prediction <= last, "{prediction:?} > {last:?} at {speed}");
        last = prediction;
    }
    assert!(matches!(last, FramePrediction::Frames(_)));
}
