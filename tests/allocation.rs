use rover_pilot::autonomous::{AutonomousPilot, CycleOutcome};
use rover_pilot::classifier::{Arena, CompiledModel, Layer, QuantizedGraph, TensorShape};
use rover_pilot::frame::{Encoding, MemorySource};
use rover_pilot::motor::LoggingMotor;
use rover_pilot::preprocess::Preprocessor;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

/// Counts allocations made by the current thread.
struct Counting;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|c| c.set(c.get() + 1));
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|c| c.set(c.get() + 1));
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

fn allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

fn model() -> CompiledModel {
    CompiledModel {
        input: TensorShape {
            height: 8,
            width: 8,
            channels: 3,
        },
        layers: vec![
            Layer::AvgPool { size: 4 },
            Layer::Dense {
                outputs: 6,
                relu: true,
                multiplier: 1 << 30,
                shift: 2,
                weights: (0..6 * 12).map(|i| (i % 7) as i8 - 3).collect(),
                bias: vec![5, -5, 0, 10, -10, 1],
            },
            Layer::Dense {
                outputs: 3,
                relu: false,
                multiplier: i32::MAX,
                shift: 0,
                weights: (0..3 * 6).map(|i| (i % 5) as i8 - 2).collect(),
                bias: vec![0, 1, -1],
            },
        ],
    }
}

#[test]
fn steady_state_cycle_does_not_allocate() {
    let model = model();
    let arena = Arena::reserve(model.arena_requirement().unwrap()).unwrap();
    let graph = QuantizedGraph::build(arena, &model).unwrap();
    let source = MemorySource::new(16, 12, Encoding::Gray8)
        .with_frame((0..16 * 12).map(|i| (i * 7 % 256) as u8).collect())
        .with_gap()
        .with_frame(vec![240; 16 * 12]);
    let pre = Preprocessor::new(16, 12, 8, 3).unwrap();
    let mut pilot = AutonomousPilot::new(source, pre, graph, LoggingMotor::new(200), 200).unwrap();

    // Warm up every path once so lazy one-time setup is out of the way.
    for _ in 0..6 {
        pilot.cycle();
    }

    let before = allocations();
    let mut decided = 0;
    for _ in 0..300 {
        if matches!(pilot.cycle(), CycleOutcome::Decided { .. }) {
            decided += 1;
        }
    }
    let after = allocations();
    assert_eq!(after - before, 0, "forward passes allocated");
    assert_eq!(decided, 200);
}
