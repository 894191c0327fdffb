//! A program that uses the sbrk-backed allocator as the global allocator,
//! creates, grows and destroys a large number of objects, and checks the heap
//! along the way.

use boundary_alloc::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::sbrk();

// Minimum number of allocations before we start deallocating
const MIN_ALLOCATIONS: usize = 1024;
// Total number of allocations / deallocations
const ALLOCATIONS: usize = 64 * 1024;
// Log_2 of the maximum sized array to allocate
const LOG2_MAX_SIZE: usize = 20;

struct RandomObjects {
    allocated: Vec<Vec<u64>>,
    log2_max_size: usize,
}

impl RandomObjects {
    fn new(log2_max_size: usize) -> Self {
        RandomObjects {
            allocated: Vec::new(),
            log2_max_size: log2_max_size.max(8),
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        let range = Uniform::new_inclusive(8usize, self.log2_max_size);
        let new_size = (range.sample(rng) * range.sample(rng)) as u64;
        let obj: Vec<u64> = (0..new_size).collect();
        self.allocated.push(obj);
    }

    // Push onto an existing object one element at a time, which reallocates
    // it in small steps.
    fn grow<R: Rng>(&mut self, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.allocated.len()).sample(rng);
        let obj = &mut self.allocated[ix];
        obj.shrink_to_fit();
        for _ in 0..rng.gen_range(1..64) {
            obj.push(obj.len() as u64);
            obj.shrink_to_fit();
        }
        assert!(obj.iter().enumerate().all(|(i, &v)| v == i as u64));
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.allocated.len()).sample(rng);
        let obj = self.allocated.swap_remove(ix);
        drop(obj);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!(
            "USAGE: {} [ALLOCATIONS] [MIN_ALLOCATIONS] [LOG2_MAX_SIZE]",
            args[0]
        );
        return;
    }
    let min_allocations: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MIN_ALLOCATIONS);
    let allocations: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ALLOCATIONS)
        .max(min_allocations);
    let log2_max_size: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    // The allocator never logs from behind its lock, so a logger that
    // allocates is safe to install here.
    env_logger::init();
    println!("Running Stress Test.\n\nParameters:");
    println!("    {} total allocations", allocations);
    println!(
        "    {} allocations before any deallocations",
        min_allocations
    );
    println!("    2^{} max allocated object size", log2_max_size);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = RandomObjects::new(log2_max_size);
    let mut allocation_run: isize = min_allocations as isize;

    for i in 1..=allocations {
        // Decide if we should allocate some new objects, or destroy old ones.
        while allocation_run == 0 {
            let max_allocations = objects.allocated.len().max(min_allocations);
            let max_deallocations = objects.allocated.len() as isize;
            let range = Uniform::new(-max_deallocations, max_allocations as isize);
            allocation_run = range.sample(&mut rng);
        }

        if allocation_run > 0 {
            if rng.gen_bool(0.25) {
                objects.grow(&mut rng);
            } else {
                objects.create(&mut rng);
            }
            allocation_run -= 1;
        } else {
            objects.destroy(&mut rng);
            allocation_run += 1;
        }

        if i % 1024 == 0 {
            // Copy the results out before printing: printing allocates.
            let (stats, counters) = {
                let raw = ALLOCATOR.lock();
                (raw.check(), raw.counters())
            };
            let stats = stats.unwrap_or_else(|e| panic!("heap is corrupt: {}", e));
            println!("Step {} / {}", i, allocations);
            let count = objects.allocated.len();
            let total_size: usize = objects.allocated.iter().map(|v| v.len()).sum();
            println!("    Allocated objects: {}, size: {}", count, total_size);
            println!("    Allocator stats: {:?}", stats);
            println!("    Allocator counters: {:?}", counters);
        }
    }

    while !objects.allocated.is_empty() {
        objects.destroy(&mut rng);
    }

    let (stats, counters, growths, bytes) = {
        let raw = ALLOCATOR.lock();
        (
            raw.check(),
            raw.counters(),
            raw.grower.growths(),
            raw.grower.bytes(),
        )
    };
    println!("\nFinished.");
    println!("    Stats:    {:?}", stats);
    println!("    Counters: {:?}", counters);
    println!("    sbrk:     {} calls, {} bytes", growths, bytes);
    assert!(stats.is_ok());
}
