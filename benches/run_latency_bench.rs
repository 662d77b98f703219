// Run-loop latency benchmark
// Measures end-to-end latency of Engine::run against the software device
// model for the three dominant request shapes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coprun::config::types::EngineConfig;
use coprun::exec::relay::{nr, RelayBlock};
use coprun::exec::run_loop::Engine;
use coprun::hw::resource::CoprocessorOps;
use coprun::hw::sim::{isa, SimCoprocessor};
use coprun::hw::status::STOP_CODE_HOST_CALL;
use coprun::sched::context::{Context, ContextFlags};
use coprun::sched::wait::CancelToken;

const ITERATIONS: usize = 200;
const WARMUP_ITERATIONS: usize = 20;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    min: Duration,
    max: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        Self {
            p50: samples[(len as f64 * 0.50) as usize],
            p95: samples[(len as f64 * 0.95) as usize],
            min: samples[0],
            max: samples[len - 1],
        }
    }

    fn print(&self, scenario: &str) {
        println!(
            "{scenario}: p50 {:?} p95 {:?} min {:?} max {:?}",
            self.p50, self.p95, self.min, self.max
        );
    }
}

fn bench_config() -> EngineConfig {
    EngineConfig {
        wait_poll_interval: Duration::from_micros(100),
        tick_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn bench<F: FnMut() -> Duration>(mut iteration: F) -> LatencyStats {
    for _ in 0..WARMUP_ITERATIONS {
        iteration();
    }
    let samples = (0..ITERATIONS).map(|_| iteration()).collect();
    LatencyStats::from_samples(samples)
}

fn bench_plain_halt() -> LatencyStats {
    let engine = Engine::new(bench_config());
    let unit = Arc::new(SimCoprocessor::new(0, 0x1000));
    unit.load_program(0, &[isa::halt()]).unwrap();
    engine.add_coprocessor(unit).unwrap();
    let ctx = Context::new(ContextFlags::default());

    bench(|| {
        let start = Instant::now();
        engine.run(&ctx, 0, &CancelToken::new()).unwrap();
        start.elapsed()
    })
}

fn bench_relay_round_trip() -> LatencyStats {
    let engine = Engine::new(bench_config());
    let unit = Arc::new(SimCoprocessor::new(0, 0x1000));
    unit.load_program(0, &[isa::stop(STOP_CODE_HOST_CALL), 0x200, isa::halt()])
        .unwrap();
    let block = RelayBlock {
        nr: nr::NOOP,
        args: [0; 6],
    };
    unit.write_local(0x200, &block.to_bytes()).unwrap();
    engine.add_coprocessor(unit).unwrap();
    let ctx = Context::new(ContextFlags::default());

    bench(|| {
        let start = Instant::now();
        engine.run(&ctx, 0, &CancelToken::new()).unwrap();
        start.elapsed()
    })
}

fn bench_single_step() -> LatencyStats {
    let engine = Engine::new(bench_config());
    let unit = Arc::new(SimCoprocessor::new(0, 0x1000));
    unit.load_program(0, &[isa::nop(), isa::halt()]).unwrap();
    engine.add_coprocessor(unit).unwrap();
    let ctx = Context::new(ContextFlags {
        single_step: true,
        ..ContextFlags::default()
    });

    bench(|| {
        let start = Instant::now();
        engine.run(&ctx, 0, &CancelToken::new()).unwrap();
        start.elapsed()
    })
}

fn main() {
    println!("=== coprun run-loop latency ===");
    println!("Iterations: {ITERATIONS} (after {WARMUP_ITERATIONS} warmup)");

    bench_plain_halt().print("plain halt");
    bench_relay_round_trip().print("noop relay round trip");
    bench_single_step().print("single step");
}
