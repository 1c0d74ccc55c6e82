//! Call-path benchmarks for the sandbox
//!
//! Run with: cargo run -p wasm-posix --example call_benchmark --release

use std::time::Instant;
use wasm_posix::{RuntimeConfig, WasmRuntime};

const LIBC_WAT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/libc.wat");

fn main() {
    println!("=== wasm-posix Call Benchmarks ===\n");

    bench_instantiation();
    bench_numeric_calls();
    bench_string_calls();
    bench_run();

    println!("\n=== Benchmark Complete ===");
}

fn bench_instantiation() {
    println!("## Instantiation");

    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module(LIBC_WAT).unwrap();

    // Warm up
    for _ in 0..5 {
        let _ = runtime.instantiate(&module).unwrap();
    }

    let mut times = Vec::new();
    for _ in 0..100 {
        let start = Instant::now();
        let _ = runtime.instantiate(&module).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("instantiate (bridge + constants)", &times);
    println!();
}

fn bench_numeric_calls() {
    println!("## Numeric Calls");

    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module(LIBC_WAT).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();

    let mut times = Vec::new();
    for i in 0..10_000 {
        let start = Instant::now();
        let _ = instance.call("add", &[i, 1]).unwrap();
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("call add", &times);

    // through the table accessor
    let mut times = Vec::new();
    for i in 0..10_000 {
        let start = Instant::now();
        let _ = instance.call("twice", &[i]).unwrap();
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("call twice (indirect)", &times);
    println!();
}

fn bench_string_calls() {
    println!("## String Calls");

    let runtime = WasmRuntime::new(RuntimeConfig::minimal().small_string_size(256)).unwrap();
    let module = runtime.load_module(LIBC_WAT).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();

    let short = "x".repeat(64);
    let mut times = Vec::new();
    for _ in 0..5_000 {
        let start = Instant::now();
        let _ = instance.call_with_string("strlen", &short, &[]).unwrap();
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("strlen 64 bytes (scratch buffer)", &times);

    // the fixture's bump heap never reuses freed blocks, so start over
    // every few calls
    let long = "x".repeat(2048);
    let mut times = Vec::new();
    for round in 0..5_000 {
        if round % 16 == 0 {
            instance = runtime.instantiate(&module).unwrap();
        }
        let start = Instant::now();
        let _ = instance.call_with_string("strlen", &long, &[]).unwrap();
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("strlen 2048 bytes (malloc + free)", &times);
    println!();
}

fn bench_run() {
    println!("## run (load, main, unload, restore)");

    let runtime = WasmRuntime::new(RuntimeConfig::minimal()).unwrap();
    let module = runtime.load_module(LIBC_WAT).unwrap();
    let mut instance = runtime.instantiate(&module).unwrap();
    let argv = vec!["main.so".to_string(), "-v".to_string()];

    let mut times = Vec::new();
    for _ in 0..200 {
        let start = Instant::now();
        let _ = instance.run(&argv).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    let pages = instance.memory_snapshot().len() / 65536;
    print_stats(&format!("run ({} pages snapshotted)", pages), &times);
    println!();
}

fn print_stats(name: &str, times: &[u64]) {
    let (min, max, avg) = stats(times);
    println!("  {:<36} min={:>6}us avg={:>8.1}us max={:>6}us", name, min, avg, max);
}

fn print_stats_ns(name: &str, times: &[u64]) {
    let (min, max, avg) = stats(times);
    println!("  {:<36} min={:>6}ns avg={:>8.1}ns max={:>6}ns", name, min, avg, max);
}

fn stats(times: &[u64]) -> (u64, u64, f64) {
    let min = times.iter().copied().min().unwrap_or(0);
    let max = times.iter().copied().max().unwrap_or(0);
    let avg = times.iter().sum::<u64>() as f64 / times.len().max(1) as f64;
    (min, max, avg)
}
