use std::time::Instant;
use weave_grid::{DataPayload, FrameBuffer, Packet, PayloadFormat};

const ITERATIONS: usize = 100;
const PACKETS_PER_RUN: usize = 1_000;
const PAYLOAD_SIZE: usize = 4 * 1024;
const READ_SIZE: usize = 1_500;
const TARGET_LATENCY_MS: u128 = 50;

fn main() {
    println!("Running frame reassembly benchmark...");
    println!("Target latency: < {}ms per {} packets", TARGET_LATENCY_MS, PACKETS_PER_RUN);
    println!("Iterations: {}", ITERATIONS);
    println!();

    let content: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();
    let packet = Packet::DataTransmission(DataPayload::new(PayloadFormat::File, content));
    let frame = packet.to_wire().expect("frame");
    let stream: Vec<u8> = frame.as_bytes().repeat(PACKETS_PER_RUN);

    let mut durations = Vec::with_capacity(ITERATIONS);

    for i in 0..ITERATIONS {
        let start = Instant::now();

        let mut buffer = FrameBuffer::new();
        let mut decoded = 0;
        for chunk in stream.chunks(READ_SIZE) {
            buffer.extend(chunk);
            while let Some(result) = buffer.next_packet() {
                if result.is_ok() {
                    decoded += 1;
                }
            }
        }

        let duration = start.elapsed();
        if decoded == PACKETS_PER_RUN {
            durations.push(duration.as_micros());
        }

        if (i + 1) % 10 == 0 {
            print!(".");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
    }

    println!();
    println!();

    if durations.is_empty() {
        println!("ERROR: No complete runs!");
        std::process::exit(1);
    }

    durations.sort_unstable();
    let min_us = durations[0];
    let max_us = durations[durations.len() - 1];
    let median_us = durations[durations.len() / 2];
    let p95_idx = (durations.len() as f64 * 0.95) as usize;
    let p95_us = durations[p95_idx.min(durations.len() - 1)];

    println!("Results:");
    println!("  Complete:  {}/{}", durations.len(), ITERATIONS);
    println!("  Min:       {:6.2}ms", min_us as f64 / 1000.0);
    println!("  Median:    {:6.2}ms", median_us as f64 / 1000.0);
    println!("  P95:       {:6.2}ms", p95_us as f64 / 1000.0);
    println!("  Max:       {:6.2}ms", max_us as f64 / 1000.0);
    println!();

    let median_ms = median_us as f64 / 1000.0;
    if median_ms < TARGET_LATENCY_MS as f64 {
        println!("PASS: median ({:.2}ms) is below target ({}ms)", median_ms, TARGET_LATENCY_MS);
    } else {
        println!("FAIL: median ({:.2}ms) exceeds target ({}ms)", median_ms, TARGET_LATENCY_MS);
    }
}
