//! Trace pipeline benchmarks
//!
//! Measures analysis and correlation over a synthetic 200-span trace shaped
//! like an agent turn: a root HTTP span fanning out to routing, LLM and
//! database spans, a few of them faulted.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use turnscope_trace::{analyze, correlate, CorrelationConfig, EvaluationOutcome, RawSegment};

const SPAN_COUNT: usize = 200;

fn synthetic_trace() -> Vec<RawSegment> {
    let mut segments = vec![RawSegment::new(json!({
        "id": "root",
        "name": "chat-api",
        "start_time": 1_700_000_000.0,
        "end_time": 1_700_000_004.0,
        "http": {"request": {"method": "POST", "url": "http://target/chat"}, "response": {"status": 200}},
    }))];

    for i in 1..SPAN_COUNT {
        let parent = if i < 10 { "root".to_string() } else { format!("s{}", i % 10) };
        let start = 1_700_000_000.0 + (i as f64) * 0.01;
        let annotations = match i % 4 {
            0 => json!({"model_id": "anthropic.claude", "completion_tokens": 400, "max_tokens": 512}),
            1 => json!({"query": "SELECT * FROM orders", "row_count": i % 3}),
            2 => json!({"chosen_agent": "billing"}),
            _ => json!({}),
        };
        segments.push(RawSegment::new(json!({
            "id": format!("s{}", i),
            "parent_id": parent,
            "name": format!("span-{}", i),
            "start_time": start,
            "end_time": start + 0.05 + (i % 7) as f64 * 0.1,
            "fault": i % 37 == 0,
            "annotations": annotations,
        })));
    }
    segments
}

fn bench_analyze(c: &mut Criterion) {
    let segments = synthetic_trace();
    c.bench_function("analyze_200_spans", |b| {
        b.iter(|| analyze("1-65536000-000000000000000000000001", black_box(&segments)))
    });
}

fn bench_correlate(c: &mut Criterion) {
    let segments = synthetic_trace();
    let analysis = match analyze("1-65536000-000000000000000000000001", &segments) {
        Ok(analysis) => analysis,
        Err(e) => panic!("synthetic trace must analyze: {}", e),
    };
    let outcome = EvaluationOutcome::failing("bench:1", "completeness", 0.3, 0.7, "claimed data was found")
        .with_expected_route("refunds")
        .with_data_claim(true);
    let config = CorrelationConfig::default();

    c.bench_function("correlate_200_spans", |b| {
        b.iter(|| correlate(black_box(&outcome), black_box(&analysis), &config))
    });
}

criterion_group!(benches, bench_analyze, bench_correlate);
criterion_main!(benches);
