//! Criterion benchmarks for the hot path of the NDJSON wire protocol.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Line splitting of a multi-line WS text frame
//!   - Decode of each `Incoming` variant the CLI actually streams in volume
//!   - Glob-to-regex matching in the tool-approval rule engine (cached vs. cold)

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use csm::policy::glob_matches;
use csm::protocol::{decode_line, split_lines};

// ─── Line splitting ──────────────────────────────────────────────────────────

static MULTI_LINE_FRAME: &str = concat!(
    r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"a"}}}"#,
    "\n",
    r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"b"}}}"#,
    "\n",
    "\n",
    r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"c"}}}"#,
);

fn bench_split_lines(c: &mut Criterion) {
    c.bench_function("split_lines_multi_frame", |b| {
        b.iter(|| {
            let count = split_lines(black_box(MULTI_LINE_FRAME)).count();
            black_box(count);
        });
    });
}

// ─── NDJSON decode ───────────────────────────────────────────────────────────

static SYSTEM_INIT: &str = r#"{"type":"system","subtype":"init","session_id":"01HXYZ1234567890ABCDEFGHIJ","model":"claude-opus-4","tools":["Bash","Read","Write","Edit","Grep","Glob"],"mcp_servers":[{"name":"linear"}],"permission_mode":"default","cwd":"/home/user/project"}"#;

static ASSISTANT_TEXT: &str = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"I'll implement the new feature and add tests for the edge cases you mentioned."}],"usage":{"input_tokens":512,"output_tokens":64,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}},"stop_reason":null,"uuid":"a1b2c3d4"}"#;

static STREAM_EVENT_DELTA: &str = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"ial output chunk"}}}"#;

static CONTROL_REQUEST: &str = r#"{"type":"control_request","request_id":"req-42","request":{"tool_name":"Bash","tool_use_id":"toolu_01","input":{"command":"ls -la /tmp"}}}"#;

static RESULT_SUCCESS: &str = r#"{"type":"result","subtype":"success","result":"Done.","num_turns":3,"total_cost_usd":0.0421,"duration_ms":8213,"uuid":"e5f6g7h8","usage":{"input_tokens":4096,"output_tokens":512,"cache_read_input_tokens":2048,"cache_creation_input_tokens":0}}"#;

fn bench_decode_line(c: &mut Criterion) {
    c.bench_function("decode_system_init", |b| {
        b.iter(|| {
            let v = decode_line(black_box(SYSTEM_INIT));
            black_box(v);
        });
    });

    c.bench_function("decode_assistant_text", |b| {
        b.iter(|| {
            let v = decode_line(black_box(ASSISTANT_TEXT));
            black_box(v);
        });
    });

    c.bench_function("decode_stream_event_delta", |b| {
        b.iter(|| {
            let v = decode_line(black_box(STREAM_EVENT_DELTA));
            black_box(v);
        });
    });

    c.bench_function("decode_control_request", |b| {
        b.iter(|| {
            let v = decode_line(black_box(CONTROL_REQUEST));
            black_box(v);
        });
    });

    c.bench_function("decode_result_success", |b| {
        b.iter(|| {
            let v = decode_line(black_box(RESULT_SUCCESS));
            black_box(v);
        });
    });
}

// ─── Glob matching (rule engine) ─────────────────────────────────────────────
//
// `glob_matches` caches compiled regexes process-wide; the interesting cost
// under real load is the cache-hit path, since a long-running daemon compiles
// each configured pattern once and then matches it on every tool call.

fn bench_glob_matches(c: &mut Criterion) {
    // Warm the cache before measuring steady-state matching.
    glob_matches("ls *", "ls -la /tmp");
    glob_matches("git commit *", "git commit -m test");

    c.bench_function("glob_matches_cached_hit", |b| {
        b.iter(|| {
            let m = glob_matches(black_box("ls *"), black_box("ls -la /tmp"));
            black_box(m);
        });
    });

    c.bench_function("glob_matches_cached_miss", |b| {
        b.iter(|| {
            let m = glob_matches(black_box("git commit *"), black_box("git status"));
            black_box(m);
        });
    });
}

criterion_group!(benches, bench_split_lines, bench_decode_line, bench_glob_matches);
criterion_main!(benches);
