//! Benchmarks for session bookkeeping around the native call.

use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llama_session::inference::handle::NativeHandle;
use llama_session::inference::llama_ffi::{ContextParams, ModelParams, StubLlama};
use llama_session::session::history::ConversationHistory;
use llama_session::{Message, TextGeneration};

fn bench_history_payload(c: &mut Criterion) {
    let mut history = ConversationHistory::new("You are a helpful assistant.");
    for i in 0..1_000 {
        history.push(Message::user(format!("question {i}")));
        history.push(Message::assistant(format!("answer {i}")));
    }

    c.bench_function("history_to_chat_2k_turns", |b| {
        b.iter(|| black_box(history.to_chat()))
    });

    c.bench_function("history_snapshot_2k_turns", |b| {
        b.iter(|| black_box(history.snapshot()))
    });
}

fn bench_stub_generate(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("stub_generate_then_reset", |b| {
        let handle = NativeHandle::open(
            Arc::new(StubLlama::new()),
            Path::new("model.gguf"),
            &ModelParams::cpu(),
            &ContextParams::default(),
        )
        .unwrap();
        let session = TextGeneration::new(handle, "");

        b.iter(|| {
            runtime.block_on(async {
                let exchange = session.generate("What is Rust?").await.unwrap();
                session.reset().await.unwrap();
                black_box(exchange);
            })
        })
    });
}

criterion_group!(benches, bench_history_payload, bench_stub_generate);
criterion_main!(benches);
