//! Benchmarks for key material issue and message sealing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use qkdmsg::crypto::{Aes256GcmCipher, SymmetricCipher};
use qkdmsg::key_ledger::KeyMaterialLedger;
use qkdmsg::network::wire;
use qkdmsg::network::{MessageArgs, MessageType, WireMessage};
use std::sync::Arc;

const KEY_BYTES: usize = 32;

fn fresh_ledger(messages: usize) -> KeyMaterialLedger {
    let ledger = KeyMaterialLedger::new();
    ledger
        .insert("bob", vec![7u8; KEY_BYTES * messages], true)
        .unwrap();
    ledger
}

fn bench_take_next(c: &mut Criterion) {
    c.bench_function("ledger_take_next_1000", |b| {
        b.iter_batched(
            || fresh_ledger(1000),
            |ledger| {
                for _ in 0..1000 {
                    black_box(ledger.take_next("bob", KEY_BYTES).unwrap());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_take_next_contended(c: &mut Criterion) {
    c.bench_function("ledger_take_next_8_threads", |b| {
        b.iter_batched(
            || Arc::new(fresh_ledger(8000)),
            |ledger| {
                std::thread::scope(|scope| {
                    for _ in 0..8 {
                        let ledger = ledger.clone();
                        scope.spawn(move || {
                            for _ in 0..1000 {
                                black_box(ledger.take_next("bob", KEY_BYTES).unwrap());
                            }
                        });
                    }
                });
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_seal_message(c: &mut Criterion) {
    let content = vec![0x42u8; 1024];

    c.bench_function("encrypt_and_frame_1k", |b| {
        b.iter_batched(
            || fresh_ledger(1),
            |ledger| {
                let key = ledger.take_next("bob", KEY_BYTES).unwrap();
                let sealed = Aes256GcmCipher.encrypt(&content, &key.bytes).unwrap();
                let message = WireMessage::new(MessageType::TextMessage)
                    .with_args(MessageArgs {
                        username: Some("alice".to_string()),
                        key_index: Some(key.offset as u64),
                        ..Default::default()
                    })
                    .with_content(sealed);
                black_box(wire::encode_frame(&message).unwrap())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_take_next,
    bench_take_next_contended,
    bench_seal_message
);
criterion_main!(benches);
