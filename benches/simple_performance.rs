use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sms_core::*;
use sms_gateway::rate_limiter::{RateLimitConfig, RateLimiter};
use sms_gateway::router::{classify, InboundRouter};
use sms_web_generic::SubmitForm;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct NullHandler;

#[async_trait::async_trait]
impl InboundHandler for NullHandler {
    async fn handle(&self, event: InboundEvent) {
        black_box(event);
    }
}

fn deliver_frame(size: usize) -> Frame {
    Frame::new(CommandId::DeliverSm)
        .with_field(Field::SourceAddr, "996771977377")
        .with_field(Field::DestinationAddr, "6791")
        .with_field(Field::ShortMessage, vec![b'x'; size])
}

fn benchmark_inbound_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("inbound_classification");

    for size in [16, 140, 254] {
        let frame = deliver_frame(size);
        group.bench_with_input(BenchmarkId::new("classify", size), &frame, |b, frame| {
            b.iter(|| black_box(classify(frame)))
        });
    }
    group.finish();
}

fn benchmark_inbound_routing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = rt.block_on(async { InboundRouter::spawn(Arc::new(NullHandler), 1024).0 });
    let frame = deliver_frame(140);

    c.bench_function("inbound_route", |b| {
        b.iter(|| black_box(router.route(&frame)))
    });
    router.close();
}

fn benchmark_rate_limiting(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let limiter = RateLimiter::new(RateLimitConfig {
        enabled: true,
        requests_per_second: 1_000_000.0,
        burst_size: 1_000,
        max_wait_ms: 0,
    });

    let mut group = c.benchmark_group("rate_limiting");

    group.bench_function("try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire(1)))
    });

    group.bench_function("acquire_no_wait", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(limiter.acquire(1, Duration::ZERO).await) })
    });

    let disabled = RateLimiter::new(RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    });
    group.bench_function("disabled", |b| {
        b.iter(|| black_box(disabled.try_acquire(1)))
    });

    group.finish();
}

fn benchmark_outbound_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound_encoding");

    group.bench_function("ucs2_to_frame", |b| {
        b.iter(|| {
            let msg = OutboundMessage::ucs2("6791", "996771977377", black_box("hello from the gateway"));
            black_box(msg.to_frame())
        })
    });

    group.bench_function("form_into_message", |b| {
        b.iter(|| {
            let form = SubmitForm {
                source: "6791".into(),
                target: "996771977377".into(),
                text: "hello".into(),
                coding: None,
                receipt: None,
            };
            black_box(form.into_message())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_inbound_classification,
    benchmark_inbound_routing,
    benchmark_rate_limiting,
    benchmark_outbound_encoding
);
criterion_main!(benches);
