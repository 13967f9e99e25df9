//! End-to-end throughput benchmark for Courier.
//!
//! This benchmark measures actual WebSocket message throughput with real network I/O.

use bytes::BytesMut;
use courier_protocol::{codec, Frame, PROTOCOL_VERSION};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsReceiver = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const SERVER_URL: &str = "ws://127.0.0.1:8000/ws";
const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Courier End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients).await;
}

async fn run_pubsub_benchmark(num_clients: usize) {
    println!("Pub/Sub Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let publication_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let count = Arc::clone(&publication_count);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients subscribed", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    publication_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = publication_count.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Publications:         {:>10}                           ║",
        total
    );
    println!(
        "║  Throughput:           {:>10.0} pub/s                    ║",
        per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} pub/s                    ║",
        per_sec / num_clients as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Read frames until one matches `pred`.
async fn expect_frame(
    receiver: &mut WsReceiver,
    buf: &mut BytesMut,
    pred: impl Fn(&Frame) -> bool,
) -> Result<Frame, BoxError> {
    loop {
        while let Some(frame) = codec::decode_from(buf)? {
            if let Frame::Error { code, message, .. } = &frame {
                return Err(format!("server error {code}: {message}").into());
            }
            if pred(&frame) {
                return Ok(frame);
            }
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed".into()),
        }
    }
}

async fn run_client(
    client_id: usize,
    publication_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();
    let mut buf = BytesMut::with_capacity(65536);

    let connect = Frame::connect(PROTOCOL_VERSION.major, Some(format!("bench-{client_id}")));
    sender
        .send(Message::Binary(codec::encode(&connect)?.to_vec()))
        .await?;
    expect_frame(&mut receiver, &mut buf, |f| matches!(f, Frame::Connected { .. })).await?;

    let subscribe = Frame::subscribe(1, CHANNEL);
    sender
        .send(Message::Binary(codec::encode(&subscribe)?.to_vec()))
        .await?;
    expect_frame(&mut receiver, &mut buf, |f| matches!(f, Frame::Subscribed { .. })).await?;

    barrier.wait().await;

    let publish = Frame::publish(2, CHANNEL, br#"{"input":"benchmark"}"#.to_vec());
    let publish_msg = Message::Binary(codec::encode(&publish)?.to_vec());

    // Separate receiver task for full-duplex operation
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                    if matches!(frame, Frame::Publication { .. }) {
                        publication_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(publish_msg.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
