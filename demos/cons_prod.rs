//! Throughput demo: runs a Producer and a Consumer against the same queue for one second and
//! reports messages/sec each way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ami::config::{ConsumerOptions, ProducerOptions};
use ami::redis::Store;
use ami::{Consumer, ErrorNotifier, Producer};
use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ami-demo", about = "produce/consume throughput demo")]
struct Args {
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, default_value = "ruthie")]
    queue: String,

    #[arg(long, default_value_t = 1)]
    run_seconds: u64,
}

struct LoggingNotifier;

impl ErrorNotifier for LoggingNotifier {
    fn notify(&self, err: &ami::AmiError) {
        eprintln!("got error from ami: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let store = Store::connect(&args.redis_url).await?;
    let notifier: Arc<dyn ErrorNotifier> = Arc::new(LoggingNotifier);

    let mut consumer = Consumer::with_notifier(
        ConsumerOptions::new(&args.queue, "alice"),
        store.clone(),
        notifier.clone(),
    )
    .await?;

    let producer = Producer::with_notifier(ProducerOptions::new(&args.queue), store, notifier).await?;

    let mut rx = consumer.start()?;
    let consumer = Arc::new(consumer);

    let produced = Arc::new(AtomicU64::new(0));
    let consumed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let consumed2 = consumed.clone();
    let consumer_for_ack = consumer.clone();
    let consume_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if consumer_for_ack.ack(msg).await.is_err() {
                break;
            }
            consumed2.fetch_add(1, Ordering::Relaxed);
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let produced2 = produced.clone();
    let produce_task = async {
        while !stop2.load(Ordering::Relaxed) {
            producer.send("{}".to_string()).await?;
            produced2.fetch_add(1, Ordering::Relaxed);
        }
        Ok::<_, ami::AmiError>(())
    };

    tokio::select! {
        res = produce_task => { res?; }
        _ = tokio::time::sleep(Duration::from_secs(args.run_seconds)) => {
            stop.store(true, Ordering::Relaxed);
        }
    }

    producer.close().await?;
    consume_task.await?;

    let mut consumer = Arc::try_unwrap(consumer)
        .unwrap_or_else(|_| panic!("consumer still shared after consume task finished"));
    consumer.stop().await?;
    consumer.close().await?;

    let elapsed = start.elapsed().as_secs_f64();
    let prod = produced.load(Ordering::Relaxed);
    let cons = consumed.load(Ordering::Relaxed);
    println!("Produced {prod} in {elapsed:.3}s, rps {:.1}", prod as f64 / elapsed);
    println!("Consumed {cons} in {elapsed:.3}s, rps {:.1}", cons as f64 / elapsed);

    Ok(())
}
