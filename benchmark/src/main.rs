use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use replifs::client::FsClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Pause between requests in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8200")]
    server: String,

    /// Payload size per append in bytes
    #[arg(short, long, default_value = "256")]
    payload: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, interval {} ms",
        args.concurrency, args.interval
    );

    let mut setup = FsClient::new(args.server.clone());
    let resp = setup.create_directory("bench").await?;
    if !resp.ok {
        eprintln!("Failed to create bench directory: {}", resp.error);
        return Ok(());
    }

    let mut handles = vec![];
    for worker in 0..args.concurrency {
        let server_addr = args.server.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let interval = args.interval;
        let payload_size = args.payload;

        let handle = tokio::spawn(async move {
            let mut client = FsClient::new(server_addr);
            let path = format!("bench/worker_{worker}.log");
            loop {
                let payload: Vec<u8> = (0..payload_size).map(|_| rand::random::<u8>()).collect();
                let start = Instant::now();

                match client.append_file(&path, payload).await {
                    Ok(resp) if resp.ok => {
                        let elapsed = start.elapsed();
                        let mut hist = histogram.lock().await;
                        hist.record(elapsed.as_micros() as u64).unwrap();
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Ok(resp) => eprintln!("Request rejected: {}", resp.error),
                    Err(e) => eprintln!("Request failed: {e}"),
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {total}");
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
