use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Test client for the seguro event log server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Urbit-style ship name to authenticate as
    #[arg(long, default_value = "~zod")]
    patp: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Handshake, write a couple of events, read them back (default)
    Smoke,
    /// Write 1000 events then read the whole range back
    Pipeline,
    /// Benchmark write throughput with concurrent connections
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Events written per connection
        #[arg(short, long, default_value_t = 100_000)]
        events: usize,
        /// Bytes per event payload
        #[arg(short, long, default_value_t = 256)]
        size: usize,
    },
    /// Sustained single-event READ round-trips with latency percentiles
    Sustain {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Warmup duration in seconds (discarded from report)
        #[arg(short = 'W', long, default_value_t = 3)]
        warmup: u64,
        /// Measurement duration in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

/// Thin line+bracket reader over the protocol's control channel.
struct SeguroConn {
    reader: BufReader<TcpStream>,
}

impl SeguroConn {
    fn connect(addr: &str, patp: &str) -> (TcpStream, Self) {
        let stream = TcpStream::connect(addr).expect("failed to connect");
        stream.set_nodelay(true).unwrap();
        let writer = stream.try_clone().expect("clone failed");
        let mut conn = Self { reader: BufReader::new(stream) };
        conn.expect_line("SEGURO 0");

        let mut writer = writer;
        send_line(&mut writer, "HELLO 0");
        conn.expect_line("IDENTIFY 0");
        send_line(&mut writer, &format!("POINT {patp}"));
        let ready = conn.read_line();
        assert!(ready.starts_with("READY "), "expected READY, got {ready:?}");
        (writer, conn)
    }

    fn expect_line(&mut self, expected: &str) {
        let line = self.read_line();
        assert_eq!(line, expected);
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("failed to read line");
        line.trim_end_matches('\n').to_string()
    }

    /// Reads one `EVENT <id> <length>\n<payload>\n\n` frame from a READ stream.
    fn read_event_frame(&mut self) -> (u64, Vec<u8>) {
        let header = self.read_line();
        let mut parts = header.strip_prefix("EVENT ").expect("expected EVENT header").split_whitespace();
        let id: u64 = parts.next().unwrap().parse().unwrap();
        let length: u64 = parts.next().unwrap().parse().unwrap();
        let mut payload = vec![0u8; length as usize];
        self.reader.read_exact(&mut payload).expect("failed to read event payload");
        let mut trailer = [0u8; 2];
        self.reader.read_exact(&mut trailer).expect("failed to read event trailer");
        assert_eq!(&trailer, b"\n\n");
        (id, payload)
    }
}

fn send_line(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).expect("write failed");
    stream.write_all(b"\n").expect("write failed");
}

fn send_write(stream: &mut TcpStream, id: u64, payload: &[u8]) {
    send_line(stream, &format!("WRITE {id} {}", payload.len()));
    stream.write_all(payload).expect("write failed");
    stream.write_all(b"\n\n").expect("write failed");
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr, &args.patp),
        Command::Pipeline => pipeline_test(&addr, &args.patp),
        Command::Bench { connections, events, size } => bench_test(&addr, &args.patp, connections, events, size),
        Command::Sustain { connections, warmup, duration } => sustain_test(&addr, &args.patp, connections, warmup, duration),
    }
}

fn smoke_test(addr: &str, patp: &str) {
    eprintln!("smoke test: connecting to {addr}");
    let (mut writer, mut conn) = SeguroConn::connect(addr, patp);

    send_write(&mut writer, 1, b"hello");
    send_write(&mut writer, 2, b"world!!");

    send_line(&mut writer, "READ 1 2");
    let (id, payload) = conn.read_event_frame();
    assert_eq!((id, payload.as_slice()), (1, b"hello".as_slice()));
    let (id, payload) = conn.read_event_frame();
    assert_eq!((id, payload.as_slice()), (2, b"world!!".as_slice()));

    eprintln!("smoke test: PASSED");
}

fn pipeline_test(addr: &str, patp: &str) {
    let num_events = 1000usize;
    eprintln!("pipeline test: writing {num_events} events to {addr}");
    let (mut writer, mut conn) = SeguroConn::connect(addr, patp);

    let mut expected = Vec::with_capacity(num_events);
    for i in 1..=num_events as u64 {
        let payload = format!("event-{i}").into_bytes();
        send_write(&mut writer, i, &payload);
        expected.push(payload);
    }

    send_line(&mut writer, &format!("READ 1 {num_events}"));
    for (i, exp) in expected.iter().enumerate() {
        let (id, payload) = conn.read_event_frame();
        assert_eq!(id, (i + 1) as u64, "unexpected event id at position {i}");
        assert_eq!(&payload, exp, "payload mismatch for event {id}");
    }

    eprintln!("pipeline test: PASSED ({num_events} events)");
}

fn bench_test(addr: &str, patp: &str, num_connections: usize, events_per_conn: usize, payload_size: usize) {
    eprintln!("bench: {num_connections} connections x {events_per_conn} writes ({payload_size}B each) to {addr}");

    let payload = vec![0xABu8; payload_size];
    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let patp = patp.to_string();
            let payload = payload.clone();
            std::thread::spawn(move || {
                let (mut writer, _conn) = SeguroConn::connect(&addr, &patp);
                for i in 1..=events_per_conn as u64 {
                    send_write(&mut writer, i, &payload);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_connections * events_per_conn;
    let eps = total as f64 / elapsed.as_secs_f64();
    eprintln!("bench: {total} writes in {:.2}s = {eps:.0} events/s", elapsed.as_secs_f64());
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn print_interval(samples: &mut [u64], elapsed: Duration) {
    samples.sort_unstable();
    let n = samples.len();
    let qps = n as f64 / elapsed.as_secs_f64();
    eprintln!(
        "{:>10.0}  {:>8.1}µs  {:>8.1}µs  {:>8.1}µs  {:>8.1}µs  {:>8}",
        qps,
        percentile(samples, 50.0),
        percentile(samples, 95.0),
        percentile(samples, 99.0),
        percentile(samples, 99.9),
        n,
    );
}

/// Measures round-trip latency of writing one event and immediately reading it back.
fn sustain_test(addr: &str, patp: &str, num_connections: usize, warmup_secs: u64, duration_secs: u64) {
    eprintln!("sustain: {num_connections} connections, warmup={warmup_secs}s, duration={duration_secs}s -> {addr}");

    let (tx, rx) = mpsc::channel::<u64>();

    for conn_idx in 0..num_connections {
        let addr = addr.to_string();
        let patp = patp.to_string();
        let tx = tx.clone();
        std::thread::spawn(move || {
            let (mut writer, mut conn) = SeguroConn::connect(&addr, &patp);
            let payload = vec![0x42u8; 64];
            let mut id = (conn_idx as u64) * 10_000_000 + 1;
            loop {
                let sent_at = Instant::now();
                send_write(&mut writer, id, &payload);
                send_line(&mut writer, &format!("READ {id} 1"));
                let (got_id, _) = conn.read_event_frame();
                assert_eq!(got_id, id);
                if tx.send(sent_at.elapsed().as_nanos() as u64).is_err() {
                    break;
                }
                id += 1;
            }
        });
    }
    drop(tx);

    if warmup_secs > 0 {
        eprint!("warming up ({warmup_secs}s)");
        let warmup_end = Instant::now() + Duration::from_secs(warmup_secs);
        while Instant::now() < warmup_end {
            while rx.try_recv().is_ok() {}
            std::thread::sleep(Duration::from_millis(100));
            eprint!(".");
        }
        eprintln!(" ready");
    }

    eprintln!("{:>10}  {:>9}  {:>9}  {:>9}  {:>9}  {:>8}", "rps", "p50", "p95", "p99", "p99.9", "n");

    let measure_start = Instant::now();
    let measure_end = measure_start + Duration::from_secs(duration_secs);
    let mut all_samples: Vec<u64> = Vec::new();
    let mut interval_samples: Vec<u64> = Vec::new();
    let mut last_print = Instant::now();

    loop {
        let now = Instant::now();
        if now >= measure_end {
            break;
        }
        let timeout = (measure_end - now).min(Duration::from_millis(100));
        match rx.recv_timeout(timeout) {
            Ok(ns) => {
                interval_samples.push(ns);
                all_samples.push(ns);
                while let Ok(ns) = rx.try_recv() {
                    interval_samples.push(ns);
                    all_samples.push(ns);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("error: all worker connections died — is the server running?");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_print.elapsed() >= Duration::from_secs(1) && !interval_samples.is_empty() {
            print_interval(&mut interval_samples, last_print.elapsed());
            interval_samples.clear();
            last_print = Instant::now();
        }
    }

    if !interval_samples.is_empty() {
        print_interval(&mut interval_samples, last_print.elapsed());
    }

    if all_samples.is_empty() {
        eprintln!("no samples collected");
        return;
    }
    all_samples.sort_unstable();
    let n = all_samples.len();
    let elapsed = measure_start.elapsed();
    eprintln!();
    eprintln!("── summary ({:.1}s, {n} round-trips) ──────────────────────────────────", elapsed.as_secs_f64());
    eprintln!("  rps     {:.0}", n as f64 / elapsed.as_secs_f64());
    eprintln!("  p50     {:.1}µs", percentile(&all_samples, 50.0));
    eprintln!("  p95     {:.1}µs", percentile(&all_samples, 95.0));
    eprintln!("  p99     {:.1}µs", percentile(&all_samples, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(&all_samples, 99.9));
    eprintln!("  p99.99  {:.1}µs", percentile(&all_samples, 99.99));
    eprintln!("  max     {:.1}µs", all_samples[n - 1] as f64 / 1_000.0);
}
