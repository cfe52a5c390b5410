use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2024-01-01T00:00:00Z
const T0: i64 = 1_704_067_200_000;

struct Target {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl Target {
    /// Connect to `db`, or to a fresh tenant when `db` is None.
    async fn connect(&self, db: Option<&str>) -> Client {
        let db = db.map_or_else(|| format!("bench_{}", Ulid::new()), str::to_string);
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&db)
            .user(&self.user)
            .password(&self.password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        ms(avg),
        ms(percentile(latencies, 50.0)),
        ms(percentile(latencies, 95.0)),
        ms(percentile(latencies, 99.0)),
        ms(latencies[latencies.len() - 1]),
    );
}

async fn create_service(client: &Client) -> Ulid {
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration_ms, price_cents) VALUES ('{sid}', 'Bench', {HOUR}, 1000)"
        ))
        .await
        .expect("create service");
    sid
}

fn booking_sql(sid: Ulid, start: i64, end: i64) -> String {
    let bid = Ulid::new();
    format!(
        r#"INSERT INTO bookings (id, service_id, customer_name, start, "end", status) VALUES ('{bid}', '{sid}', 'bench', {start}, {end}, 'confirmed')"#
    )
}

fn is_conflict(err: &tokio_postgres::Error) -> bool {
    err.code().is_some_and(|c| c.code() == "23P01")
}

async fn phase1_sequential(target: &Target) {
    let client = target.connect(None).await;
    let sid = create_service(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = T0 + i as i64 * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(sid, s, s + HOUR))
            .await
            .expect("sequential insert");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots in one tenant. Every slot must be
/// won exactly once.
async fn phase2_contention(target: Arc<Target>) {
    let db = format!("bench_race_{}", Ulid::new());
    let setup = target.connect(Some(&db)).await;
    let sid = create_service(&setup).await;

    let n_tasks = 16;
    let n_slots = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let target = target.clone();
        let db = db.clone();
        let (won, lost) = (won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            let client = target.connect(Some(&db)).await;
            for slot in 0..n_slots {
                let s = T0 + slot * HOUR;
                match client.batch_execute(&booking_sql(sid, s, s + HOUR)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if is_conflict(&e) => lost.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("contention task");
    }

    let elapsed = start.elapsed();
    let (won, lost) = (won.load(Ordering::Relaxed), lost.load(Ordering::Relaxed));
    println!(
        "  {n_tasks} clients x {n_slots} slots: {won} won, {lost} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots as usize, "every slot must be booked exactly once");
}

async fn phase3_read_under_load(target: Arc<Target>) {
    let db = format!("bench_read_{}", Ulid::new());
    let setup = target.connect(Some(&db)).await;
    let sid = create_service(&setup).await;
    for i in 0..500 {
        let s = T0 + i * HOUR;
        setup
            .batch_execute(&booking_sql(sid, s, s + HOUR / 2))
            .await
            .expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4 {
        let target = target.clone();
        let db = db.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = target.connect(Some(&db)).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = T0 + (1000 + w * 100_000 + i) * HOUR;
                let _ = client.batch_execute(&booking_sql(sid, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        let db = db.clone();
        readers.push(tokio::spawn(async move {
            let client = target.connect(Some(&db)).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader as i64 {
                let from = T0 + ((r * 31 + i) % 480) * HOUR;
                let sql = if i % 2 == 0 {
                    format!(
                        r#"SELECT * FROM bookings WHERE "end" > {from} AND start < {}"#,
                        from + 24 * HOUR
                    )
                } else {
                    format!(
                        r#"SELECT * FROM conflicts WHERE start = {from} AND "end" = {}"#,
                        from + HOUR
                    )
                };
                let t = Instant::now();
                client.simple_query(&sql).await.expect("read");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("reader task"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("calendar + conflict reads", &mut all);
}

async fn phase4_connection_storm(target: Arc<Target>) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = target.connect(None).await;
            let sid = create_service(&client).await;
            for i in 0..ops_per_conn {
                let s = T0 + i * HOUR;
                client
                    .batch_execute(&booking_sql(sid, s, s + HOUR))
                    .await
                    .expect("storm insert");
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {}/{n_conns} succeeded in {:.2}s",
        success.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let env = |k: &str, default: &str| std::env::var(k).unwrap_or_else(|_| default.into());
    let target = Arc::new(Target {
        host: env("BOOKDESK_HOST", "127.0.0.1"),
        port: env("BOOKDESK_PORT", "5433").parse().expect("invalid BOOKDESK_PORT"),
        user: env("BOOKDESK_USER", "bookdesk"),
        password: env("BOOKDESK_PASSWORD", "bookdesk"),
    });

    println!("=== bookdesk stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contention on shared slots");
    phase2_contention(target.clone()).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(target.clone()).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(target).await;

    println!("\n=== benchmark complete ===");
}
