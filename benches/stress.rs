use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use staybook::engine::EngineConfig;
use staybook::mailer::MemoryMailer;
use staybook::site::{SiteManager, SiteSettings};
use staybook::wire;

const PASSWORD: &str = "Secr3t!pass";
const OPEN_DAYS: i64 = 365;

/// Runs the server in-process so sign-up OTPs can be read back from memory.
async fn start_server() -> (SocketAddr, Arc<MemoryMailer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let dir = std::env::temp_dir().join(format!("staybook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("cannot create data dir");
    let mailer = Arc::new(MemoryMailer::new());
    let settings = SiteSettings {
        engine: EngineConfig {
            bcrypt_cost: 4,
            ..EngineConfig::default()
        },
        compact_threshold: 10_000,
    };
    let sites = Arc::new(SiteManager::new(dir, settings, mailer.clone()));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let sites = sites.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sites, "staybook".to_string(), None).await;
            });
        }
    });
    (addr, mailer)
}

async fn connect(addr: SocketAddr, site: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(site)
        .user("staybook")
        .password("staybook");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn day(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(offset)
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
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn login(client: &Client, role: &str, email: &str) {
    client
        .simple_query(&format!(
            "SELECT * FROM login WHERE role = '{role}' AND email = '{email}' AND password = '{PASSWORD}'"
        ))
        .await
        .expect("login failed");
}

/// A logged-in tenant connection with `n_rooms` rooms, each open for the next year.
async fn setup_site(addr: SocketAddr, site: &str, n_rooms: usize) -> Vec<Ulid> {
    let client = connect(addr, site).await;
    let email = format!("tenant@{site}.example.com");
    client
        .batch_execute(&format!(
            "INSERT INTO tenants (id, name, email, password, phone_number) VALUES ('{}', 'Sari', '{email}', '{PASSWORD}', '081234567890')",
            Ulid::new()
        ))
        .await
        .unwrap();
    login(&client, "tenant", &email).await;

    let category = Ulid::new();
    let property = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO categories (id, location) VALUES ('{category}', 'Bali')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO properties (id, category_id, name, description) VALUES ('{property}', '{category}', 'Villa Sunset', 'Sea view')"
        ))
        .await
        .unwrap();

    let mut rooms = Vec::with_capacity(n_rooms);
    for i in 0..n_rooms {
        let room = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO rooms (id, property_id, room_type, price, description) VALUES ('{room}', '{property}', 'Room {i}', 500000, 'Queen bed')"
            ))
            .await
            .unwrap();
        let values: Vec<String> = (1..=OPEN_DAYS)
            .map(|d| {
                let markup = if d % 7 == 0 { "0.25" } else { "0" };
                format!("('{room}', '{}', {markup})", day(d))
            })
            .collect();
        client
            .batch_execute(&format!(
                "INSERT INTO available_dates (room_id, date, price_percentage) VALUES {}",
                values.join(", ")
            ))
            .await
            .unwrap();
        rooms.push(room);
    }
    println!("  {site}: {n_rooms} rooms open for {OPEN_DAYS} days");
    rooms
}

/// A verified, logged-in user connection on `site`.
async fn user(addr: SocketAddr, mailer: &MemoryMailer, site: &str) -> Client {
    let client = connect(addr, site).await;
    let id = Ulid::new();
    let email = format!("{}@{site}.example.com", id.to_string().to_lowercase());
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, password, phone_number) VALUES ('{id}', 'Budi', '{email}', '{PASSWORD}', '081234567890')"
        ))
        .await
        .unwrap();
    let body = mailer.last_to(&email).expect("no OTP mail").body;
    let start = body.find("code: ").expect("no OTP in mail") + "code: ".len();
    client
        .batch_execute(&format!(
            "INSERT INTO verifications (user_id, otp) VALUES ('{id}', '{}')",
            &body[start..start + 4]
        ))
        .await
        .unwrap();
    login(&client, "user", &email).await;
    client
}

fn book_sql(room: Ulid, from: i64, to: i64) -> String {
    format!(
        "INSERT INTO orders (id, room_id, start_date, end_date) VALUES ('{}', '{room}', '{}', '{}')",
        Ulid::new(),
        day(from),
        day(to)
    )
}

async fn phase1_sequential(addr: SocketAddr, mailer: &MemoryMailer) {
    let rooms = setup_site(addr, "bench_seq", 1).await;
    let client = user(addr, mailer, "bench_seq").await;

    let n = OPEN_DAYS as usize;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for night in 1..=OPEN_DAYS {
        let t = Instant::now();
        client.batch_execute(&book_sql(rooms[0], night, night + 1)).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task tries to book every night of one room; each night must go to
/// exactly one of them.
async fn phase2_booking_race(addr: SocketAddr, mailer: Arc<MemoryMailer>) {
    let rooms = setup_site(addr, "bench_race", 1).await;
    let room = rooms[0];
    let n_tasks = 10;
    let nights = 60;

    let won = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let mailer = mailer.clone();
        let won = won.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = user(addr, &mailer, "bench_race").await;
            for i in 0..nights {
                // Tasks walk the nights in different orders to maximise contention.
                let night = 1 + (i + t * 7) % nights;
                match client.batch_execute(&book_sql(room, night, night + 1)).await {
                    Ok(()) => {
                        won.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let code = e.code().map(|c| c.code().to_string()).unwrap_or_default();
                        assert_eq!(code, "23P01", "unexpected error: {e}");
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let refused = refused.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {nights} nights: {won} booked, {refused} refused in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, nights as usize, "every night must be booked exactly once");
}

async fn phase3_read_under_load(addr: SocketAddr, mailer: Arc<MemoryMailer>) {
    let rooms = setup_site(addr, "bench_read", 10).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for &room in rooms.iter().take(5) {
        let stop = stop.clone();
        let mailer = mailer.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = user(addr, &mailer, "bench_read").await;
            let mut night = 1;
            while !stop.load(Ordering::Relaxed) && night < OPEN_DAYS {
                let _ = client.batch_execute(&book_sql(room, night, night + 1)).await;
                night += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let room = rooms[r % rooms.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(addr, "bench_read").await;
            let mut latencies = Vec::with_capacity(reads_per_reader * 2);
            for i in 0..reads_per_reader as i64 {
                let from = 1 + i % 300;
                let t = Instant::now();
                let quote = format!(
                    "SELECT * FROM quotes WHERE room_id = '{room}' AND start_date = '{}' AND end_date = '{}'",
                    day(from),
                    day(from + 3)
                );
                let _ = client.simple_query(&quote).await;
                latencies.push(t.elapsed());

                let t = Instant::now();
                let search = format!(
                    "SELECT * FROM availability WHERE start_date = '{}' AND end_date = '{}'",
                    day(from),
                    day(from + 2)
                );
                let hits = client.simple_query(&search).await.unwrap();
                latencies.push(t.elapsed());
                let rows = hits
                    .iter()
                    .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
                    .count();
                assert!(rows <= 10);
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("quote + search latency", &mut all_latencies);
}

async fn phase4_connection_storm(addr: SocketAddr) {
    let rooms = setup_site(addr, "bench_storm", 1).await;
    let room = rooms[0];
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, "bench_storm").await;
            for i in 0..ops_per_conn {
                client
                    .simple_query(&format!(
                        "SELECT * FROM quotes WHERE room_id = '{room}' AND start_date = '{}' AND end_date = '{}'",
                        day(i + 1),
                        day(i + 4)
                    ))
                    .await
                    .unwrap();
                client.simple_query("SELECT * FROM categories").await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let (addr, mailer) = start_server().await;

    println!("=== staybook stress benchmark ===");
    println!("server: {addr}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(addr, &mailer).await;

    println!("\n[phase 2] concurrent booking race");
    phase2_booking_race(addr, mailer.clone()).await;

    println!("\n[phase 3] read latency under booking load");
    phase3_read_under_load(addr, mailer.clone()).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr).await;

    println!("\n=== benchmark complete ===");
}
