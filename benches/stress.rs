use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
/// 2025-03-10T00:00:00Z
const BASE: i64 = 1_741_564_800_000;

async fn connect(host: &str, port: u16, db: &str) -> tokio_postgres::Client {
    let user = std::env::var("RESERVAD_ADMIN_USER").unwrap_or_else(|_| "admin".into());
    let password = std::env::var("RESERVAD_PASSWORD").unwrap_or_else(|_| "reservad".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(&user)
        .password(&password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

/// Run an INSERT and return the `id` column of the row it answers with.
async fn insert_id(client: &tokio_postgres::Client, sql: &str) -> String {
    let messages = client.simple_query(sql).await.expect("insert failed");
    messages
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("insert returned no row")
}

/// One professor, one course and one room in a fresh tenant.
struct Fixture {
    room: String,
    professor: String,
    course: String,
}

async fn fixture(client: &tokio_postgres::Client) -> Fixture {
    let ni = Ulid::new().random() as u32 % 1_000_000 + 1;
    let professor = insert_id(
        client,
        &format!("INSERT INTO usuarios (username, tipo, ni) VALUES ('prof_{ni}', 'P', {ni})"),
    )
    .await;
    let course = insert_id(
        client,
        &format!(
            "INSERT INTO disciplinas (nome, curso, carga_horaria, professor) VALUES ('Redes', 'ADS', 60, '{professor}')"
        ),
    )
    .await;
    let room = insert_id(
        client,
        &format!(
            "INSERT INTO salas (nome, capacidade, professor) VALUES ('Lab {ni}', 30, '{professor}')"
        ),
    )
    .await;
    Fixture {
        room,
        professor,
        course,
    }
}

fn booking_sql(f: &Fixture, start: i64, end: i64) -> String {
    format!(
        "INSERT INTO reservas (data_inicio, data_termino, periodo, sala, professor, disciplina) \
         VALUES ({start}, {end}, 'M', '{}', '{}', '{}')",
        f.room, f.professor, f.course
    )
}

fn tenant() -> String {
    format!("bench_{}", Ulid::new())
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &tenant()).await;
    let f = fixture(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = BASE + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(&f, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s ({:.0} ops/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("booking insert", &mut latencies);
}

/// Many connections race for the same slots on one room. Every slot must end
/// up with exactly one reservation.
async fn phase2_contended(host: &str, port: u16) {
    let db = tenant();
    let setup = connect(host, port, &db).await;
    let f = Arc::new(fixture(&setup).await);

    let n_clients = 16;
    let slots = 200;
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let (host, db, f) = (host.to_string(), db.clone(), f.clone());
        let (committed, conflicts) = (committed.clone(), conflicts.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(slots);
            for i in 0..slots {
                let s = BASE + (i as i64) * HOUR;
                let t = Instant::now();
                match client.batch_execute(&booking_sql(&f, s, s + HOUR)).await {
                    Ok(()) => {
                        committed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let code = e.code().map(|c| c.code().to_string());
                        if code.as_deref() == Some("23P01") {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                        } else {
                            eprintln!("unexpected error: {e}");
                        }
                    }
                }
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let committed = committed.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {slots} slots in {:.2}s: {committed} committed, {} conflicts",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    if committed != slots {
        println!("  !! expected exactly {slots} commits, got {committed}");
    }
    print_latency("contended insert", &mut all);
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = tenant();
    let setup = connect(host, port, &db).await;
    let f = Arc::new(fixture(&setup).await);
    let stop = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..4i64 {
        let (host, db, f, stop) = (host.to_string(), db.clone(), f.clone(), stop.clone());
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = BASE + (w * 100_000 + i) * HOUR;
                let _ = client.batch_execute(&booking_sql(&f, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let mut reader_handles = Vec::new();
    for _ in 0..4 {
        let (host, db, room) = (host.to_string(), db.clone(), f.room.clone());
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(200);
            for _ in 0..200 {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM reservas WHERE sala = '{room}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in reader_handles {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("room listing", &mut all);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant()).await;
            let f = fixture(&client).await;
            for i in 0..ops_per_conn {
                let s = BASE + (i as i64) * HOUR;
                client
                    .batch_execute(&booking_sql(&f, s, s + HOUR))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} tenants, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RESERVAD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RESERVAD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RESERVAD_PORT");

    println!("=== reservad stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential bookings on one room");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent bookings racing for the same slots");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
