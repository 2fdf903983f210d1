use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use tablewise::config::Config;
use tablewise::engine::Engine;
use tablewise::model::*;
use tablewise::registry::RestaurantRegistry;

const TIMES: [Minutes; 8] = [1020, 1050, 1080, 1110, 1140, 1170, 1200, 1230];

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn base_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date")
}

fn request(date: NaiveDate, time: Minutes, party_size: u32, phone: String) -> ReservationRequest {
    ReservationRequest {
        guest: GuestRef::Contact { phone, name: None },
        date,
        time,
        party_size,
        duration: None,
        comments: None,
        source: None,
    }
}

/// A 20 table floor: small, medium and large tables.
fn setup(registry: &RestaurantRegistry, restaurant: &str) -> Arc<Engine> {
    let engine = registry.get_or_open(restaurant).expect("open engine");
    engine
        .set_profile(OperatingProfile::new(660, 1380, 90, 0).expect("profile"))
        .expect("set profile");
    let capacities = [(1, 2); 8]
        .into_iter()
        .chain([(2, 4); 8])
        .chain([(4, 8); 4]);
    for (i, (min, max)) in capacities.enumerate() {
        engine
            .create_table(
                Ulid::new(),
                format!("T{:02}", i + 1),
                PartyRange::new(min, max).expect("capacity"),
            )
            .expect("create table");
    }
    println!("  created {} tables", engine.table_count());
    engine
}

fn phase1_sequential(engine: &Engine) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut booked = 0;
    let start = Instant::now();

    for i in 0..n {
        let date = base_day() + Days::new((i / 40) as u64);
        let req = request(date, TIMES[i % TIMES.len()], 2 + (i % 5) as u32, format!("55510{i:04}"));
        let t = Instant::now();
        if engine.create_reservation(&req).is_ok() {
            booked += 1;
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} attempts ({booked} booked) in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

fn phase2_concurrent(engine: &Engine) {
    let n_threads = 8;
    let n_per_thread = 250;
    let booked = AtomicUsize::new(0);
    let start = Instant::now();

    std::thread::scope(|s| {
        for t in 0..n_threads {
            let booked = &booked;
            s.spawn(move || {
                for j in 0..n_per_thread {
                    // All threads fight over the same days.
                    let date = base_day() + Days::new(100 + (j / 25) as u64);
                    let req = request(date, TIMES[(t + j) % TIMES.len()], 2 + (j % 3) as u32, format!("5552{t}{j:04}"));
                    if engine.create_reservation(&req).is_ok() {
                        booked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let elapsed = start.elapsed();
    let total = n_threads * n_per_thread;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_threads} threads x {n_per_thread} attempts = {total} total ({} booked) in {:.2}s = {ops:.0} ops/sec",
        booked.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
}

fn phase3_read_under_load(engine: &Engine) {
    let date = base_day() + Days::new(200);
    let n_reads = 5000;
    let mut latencies = Vec::with_capacity(n_reads);
    let start = Instant::now();

    std::thread::scope(|s| {
        for t in 0..4usize {
            s.spawn(move || {
                for j in 0..200usize {
                    let req = request(date, TIMES[j % TIMES.len()], 1 + (j % 6) as u32, format!("5553{t}{j:04}"));
                    let _ = engine.create_reservation(&req);
                }
            });
        }
        for i in 0..n_reads {
            let query = engine
                .config()
                .slot_query(1 + (i % 6) as u32)
                .preferred(TIMES[i % TIMES.len()]);
            let t = Instant::now();
            let _ = engine.find_slots(date, &query);
            latencies.push(t.elapsed());
        }
    });

    println!("  {n_reads} searches in {:.2}s", start.elapsed().as_secs_f64());
    print_latency("find_slots latency", &mut latencies);
}

fn phase4_restaurant_storm(registry: &RestaurantRegistry) {
    let n_restaurants = 50;
    let ops_per_restaurant = 40;
    let success = AtomicUsize::new(0);
    let start = Instant::now();

    std::thread::scope(|s| {
        for r in 0..n_restaurants {
            let success = &success;
            s.spawn(move || {
                let engine = setup_quiet(registry, &format!("storm-{r}"));
                for i in 0..ops_per_restaurant {
                    let req = request(base_day(), TIMES[i % TIMES.len()], 2, format!("5554{r:02}{i:02}"));
                    if engine.create_reservation(&req).is_ok() {
                        success.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    println!(
        "  {n_restaurants} restaurants, {ops_per_restaurant} ops each: {} booked in {:.2}s",
        success.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

fn setup_quiet(registry: &RestaurantRegistry, restaurant: &str) -> Arc<Engine> {
    let engine = registry.get_or_open(restaurant).expect("open engine");
    engine
        .set_profile(OperatingProfile::new(660, 1380, 90, 0).expect("profile"))
        .expect("set profile");
    for i in 0..4 {
        engine
            .create_table(Ulid::new(), format!("T{i}"), PartyRange::new(1, 4).expect("capacity"))
            .expect("create table");
    }
    engine
}

fn main() {
    let dir = std::env::var("TABLEWISE_BENCH_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join(format!("tablewise_bench_{}", Ulid::new())));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let registry = RestaurantRegistry::new(Config {
        data_dir: dir.clone(),
        booking_retries: 3,
        ..Config::from_env()
    });

    println!("=== tablewise stress benchmark ===");
    println!("data: {}\n", dir.display());

    println!("[setup]");
    let engine = setup(&registry, "bench");

    println!("\n[phase 1] sequential create throughput");
    phase1_sequential(&engine);

    println!("\n[phase 2] concurrent create throughput");
    phase2_concurrent(&engine);

    println!("\n[phase 3] search latency under write load");
    phase3_read_under_load(&engine);

    println!("\n[phase 4] restaurant storm");
    phase4_restaurant_storm(&registry);

    println!("\n=== benchmark complete ===");
}
