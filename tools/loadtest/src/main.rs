// =============================================================================
// FIELDLINK — Load Test Tool
// =============================================================================
// Generates HMAC-signed telemetry envelopes for a fleet of simulated machines
// and posts them to the ingest server at a configurable rate.
// =============================================================================

use clap::Parser;
use fieldlink_ingest::envelope::SCHEMA_VERSION;
use fieldlink_ingest::signature::{sign_request, ALG_HMAC_SHA256, HDR_NONCE, HDR_SIGNATURE, HDR_SIGNATURE_ALG, HDR_TIMESTAMP};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "fieldlink-loadtest")]
#[command(about = "Load test tool for the FieldLink telemetry ingest server")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    /// Requests per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of simulated devices (LT-0000, LT-0001, ...)
    #[arg(long, default_value_t = 10)]
    devices: usize,

    /// Device secret is `<prefix><device id>`; seed the server to match
    #[arg(long, default_value = "lt-")]
    secret_prefix: String,

    /// Envelopes per request; 0 posts single envelopes to /telemetry
    #[arg(long, default_value_t = 0)]
    batch: usize,

    /// Send X-Device-Secret so a server with auto-registration enrolls the fleet
    #[arg(long)]
    bootstrap: bool,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    bad_body: AtomicU64,
    unavailable: AtomicU64,
    server_error: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

struct Device {
    id: String,
    secret: String,
    seq: i64,
    lat: f64,
    lng: f64,
    fuel: f64,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn next_envelope(d: &mut Device, rng: &mut impl Rng) -> Value {
    d.seq += 1;
    d.lat += rng.gen_range(-0.0005..0.0005);
    d.lng += rng.gen_range(-0.0005..0.0005);
    d.fuel = (d.fuel - rng.gen_range(0.0..0.05)).max(0.0);
    json!({
        "schemaVersion": SCHEMA_VERSION,
        "deviceId": d.id,
        "sentAt": now_ms(),
        "seq": d.seq,
        "firmwareVersion": "lt-1.0.0",
        "payload": {
            "position": { "lat": d.lat, "lng": d.lng, "speedKph": rng.gen_range(0.0..25.0), "headingDeg": rng.gen_range(0.0..360.0) },
            "state": { "status": if rng.gen_bool(0.9) { "working" } else { "idle" } },
            "consumables": { "fuelPct": d.fuel, "defPct": 80.0 },
            "powertrain": { "rpm": rng.gen_range(800..2200), "loadPct": rng.gen_range(10.0..95.0) }
        }
    })
}

fn main() {
    let args = Args::parse();
    let (path, unit) = if args.batch > 0 { ("/telemetry/batch", "batch") } else { ("/telemetry", "env") };

    println!("=== FieldLink Load Test ===");
    println!("Target:   {}{}", args.url, path);
    println!("Rate:     {} req/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Devices:  {}", args.devices);
    println!("Batch:    {}", args.batch);
    println!();

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Device> = (0..args.devices.max(1))
        .map(|i| {
            let id = format!("LT-{i:04}");
            Device {
                secret: format!("{}{}", args.secret_prefix, id),
                id,
                seq: 0,
                lat: 46.0 + rng.gen_range(-0.5..0.5),
                lng: 7.0 + rng.gen_range(-0.5..0.5),
                fuel: 100.0,
            }
        })
        .collect();

    let health_url = format!("{}/health", args.url);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {}", e);
            std::process::exit(1);
        }
    }

    let counters = Counters::default();
    let target_url = format!("{}{}", args.url, path);
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    let client = match reqwest::blocking::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Cannot build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    println!("\nSending...\n");
    let start = Instant::now();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let idx = (tick as usize) % fleet.len();
        let dev = &mut fleet[idx];
        let body = if args.batch > 0 {
            let items: Vec<Value> = (0..args.batch).map(|_| next_envelope(dev, &mut rng)).collect();
            json!({ "items": items })
        } else {
            next_envelope(dev, &mut rng)
        }
        .to_string();

        let ts = now_ms().to_string();
        let nonce = hex::encode(rng.gen::<[u8; 16]>());
        let sig = match sign_request(&dev.secret, &ts, &nonce, "POST", path, body.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Cannot sign for {}: {}", dev.id, e);
                std::process::exit(1);
            }
        };

        let mut req = client
            .post(&target_url)
            .header("Content-Type", "application/json")
            .header("x-device-id", &dev.id)
            .header(HDR_TIMESTAMP, &ts)
            .header(HDR_NONCE, &nonce)
            .header(HDR_SIGNATURE, sig)
            .header(HDR_SIGNATURE_ALG, ALG_HMAC_SHA256);
        if args.bootstrap {
            req = req.header("x-device-secret", &dev.secret);
        }

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        match req.body(body).send() {
            Ok(resp) => {
                let lat = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(lat, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    401 => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Rejected: {}", resp.text().unwrap_or_default());
                        }
                    }
                    400 | 413 => {
                        counters.bad_body.fetch_add(1, Ordering::Relaxed);
                    }
                    503 => {
                        counters.unavailable.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.server_error.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {}", other);
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} rejected={} bad_body={} unavailable={} 5xx={} err={} ({:.0} req/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.bad_body.load(Ordering::Relaxed),
                counters.unavailable.load(Ordering::Relaxed),
                counters.server_error.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 { counters.latency_sum_us.load(Ordering::Relaxed) / sent } else { 0 };
    let per_req = args.batch.max(1) as u64;

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {} ({} {}s)", sent, sent * per_req, unit);
    println!("Accepted:     {} ({:.1}%)", accepted, accepted as f64 / sent.max(1) as f64 * 100.0);
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Bad body:     {}", counters.bad_body.load(Ordering::Relaxed));
    println!("Unavailable:  {}", counters.unavailable.load(Ordering::Relaxed));
    println!("Server 5xx:   {}", counters.server_error.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {} us", avg_lat);
    println!("Throughput:   {:.1} req/s", sent as f64 / elapsed.as_secs_f64());
}
