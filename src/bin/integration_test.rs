use clap::{Arg, Command};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::{
    process,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use uuid::Uuid;

#[allow(dead_code)]
#[derive(Debug)]
struct TestResult {
    name: String,
    success: bool,
    duration_ms: u128,
    error: Option<String>,
}

#[derive(Clone)]
struct TestRunner {
    client: Client,
    base_url: String,
    verbose: bool,
}

impl TestRunner {
    fn new(base_url: String, verbose: bool) -> Self {
        // Contended /lock requests block until the holder releases.
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            verbose,
        }
    }

    async fn get(&self, path: &str) -> Result<(u16, Value), String> {
        let url = format!("{}{}", self.base_url, path);
        if self.verbose {
            println!("  → GET {}", url);
        }

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;

        if self.verbose {
            println!("    Status: {}", status);
            println!("    Response: {}", text);
        }

        let json = serde_json::from_str(&text).unwrap_or_else(|_| json!(text));
        Ok((status, json))
    }

    async fn lock(&self, key: &str) -> Result<(u16, Value), String> {
        self.get(&format!("/lock?path={}", key)).await
    }

    async fn release(&self, key: &str) -> Result<(u16, Value), String> {
        self.get(&format!("/release?path={}", key)).await
    }

    async fn lock_status(&self, key: &str) -> Result<String, String> {
        let (status, body) = self.get(&format!("/status?path={}", key)).await?;
        if status != 200 {
            return Err(format!("Status check failed with {}", status));
        }
        body.get("status")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "Missing status field".to_string())
    }

    fn generate_key(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("integration-test-{}", &id[..8])
    }
}

struct Report {
    results: Vec<TestResult>,
}

impl Report {
    fn add(&mut self, name: &str, started: Instant, outcome: Result<(), String>) {
        let duration_ms = started.elapsed().as_millis();
        let success = outcome.is_ok();
        let status = if success { "\x1b[32m✅" } else { "\x1b[31m❌" };
        println!(" {} {:.<45} \x1b[90m({:>4}ms)\x1b[0m", status, format!("{} ", name), duration_ms);

        let error = outcome.err();
        if let Some(ref err) = error {
            println!("    \x1b[31m{}\x1b[0m", err);
        }

        self.results.push(TestResult {
            name: name.to_string(),
            success,
            duration_ms,
            error,
        });
    }

    fn print_summary(&self) {
        let total = self.results.len();
        let passed = self.results.iter().filter(|r| r.success).count();
        let failed = total - passed;

        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            println!("\x1b[32mResults: {}/{} passed\x1b[0m", passed, total);
        } else {
            println!("\x1b[31mResults: {}/{} passed, {} failed\x1b[0m", passed, total, failed);
            process::exit(1);
        }
    }
}

fn expect_true(what: &str, result: Result<(u16, Value), String>) -> Result<(), String> {
    match result? {
        (200, Value::Bool(true)) => Ok(()),
        (status, body) => Err(format!("{}: expected 200 true, got {} {}", what, status, body)),
    }
}

async fn check_health(runner: &TestRunner) -> Result<(), String> {
    match runner.get("/health").await? {
        (200, _) => Ok(()),
        (status, body) => Err(format!("Expected 200, got {} {}", status, body)),
    }
}

async fn check_acquire_and_status(runner: &TestRunner, key: &str) -> Result<(), String> {
    expect_true("lock", runner.lock(key).await)?;
    match runner.lock_status(key).await?.as_str() {
        "held" => Ok(()),
        other => Err(format!("Expected status 'held', got '{}'", other)),
    }
}

async fn check_contended_handoff(runner: &TestRunner, key: &str) -> Result<(), String> {
    let waiter = runner.clone();
    let waiting_key = key.to_string();
    let waiting = tokio::spawn(async move { waiter.lock(&waiting_key).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    if waiting.is_finished() {
        return Err("Second lock request returned while the lock was held".to_string());
    }

    expect_true("release", runner.release(key).await)?;

    match tokio::time::timeout(Duration::from_secs(10), waiting).await {
        Ok(Ok(result)) => expect_true("blocked lock", result),
        Ok(Err(e)) => Err(format!("Waiting task panicked: {}", e)),
        Err(_) => Err("Blocked lock request was not granted after release".to_string()),
    }
}

async fn check_release_and_free(runner: &TestRunner, key: &str) -> Result<(), String> {
    expect_true("release", runner.release(key).await)?;
    match runner.lock_status(key).await?.as_str() {
        "free" => Ok(()),
        other => Err(format!("Expected status 'free', got '{}'", other)),
    }
}

async fn check_invalid_key(runner: &TestRunner) -> Result<(), String> {
    match runner.lock("bad%2Fkey").await? {
        (400, body) if body.get("error").is_some() => Ok(()),
        (status, body) => Err(format!("Expected 400 with error body, got {} {}", status, body)),
    }
}

async fn check_concurrent_contention(runner: &TestRunner, key: &str) -> Result<(), String> {
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let outcomes: Vec<Result<(), String>> = stream::iter(0..5)
        .map(|_| {
            let runner = runner.clone();
            let key = key.to_string();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            async move {
                expect_true("lock", runner.lock(&key).await)?;
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                expect_true("release", runner.release(&key).await)
            }
        })
        .buffer_unordered(5)
        .collect()
        .await;

    outcomes.into_iter().collect::<Result<Vec<()>, String>>()?;
    match overlaps.load(Ordering::SeqCst) {
        0 => Ok(()),
        n => Err(format!("{} clients held the lock at the same time", n + 1)),
    }
}

async fn check_metrics(runner: &TestRunner) -> Result<(), String> {
    match runner.get("/metrics").await? {
        (200, body) => match body["locks"]["acquisitions"].as_u64() {
            Some(n) if n > 0 => Ok(()),
            _ => Err(format!("Expected acquisitions > 0, got {}", body["locks"])),
        },
        (status, _) => Err(format!("Expected 200, got {}", status)),
    }
}

#[tokio::main]
async fn main() {
    let matches = Command::new("zklock-test")
        .about("zklock integration tests")
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Base URL to test against")
                .default_value("http://127.0.0.1:8080"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .help("Print detailed request/response info")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let base_url = matches
        .get_one::<String>("url")
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_default();
    let verbose = matches.get_flag("verbose");

    println!("\x1b[1m🔒 zklock Integration Tests\x1b[0m");
    println!("\x1b[90m   Target: {}\x1b[0m\n", base_url);

    let runner = TestRunner::new(base_url, verbose);
    let mut report = Report { results: Vec::new() };
    let key = runner.generate_key();

    let started = Instant::now();
    report.add("Health Check", started, check_health(&runner).await);

    let started = Instant::now();
    report.add("Acquire Lock", started, check_acquire_and_status(&runner, &key).await);

    let started = Instant::now();
    report.add("Contended Handoff", started, check_contended_handoff(&runner, &key).await);

    let started = Instant::now();
    report.add("Release Lock", started, check_release_and_free(&runner, &key).await);

    let started = Instant::now();
    report.add(
        "Release Unheld Lock",
        started,
        expect_true("release", runner.release(&runner.generate_key()).await),
    );

    let started = Instant::now();
    report.add("Invalid Key", started, check_invalid_key(&runner).await);

    let started = Instant::now();
    let contention_key = runner.generate_key();
    report.add(
        "Concurrent Contention",
        started,
        check_concurrent_contention(&runner, &contention_key).await,
    );

    let started = Instant::now();
    report.add("Metrics", started, check_metrics(&runner).await);

    // Best-effort cleanup
    let _ = runner.release(&key).await;
    let _ = runner.release(&contention_key).await;

    report.print_summary();
}
