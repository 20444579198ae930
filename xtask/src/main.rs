use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde_json::json;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitCode, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

type Step = (&'static str, &'static [&'static str]);

const FMT: Step = ("cargo", &["fmt", "--all"]);
const FMT_CHECK: Step = ("cargo", &["fmt", "--all", "--", "--check"]);
const CLIPPY: Step = ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]);
const TEST: Step = ("cargo", &["test", "--workspace"]);
const BUILD_SERVER: Step = (
    "cargo",
    &["build", "--features", "metrics", "-p", "dockside-server"],
);

/// Boat 7 is captained by user 9; booking 42 is open, 43 is cancelled.
const SMOKE_FIXTURES: &str = r#"
[[fixtures.boats]]
id = 7
owner_id = 9
name = "Smoke Test"

[[fixtures.bookings]]
id = 42
customer_id = 5
boat_id = 7
status = "CONFIRMED"

[[fixtures.bookings]]
id = 43
customer_id = 5
boat_id = 7
status = "CANCELLED"
"#;

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Dockside gateway")]
struct Cli {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Format every crate.
    Fmt,
    /// Check formatting and run clippy with warnings denied.
    Lint,
    /// Run the workspace tests.
    Test,
    /// Lint, then test.
    Ci,
    /// Boot the gateway on fixture bookings and walk a conversation through it.
    Smoke,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let root = workspace_root();

    let ok = match cli.task {
        Task::Fmt => run_steps(&root, &[FMT]),
        Task::Lint => run_steps(&root, &[FMT_CHECK, CLIPPY]),
        Task::Test => run_steps(&root, &[TEST]),
        Task::Ci => run_steps(&root, &[FMT_CHECK, CLIPPY, TEST]),
        Task::Smoke => run_steps(&root, &[BUILD_SERVER]) && smoke(&root),
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run_steps(root: &Path, steps: &[Step]) -> bool {
    steps.iter().all(|(program, args)| {
        match Command::new(program).args(*args).current_dir(root).status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                eprintln!("'{program} {}' exited with {status}", args.join(" "));
                false
            }
            Err(err) => {
                eprintln!("could not start '{program}': {err}");
                false
            }
        }
    })
}

/// One HTTP exchange and the status the gateway must answer with.
struct Exchange {
    label: &'static str,
    post: Option<(u64, &'static str)>,
    path: &'static str,
    expect: StatusCode,
}

impl Exchange {
    fn post(label: &'static str, path: &'static str, sender_id: u64, content: &'static str, expect: StatusCode) -> Self {
        Self {
            label,
            post: Some((sender_id, content)),
            path,
            expect,
        }
    }

    fn get(label: &'static str, path: &'static str, expect: StatusCode) -> Self {
        Self {
            label,
            post: None,
            path,
            expect,
        }
    }

    fn request(&self, client: &Client, base_url: &str) -> RequestBuilder {
        let url = format!("{base_url}/{}", self.path);
        match self.post {
            Some((sender_id, content)) => client
                .post(url)
                .json(&json!({ "sender_id": sender_id, "content": content })),
            None => client.get(url),
        }
    }

    fn run(&self, client: &Client, base_url: &str) -> bool {
        match self.request(client, base_url).send() {
            Ok(response) if response.status() == self.expect => true,
            Ok(response) => {
                eprintln!(
                    "{}: expected {}, got {}",
                    self.label,
                    self.expect,
                    response.status()
                );
                false
            }
            Err(err) => {
                eprintln!("{}: request failed: {err}", self.label);
                false
            }
        }
    }
}

fn conversation() -> Vec<Exchange> {
    const OPEN: &str = "client/v1/bookings/42/messages";
    vec![
        Exchange::post("customer greeting", OPEN, 5, "Morning, is the fuel dock open?", StatusCode::OK),
        Exchange::post("stranger", OPEN, 77, "hello", StatusCode::FORBIDDEN),
        Exchange::post(
            "cancelled booking",
            "client/v1/bookings/43/messages",
            5,
            "still on?",
            StatusCode::FORBIDDEN,
        ),
        Exchange::post("captain script", OPEN, 9, "<script>alert(1)</script>", StatusCode::BAD_REQUEST),
        Exchange::post("second message", OPEN, 5, "We will be four people", StatusCode::OK),
        Exchange::post("third message", OPEN, 5, "Arriving around ten", StatusCode::OK),
        Exchange::post("burst overflow", OPEN, 5, "One more thing", StatusCode::TOO_MANY_REQUESTS),
        Exchange::post(
            "unknown booking",
            "client/v1/bookings/1/messages",
            5,
            "hello",
            StatusCode::NOT_FOUND,
        ),
        Exchange::get(
            "customer opens conversation",
            "client/v1/conversations/booking_42_5_9/access?user_id=5",
            StatusCode::OK,
        ),
        Exchange::get(
            "forged conversation id",
            "client/v1/conversations/booking_42_666_9/access?user_id=9",
            StatusCode::FORBIDDEN,
        ),
        Exchange::get(
            "stranger's audit trail",
            "client/v1/security/events?user_id=77",
            StatusCode::OK,
        ),
    ]
}

const EXPECTED_SERIES: &[&str] = &[
    r#"dockside_message_rejections_total{reason="rate_limited"} 1"#,
    r#"dockside_message_rejections_total{reason="not_booking_owner"} 1"#,
    r#"dockside_message_rejections_total{reason="failed_sanitization"} 1"#,
    r#"dockside_http_requests_total{route="messages.check",status="429"} 1"#,
    r#"dockside_http_requests_total{route="messages.check",status="404"} 1"#,
];

fn smoke(root: &Path) -> bool {
    let scratch = std::env::temp_dir().join(format!("dockside-smoke-{}", std::process::id()));
    if let Err(err) = fs::create_dir_all(&scratch)
        .and_then(|()| fs::write(scratch.join("server.toml"), SMOKE_FIXTURES))
    {
        eprintln!("could not write fixture config: {err}");
        return false;
    }

    let Some(port) = free_port() else {
        eprintln!("no free TCP port available");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");
    let config_base = scratch.join("server");

    let ok = match start_server(root, &bind_addr, &config_base) {
        Ok(mut server) => {
            let ok = drive(&format!("http://{bind_addr}"));
            if let Err(err) = server.kill() {
                eprintln!("could not stop dockside-server: {err}");
            }
            let _ = server.wait();
            ok
        }
        Err(err) => {
            eprintln!("could not launch dockside-server: {err}");
            false
        }
    };

    let _ = fs::remove_dir_all(&scratch);
    ok
}

fn start_server(root: &Path, bind_addr: &str, config_base: &Path) -> std::io::Result<Child> {
    Command::new("cargo")
        .args(["run", "--quiet", "--features", "metrics", "-p", "dockside-server", "--"])
        .arg("--config")
        .arg(config_base)
        .args(["--bind-addr", bind_addr, "--metrics-enabled", "true"])
        .env("RUST_LOG", "warn")
        .current_dir(root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

fn drive(base_url: &str) -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("could not build HTTP client: {err}");
            return false;
        }
    };

    if !wait_until_ready(&client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
        eprintln!("gateway did not become ready in time");
        return false;
    }

    // Every exchange runs even after a failure so the log shows all of them.
    let failures = conversation()
        .iter()
        .filter(|exchange| !exchange.run(&client, base_url))
        .count();

    failures == 0 && metrics_match(&client, &format!("{base_url}/metrics"))
}

fn free_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_until_ready(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if client
            .get(url)
            .send()
            .is_ok_and(|response| response.status().is_success())
        {
            return true;
        }
        sleep(Duration::from_millis(500));
    }
    false
}

fn metrics_match(client: &Client, url: &str) -> bool {
    let body = match client.get(url).send().and_then(|response| response.text()) {
        Ok(body) => body,
        Err(err) => {
            eprintln!("could not read metrics: {err}");
            return false;
        }
    };

    let missing: Vec<_> = EXPECTED_SERIES
        .iter()
        .filter(|series| !body.contains(*series))
        .collect();
    for series in &missing {
        eprintln!("metrics missing {series}");
    }
    missing.is_empty()
}
