#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn m2mp() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_m2mp"));
    command.arg("--log-level").arg("error");
    command
}

fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind should succeed");
    listener.local_addr().expect("local addr").port()
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn version_prints_package_version() {
    let output = m2mp().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("m2mp {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn send_on_null_channel_reports_fragments() {
    let output = m2mp()
        .args(["--format", "json", "--redundancy", "2", "send", "--data", "hi"])
        .output()
        .expect("send should run");

    assert!(output.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("send should emit json");
    assert_eq!(payload["payload_size"], 2);
    assert_eq!(payload["fragments"], 2);
    assert_eq!(payload["redundancy"], 2);
    assert!(payload["schema_id"]
        .as_str()
        .is_some_and(|id| id.ends_with("message-sent.schema.json")));
}

#[test]
fn zero_redundancy_is_usage_error() {
    let output = m2mp()
        .args(["--redundancy", "0", "send", "--data", "x"])
        .output()
        .expect("send should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn unknown_channel_is_usage_error() {
    let output = m2mp()
        .args(["send", "--channel", "carrier-pigeon", "--data", "x"])
        .output()
        .expect("send should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn send_without_daemon_is_transport_error() {
    let output = m2mp()
        .args(["send", "--daemon-port", &free_port().to_string(), "--data", "x"])
        .output()
        .expect("send should run");
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn listen_timeout_returns_124() {
    let output = m2mp()
        .args(["listen", "--timeout", "1s"])
        .output()
        .expect("listen should run");
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn daemon_relays_between_cli_clients() {
    let port = free_port().to_string();
    let mut daemon = KillOnDrop(
        m2mp()
            .args(["--format", "json", "daemon", "--port", &port])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("daemon should start"),
    );

    let mut ready = String::new();
    BufReader::new(daemon.0.stdout.take().expect("daemon stdout"))
        .read_line(&mut ready)
        .expect("daemon should report listening");
    assert!(ready.contains("daemon-listening.schema.json"));
    assert!(ready.contains(&format!("127.0.0.1:{port}")));

    let mut listener = KillOnDrop(
        m2mp()
            .args([
                "--format",
                "json",
                "listen",
                "--daemon-port",
                &port,
                "--prefix",
                "hello",
                "--count",
                "1",
                "--timeout",
                "20s",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("listener should start"),
    );

    // The listener may not be connected yet; resend until it has heard one.
    let deadline = Instant::now() + Duration::from_secs(15);
    let status = loop {
        let sent = m2mp()
            .args(["send", "--daemon-port", &port, "--data", "hello from cli"])
            .output()
            .expect("send should run");
        assert!(sent.status.success());

        if let Some(status) = listener.0.try_wait().expect("listener status") {
            break status;
        }
        assert!(Instant::now() < deadline, "listener never received a message");
        thread::sleep(Duration::from_millis(200));
    };
    assert!(status.success());

    let mut line = String::new();
    BufReader::new(listener.0.stdout.take().expect("listener stdout"))
        .read_line(&mut line)
        .expect("listener output");
    let message: serde_json::Value = serde_json::from_str(&line).expect("listener should emit json");
    assert_eq!(message["payload"], "hello from cli");
    assert_eq!(message["payload_size"], 14);
}
