use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::{sleep, timeout, Instant},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_replicates_from_leader_to_follower() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("replicated_cache");

    let (mut leader, mut leader_stdout) = spawn_node(&binary, None).await?;
    let leader_addr = read_listen_addr(&mut leader_stdout).await?;
    let leader_logs = tokio::spawn(drain_stdout(leader_stdout));

    let (mut follower, mut follower_stdout) = spawn_node(&binary, Some(&leader_addr)).await?;
    let follower_addr = read_listen_addr(&mut follower_stdout).await?;
    let follower_logs = tokio::spawn(drain_stdout(follower_stdout));

    // The follower joins in the background; keep writing until it shows up there.
    let deadline = Instant::now() + READ_TIMEOUT;
    loop {
        run_client(&binary, &["set", "--server", &leader_addr, "foo", "bar"]).await?;
        let fetched = run_client(&binary, &["get", "--server", &follower_addr, "foo"]).await;
        if let Ok(value) = fetched {
            assert_eq!(value, "bar");
            break;
        }
        if Instant::now() > deadline {
            return Err(anyhow!("value never reached the follower"));
        }
        sleep(Duration::from_millis(100)).await;
    }

    let leader_value = run_client(&binary, &["get", "--server", &leader_addr, "foo"]).await?;
    assert_eq!(leader_value, "bar");

    run_client(&binary, &["delete", "--server", &leader_addr, "foo"]).await?;
    let missing = run_client(&binary, &["get", "--server", &leader_addr, "foo"]).await;
    assert!(missing.is_err(), "deleted key should not be found");

    for child in [&mut follower, &mut leader] {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
    let _ = follower_logs.await;
    let _ = leader_logs.await;

    Ok(())
}

#[tokio::test]
async fn serve_fails_when_address_is_taken() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("replicated_cache");
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?.to_string();

    let status = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .args(["serve", "--listen", &addr])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("serve did not exit")??;
    assert!(!status.success());

    Ok(())
}

async fn spawn_node(
    binary: &Path,
    leader: Option<&str>,
) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve").arg("--listen").arg("127.0.0.1:0");
    if let Some(leader) = leader {
        cmd.arg("--leader").arg(leader).arg("--reconnect-delay-ms").arg("50");
    }
    cmd.env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn node")?;
    let stdout = child
        .stdout
        .take()
        .context("node stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out waiting for listen banner")??;
    if bytes == 0 {
        return Err(anyhow!("node exited before printing its address"));
    }

    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("banner missing socket: {}", line.trim()));
    }
    Ok(addr.to_string())
}

async fn run_client(binary: &Path, args: &[&str]) -> Result<String> {
    let output = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .args(args)
            .env("RUST_LOG", "warn")
            .output(),
    )
    .await
    .context("client command timed out")??;

    if !output.status.success() {
        return Err(anyhow!(
            "client {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            buffer.clear();
            has_data
        })
        .unwrap_or(false)
    {}
}
