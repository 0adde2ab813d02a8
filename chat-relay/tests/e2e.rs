use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain request logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let url = format!("ws://{addr}/ws");
    let mut alice = spawn_client(&binary, "alice", &url).await?;
    let mut bob = spawn_client(&binary, "bob", &url).await?;

    // Alice's message is relayed to both participants, Alice included.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    read_until(&mut bob.stdout, "<alice> Hello from Alice").await?;
    read_until(&mut alice.stdout, "<alice> Hello from Alice").await?;

    bob.send_line("Hi Alice!").await.context("bob send line")?;
    read_until(&mut alice.stdout, "<bob> Hi Alice!").await?;
    read_until(&mut bob.stdout, "<bob> Hi Alice!").await?;

    alice.send_line("/quit").await.context("alice send quit")?;
    read_until(&mut alice.stdout, "*** leaving chat").await?;
    ensure_success(&mut alice.child, "alice client").await?;

    // A late joiner is greeted with the history so far.
    let mut carol = spawn_client(&binary, "carol", &url).await?;
    read_until(&mut carol.stdout, "<alice> Hello from Alice").await?;
    read_until(&mut carol.stdout, "<bob> Hi Alice!").await?;

    for (name, client) in [("bob", &mut bob), ("carol", &mut carol)] {
        client.send_line("/quit").await.context("send quit")?;
        read_until(&mut client.stdout, "*** leaving chat").await?;
        ensure_success(&mut client.child, name).await?;
    }

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

#[tokio::test]
async fn client_gives_up_when_no_server_answers() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    // Reserve a port, then free it so nothing is listening there.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };

    let mut child = Command::new(&binary)
        .arg("client")
        .arg("--name")
        .arg("dave")
        .arg("--server")
        .arg(format!("ws://{addr}/ws"))
        .arg("--reconnect-attempts")
        .arg("2")
        .arg("--reconnect-delay-ms")
        .arg("50")
        .env("RUST_LOG", "error")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn client")?;

    let stdout = child.stdout.take().context("client stdout missing")?;
    let mut stdout = BufReader::new(stdout);
    read_until(&mut stdout, "*** disconnected").await?;

    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("client did not exit"))??;
    assert!(!status.success(), "client should fail when the relay is unreachable");
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_until_match(reader, |line| line.contains("listening on")).await?;
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {line}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, name: &str, url: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(url)
        .env("RUST_LOG", "error")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    read_until(&mut process.stdout, &format!("*** connected to {url}")).await?;
    Ok(process)
}

/// Skips status lines until `expected` shows up.
async fn read_until(reader: &mut BufReader<ChildStdout>, expected: &str) -> Result<String> {
    read_until_match(reader, |line| line == expected)
        .await
        .with_context(|| format!("waiting for '{expected}'"))
}

async fn read_until_match(
    reader: &mut BufReader<ChildStdout>,
    matches: impl Fn(&str) -> bool,
) -> Result<String> {
    timeout(READ_TIMEOUT, skip_until(reader, matches))
        .await
        .map_err(|_| anyhow!("timed out waiting for line"))?
}

async fn skip_until(
    reader: &mut BufReader<ChildStdout>,
    matches: impl Fn(&str) -> bool,
) -> Result<String> {
    loop {
        match read_line(reader).await? {
            Some(line) if matches(&line) => return Ok(line),
            Some(_) => continue,
            None => return Err(anyhow!("stream closed")),
        }
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let byte_count = reader.read_line(&mut line).await?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
