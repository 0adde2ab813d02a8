use std::{collections::HashSet, fmt, time::Duration};

use anyhow::{Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, watch},
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{Message, protocol::WebSocketConfig},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    history::{HistoryStore, HistoryWindow},
    protocol::{ClientEvent, ServerEvent, decode_server_event, encode},
    record::{MessageId, MessageRecord, Payload, Submission},
    relay::DEFAULT_CAPACITY,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 64;
const OUTGOING_BUFFER: usize = 32;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Records kept by a [`Transcript`]: one full relay snapshot.
pub const TRANSCRIPT_LIMIT: usize = DEFAULT_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Fixed-delay retry with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

enum PumpExit {
    /// The outgoing side hung up; the client is done.
    Finished,
    Lost,
}

/// An owned connection to a relay.
///
/// Observers register through [`Connection::status`] and
/// [`Connection::subscribe`] and unregister by dropping the receiver.
pub struct Connection {
    url: String,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ServerEvent>,
}

impl Connection {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            url: url.into(),
            policy,
            status,
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Connects, relays events in both directions and reconnects when the
    /// link drops. Returns once `outgoing` is closed, or with an error once
    /// the reconnect attempts are used up.
    pub async fn run(&self, mut outgoing: mpsc::Receiver<ClientEvent>) -> Result<()> {
        loop {
            let Some(stream) = self.establish().await else {
                self.status.send_replace(ConnectionStatus::Disconnected);
                bail!(
                    "could not reach {} after {} attempts",
                    self.url,
                    self.policy.max_attempts
                );
            };

            match self.pump(stream, &mut outgoing).await {
                PumpExit::Finished => {
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    return Ok(());
                }
                PumpExit::Lost => {
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    warn!(url = %self.url, "connection lost, reconnecting");
                    sleep(self.policy.delay).await;
                }
            }
        }
    }

    async fn establish(&self) -> Option<WsStream> {
        for attempt in 1..=self.policy.max_attempts {
            self.status.send_replace(ConnectionStatus::Connecting);
            let connecting =
                connect_async_with_config(self.url.as_str(), Some(socket_config()), false);
            match connecting.await {
                Ok((stream, _)) => {
                    info!(url = %self.url, attempt, "connected");
                    self.status.send_replace(ConnectionStatus::Connected);
                    return Some(stream);
                }
                Err(err) => {
                    warn!(url = %self.url, attempt, error = %err, "connect failed");
                    if attempt < self.policy.max_attempts {
                        self.status.send_replace(ConnectionStatus::Disconnected);
                        sleep(self.policy.delay).await;
                    }
                }
            }
        }
        None
    }

    async fn pump(&self, stream: WsStream, outgoing: &mut mpsc::Receiver<ClientEvent>) -> PumpExit {
        let (mut sink, mut source) = stream.split();

        loop {
            select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.publish(&text),
                    Some(Ok(Message::Close(_))) | None => return PumpExit::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket receive failed");
                        return PumpExit::Lost;
                    }
                },
                event = outgoing.recv() => match event {
                    Some(event) => {
                        let text = match encode(&event) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "dropping unencodable event");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(error = %err, "websocket send failed");
                            return PumpExit::Lost;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return PumpExit::Finished;
                    }
                },
            }
        }
    }

    fn publish(&self, text: &str) {
        match decode_server_event(text) {
            Ok(event) => {
                // No observers is fine; events are simply dropped.
                let _ = self.events.send(event);
            }
            Err(err) => warn!(error = %err, "ignoring malformed server frame"),
        }
    }
}

/// Snapshots carry up to a whole relay in one frame, and each image or
/// audio record may itself approach the server's frame limit.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: None,
        max_frame_size: None,
        ..WebSocketConfig::default()
    }
}

/// The most recent records seen, in display order, without duplicates.
///
/// `seen` covers every id of the last snapshot even when the snapshot is
/// longer than `limit`, so a reconnect never replays it.
pub struct Transcript {
    records: Vec<MessageRecord>,
    seen: HashSet<MessageId>,
    limit: usize,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_limit(TRANSCRIPT_LIMIT)
    }
}

impl Transcript {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            seen: HashSet::new(),
            limit: limit.max(1),
        }
    }

    pub fn from_records(records: Vec<MessageRecord>) -> Self {
        let mut transcript = Self::default();
        transcript.reset(records);
        transcript
    }

    /// Replaces the transcript with a snapshot, returning the records not
    /// shown before.
    pub fn replace(&mut self, snapshot: Vec<MessageRecord>) -> Vec<MessageRecord> {
        let fresh = snapshot
            .iter()
            .filter(|record| !self.seen.contains(&record.id))
            .cloned()
            .collect();
        self.reset(snapshot);
        fresh
    }

    /// Adds a record, returning false when it was already shown.
    pub fn push(&mut self, record: MessageRecord) -> bool {
        if !self.seen.insert(record.id.clone()) {
            return false;
        }
        self.records.push(record);

        let excess = self.records.len().saturating_sub(self.limit);
        for evicted in self.records.drain(..excess) {
            self.seen.remove(&evicted.id);
        }
        true
    }

    fn reset(&mut self, records: Vec<MessageRecord>) {
        self.seen = records.iter().map(|record| record.id.clone()).collect();
        let excess = records.len().saturating_sub(self.limit);
        self.records = records;
        self.records.drain(..excess);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let connection = Connection::new(args.server.clone(), args.reconnect_policy());
    let mut events = connection.subscribe();
    let mut status = connection.status();
    let history = args
        .history
        .as_ref()
        .map(|path| HistoryStore::new(path, HistoryWindow::default()));

    let mut transcript = match &history {
        Some(store) => Transcript::from_records(store.load().await),
        None => Transcript::default(),
    };
    for record in transcript.records() {
        write_stdout(&describe(record)).await?;
    }

    let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
    let pump = connection.run(outgoing_rx);
    tokio::pin!(pump);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    write_stdout(&format!("*** connecting to {}", connection.url())).await?;

    loop {
        select! {
            result = &mut pump => {
                write_stdout("*** disconnected").await?;
                return result;
            }
            event = events.recv() => {
                handle_server_event(event, &mut transcript, history.as_ref()).await?;
            }
            changed = status.changed() => {
                if changed.is_ok() {
                    let current = *status.borrow_and_update();
                    render_status(current, connection.url()).await?;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_line(line?, &args.name, &outgoing).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    drop(outgoing);
    match timeout(CLOSE_GRACE, &mut pump).await {
        Ok(Err(err)) => debug!(error = ?err, "connection ended with error while closing"),
        Ok(Ok(())) => {}
        Err(_) => debug!("connection did not close in time"),
    }
    Ok(())
}

async fn handle_server_event(
    event: Result<ServerEvent, broadcast::error::RecvError>,
    transcript: &mut Transcript,
    history: Option<&HistoryStore>,
) -> Result<()> {
    let event = match event {
        Ok(event) => event,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "terminal fell behind the connection");
            return Ok(());
        }
        Err(broadcast::error::RecvError::Closed) => return Ok(()),
    };

    match event {
        ServerEvent::Messages(snapshot) => {
            for record in transcript.replace(snapshot) {
                write_stdout(&describe(&record)).await?;
            }
        }
        ServerEvent::Message(record) => {
            let line = describe(&record);
            if !transcript.push(record) {
                return Ok(());
            }
            write_stdout(&line).await?;
        }
        ServerEvent::Typing(notice) if !notice.sender.is_empty() => {
            write_stdout(&format!("*** {} is typing...", notice.sender)).await?;
            return Ok(());
        }
        ServerEvent::Typing(_) | ServerEvent::StopTyping => return Ok(()),
        ServerEvent::Error(notice) => {
            write_stderr(&format!("!!! {}", notice.message)).await?;
            return Ok(());
        }
    }

    if let Some(store) = history {
        store.save(transcript.records()).await;
    }
    Ok(())
}

async fn handle_stdin_line(
    line: Option<String>,
    name: &str,
    outgoing: &mpsc::Sender<ClientEvent>,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let event = ClientEvent::Message(Submission::text(name, text));
    if outgoing.send(event).await.is_err() {
        return Ok(false);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_status(status: ConnectionStatus, url: &str) -> io::Result<()> {
    match status {
        ConnectionStatus::Connecting => write_stdout(&format!("*** connecting to {url}")).await,
        ConnectionStatus::Connected => write_stdout(&format!("*** connected to {url}")).await,
        ConnectionStatus::Disconnected => {
            write_stdout("*** connection lost, trying to reconnect...").await
        }
    }
}

pub fn describe(record: &MessageRecord) -> String {
    match &record.payload {
        Payload::Text { text } => format!("<{}> {}", record.sender, text),
        Payload::Image { image } => format!("<{}> [image, {} bytes]", record.sender, image.len()),
        Payload::Audio { audio } => format!("<{}> [audio, {} bytes]", record.sender, audio.len()),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
