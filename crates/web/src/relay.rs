//! Bidirectional frame pump between the client and upstream legs.
//!
//! Each leg gets one reader task and one writer task. A reader hands frames
//! to the opposite leg's writer over a bounded channel, so frames from one
//! leg reach the other in receipt order without reframing. The first leg to
//! close or fail cancels the session; writers then close their sockets and
//! the pump waits at most the close grace before dropping whatever is left.

use axum::extract::ws::{self, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use vmrelay_common::{Error, Result};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// A relayed WebSocket frame. Ping and pong never appear here; each leg's
/// WebSocket layer answers them itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<(u16, String)>),
}

/// Which side of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Client => write!(f, "client"),
            Leg::Upstream => write!(f, "upstream"),
        }
    }
}

/// Why Relaying ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Closed(Leg),
    Failed(Leg),
    MaxLifetime,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub close_grace: Duration,
    pub max_session: Option<Duration>,
    pub channel_capacity: usize,
}

impl From<&crate::config::RelayConfig> for RelayOptions {
    fn from(cfg: &crate::config::RelayConfig) -> Self {
        Self {
            close_grace: cfg.close_grace(),
            max_session: cfg.max_session(),
            channel_capacity: cfg.channel_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: EndReason,
    pub client_frames: u64,
    pub upstream_frames: u64,
    /// Teardown exceeded the close grace and tasks were aborted
    pub forced: bool,
}

/// Adapt the browser-facing axum socket into a frame sink and stream
pub fn client_leg(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| Error::Transport(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, Error>(to_axum(frame))));
    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(ws::Message::Text(t)) => Some(Ok(Frame::Text(t))),
            Ok(ws::Message::Binary(b)) => Some(Ok(Frame::Binary(b))),
            Ok(ws::Message::Close(c)) => Some(Ok(Frame::Close(c.map(|c| (c.code, c.reason.into_owned()))))),
            Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) => None,
            Err(e) => Some(Err(Error::Transport(e.to_string()))),
        })
    });
    (sink, stream)
}

/// Adapt a tungstenite socket (the hypervisor leg) into a frame sink and stream
pub fn tungstenite_leg<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Sink<Frame, Error = Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame>> + Send + Unpin + 'static,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| Error::Transport(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, Error>(to_tungstenite(frame))));
    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(tungstenite::Message::Text(t)) => Some(Ok(Frame::Text(t))),
            Ok(tungstenite::Message::Binary(b)) => Some(Ok(Frame::Binary(b))),
            Ok(tungstenite::Message::Close(c)) => {
                Some(Ok(Frame::Close(c.map(|c| (u16::from(c.code), c.reason.into_owned())))))
            }
            Ok(_) => None,
            Err(e) => Some(Err(Error::Transport(e.to_string()))),
        })
    });
    (sink, stream)
}

fn to_axum(frame: Frame) -> ws::Message {
    match frame {
        Frame::Text(t) => ws::Message::Text(t),
        Frame::Binary(b) => ws::Message::Binary(b),
        Frame::Close(c) => ws::Message::Close(c.map(|(code, reason)| ws::CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })),
    }
}

fn to_tungstenite(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(t) => tungstenite::Message::Text(t),
        Frame::Binary(b) => tungstenite::Message::Binary(b),
        Frame::Close(c) => tungstenite::Message::Close(c.map(|(code, reason)| {
            tungstenite::protocol::CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason),
            }
        })),
    }
}

enum TaskReport {
    Read(Leg, u64),
    Written,
}

/// Pump frames between the two legs until either side ends
pub async fn pump<CS, CR, US, UR>(client: (CS, CR), upstream: (US, UR), opts: RelayOptions) -> RelayOutcome
where
    CS: Sink<Frame, Error = Error> + Send + Unpin + 'static,
    CR: Stream<Item = Result<Frame>> + Send + Unpin + 'static,
    US: Sink<Frame, Error = Error> + Send + Unpin + 'static,
    UR: Stream<Item = Result<Frame>> + Send + Unpin + 'static,
{
    let cancel = CancellationToken::new();
    let ended: Arc<OnceLock<EndReason>> = Arc::new(OnceLock::new());

    let (to_upstream_tx, to_upstream_rx) = mpsc::channel(opts.channel_capacity);
    let (to_client_tx, to_client_rx) = mpsc::channel(opts.channel_capacity);

    let (client_sink, client_stream) = client;
    let (upstream_sink, upstream_stream) = upstream;

    let mut tasks = JoinSet::new();
    tasks.spawn(read_leg(Leg::Client, client_stream, to_upstream_tx, cancel.clone(), ended.clone()));
    tasks.spawn(read_leg(Leg::Upstream, upstream_stream, to_client_tx, cancel.clone(), ended.clone()));
    tasks.spawn(write_leg(Leg::Upstream, upstream_sink, to_upstream_rx, cancel.clone(), ended.clone()));
    tasks.spawn(write_leg(Leg::Client, client_sink, to_client_rx, cancel.clone(), ended.clone()));

    match opts.max_session {
        Some(limit) => {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    debug!(limit_secs = limit.as_secs(), "session reached its maximum lifetime");
                    let _ = ended.set(EndReason::MaxLifetime);
                    cancel.cancel();
                }
            }
        }
        None => cancel.cancelled().await,
    }

    let mut outcome = RelayOutcome {
        reason: ended.get().copied().unwrap_or(EndReason::MaxLifetime),
        client_frames: 0,
        upstream_frames: 0,
        forced: false,
    };

    let drained = tokio::time::timeout(opts.close_grace, async {
        let mut counts = Vec::new();
        while let Some(report) = tasks.join_next().await {
            if let Ok(TaskReport::Read(leg, n)) = report {
                counts.push((leg, n));
            }
        }
        counts
    })
    .await;

    match drained {
        Ok(counts) => {
            for (leg, n) in counts {
                match leg {
                    Leg::Client => outcome.client_frames = n,
                    Leg::Upstream => outcome.upstream_frames = n,
                }
            }
        }
        Err(_) => {
            warn!(grace_ms = opts.close_grace.as_millis() as u64, "relay leg did not close in time, dropping it");
            tasks.abort_all();
            outcome.forced = true;
        }
    }

    outcome
}

async fn read_leg<R>(
    leg: Leg,
    mut stream: R,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    ended: Arc<OnceLock<EndReason>>,
) -> TaskReport
where
    R: Stream<Item = Result<Frame>> + Unpin,
{
    let mut frames = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Frame::Close(close))) => {
                debug!(%leg, ?close, "leg sent close");
                let _ = ended.set(EndReason::Closed(leg));
                let _ = tx.send(Frame::Close(close)).await;
                break;
            }
            Some(Ok(frame)) => {
                frames += 1;
                trace!(%leg, frames, "frame");
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(%leg, "leg failed: {}", e);
                let _ = ended.set(EndReason::Failed(leg));
                break;
            }
            None => {
                debug!(%leg, "leg ended without close");
                let _ = ended.set(EndReason::Closed(leg));
                break;
            }
        }
    }
    cancel.cancel();
    TaskReport::Read(leg, frames)
}

async fn write_leg<W>(
    leg: Leg,
    mut sink: W,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    ended: Arc<OnceLock<EndReason>>,
) -> TaskReport
where
    W: Sink<Frame, Error = Error> + Unpin,
{
    let mut closed = false;
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = cancel.cancelled() => break,
        };

        match frame {
            Some(Frame::Close(close)) => {
                let _ = sink.send(Frame::Close(close)).await;
                closed = true;
                break;
            }
            Some(frame) => {
                if let Err(e) = sink.send(frame).await {
                    debug!(%leg, "write failed: {}", e);
                    let _ = ended.set(EndReason::Failed(leg));
                    closed = true;
                    cancel.cancel();
                    break;
                }
            }
            None => break,
        }
    }

    if !closed {
        let _ = sink.send(Frame::Close(Some((CLOSE_NORMAL, String::new())))).await;
    }
    let _ = sink.close().await;
    TaskReport::Written
}
