//! WebSocket sessions driven by an explicit state machine.
//!
//! [`connect`] opens a socket and runs its session loop until the socket is closed.
//! Everything that happens to the socket (open, incoming message, timer, error,
//! close) is delivered to a [`SocketHandler`] from that one loop, in order, so the
//! handler never needs synchronization. The handler acts on the socket through the
//! [`Socket`] it is handed; its commands are applied after the callback returns.
//!
//! ```text
//! Connecting --upgrade--> Open --close()--> Closing --close frame--> Closed
//!                          |                                           ^
//!                          +------ remote close / error / drop --------+
//! ```
//!
//! [`SocketHandler::on_close`] runs exactly once for every socket that was opened,
//! whichever way it ends, including when the session future is dropped because the
//! iteration was interrupted.

use std::{pin::Pin, time::Duration};

use futures::{SinkExt, Stream, StreamExt, stream};
use tokio::{net::TcpStream, time::Instant};
use tokio_stream::{StreamMap, wrappers::IntervalStream};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        error::ProtocolError,
        http::{HeaderName, HeaderValue},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use typed_builder::TypedBuilder;

use crate::{
    aggregator::Recorder,
    error::IterationError,
    metric::{Protocol, RequestOutcome, Tags, names},
};

/// How long to wait for the peer's close frame after sending ours.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Timer = Pin<Box<dyn Stream<Item = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

enum Command {
    Send(Message),
    Interval(TimerId, Duration),
    Timeout(TimerId, Duration),
    ClearTimer(TimerId),
    Close,
}

/// The handler's view of an open socket. Commands are buffered and applied in
/// order once the current callback returns.
pub struct Socket {
    state: SocketState,
    commands: Vec<Command>,
    next_timer: u64,
}

impl Socket {
    fn new() -> Self {
        Self {
            state: SocketState::Connecting,
            commands: Vec::new(),
            next_timer: 0,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn send_text(&mut self, text: impl Into<String>) {
        self.commands.push(Command::Send(Message::Text(text.into())));
    }

    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) {
        self.commands
            .push(Command::Send(Message::Binary(data.into())));
    }

    /// Fire [`SocketHandler::on_timer`] every `period`, first after one period.
    pub fn set_interval(&mut self, period: Duration) -> TimerId {
        let id = self.timer_id();
        self.commands.push(Command::Interval(id, period));
        id
    }

    /// Fire [`SocketHandler::on_timer`] once, after `after`.
    pub fn set_timeout(&mut self, after: Duration) -> TimerId {
        let id = self.timer_id();
        self.commands.push(Command::Timeout(id, after));
        id
    }

    pub fn clear_timer(&mut self, id: TimerId) {
        self.commands.push(Command::ClearTimer(id));
    }

    /// Start the closing handshake. Ignored unless the socket is open.
    pub fn close(&mut self) {
        self.commands.push(Command::Close);
    }

    fn timer_id(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId(self.next_timer)
    }
}

/// Callbacks of one socket. All default to doing nothing.
pub trait SocketHandler: Send {
    fn on_open(&mut self, _socket: &mut Socket) {}

    fn on_message(&mut self, _socket: &mut Socket, _message: Message) {}

    fn on_timer(&mut self, _socket: &mut Socket, _timer: TimerId) {}

    /// An unexpected error. The socket is closed right after.
    fn on_error(&mut self, _socket: &mut Socket, _error: &WsError) {}

    /// Runs exactly once per opened socket. `code` is the close code received from
    /// the peer, if any.
    fn on_close(&mut self, _code: Option<u16>) {}
}

#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct WsParams {
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default)]
    pub tags: Tags,
    #[builder(default)]
    pub insecure_skip_tls_verify: bool,
    #[builder(default, setter(strip_option))]
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WsResponse {
    /// 101 once the upgrade succeeded.
    pub status: u16,
    pub session_duration: Duration,
}

/// Errors that describe a socket that is already closing or closed. They end the
/// session quietly instead of being reported.
pub fn is_expected_close(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
            | WsError::Protocol(ProtocolError::ReceivedAfterClosing)
    )
}

/// Open a socket to `url` and run its session until it closes.
///
/// A failed upgrade is returned as an error without calling any handler method.
pub async fn connect<H: SocketHandler>(
    recorder: &Recorder,
    url: &str,
    params: &WsParams,
    handler: &mut H,
) -> Result<WsResponse, IterationError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| IterationError::Usage(e.to_string()))?;
    for (k, v) in &params.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| IterationError::Usage(format!("header {k:?}: {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| IterationError::Usage(format!("header {k:?}: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    let connector = if params.insecure_skip_tls_verify {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| IterationError::Usage(e.to_string()))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let mut tags = params.tags.clone();
    tags.insert("url".into(), url.to_string());

    let start = Instant::now();
    let connecting = connect_async_tls_with_config(request, None, false, connector);
    let result = match params.connect_timeout {
        Some(after) => match tokio::time::timeout(after, connecting).await {
            Ok(res) => res.map_err(connect_error),
            Err(_) => Err(IterationError::Timeout { after }),
        },
        None => connecting.await.map_err(connect_error),
    };
    let (ws, response) = match result {
        Ok(ok) => ok,
        Err(err) => {
            tracing::warn!(url, error = %err, "WebSocket connect failed");
            recorder.outcome(
                RequestOutcome::failed(Protocol::Ws, start.elapsed(), &err).with_tags(tags),
            );
            return Err(err);
        }
    };
    let status = response.status().as_u16();
    recorder.outcome(
        RequestOutcome::succeeded(Protocol::Ws, status, start.elapsed(), true)
            .with_tags(tags.clone()),
    );

    let mut session = Session {
        handler,
        socket: Socket::new(),
        recorder: recorder.with_tags(tags),
        opened: Instant::now(),
        close_code: None,
        notified: false,
    };
    session.run(ws).await;
    Ok(WsResponse {
        status,
        session_duration: session.opened.elapsed(),
    })
}

fn connect_error(e: WsError) -> IterationError {
    match e {
        WsError::Http(response) => {
            IterationError::Protocol(format!("upgrade rejected with {}", response.status()))
        }
        WsError::Url(e) => IterationError::Usage(e.to_string()),
        e => IterationError::Connection(e.to_string()),
    }
}

/// One opened socket. Dropping it runs the close handler if the loop did not.
struct Session<'h, H: SocketHandler> {
    handler: &'h mut H,
    socket: Socket,
    recorder: Recorder,
    opened: Instant,
    close_code: Option<u16>,
    notified: bool,
}

impl<H: SocketHandler> Session<'_, H> {
    async fn run(&mut self, ws: Ws) {
        let (mut sink, mut frames) = ws.split();
        let mut timers: StreamMap<TimerId, Timer> = StreamMap::new();
        let mut closing_deadline: Option<Instant> = None;

        self.socket.state = SocketState::Open;
        self.handler.on_open(&mut self.socket);
        self.apply(&mut sink, &mut timers, &mut closing_deadline)
            .await;

        while self.socket.state != SocketState::Closed {
            let deadline = closing_deadline.unwrap_or_else(|| Instant::now() + CLOSE_TIMEOUT);
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Close(frame))) => {
                        self.close_code = frame.map(|f| u16::from(f.code));
                        tracing::debug!(code = ?self.close_code, "Peer closed the socket");
                        // answer the handshake; failures mean the peer is already gone
                        let _ = sink.close().await;
                        self.socket.state = SocketState::Closed;
                    }
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        self.recorder.count(names::WS_MSGS_RECEIVED, 1.0);
                        self.handler.on_message(&mut self.socket, message);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => self.fail(&e),
                    None => self.socket.state = SocketState::Closed,
                },
                Some((id, ())) = timers.next(), if !timers.is_empty() => {
                    self.handler.on_timer(&mut self.socket, id);
                }
                _ = tokio::time::sleep_until(deadline), if closing_deadline.is_some() => {
                    tracing::debug!("Peer did not answer the close frame in time");
                    self.socket.state = SocketState::Closed;
                }
            }
            self.apply(&mut sink, &mut timers, &mut closing_deadline)
                .await;
        }
        self.finish();
    }

    /// Apply the commands the handler issued during the last callback.
    async fn apply<S>(
        &mut self,
        sink: &mut S,
        timers: &mut StreamMap<TimerId, Timer>,
        closing_deadline: &mut Option<Instant>,
    ) where
        S: futures::Sink<Message, Error = WsError> + Unpin,
    {
        for command in std::mem::take(&mut self.socket.commands) {
            if self.socket.state != SocketState::Open {
                break;
            }
            match command {
                Command::Send(message) => match sink.send(message).await {
                    Ok(()) => self.recorder.count(names::WS_MSGS_SENT, 1.0),
                    Err(e) => self.fail(&e),
                },
                Command::Interval(id, period) => {
                    let interval = tokio::time::interval_at(Instant::now() + period, period);
                    timers.insert(id, Box::pin(IntervalStream::new(interval).map(|_| ())));
                }
                Command::Timeout(id, after) => {
                    timers.insert(id, Box::pin(stream::once(tokio::time::sleep(after))));
                }
                Command::ClearTimer(id) => {
                    timers.remove(&id);
                }
                Command::Close => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    match sink.send(Message::Close(Some(frame))).await {
                        Ok(()) => {
                            self.socket.state = SocketState::Closing;
                            *closing_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                            timers.clear();
                        }
                        Err(e) => self.fail(&e),
                    }
                }
            }
        }
        // anything issued by on_error while failing is dropped with the socket
        if self.socket.state == SocketState::Closed {
            self.socket.commands.clear();
        }
    }

    /// Report an error and close the socket.
    fn fail(&mut self, error: &WsError) {
        if is_expected_close(error) {
            tracing::debug!(%error, "Socket already closing");
        } else {
            tracing::warn!(%error, "WebSocket error");
            self.recorder.count(names::WS_ERRORS, 1.0);
            self.handler.on_error(&mut self.socket, error);
        }
        self.socket.state = SocketState::Closed;
    }

    fn finish(&mut self) {
        if self.notified {
            return;
        }
        self.notified = true;
        self.socket.state = SocketState::Closed;
        self.recorder
            .trend_duration(names::WS_SESSION_DURATION, self.opened.elapsed());
        self.handler.on_close(self.close_code);
    }
}

impl<H: SocketHandler> Drop for Session<'_, H> {
    fn drop(&mut self) {
        self.finish();
    }
}
