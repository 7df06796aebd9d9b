use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::audio::device::AudioInput;
use crate::audio::uplink::{AudioChunkSink, AudioUplink};
use crate::diagnostics::stats::FrameDrop;
use crate::events::{SubscriptionId, Subscribers};
use crate::preview::compress::EncodedFrame;
use crate::realtime::error::{RealtimeError, Result};
use crate::realtime::protocol::{self, ServerEvent, SetupConfig, DEFAULT_ENDPOINT};
use crate::realtime::throttle::{FrameThrottle, DEFAULT_VIDEO_INTERVAL};
use crate::realtime::transport::{Connector, Inbound, Outbound, TransportHandle, NORMAL_CLOSE};

const CLOSE_REASON: &str = "Client closing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Transport is open and `setup` was sent; waiting for `setupComplete`.
    AwaitingSetupAck,
    Active,
    Closing,
    Error(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::AwaitingSetupAck => f.write_str("awaiting setup"),
            Self::Active => f.write_str("active"),
            Self::Closing => f.write_str("closing"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub setup: SetupConfig,
    /// Minimum gap between forwarded video frames.
    pub video_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            setup: SetupConfig::default(),
            video_interval: DEFAULT_VIDEO_INTERVAL,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Rejects empty keys and the placeholders left by unset build config.
pub fn is_valid_credential(api_key: &str) -> bool {
    let key = api_key.trim();
    !(key.is_empty() || key == "\"\"" || key == "null")
}

/// One connection to the live endpoint.
///
/// Single use: after `close()` or a transport failure, create a new session.
/// Video and audio are only forwarded once the server acknowledged `setup`;
/// the acknowledgement also starts the microphone uplink.
pub struct RealtimeSession {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    throttle: Mutex<FrameThrottle>,
    used: AtomicBool,
    /// Whether `true` was reported to connection-status subscribers.
    reported_connected: AtomicBool,
    uplink_requested: AtomicBool,
    uplink: AudioUplink,
    connection_status: Subscribers<bool>,
    responses: Subscribers<String>,
    audio_responses: Subscribers<Bytes>,
    setup_completed: Subscribers<()>,
}

impl RealtimeSession {
    pub fn new(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        audio_input: Arc<dyn AudioInput>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let target = weak.clone() as Weak<dyn AudioChunkSink>;
            Self {
                throttle: Mutex::new(FrameThrottle::new(config.video_interval)),
                config,
                connector,
                state: Mutex::new(SessionState::Disconnected),
                outbound: Mutex::new(None),
                used: AtomicBool::new(false),
                reported_connected: AtomicBool::new(false),
                uplink_requested: AtomicBool::new(false),
                uplink: AudioUplink::new(target, audio_input),
                connection_status: Subscribers::new(),
                responses: Subscribers::new(),
                audio_responses: Subscribers::new(),
                setup_completed: Subscribers::new(),
            }
        })
    }

    /// Open the connection and send `setup`.
    ///
    /// Returns `true` once the transport is open; the session becomes
    /// active later, when the server acknowledges the setup. Never retries.
    pub async fn connect(self: &Arc<Self>) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to connect realtime session: {e}");
                false
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        if !is_valid_credential(&self.config.api_key) {
            return Err(RealtimeError::InvalidCredential);
        }
        if self.used.swap(true, Ordering::AcqRel) {
            return Err(RealtimeError::Closed);
        }

        let params = [("key", self.config.api_key.as_str())];
        let url = match Url::parse_with_params(&self.config.url, params) {
            Ok(url) => url,
            Err(e) => {
                let e = RealtimeError::Connection(format!("invalid endpoint url: {e}"));
                self.fail(e.to_string());
                return Err(e);
            }
        };

        self.set_state(SessionState::Connecting);
        info!("connecting realtime session");

        let timeout = self.config.connect_timeout;
        let opened = tokio::time::timeout(timeout, self.connector.connect(url))
            .await
            .unwrap_or_else(|_| {
                Err(RealtimeError::Connection(format!("timed out after {timeout:?}")))
            });

        let TransportHandle { outbound, inbound } = match opened {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };

        if *self.state.lock() != SessionState::Connecting {
            debug!("realtime session closed while connecting");
            let _ = outbound.send(close_message());
            return Err(RealtimeError::Closed);
        }

        let setup = match protocol::setup_message(&self.config.setup) {
            Ok(setup) => setup,
            Err(e) => {
                let _ = outbound.send(close_message());
                self.fail(e.to_string());
                return Err(e);
            }
        };
        if outbound.send(Outbound::Text(setup)).is_err() {
            self.fail("transport closed before setup".into());
            return Err(RealtimeError::Closed);
        }
        info!("realtime setup sent (model {})", self.config.setup.model);

        *self.outbound.lock() = Some(outbound);
        self.set_state(SessionState::AwaitingSetupAck);
        self.report_connected();

        tokio::spawn(pump_inbound(Arc::downgrade(self), inbound));
        Ok(())
    }

    /// Forward a JPEG frame, subject to the video throttle. Returns `false`
    /// when the frame was dropped.
    pub fn send_video_frame(&self, frame: &EncodedFrame) -> std::result::Result<(), FrameDrop> {
        if !self.is_active() {
            return Err(FrameDrop::Inactive);
        }

        let now = Instant::now();
        let mut throttle = self.throttle.lock();
        if !throttle.would_accept(now) {
            return Err(FrameDrop::Throttled);
        }
        let message = protocol::video_message(frame).map_err(|e| {
            warn!("failed to encode video message: {e}");
            FrameDrop::SendFailed
        })?;
        // Only a queued frame consumes the slot.
        if !self.send(Outbound::Text(message)) {
            return Err(FrameDrop::SendFailed);
        }
        throttle.record(now);
        Ok(())
    }

    /// Forward 16 kHz mono s16le PCM. Dropped unless active.
    pub fn send_audio_chunk(&self, pcm: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        match protocol::audio_message(pcm) {
            Ok(message) => self.send(Outbound::Text(message)),
            Err(e) => {
                warn!("failed to encode audio message: {e}");
                false
            }
        }
    }

    /// Stop the uplink and close the connection. Safe from any state.
    pub fn close(&self) {
        self.uplink.stop();

        let outbound = self.outbound.lock().take();
        let had_transport = outbound.is_some();
        if let Some(outbound) = outbound {
            self.set_state(SessionState::Closing);
            let _ = outbound.send(close_message());
        }

        {
            let mut state = self.state.lock();
            if !matches!(*state, SessionState::Error(_)) {
                *state = SessionState::Disconnected;
            }
        }
        self.used.store(true, Ordering::Release);

        if had_transport {
            info!("realtime session closed");
        }
        self.report_disconnected();
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        *self.state.lock() == SessionState::Active
    }

    /// Start streaming the microphone. Requires an active session.
    pub async fn start_audio_uplink(&self) -> bool {
        self.uplink.start().await
    }

    pub fn stop_audio_uplink(&self) {
        self.uplink.stop();
    }

    pub fn is_audio_uplink_running(&self) -> bool {
        self.uplink.is_running()
    }

    pub fn on_connection_status(
        &self,
        callback: impl Fn(&bool) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.connection_status.subscribe(callback)
    }

    /// Text parts of model turns.
    pub fn on_response(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> SubscriptionId {
        self.responses.subscribe(callback)
    }

    /// Decoded 24 kHz mono s16le PCM from model turns.
    pub fn on_audio_response(
        &self,
        callback: impl Fn(&Bytes) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.audio_responses.subscribe(callback)
    }

    pub fn on_setup_completed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.setup_completed.subscribe(callback)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn send(&self, message: Outbound) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    fn fail(&self, reason: String) {
        self.uplink.stop();
        self.outbound.lock().take();
        self.set_state(SessionState::Error(reason));
        // A failed connect reports `false` even if `true` was never sent.
        self.reported_connected.store(false, Ordering::Release);
        self.connection_status.emit(&false);
    }

    fn report_connected(&self) {
        if !self.reported_connected.swap(true, Ordering::AcqRel) {
            self.connection_status.emit(&true);
        }
    }

    fn report_disconnected(&self) {
        if self.reported_connected.swap(false, Ordering::AcqRel) {
            self.connection_status.emit(&false);
        }
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        let events = match protocol::parse_server_message(text) {
            Ok(events) => events,
            Err(e) => {
                warn!("dropping inbound message: {e}");
                return;
            }
        };
        for event in events {
            match event {
                ServerEvent::SetupComplete => self.handle_setup_complete(),
                ServerEvent::Text(text) => self.responses.emit(&text),
                ServerEvent::Audio(pcm) => self.audio_responses.emit(&pcm),
                ServerEvent::InputTranscription(text) => debug!("input transcription: {text}"),
            }
        }
    }

    fn handle_setup_complete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::AwaitingSetupAck {
                warn!("unexpected setupComplete in state {state}");
                return;
            }
            *state = SessionState::Active;
        }
        info!("realtime setup completed");

        if !self.uplink_requested.swap(true, Ordering::AcqRel) {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let started = session.uplink.start().await;
                info!(
                    "audio uplink {}",
                    if started { "started" } else { "failed to start" }
                );
            });
        }

        self.setup_completed.emit(&());
    }

    /// The connection is gone, cleanly or not. Only a failed `connect`
    /// leaves the session in `Error`.
    fn handle_transport_end(&self) {
        self.uplink.stop();
        self.outbound.lock().take();
        *self.state.lock() = SessionState::Disconnected;
        self.report_disconnected();
    }
}

impl AudioChunkSink for RealtimeSession {
    fn is_active(&self) -> bool {
        RealtimeSession::is_active(self)
    }

    fn send_audio_chunk(&self, pcm: &[u8]) -> bool {
        RealtimeSession::send_audio_chunk(self, pcm)
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.uplink.stop();
        if let Some(outbound) = self.outbound.get_mut().take() {
            let _ = outbound.send(close_message());
        }
    }
}

fn close_message() -> Outbound {
    Outbound::Close {
        code: NORMAL_CLOSE,
        reason: CLOSE_REASON.to_string(),
    }
}

async fn pump_inbound(
    session: Weak<RealtimeSession>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match message {
            Inbound::Text(text) => session.handle_text(&text),
            Inbound::Closed { code, reason } => {
                info!("realtime connection closed by server: {code:?} {reason}");
                session.handle_transport_end();
                return;
            }
            Inbound::Failed(reason) => {
                error!("realtime connection failed: {reason}");
                session.handle_transport_end();
                return;
            }
        }
    }
    if let Some(session) = session.upgrade() {
        session.handle_transport_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::testing::ScriptedInput;
    use crate::realtime::transport::{LoopbackConnector, LoopbackPeer};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    fn config(api_key: &str) -> RealtimeConfig {
        RealtimeConfig {
            url: "wss://live.test/ws".into(),
            api_key: api_key.into(),
            video_interval: Duration::from_millis(333),
            ..Default::default()
        }
    }

    struct Harness {
        session: Arc<RealtimeSession>,
        connector: Arc<LoopbackConnector>,
        peers: mpsc::UnboundedReceiver<LoopbackPeer>,
        input: ScriptedInput,
        statuses: Arc<Mutex<Vec<bool>>>,
    }

    fn harness(api_key: &str) -> Harness {
        let (connector, peers) = LoopbackConnector::pair();
        let input = ScriptedInput::default();
        let session = RealtimeSession::new(
            config(api_key),
            connector.clone(),
            Arc::new(input.clone()),
        );
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&statuses);
        session.on_connection_status(move |up| s.lock().push(*up));
        Harness {
            session,
            connector,
            peers,
            input,
            statuses,
        }
    }

    /// Connect and return the server end, with `setup` already consumed.
    async fn connected(h: &mut Harness) -> LoopbackPeer {
        assert!(h.session.connect().await);
        let mut peer = h.peers.recv().await.unwrap();
        let setup = peer.next_json(WAIT).await.unwrap();
        assert!(setup.get("setup").is_some());
        peer
    }

    async fn activate(h: &mut Harness) -> LoopbackPeer {
        let peer = connected(h).await;
        assert!(peer.complete_setup());
        assert!(wait_until(|| h.session.is_active()).await);
        peer
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn frame() -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            mime_type: "image/jpeg",
        }
    }

    #[tokio::test]
    async fn placeholder_credentials_never_reach_the_transport() {
        for key in ["", "\"\"", "null", "   "] {
            let h = harness(key);
            assert!(!h.session.connect().await, "key {key:?} accepted");
            assert_eq!(h.connector.attempts(), 0);
            assert_eq!(h.session.state(), SessionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn connect_sends_setup_first_and_waits_for_ack() {
        let mut h = harness("secret");
        let peer = connected(&mut h).await;

        assert_eq!(peer.url.query(), Some("key=secret"));
        assert_eq!(h.session.state(), SessionState::AwaitingSetupAck);
        assert!(!h.session.is_active());
        assert_eq!(*h.statuses.lock(), [true]);
    }

    #[tokio::test]
    async fn refused_connection_reports_error() {
        let h = harness("secret");
        h.connector.set_refusing(true);
        assert!(!h.session.connect().await);
        assert!(matches!(h.session.state(), SessionState::Error(_)));
        assert_eq!(*h.statuses.lock(), [false]);
    }

    #[tokio::test]
    async fn a_session_connects_only_once() {
        let mut h = harness("secret");
        let _peer = connected(&mut h).await;
        assert!(!h.session.connect().await);
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn frames_before_setup_ack_are_dropped() {
        let mut h = harness("secret");
        assert_eq!(h.session.send_video_frame(&frame()), Err(FrameDrop::Inactive));

        let mut peer = connected(&mut h).await;
        assert_eq!(h.session.send_video_frame(&frame()), Err(FrameDrop::Inactive));
        assert!(!h.session.send_audio_chunk(&[1, 2]));
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn setup_ack_activates_and_starts_uplink_once() {
        let mut h = harness("secret");
        let completed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completed);
        h.session.on_setup_completed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let peer = activate(&mut h).await;
        peer.complete_setup();

        assert!(wait_until(|| h.session.is_audio_uplink_running()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.input.opens.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        h.session.close();
    }

    #[tokio::test]
    async fn uplink_audio_reaches_the_server() {
        let mut h = harness("secret");
        let mut peer = activate(&mut h).await;

        let mut audio = None;
        for _ in 0..10 {
            match peer.next_json(WAIT).await {
                Some(msg) if msg["realtimeInput"]["audio"].is_object() => {
                    audio = Some(msg);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        let audio = audio.expect("no audio message");
        assert_eq!(
            audio["realtimeInput"]["audio"]["mimeType"],
            "audio/pcm;rate=16000"
        );
        h.session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn video_is_throttled_while_active() {
        let mut h = harness("secret");
        let mut peer = activate(&mut h).await;
        h.session.stop_audio_uplink();
        peer.drain();

        assert!(h.session.send_video_frame(&frame()).is_ok());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(h.session.send_video_frame(&frame()), Err(FrameDrop::Throttled));
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(h.session.send_video_frame(&frame()).is_ok());

        let videos = peer
            .drain()
            .into_iter()
            .filter(|m| matches!(m, Outbound::Text(t) if t.contains("\"video\"")))
            .count();
        assert_eq!(videos, 2);
    }

    #[tokio::test]
    async fn inbound_content_reaches_callbacks() {
        let mut h = harness("secret");
        let texts = Arc::new(Mutex::new(Vec::new()));
        let audio = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&texts);
        let a = Arc::clone(&audio);
        h.session.on_response(move |s| t.lock().push(s.clone()));
        h.session.on_audio_response(move |b| a.lock().push(b.clone()));

        let peer = activate(&mut h).await;
        peer.send_text("garbage");
        peer.send_text(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"a cup"},{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAEC"}}]}}}"#,
        );

        assert!(wait_until(|| !audio.lock().is_empty()).await);
        assert_eq!(*texts.lock(), ["a cup".to_string()]);
        assert_eq!(audio.lock()[0].as_ref(), &[0u8, 1, 2]);
        assert!(h.session.is_active(), "bad message must not end the session");
        h.session.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_once() {
        let mut h = harness("secret");
        let mut peer = activate(&mut h).await;

        h.session.close();
        h.session.close();

        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(!h.session.is_audio_uplink_running());
        assert_eq!(*h.statuses.lock(), [true, false]);

        let close = peer
            .drain()
            .into_iter()
            .find(|m| matches!(m, Outbound::Close { .. }));
        assert_eq!(
            close,
            Some(Outbound::Close {
                code: 1000,
                reason: "Client closing".into()
            })
        );
        assert!(!h.session.connect().await);
    }

    #[tokio::test]
    async fn close_before_connect_is_harmless() {
        let h = harness("secret");
        h.session.close();
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.statuses.lock().is_empty());
    }

    #[tokio::test]
    async fn server_close_disconnects_and_stops_uplink() {
        let mut h = harness("secret");
        let peer = activate(&mut h).await;
        assert!(wait_until(|| h.session.is_audio_uplink_running()).await);

        peer.close(1011, "internal error");
        assert!(wait_until(|| h.session.state() == SessionState::Disconnected).await);
        assert!(!h.session.is_audio_uplink_running());
        assert_eq!(*h.statuses.lock(), [true, false]);
    }

    #[tokio::test]
    async fn transport_failure_disconnects() {
        let mut h = harness("secret");
        let peer = activate(&mut h).await;
        assert!(wait_until(|| h.session.is_audio_uplink_running()).await);

        peer.fail("connection reset");
        assert!(wait_until(|| h.session.state() == SessionState::Disconnected).await);
        assert!(!h.session.is_audio_uplink_running());
        assert_eq!(*h.statuses.lock(), [true, false]);
        assert_eq!(h.session.send_video_frame(&frame()), Err(FrameDrop::Inactive));
    }
}
