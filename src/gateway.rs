//! # WebSocket Voice Gateway
//!
//! One actor per WebSocket connection, one voice session per actor. Clients
//! connect to `/ws/voice`, send typed JSON control frames and binary PCM
//! audio, and receive typed JSON frames back (plus binary frames carrying
//! synthesized audio).
//!
//! ## Protocol:
//! 1. **Connection**: the gateway creates a session (capacity permitting)
//!    and announces it with a `session-ready` frame
//! 2. **Audio streaming**: binary frames are buffered into windows and
//!    dispatched to transcription; results come back as `transcription`
//!    frames, always in window order even though windows transcribe
//!    concurrently
//! 3. **Control**: `configure`, `flush`, `reset`, `get-status` adjust the
//!    session; `speak` requests synthesized audio
//! 4. **Errors**: every error frame carries a stable kind and a retryable
//!    flag, and affects this session only

use crate::error::GatewayError;
use crate::session::{
    DispatchedWindow, IngestOutcome, ResultSequencer, SessionConfig, SessionStatus, SharedSession,
};
use crate::state::AppState;
use crate::synthesis::{SynthesisEvent, VoiceOptions};
use crate::transcription::TranscriptionResult;
use crate::audio::{SampleFormat, WindowPolicy};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the server pings an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long without any client traffic before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control frames from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    /// Adjust the session's audio format and window policy. Omitted fields
    /// keep their current values. Buffered audio in the old format is
    /// flushed before the change applies.
    Configure {
        sample_rate: Option<u32>,
        channels: Option<u8>,
        bit_depth: Option<u8>,
        min_window_ms: Option<u32>,
        max_window_ms: Option<u32>,
        hard_max_ms: Option<u32>,
        language: Option<String>,
    },

    /// Force out whatever is buffered, even below the minimum window.
    Flush,

    /// Discard buffered audio that has not yet formed a window.
    Reset,

    /// Request a status-update frame.
    GetStatus,

    /// Synthesize speech; audio arrives as binary frames.
    Speak {
        text: String,
        voice: Option<String>,
        speed: Option<f32>,
    },
}

/// Frames from the gateway to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    /// Session created and ready for audio.
    SessionReady {
        session_id: String,
        sample_rate: u32,
        channels: u8,
        bit_depth: u8,
        min_window_ms: u32,
        max_window_ms: u32,
        hard_max_ms: u32,
    },

    /// A window was dispatched to transcription. `buffered_ms` is the audio
    /// carried by that window.
    Processing {
        session_id: String,
        window_seq: u64,
        buffered_ms: u32,
    },

    /// Transcription result for one window. Delivered in window order.
    Transcription {
        session_id: String,
        window_seq: u64,
        text: String,
        is_final: bool,
        confidence: Option<f32>,
        language_detected: Option<String>,
        duration_ms: u32,
    },

    /// The configure frame was applied.
    ConfigUpdated {
        session_id: String,
        sample_rate: u32,
        channels: u8,
        bit_depth: u8,
        min_window_ms: u32,
        max_window_ms: u32,
        hard_max_ms: u32,
        language: Option<String>,
    },

    /// Answer to get-status.
    StatusUpdate { status: SessionStatus },

    /// A synthesis request finished streaming.
    SynthesisComplete { session_id: String, provider: String },

    /// Anything that went wrong on this session's channel.
    Error {
        session_id: Option<String>,
        kind: String,
        message: String,
        retryable: bool,
        /// Present when the error concerns one dispatched window
        window_seq: Option<u64>,
    },
}

/// Result of one window's trip through the transcription backend, held by
/// the sequencer until every earlier window has been delivered.
struct WindowOutcome {
    duration_ms: u32,
    result: Result<TranscriptionResult, GatewayError>,
}

/// WebSocket actor for one voice connection.
pub struct VoiceWebSocket {
    state: AppState,
    session: Option<SharedSession>,
    session_id: Option<String>,
    sequencer: ResultSequencer<WindowOutcome>,
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            session: None,
            session_id: None,
            sequencer: ResultSequencer::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send_frame(&self, ctx: &mut ws::WebsocketContext<Self>, frame: &OutboundFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize outbound frame"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &GatewayError) {
        warn!(
            session_id = ?self.session_id,
            kind = err.kind(),
            "Session error: {}",
            err
        );
        let frame = OutboundFrame::Error {
            session_id: self.session_id.clone(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            window_seq: None,
        };
        self.send_frame(ctx, &frame);
    }

    /// Announce a dispatched window and hand it to the transcription backend
    /// on a spawned task. The task races the call against the session's
    /// close signal so a closed session never leaves work running.
    fn dispatch_window(&mut self, dispatched: DispatchedWindow, ctx: &mut ws::WebsocketContext<Self>) {
        let session = match &self.session {
            Some(s) => s,
            None => return,
        };
        let session_id = dispatched.window.session_id.clone();
        let window_seq = dispatched.window_seq;
        let duration_ms = dispatched.window.duration_ms;

        self.state.record_window_dispatched();
        self.send_frame(
            ctx,
            &OutboundFrame::Processing {
                session_id,
                window_seq,
                buffered_ms: duration_ms,
            },
        );

        let transcriber = self.state.transcriber.clone();
        let (mut closed, language) = {
            let s = session.read().unwrap();
            (s.closed_signal(), s.config().language.clone())
        };
        let window = dispatched.window;
        let addr = ctx.address();

        tokio::spawn(async move {
            tokio::select! {
                _ = closed.changed() => {
                    debug!(window_seq, "Window dropped: session closed mid-flight");
                }
                result = transcriber.transcribe(&window, language.as_deref()) => {
                    addr.do_send(WindowComplete {
                        window_seq,
                        duration_ms,
                        result: result.map_err(GatewayError::from),
                    });
                }
            }
        });
    }

    /// Run a speak request against the synthesis chain, forwarding events
    /// back into the actor as they arrive. The forwarding task races the
    /// event stream against the session's close signal, same as window
    /// dispatch; dropping the stream tells the router the receiver is gone.
    fn handle_speak(
        &mut self,
        text: String,
        voice: Option<String>,
        speed: Option<f32>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let (session_id, closed) = match (&self.session_id, &self.session) {
            (Some(id), Some(session)) => (id.clone(), session.read().unwrap().closed_signal()),
            _ => return,
        };
        if text.trim().is_empty() {
            self.send_error(
                ctx,
                &GatewayError::InvalidFrame("speak frame with empty text".to_string()),
            );
            return;
        }

        self.state.record_synthesis_request();
        let synthesizer = self.state.synthesizer.clone();
        let options = VoiceOptions { voice, speed };
        let addr = ctx.address();

        tokio::spawn(async move {
            let events = match synthesizer.synthesize(text, options).await {
                Ok(stream) => stream,
                Err(err) => {
                    addr.do_send(SynthesisUpdate::Failed(err));
                    return;
                }
            };

            drain_until_closed(events, closed, move |event| {
                let update = match event {
                    SynthesisEvent::Audio(chunk) => SynthesisUpdate::Audio(chunk),
                    SynthesisEvent::PartialStreamAborted { provider } => {
                        SynthesisUpdate::Failed(GatewayError::PartialStreamAborted { provider })
                    }
                    SynthesisEvent::Completed { provider } => SynthesisUpdate::Completed {
                        session_id: session_id.clone(),
                        provider,
                    },
                    SynthesisEvent::Failed(err) => SynthesisUpdate::Failed(err),
                };
                addr.do_send(update);
            })
            .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_configure(
        &mut self,
        sample_rate: Option<u32>,
        channels: Option<u8>,
        bit_depth: Option<u8>,
        min_window_ms: Option<u32>,
        max_window_ms: Option<u32>,
        hard_max_ms: Option<u32>,
        language: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let session = match &self.session {
            Some(s) => s.clone(),
            None => return,
        };

        let current = session.read().unwrap().config().clone();
        let new_config = SessionConfig {
            format: SampleFormat::new(
                sample_rate.unwrap_or(current.format.sample_rate),
                channels.unwrap_or(current.format.channels),
                bit_depth.unwrap_or(current.format.bit_depth),
            ),
            policy: WindowPolicy {
                min_window_ms: min_window_ms.unwrap_or(current.policy.min_window_ms),
                max_window_ms: max_window_ms.unwrap_or(current.policy.max_window_ms),
                hard_max_ms: hard_max_ms.unwrap_or(current.policy.hard_max_ms),
            },
            language: language.or(current.language),
        };

        let flushed = match session.write().unwrap().reconfigure(new_config.clone()) {
            Ok(flushed) => flushed,
            Err(err) => {
                self.send_error(ctx, &err);
                return;
            }
        };

        // Audio buffered under the old format goes out before the new
        // format takes effect.
        if let Some(window) = flushed {
            self.dispatch_window(window, ctx);
        }

        let frame = OutboundFrame::ConfigUpdated {
            session_id: self.session_id.clone().unwrap_or_default(),
            sample_rate: new_config.format.sample_rate,
            channels: new_config.format.channels,
            bit_depth: new_config.format.bit_depth,
            min_window_ms: new_config.policy.min_window_ms,
            max_window_ms: new_config.policy.max_window_ms,
            hard_max_ms: new_config.policy.hard_max_ms,
            language: new_config.language,
        };
        self.send_frame(ctx, &frame);
    }

    fn handle_audio(&mut self, payload: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let session = match &self.session {
            Some(s) => s.clone(),
            None => return,
        };

        let outcome = session.write().unwrap().ingest(payload);
        match outcome {
            Ok(IngestOutcome::Buffered) => {}
            Ok(IngestOutcome::Window(dispatched)) => self.dispatch_window(dispatched, ctx),
            Ok(IngestOutcome::Overflow {
                dispatched,
                buffered_ms,
            }) => {
                // The oversized window is still transcribed; the client just
                // learns it blew past the ceiling.
                self.send_error(ctx, &GatewayError::BufferOverflow { buffered_ms });
                self.dispatch_window(dispatched, ctx);
            }
            Err(err) => self.send_error(ctx, &err),
        }
    }
}

/// Forward synthesis events until the stream ends or the session's close
/// signal fires. A closed session stops the drain immediately rather than
/// waiting out the provider's stream.
async fn drain_until_closed<S>(
    mut events: S,
    mut closed: watch::Receiver<bool>,
    mut deliver: impl FnMut(SynthesisEvent),
) where
    S: futures_util::Stream<Item = SynthesisEvent> + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.changed() => {
                debug!("Synthesis forwarding stopped: session closed");
                return;
            }
            event = events.next() => {
                match event {
                    Some(event) => deliver(event),
                    None => return,
                }
            }
        }
    }
}

/// Outcome of one window's transcription, delivered back to the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct WindowComplete {
    window_seq: u64,
    duration_ms: u32,
    result: Result<TranscriptionResult, GatewayError>,
}

/// Progress of a speak request.
#[derive(Message)]
#[rtype(result = "()")]
enum SynthesisUpdate {
    Audio(Bytes),
    Completed { session_id: String, provider: String },
    Failed(GatewayError),
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        // Heartbeat: ping on an interval, drop unresponsive clients.
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = ?act.session_id, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        // Capacity is enforced before any session state exists.
        let config = SessionConfig::from_app(&self.state.config.audio);
        match self.state.registry.create(config) {
            Ok(session) => {
                let (id, frame) = {
                    let mut s = session.write().unwrap();
                    s.mark_ready();
                    let config = s.config();
                    (
                        s.id.clone(),
                        OutboundFrame::SessionReady {
                            session_id: s.id.clone(),
                            sample_rate: config.format.sample_rate,
                            channels: config.format.channels,
                            bit_depth: config.format.bit_depth,
                            min_window_ms: config.policy.min_window_ms,
                            max_window_ms: config.policy.max_window_ms,
                            hard_max_ms: config.policy.hard_max_ms,
                        },
                    )
                };
                self.session = Some(session);
                self.session_id = Some(id);
                self.send_frame(ctx, &frame);
            }
            Err(err) => {
                self.send_error(ctx, &err);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(err.to_string()),
                }));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = ?self.session_id, "WebSocket connection stopped");
        if let Some(id) = &self.session_id {
            // Ignore not-found: an admin may already have terminated it.
            let _ = self.state.registry.terminate(id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(InboundFrame::Configure {
                        sample_rate,
                        channels,
                        bit_depth,
                        min_window_ms,
                        max_window_ms,
                        hard_max_ms,
                        language,
                    }) => self.handle_configure(
                        sample_rate,
                        channels,
                        bit_depth,
                        min_window_ms,
                        max_window_ms,
                        hard_max_ms,
                        language,
                        ctx,
                    ),
                    Ok(InboundFrame::Flush) => {
                        let flushed = self
                            .session
                            .as_ref()
                            .and_then(|s| s.write().unwrap().flush());
                        if let Some(window) = flushed {
                            self.dispatch_window(window, ctx);
                        }
                    }
                    Ok(InboundFrame::Reset) => {
                        if let Some(session) = &self.session {
                            session.write().unwrap().reset();
                        }
                    }
                    Ok(InboundFrame::GetStatus) => {
                        if let Some(session) = &self.session {
                            let status = session.read().unwrap().status();
                            self.send_frame(ctx, &OutboundFrame::StatusUpdate { status });
                        }
                    }
                    Ok(InboundFrame::Speak { text, voice, speed }) => {
                        self.handle_speak(text, voice, speed, ctx)
                    }
                    Err(err) => {
                        self.send_error(ctx, &GatewayError::from(err));
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = ?self.session_id, "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<WindowComplete> for VoiceWebSocket {
    type Result = ();

    /// Completions can arrive in any order; the sequencer holds each one
    /// until every earlier window has been delivered, so the client always
    /// observes results in window order.
    fn handle(&mut self, msg: WindowComplete, ctx: &mut Self::Context) {
        if let Some(session) = &self.session {
            let mut s = session.write().unwrap();
            s.complete_window();
            match &msg.result {
                Ok(_) => {}
                Err(_) => s.mark_error(),
            }
        }

        match &msg.result {
            Ok(_) => self.state.record_window_transcribed(),
            Err(_) => self.state.record_transcription_failure(),
        }

        let outcome = WindowOutcome {
            duration_ms: msg.duration_ms,
            result: msg.result,
        };

        let session_id = self.session_id.clone().unwrap_or_default();
        for (window_seq, outcome) in self.sequencer.complete(msg.window_seq, outcome) {
            let frame = match outcome.result {
                Ok(result) => OutboundFrame::Transcription {
                    session_id: session_id.clone(),
                    window_seq,
                    text: result.text,
                    is_final: result.is_final,
                    confidence: result.confidence,
                    language_detected: result.language_detected,
                    duration_ms: outcome.duration_ms,
                },
                Err(err) => OutboundFrame::Error {
                    session_id: Some(session_id.clone()),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                    retryable: err.retryable(),
                    window_seq: Some(window_seq),
                },
            };
            self.send_frame(ctx, &frame);
        }
    }
}

impl Handler<SynthesisUpdate> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SynthesisUpdate, ctx: &mut Self::Context) {
        match msg {
            SynthesisUpdate::Audio(chunk) => ctx.binary(chunk),
            SynthesisUpdate::Completed {
                session_id,
                provider,
            } => {
                self.send_frame(
                    ctx,
                    &OutboundFrame::SynthesisComplete {
                        session_id,
                        provider,
                    },
                );
            }
            SynthesisUpdate::Failed(err) => self.send_error(ctx, &err),
        }
    }
}

/// HTTP → WebSocket upgrade for `/ws/voice`.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(VoiceWebSocket::new(app_state.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_frames_use_kebab_types_and_camel_fields() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type": "configure", "sampleRate": 8000, "minWindowMs": 500}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Configure {
                sample_rate,
                min_window_ms,
                max_window_ms,
                ..
            } => {
                assert_eq!(sample_rate, Some(8000));
                assert_eq!(min_window_ms, Some(500));
                assert_eq!(max_window_ms, None);
            }
            other => panic!("wrong frame: {:?}", other),
        }

        assert!(matches!(
            serde_json::from_str::<InboundFrame>(r#"{"type": "flush"}"#).unwrap(),
            InboundFrame::Flush
        ));
        assert!(matches!(
            serde_json::from_str::<InboundFrame>(r#"{"type": "get-status"}"#).unwrap(),
            InboundFrame::GetStatus
        ));
    }

    #[test]
    fn test_speak_frame_parses_voice_options() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type": "speak", "text": "hello there", "voice": "nova", "speed": 1.2}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Speak { text, voice, speed } => {
                assert_eq!(text, "hello there");
                assert_eq!(voice.as_deref(), Some("nova"));
                assert_eq!(speed, Some(1.2));
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_type_is_invalid() {
        let result = serde_json::from_str::<InboundFrame>(r#"{"type": "warp-speed"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_outbound_frames_serialize_with_stable_wire_shape() {
        let frame = OutboundFrame::Transcription {
            session_id: "s1".to_string(),
            window_seq: 3,
            text: "hello".to_string(),
            is_final: true,
            confidence: Some(0.92),
            language_detected: Some("en".to_string()),
            duration_ms: 1200,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["windowSeq"], 3);
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["durationMs"], 1200);

        let processing = OutboundFrame::Processing {
            session_id: "s1".to_string(),
            window_seq: 3,
            buffered_ms: 1200,
        };
        let json = serde_json::to_value(&processing).unwrap();
        assert_eq!(json["type"], "processing");
        assert_eq!(json["bufferedMs"], 1200);

        let error = OutboundFrame::Error {
            session_id: Some("s1".to_string()),
            kind: "buffer_overflow".to_string(),
            message: "too much".to_string(),
            retryable: false,
            window_seq: None,
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "buffer_overflow");
        assert_eq!(json["retryable"], false);
    }

    #[tokio::test]
    async fn test_synthesis_forwarding_stops_when_session_closes() {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(4);
        let (closed_tx, closed_rx) = watch::channel(false);

        event_tx
            .send(SynthesisEvent::Audio(Bytes::from("a")))
            .await
            .unwrap();
        closed_tx.send(true).unwrap();

        // The sender stays alive, so the stream never ends on its own; only
        // the close signal can stop the drain.
        let events = tokio_stream::wrappers::ReceiverStream::new(event_rx);
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            drain_until_closed(events, closed_rx, |_| {}),
        )
        .await;

        assert!(result.is_ok(), "drain must stop once the session closes");
        drop(event_tx);
    }
}
