//! WebSocket media room
//!
//! Binary messages carry media, `[kind: u8][captured_at_ms: u64 LE][payload]`
//! with kind 1 for PCM16 mono audio at 48 kHz and kind 2 for a JPEG frame.
//! Audio goes back out as binary PCM16 frames; control and state markers are
//! text messages.

use super::model::{outbound_channel, ModelCaller, Outbound, Outputs, StateMarker};
use super::queue::DropOldestQueue;
use super::state::shared_state;
use super::stream::{ingest_audio, run_output, AudioFrame, TurnLoop};
use super::{Session, SessionContext};
use crate::audio::{i16_to_f32, pcm16_from_le_bytes, pcm16_to_le_bytes};
use crate::pool::ServiceStatus;
use crate::{ParleyError, Result};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub const KIND_AUDIO: u8 = 1;
pub const KIND_IMAGE: u8 = 2;
const HEADER_LEN: usize = 9;

#[derive(Clone, Debug, PartialEq)]
pub enum MediaFrame {
    Audio { captured_at_ms: u64, samples: Vec<i16> },
    Image { captured_at_ms: u64, jpeg: Vec<u8> },
}

pub fn parse_media(bytes: &[u8]) -> Result<MediaFrame> {
    if bytes.len() < HEADER_LEN {
        return Err(ParleyError::ProtocolError(format!(
            "media message too short: {} bytes",
            bytes.len()
        )));
    }
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&bytes[1..HEADER_LEN]);
    let captured_at_ms = u64::from_le_bytes(stamp);
    let payload = &bytes[HEADER_LEN..];

    match bytes[0] {
        KIND_AUDIO => Ok(MediaFrame::Audio {
            captured_at_ms,
            samples: pcm16_from_le_bytes(payload),
        }),
        KIND_IMAGE => Ok(MediaFrame::Image {
            captured_at_ms,
            jpeg: payload.to_vec(),
        }),
        other => Err(ParleyError::ProtocolError(format!("unknown media kind {}", other))),
    }
}

pub fn encode_media(frame: &MediaFrame) -> Vec<u8> {
    let (kind, at, payload) = match frame {
        MediaFrame::Audio { captured_at_ms, samples } => (KIND_AUDIO, *captured_at_ms, pcm16_to_le_bytes(samples)),
        MediaFrame::Image { captured_at_ms, jpeg } => (KIND_IMAGE, *captured_at_ms, jpeg.clone()),
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(kind);
    bytes.extend_from_slice(&at.to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

/// Text messages from the front end
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    PlayEnd,
    Init,
    Stop,
    Break,
}

#[derive(Deserialize)]
struct InterfaceMessage {
    interface: String,
}

pub fn parse_control(text: &str) -> Option<Control> {
    let text = text.trim();
    if text == "<state><play_end>" {
        return Some(Control::PlayEnd);
    }
    let message: InterfaceMessage = serde_json::from_str(text).ok()?;
    match message.interface.as_str() {
        "init" => Some(Control::Init),
        "stop" => Some(Control::Stop),
        "break" => Some(Control::Break),
        _ => None,
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Drive one attached session until the front end leaves, asks to stop or
/// the backend goes away
pub async fn serve(socket: WebSocket, session: Session, ctx: SessionContext) {
    let span = info_span!("session", session_id = %session.session_id, service_id = %session.service.service_id);
    run_room(socket, session, ctx).instrument(span).await
}

async fn run_room(socket: WebSocket, session: Session, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = outbound_channel(ctx.voice_chat.outbound_frame_queue);

    let writer = tokio::spawn(
        async move {
            while let Some(message) = out_rx.recv().await {
                let result = match message {
                    Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                    Outbound::Audio(samples) => {
                        ws_tx.send(Message::Binary(pcm16_to_le_bytes(&samples).into())).await
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!("websocket send failed: {}", e);
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let cancel = CancellationToken::new();
    let state = shared_state(session.params.high_fps);
    let outputs = Arc::new(Outputs::new(&ctx.voice_chat));
    let input = Arc::new(DropOldestQueue::new(ctx.voice_chat.audio_input_queue));
    let model = Arc::new(ModelCaller::new(
        session.backend.clone(),
        session.params.clone(),
        state.clone(),
        outputs,
        out_tx.clone(),
        Some(session.lease.clone()),
        cancel.clone(),
    ));

    info!(model_type = session.params.model_type.as_str(), "session attached");
    if let Err(e) = model.init().await {
        warn!("model init failed: {}", e);
        model.stop().await;
        let _ = out_tx.send(Outbound::Close);
        let _ = writer.await;
        return;
    }

    let turn_loop = TurnLoop::new(model.clone(), ctx.vad.clone(), ctx.voice_chat.clone(), input.clone());
    tokio::spawn(turn_loop.run(cancel.clone()).in_current_span());
    tokio::spawn(run_output(model.clone(), ctx.voice_chat.clone(), cancel.clone()).in_current_span());
    tokio::spawn(monitor_service(model.clone(), session.clone(), ctx.clone(), cancel.clone()).in_current_span());

    let (image_tx, image_rx) = mpsc::channel::<Vec<u8>>(2);
    tokio::spawn(send_images(model.clone(), image_rx, cancel.clone()).in_current_span());
    let image_interval = ctx.voice_chat.image_interval(session.params.high_fps);
    let mut last_image: Option<Instant> = None;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_rx.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("websocket receive failed: {}", e);
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => match parse_control(text.as_str()) {
                Some(Control::PlayEnd) => {
                    {
                        let mut state = state.lock();
                        state.play_end = true;
                        state.speaking = false;
                    }
                    model.emit(StateMarker::PlayEndSuccess);
                }
                Some(Control::Init) => {
                    state.lock().accepting_audio = true;
                    model.emit(StateMarker::SessionInit);
                }
                Some(Control::Stop) => {
                    model.emit(StateMarker::SessionStop);
                    break;
                }
                Some(Control::Break) => model.break_generation().await,
                None => debug!("ignoring text message: {}", text.as_str()),
            },
            Message::Binary(bytes) => match parse_media(&bytes) {
                Ok(MediaFrame::Audio { captured_at_ms, samples }) => {
                    let frame = AudioFrame {
                        captured_at_ms,
                        samples: i16_to_f32(&samples),
                    };
                    ingest_audio(&state, &input, frame, now_ms());
                }
                Ok(MediaFrame::Image { jpeg, .. }) => {
                    let due = last_image.map(|at| at.elapsed() >= image_interval).unwrap_or(true);
                    if due && image_tx.try_send(jpeg).is_ok() {
                        last_image = Some(Instant::now());
                    }
                }
                Err(e) => debug!("bad media message: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    cancel.cancel();
    model.stop().await;
    let _ = out_tx.send(Outbound::Close);
    let _ = writer.await;
    info!("session closed");
}

async fn send_images(model: Arc<ModelCaller>, mut images: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
    loop {
        let jpeg = tokio::select! {
            _ = cancel.cancelled() => break,
            jpeg = images.recv() => match jpeg {
                Some(jpeg) => jpeg,
                None => break,
            },
        };
        match model.prefill_image(&jpeg).await {
            Ok(true) => {}
            Ok(false) => debug!("image throttled"),
            Err(e) => warn!("image prefill failed: {}", e),
        }
    }
}

/// End the session once the held service disappears or stops being ours
async fn monitor_service(model: Arc<ModelCaller>, session: Session, ctx: SessionContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.voice_chat.resource_check_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let lost = match ctx.manager.get(&session.service.service_id).await {
            Ok(Some(service)) => {
                service.status != ServiceStatus::Busy
                    || service.locked_by.as_deref() != Some(session.user_id.as_str())
            }
            Ok(None) => true,
            Err(e) => {
                warn!("service lookup failed: {}", e);
                false
            }
        };
        if lost {
            warn!("inference service lost, ending session");
            model.emit(StateMarker::RobotExit);
            cancel.cancel();
            break;
        }
    }
}
