//! # Audio Socket Server
//!
//! TCP listener and per-connection handler for the PBX media protocol. One
//! tokio task owns each accepted connection for the life of its call and
//! drives it through the connection's phases as straight-line code:
//!
//! 1. **Handshake** — the PBX sends one framed session-id packet; the
//!    server resolves it against the registry (unknown id: terminate packet
//!    and close) and binds the connection's outbound sink
//! 2. **Active** — inbound raw PCM flows through the segmenter; each
//!    finished utterance runs the full pipeline (barge-in interrupt,
//!    transcription, response, synthesis, playback) strictly in order
//! 3. **Closing** — the segmenter is flushed so trailing words still get
//!    transcribed, a best-effort farewell plays out
//! 4. **Closed** — playback is cancelled, the sink unbound, the session
//!    deleted
//!
//! Barge-in lives here too: the moment the segmenter flips to speaking
//! while a response is still playing, the playback token is bumped and the
//! caller talks over silence, not over the assistant.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assistant::Collaborators;
use crate::audio::codec::{self, CodecError, PacketKind};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::segmenter::{
    EnergyDetector, SegmenterConfig, SpeechSegment, VoiceSegmenter,
};
use crate::audio::session::{CallSession, SessionRegistry};
use crate::config::{AudioConfig, SpeechConfig, VadConfig};

/// Longest the server waits for the handshake packet before dropping the
/// connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake bytes buffered before the peer is declared broken. The
/// session-id packet is 19 bytes; anything past this is not a handshake.
const HANDSHAKE_MAX_BYTES: usize = 64;

/// How long the Closing phase waits for the farewell to finish playing.
const FAREWELL_MAX_WAIT: Duration = Duration::from_secs(10);

/// Socket read buffer; sized for several audio frames per read.
const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error("no handshake within {:?}", HANDSHAKE_TIMEOUT)]
    TimedOut,

    #[error("expected a session-id packet, got {0:?}")]
    WrongPacket(PacketKind),

    #[error("session-id payload is {0} bytes, expected 16")]
    BadSessionId(usize),

    #[error("handshake exceeded {} bytes without a complete packet", HANDSHAKE_MAX_BYTES)]
    Oversized,

    #[error(transparent)]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to take one utterance from PCM to played-back reply.
pub struct CallPipeline {
    collaborators: Collaborators,
    scheduler: PlaybackScheduler,
    speech: SpeechConfig,
}

impl CallPipeline {
    pub fn new(
        collaborators: Collaborators,
        scheduler: PlaybackScheduler,
        speech: SpeechConfig,
    ) -> Self {
        Self {
            collaborators,
            scheduler,
            speech,
        }
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Synthesize `text` and start playing it on the session. Failures are
    /// logged, never fatal to the call.
    pub async fn speak(&self, session: &Arc<CallSession>, text: &str) {
        let pcm = match self.collaborators.tts.synthesize(text).await {
            Ok(pcm) => pcm,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "synthesis failed");
                return;
            }
        };
        if let Err(e) = self.scheduler.play(Arc::clone(session), pcm) {
            warn!(session_id = %session.session_id, error = %e, "could not start playback");
        }
    }

    /// Run one finished utterance through transcription, response
    /// generation, synthesis, and playback.
    ///
    /// Collaborator failures degrade to the configured fallback line; the
    /// caller hears something rather than dead air. An utterance that
    /// transcribes to nothing (breath, line noise) is dropped silently.
    pub async fn handle_utterance(&self, session: &Arc<CallSession>, segment: SpeechSegment) {
        // The caller spoke: whatever the assistant was saying is stale
        self.scheduler.interrupt(session);

        let transcript = match self
            .collaborators
            .stt
            .transcribe(&segment.pcm, &session.session_id)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "transcription failed");
                self.speak(session, &self.speech.fallback).await;
                return;
            }
        };

        if transcript.trim().is_empty() {
            debug!(session_id = %session.session_id, "empty transcript, skipping");
            return;
        }

        let reply = match self
            .collaborators
            .responder
            .respond(&transcript, session)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "response generation failed");
                self.speech.fallback.clone()
            }
        };

        info!(
            session_id = %session.session_id,
            transcript = %transcript,
            reply = %reply,
            "utterance handled"
        );
        self.speak(session, &reply).await;
    }

    /// Greeting for a freshly connected call, personalized when the
    /// registered metadata carries a caller name.
    fn greeting_for(&self, session: &CallSession) -> String {
        match &session.metadata.caller_name {
            Some(name) if !name.trim().is_empty() => {
                format!("Hi {}, {}", name.trim(), self.speech.greeting)
            }
            _ => self.speech.greeting.clone(),
        }
    }
}

/// The TCP side of the bridge: accepts PBX media connections and spawns a
/// handler task per call.
pub struct AudioSocketServer {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<CallPipeline>,
    audio: AudioConfig,
    vad: VadConfig,
}

impl AudioSocketServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: Arc<CallPipeline>,
        audio: AudioConfig,
        vad: VadConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            audio,
            vad,
        }
    }

    /// Accept loop. Individual connection failures are logged and do not
    /// affect other calls; a failing `accept` is fatal and propagates.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "audio socket listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(%peer, "media connection accepted");
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(%peer, error = %e, "connection handler ended with error");
                }
                debug!(%peer, "media connection closed");
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        // Handshake: one framed session-id packet, then raw media
        let (call_id, leftover) = match read_handshake(&mut stream).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                return Ok(());
            }
        };

        let session_id = call_id.to_string();
        let session = match self.registry.get(&session_id) {
            Some(session) => session,
            None => {
                // No registered call for this id: tell the PBX to hang up
                warn!(%session_id, "no session for media connection, hanging up");
                stream.write_all(&codec::encode_terminate()).await?;
                stream.shutdown().await?;
                return Ok(());
            }
        };
        info!(%session_id, did = %session.metadata.did, "media connection bound to call");

        let (read_half, mut write_half) = stream.into_split();

        // Outbound path: playback frames funnel through this channel onto
        // the socket, serialized by a single writer task
        let (sink_tx, mut sink_rx) = mpsc::channel::<Vec<u8>>(64);
        session.bind_sink(sink_tx);

        let writer_session_id = session_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = sink_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(session_id = %writer_session_id, error = %e, "media write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Give the PBX a beat to settle its media path, then greet
        let greeting = self.pipeline.greeting_for(&session);
        let greet_pipeline = Arc::clone(&self.pipeline);
        let greet_session = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            greet_pipeline.speak(&greet_session, &greeting).await;
        });

        let mut segmenter = VoiceSegmenter::new(
            session_id.clone(),
            SegmenterConfig {
                sample_rate: self.audio.sample_rate,
                frame_duration_ms: self.audio.frame_duration_ms,
                hangover_ms: self.vad.hangover_ms,
            },
            Box::new(EnergyDetector::new(self.vad.energy_threshold)),
        );

        self.run_media_loop(read_half, &session, &mut segmenter, leftover)
            .await;

        // Closing: trailing audio still gets transcribed, but the call is
        // over, so no response is generated for it
        if let Some(tail) = segmenter.flush() {
            match self
                .pipeline
                .collaborators
                .stt
                .transcribe(&tail.pcm, &session_id)
                .await
            {
                Ok(t) if !t.trim().is_empty() => {
                    info!(%session_id, transcript = %t, "final utterance transcribed")
                }
                Ok(_) => {}
                Err(e) => warn!(%session_id, error = %e, "final transcription failed"),
            }
        }

        self.pipeline.scheduler().interrupt(&session);
        self.pipeline.speak(&session, &self.pipeline.speech.farewell).await;
        wait_for_playback_end(&session, FAREWELL_MAX_WAIT).await;

        // Closed: cancel anything still scheduled and drop the call
        self.pipeline.scheduler().interrupt(&session);
        session.clear_sink();
        self.registry.delete(&session_id);
        info!(%session_id, "call closed");

        // Sink handles are gone, so the writer drains and exits
        let _ = writer.await;
        Ok(())
    }

    /// Active phase: raw PCM off the socket, through the segmenter, each
    /// utterance through the pipeline in order. Returns when the peer
    /// closes or the read fails.
    async fn run_media_loop(
        &self,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        session: &Arc<CallSession>,
        segmenter: &mut VoiceSegmenter,
        leftover: Vec<u8>,
    ) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        // Media bytes that arrived in the same reads as the handshake
        if !leftover.is_empty() {
            for segment in segmenter.push_bytes(&leftover) {
                self.pipeline.handle_utterance(session, segment).await;
            }
        }

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(session_id = %session.session_id, "peer closed media stream");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "media read failed");
                    return;
                }
            };

            let segments = segmenter.push_bytes(&buf[..n]);

            // Barge-in: speech onset cancels playback immediately, before
            // the utterance is even finished
            if segmenter.is_speaking() && session.is_playing() {
                debug!(session_id = %session.session_id, "barge-in, interrupting playback");
                self.pipeline.scheduler().interrupt(session);
            }

            for segment in segments {
                self.pipeline.handle_utterance(session, segment).await;
            }
        }
    }
}

/// Read the session-id handshake off the front of the stream.
///
/// Bytes are buffered until one complete packet decodes; `MalformedFrame`
/// just means "keep reading". Returns the call UUID and any media bytes
/// that arrived behind the packet.
async fn read_handshake<R>(reader: &mut R) -> Result<(Uuid, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(HANDSHAKE_MAX_BYTES);
    let mut chunk = [0u8; 256];

    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        let n = tokio::time::timeout_at(deadline, reader.read(&mut chunk))
            .await
            .map_err(|_| HandshakeError::TimedOut)??;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        match codec::decode(&buf) {
            Ok((packet, consumed)) => {
                if packet.kind != PacketKind::SessionId {
                    return Err(HandshakeError::WrongPacket(packet.kind));
                }
                let id = Uuid::from_slice(&packet.payload)
                    .map_err(|_| HandshakeError::BadSessionId(packet.payload.len()))?;
                return Ok((id, buf.split_off(consumed)));
            }
            Err(CodecError::MalformedFrame { .. }) => {
                if buf.len() > HANDSHAKE_MAX_BYTES {
                    return Err(HandshakeError::Oversized);
                }
                // Partial packet, keep reading
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Poll until the session stops playing or `max_wait` passes. Used for the
/// farewell, where cutting playback off early is rude but waiting forever
/// leaks the connection.
async fn wait_for_playback_end(session: &CallSession, max_wait: Duration) {
    let deadline = tokio::time::Instant::now() + max_wait;
    // Let the playback loop claim its token first
    tokio::time::sleep(Duration::from_millis(50)).await;
    while session.is_playing() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
