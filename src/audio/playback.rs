//! # Frame-Paced Playback
//!
//! Streams synthesized PCM to a call at the telephony cadence: one frame
//! every 20 ms (configurable), sized for the deployment audio format. The
//! caller hears audio in real time instead of receiving the whole clip at
//! once, and barge-in can cut a response off mid-word.
//!
//! ## Cancellation:
//! Every `play` claims the session's playback generation token and spawns
//! one frame loop; the loop re-checks its token at the top of **every**
//! frame iteration, so after an `interrupt` (or a newer `play`) at most one
//! already-ticked frame escapes. Starting a new playback implicitly cancels
//! the previous one, which keeps responses strictly serialized per call.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::audio::codec;
use crate::audio::session::CallSession;

#[derive(Debug, Error)]
pub enum PlaybackError {
    /// No audio connection is bound to the session, so there is nowhere to
    /// send frames.
    #[error("session {0} has no bound audio sink")]
    NoSink(String),

    /// The session's TTL ran out before playback could start.
    #[error("session {0} is expired")]
    SessionExpired(String),
}

/// Paces outbound audio for every call; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    frame_size: usize,
    frame_duration: Duration,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self {
            frame_size: codec::frame_size(sample_rate, frame_duration_ms),
            frame_duration: Duration::from_millis(frame_duration_ms as u64),
        }
    }

    /// Start playing `pcm` on the session, cancelling anything already
    /// playing there. Returns as soon as the frame loop is spawned; the
    /// audio itself drains over the following `pcm.len() / frame_size`
    /// ticks.
    pub fn play(&self, session: Arc<CallSession>, pcm: Vec<u8>) -> Result<(), PlaybackError> {
        if session.is_expired() {
            return Err(PlaybackError::SessionExpired(session.session_id.clone()));
        }
        let sink = session
            .sink()
            .ok_or_else(|| PlaybackError::NoSink(session.session_id.clone()))?;
        let token = session
            .begin_playback()
            .ok_or_else(|| PlaybackError::NoSink(session.session_id.clone()))?;

        let frame_size = self.frame_size;
        let frame_duration = self.frame_duration;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_duration);
            // Skip missed ticks rather than bursting frames at the PBX
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut sent = 0usize;
            for frame in pcm.chunks(frame_size) {
                interval.tick().await;

                // Token check at the top of every iteration: an interrupt
                // or a newer play orphans this loop between frames
                if !session.playback_token_current(token) {
                    debug!(
                        session_id = %session.session_id,
                        frames_sent = sent,
                        "playback cancelled"
                    );
                    session.end_playback(token);
                    return;
                }
                if session.is_expired() {
                    debug!(session_id = %session.session_id, "session expired mid-playback");
                    break;
                }
                if sink.send(frame.to_vec()).await.is_err() {
                    // Connection went away; the handler cleans the rest up
                    break;
                }
                sent += 1;
            }

            trace!(
                session_id = %session.session_id,
                frames_sent = sent,
                "playback finished"
            );
            session.end_playback(token);
        });

        Ok(())
    }

    /// Stop whatever the session is playing. Safe to call when nothing is
    /// playing.
    pub fn interrupt(&self, session: &CallSession) {
        session.interrupt_playback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::{CallMetadata, SessionRegistry};
    use tokio::sync::mpsc;
    use tokio::time::{advance, timeout};

    const FRAME: usize = 320; // 8 kHz, 16-bit, 20 ms

    fn session_with_sink(
        registry: &SessionRegistry,
    ) -> (Arc<CallSession>, mpsc::Receiver<Vec<u8>>) {
        let session = registry.create(
            CallMetadata {
                session_id: "call-1".to_string(),
                did: "18005550100".to_string(),
                caller_id: None,
                caller_phone: None,
                caller_name: None,
            },
            Duration::from_secs(60),
        );
        let (tx, rx) = mpsc::channel(64);
        session.bind_sink(tx);
        (session, rx)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Vec<u8>>) -> Option<Vec<u8>> {
        timeout(Duration::from_millis(5), rx.recv()).await.ok()?
    }

    #[tokio::test(start_paused = true)]
    async fn test_clip_drains_as_paced_frames() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = session_with_sink(&registry);
        let scheduler = PlaybackScheduler::new(8000, 20);

        scheduler.play(Arc::clone(&session), vec![0x7f; FRAME * 10]).unwrap();
        assert!(session.is_playing());

        for _ in 0..10 {
            advance(Duration::from_millis(20)).await;
            let frame = recv_frame(&mut rx).await.expect("frame due this tick");
            assert_eq!(frame.len(), FRAME);
        }

        advance(Duration::from_millis(40)).await;
        assert!(recv_frame(&mut rx).await.is_none());
        assert!(!session.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_tail_frame_is_sent() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = session_with_sink(&registry);
        let scheduler = PlaybackScheduler::new(8000, 20);

        scheduler
            .play(Arc::clone(&session), vec![0x01; FRAME + 100])
            .unwrap();

        advance(Duration::from_millis(20)).await;
        assert_eq!(recv_frame(&mut rx).await.unwrap().len(), FRAME);
        advance(Duration::from_millis(20)).await;
        assert_eq!(recv_frame(&mut rx).await.unwrap().len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_stops_mid_clip() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = session_with_sink(&registry);
        let scheduler = PlaybackScheduler::new(8000, 20);

        scheduler
            .play(Arc::clone(&session), vec![0x7f; FRAME * 50])
            .unwrap();

        for _ in 0..3 {
            advance(Duration::from_millis(20)).await;
            assert!(recv_frame(&mut rx).await.is_some());
        }

        scheduler.interrupt(&session);
        assert!(!session.is_playing());

        // A frame that ticked before the interrupt may already sit in the
        // channel; nothing new may arrive after it
        while recv_frame(&mut rx).await.is_some() {}
        advance(Duration::from_millis(200)).await;
        assert!(recv_frame(&mut rx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_play_cancels_previous() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = session_with_sink(&registry);
        let scheduler = PlaybackScheduler::new(8000, 20);

        scheduler
            .play(Arc::clone(&session), vec![0x11; FRAME * 50])
            .unwrap();
        advance(Duration::from_millis(20)).await;
        assert_eq!(recv_frame(&mut rx).await.unwrap()[0], 0x11);

        scheduler
            .play(Arc::clone(&session), vec![0x22; FRAME * 3])
            .unwrap();

        // The first clip may have ticked out a frame or two before it was
        // orphaned; after those, only second-clip frames may appear
        let mut second = 0;
        let mut first_done = false;
        for _ in 0..10 {
            while let Some(frame) = recv_frame(&mut rx).await {
                match frame[0] {
                    0x22 => {
                        second += 1;
                        first_done = true;
                    }
                    0x11 => assert!(!first_done, "old clip emitted after the new one"),
                    other => panic!("unexpected frame byte {:#04x}", other),
                }
            }
            advance(Duration::from_millis(20)).await;
        }
        assert_eq!(second, 3);
        assert!(!session.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_without_sink_fails() {
        let registry = SessionRegistry::new();
        let session = registry.create(
            CallMetadata {
                session_id: "no-sink".to_string(),
                did: "18005550100".to_string(),
                caller_id: None,
                caller_phone: None,
                caller_name: None,
            },
            Duration::from_secs(60),
        );
        let scheduler = PlaybackScheduler::new(8000, 20);

        match scheduler.play(session, vec![0u8; FRAME]) {
            Err(PlaybackError::NoSink(id)) => assert_eq!(id, "no-sink"),
            other => panic!("expected NoSink, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_when_idle_is_harmless() {
        let registry = SessionRegistry::new();
        let (session, _rx) = session_with_sink(&registry);
        let scheduler = PlaybackScheduler::new(8000, 20);

        scheduler.interrupt(&session);
        scheduler.interrupt(&session);
        assert!(!session.is_playing());
    }
}
