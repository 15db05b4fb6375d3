//! # Voice Activity Segmentation
//!
//! Turns the continuous inbound PCM stream of one call into discrete
//! utterances for the speech-to-text collaborator. A two-state machine
//! (`Idle` / `Speaking`) classifies fixed-duration frames through a
//! pluggable voice detector and closes a segment once a configurable
//! stretch of uninterrupted silence — the hangover window — has elapsed.
//!
//! ## Hangover policy:
//! While `Speaking`, every speech-classified frame resets the silence
//! counter to zero; the segment closes when the counter reaches
//! `hangover_ms`. The hangover silence itself stays in the emitted segment
//! so trailing word endings are not clipped. Too short a window truncates
//! trailing words, too long delays the assistant's turn, so the value is
//! configuration, never a constant.
//!
//! ## Failure semantics:
//! A detector error degrades to "assume silence" for that frame. The call
//! keeps going; repeated failures are only visible in the logs.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, warn};

/// Error from a single voice-detector classification.
#[derive(Debug, Error)]
#[error("voice detector failed: {0}")]
pub struct DetectorError(pub String);

/// Per-frame speech/silence classifier.
///
/// Implementations own whatever internal state they need; the segmenter
/// feeds them one fixed-duration frame of 16-bit LE samples at a time.
pub trait VoiceDetector: Send {
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool, DetectorError>;
}

/// RMS energy gate over 16-bit samples.
///
/// Speech on a phone line sits well above line noise in raw energy, so a
/// simple root-mean-square threshold is enough to find utterance
/// boundaries. The threshold is in raw sample units (0..32768).
pub struct EnergyDetector {
    threshold: f64,
}

impl EnergyDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl VoiceDetector for EnergyDetector {
    fn is_speech(&mut self, samples: &[i16]) -> Result<bool, DetectorError> {
        if samples.is_empty() {
            return Ok(false);
        }

        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / samples.len() as f64).sqrt();
        Ok(rms >= self.threshold)
    }
}

/// Configuration for the segmentation state machine.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Sample rate of the inbound stream (Hz)
    pub sample_rate: u32,

    /// Duration of one classification frame (ms)
    pub frame_duration_ms: u32,

    /// Consecutive silence required to close a segment (ms)
    pub hangover_ms: u32,
}

impl SegmenterConfig {
    /// Bytes in one classification frame (16-bit mono).
    pub fn frame_bytes(&self) -> usize {
        super::codec::frame_size(self.sample_rate, self.frame_duration_ms)
    }
}

/// One finished utterance: contiguous PCM from speech onset through the
/// hangover window, tagged with the owning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechSegment {
    pub session_id: String,
    pub pcm: Vec<u8>,
}

impl SpeechSegment {
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        (self.pcm.len() as u64 * 1000) / (sample_rate as u64 * super::codec::BYTES_PER_SAMPLE as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmenterState {
    Idle,
    Speaking,
}

/// Segmentation state machine for one call.
///
/// Owned by the call's connection handler; never shared across calls. The
/// connection handler pushes raw bytes as they arrive off the socket and
/// the segmenter re-chunks them into classification frames internally, so
/// TCP read sizes don't matter.
pub struct VoiceSegmenter {
    session_id: String,
    cfg: SegmenterConfig,
    detector: Box<dyn VoiceDetector>,

    state: SegmenterState,

    /// Bytes that do not yet fill a whole classification frame
    pending: Vec<u8>,

    /// The open segment buffer; discarded after emit, not reused
    segment: Vec<u8>,

    /// Consecutive silence observed while `Speaking` (ms)
    silence_ms: u32,

    detector_failures: u64,
}

impl VoiceSegmenter {
    pub fn new(session_id: String, cfg: SegmenterConfig, detector: Box<dyn VoiceDetector>) -> Self {
        Self {
            session_id,
            cfg,
            detector,
            state: SegmenterState::Idle,
            pending: Vec::new(),
            segment: Vec::new(),
            silence_ms: 0,
            detector_failures: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state == SegmenterState::Speaking
    }

    /// Push raw PCM bytes in arrival order.
    ///
    /// Returns every segment completed by this push (usually zero or one;
    /// more if a large read spans several utterances).
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<SpeechSegment> {
        let frame_bytes = self.cfg.frame_bytes();
        let mut completed = Vec::new();

        self.pending.extend_from_slice(data);
        while self.pending.len() >= frame_bytes {
            let frame: Vec<u8> = self.pending.drain(..frame_bytes).collect();
            if let Some(segment) = self.push_frame(&frame) {
                completed.push(segment);
            }
        }

        completed
    }

    /// Feed one whole classification frame through the state machine.
    fn push_frame(&mut self, frame: &[u8]) -> Option<SpeechSegment> {
        let voiced = self.classify(frame);

        match self.state {
            SegmenterState::Idle => {
                if voiced {
                    debug!(session_id = %self.session_id, "speech onset, opening segment");
                    self.state = SegmenterState::Speaking;
                    self.segment = Vec::with_capacity(self.cfg.frame_bytes() * 50);
                    self.segment.extend_from_slice(frame);
                    self.silence_ms = 0;
                }
                None
            }
            SegmenterState::Speaking => {
                // Speech and silence both stay in the segment until it closes
                self.segment.extend_from_slice(frame);

                if voiced {
                    self.silence_ms = 0;
                    return None;
                }

                self.silence_ms += self.cfg.frame_duration_ms;
                if self.silence_ms >= self.cfg.hangover_ms {
                    return self.close_segment();
                }
                None
            }
        }
    }

    /// Flush the in-progress buffer when the stream ends mid-utterance.
    ///
    /// A caller who hangs up while talking still gets their last words
    /// transcribed rather than dropped on the floor.
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        if self.state != SegmenterState::Speaking {
            return None;
        }
        // Any sub-frame tail belongs to the utterance too
        let tail = std::mem::take(&mut self.pending);
        self.segment.extend_from_slice(&tail);
        self.close_segment()
    }

    fn close_segment(&mut self) -> Option<SpeechSegment> {
        self.state = SegmenterState::Idle;
        self.silence_ms = 0;

        let pcm = std::mem::take(&mut self.segment);
        if pcm.is_empty() {
            return None;
        }

        debug!(
            session_id = %self.session_id,
            bytes = pcm.len(),
            "segment closed"
        );
        Some(SpeechSegment {
            session_id: self.session_id.clone(),
            pcm,
        })
    }

    /// Classify one frame, degrading detector failures to silence.
    fn classify(&mut self, frame: &[u8]) -> bool {
        let mut cursor = Cursor::new(frame);
        let mut samples = Vec::with_capacity(frame.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        match self.detector.is_speech(&samples) {
            Ok(voiced) => voiced,
            Err(err) => {
                self.detector_failures += 1;
                warn!(
                    session_id = %self.session_id,
                    failures = self.detector_failures,
                    "voice detector error, treating frame as silence: {}",
                    err
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Detector that replays a fixed classification script, one entry per
    /// frame, then reports silence.
    struct ScriptedDetector {
        script: VecDeque<Result<bool, ()>>,
    }

    impl ScriptedDetector {
        fn new(script: Vec<Result<bool, ()>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl VoiceDetector for ScriptedDetector {
        fn is_speech(&mut self, _samples: &[i16]) -> Result<bool, DetectorError> {
            match self.script.pop_front() {
                Some(Ok(voiced)) => Ok(voiced),
                Some(Err(())) => Err(DetectorError("scripted failure".to_string())),
                None => Ok(false),
            }
        }
    }

    fn cfg() -> SegmenterConfig {
        SegmenterConfig {
            sample_rate: 8000,
            frame_duration_ms: 20,
            hangover_ms: 200,
        }
    }

    fn frames(count: usize, voiced: bool) -> Vec<Result<bool, ()>> {
        vec![Ok(voiced); count]
    }

    fn segmenter(script: Vec<Result<bool, ()>>) -> VoiceSegmenter {
        VoiceSegmenter::new(
            "test-call".to_string(),
            cfg(),
            Box::new(ScriptedDetector::new(script)),
        )
    }

    /// Push `ms` worth of frames and collect whatever segments come out.
    fn push_ms(seg: &mut VoiceSegmenter, ms: u32) -> Vec<SpeechSegment> {
        let frame_bytes = cfg().frame_bytes();
        let mut out = Vec::new();
        for _ in 0..(ms / 20) {
            out.extend(seg.push_bytes(&vec![0u8; frame_bytes]));
        }
        out
    }

    #[test]
    fn test_silence_only_emits_nothing() {
        let mut seg = segmenter(frames(50, false));
        assert!(push_ms(&mut seg, 1000).is_empty());
        assert!(!seg.is_speaking());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn test_single_utterance_with_hangover() {
        // 500ms silence, 300ms speech, 400ms silence; hangover is 200ms
        let mut script = frames(25, false);
        script.extend(frames(15, true));
        script.extend(frames(20, false));
        let mut seg = segmenter(script);

        let mut segments = push_ms(&mut seg, 500);
        assert!(segments.is_empty());

        segments.extend(push_ms(&mut seg, 300 + 400));
        assert_eq!(segments.len(), 1);

        // Segment spans the speech plus the 200ms hangover window
        let segment = &segments[0];
        assert_eq!(segment.session_id, "test-call");
        assert_eq!(segment.duration_ms(8000), 500);
        assert_eq!(segment.pcm.len(), cfg().frame_bytes() * 25);

        // The remaining silence after the segment closed stays quiet
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_speech_resets_silence_counter() {
        // speech, 180ms silence (under hangover), speech again, then 200ms silence
        let mut script = frames(5, true);
        script.extend(frames(9, false));
        script.extend(frames(5, true));
        script.extend(frames(10, false));
        let mut seg = segmenter(script);

        let segments = push_ms(&mut seg, (5 + 9 + 5 + 10) * 20);
        assert_eq!(segments.len(), 1);
        // One segment covering the whole run: the mid-utterance pause never
        // reached the hangover threshold
        assert_eq!(segments[0].duration_ms(8000), (5 + 9 + 5 + 10) * 20);
    }

    #[test]
    fn test_flush_emits_in_progress_segment() {
        let mut seg = segmenter(frames(10, true));
        assert!(push_ms(&mut seg, 200).is_empty());
        assert!(seg.is_speaking());

        let segment = seg.flush().expect("in-progress buffer must flush");
        assert_eq!(segment.duration_ms(8000), 200);
        assert!(!seg.is_speaking());
        // A second flush has nothing left
        assert!(seg.flush().is_none());
    }

    #[test]
    fn test_detector_error_degrades_to_silence() {
        // speech opens a segment, then errors count as silence until hangover
        let mut script = frames(5, true);
        script.extend(vec![Err(()); 10]);
        let mut seg = segmenter(script);

        let segments = push_ms(&mut seg, 15 * 20);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].duration_ms(8000), (5 + 10) * 20);
    }

    #[test]
    fn test_rechunks_arbitrary_read_sizes() {
        // Feed 300ms of speech in awkward slices; classification still
        // happens on whole 320-byte frames
        let mut seg = segmenter(frames(15, true));
        let total = cfg().frame_bytes() * 15;
        let data = vec![0u8; total];

        let mut emitted = Vec::new();
        for chunk in data.chunks(77) {
            emitted.extend(seg.push_bytes(chunk));
        }
        assert!(emitted.is_empty());
        assert!(seg.is_speaking());
        assert_eq!(seg.flush().unwrap().pcm.len(), total);
    }

    #[test]
    fn test_energy_detector_thresholds() {
        let mut detector = EnergyDetector::new(500.0);

        let silence = vec![0i16; 160];
        assert!(!detector.is_speech(&silence).unwrap());

        let speech = vec![8000i16; 160];
        assert!(detector.is_speech(&speech).unwrap());

        assert!(!detector.is_speech(&[]).unwrap());
    }
}
