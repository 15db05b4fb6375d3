//! Real-time call audio: wire framing, utterance segmentation, paced
//! playback, and the per-call session registry, tied together by the TCP
//! connection handler in [`socket`].

pub mod codec;
pub mod playback;
pub mod segmenter;
pub mod session;
pub mod socket;
