//! Voice activity detection.
//!
//! Energy-based endpointing for client-driven turn detection in duplex
//! sessions. The detector computes the mean absolute amplitude of each
//! PCM frame against a threshold and tracks speech and silence durations
//! in sample time, not wall-clock time, so pre-recorded audio endpoints
//! deterministically: after `silence_threshold_ms` of silence following
//! at least `min_speech_ms` of speech — or at `max_turn_duration_s`
//! regardless — it emits end-of-turn exactly once per turn.

/// Tuning parameters for the detector.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Silence run that ends a turn, in milliseconds.
    pub silence_threshold_ms: u64,
    /// Minimum accumulated speech before silence can end a turn.
    pub min_speech_ms: u64,
    /// Hard turn cap, in seconds.
    pub max_turn_duration_s: u64,
    /// Input sample rate.
    pub sample_rate: u32,
    /// Energy level below which a frame is silence. Normalized to
    /// full-scale 1.0; 0.01 suits typical microphones.
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 500,
            min_speech_ms: 200,
            max_turn_duration_s: 30,
            sample_rate: 16_000,
            energy_threshold: 0.01,
        }
    }
}

/// What a processed frame signified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Nothing notable.
    None,
    /// A silence-to-speech transition. Drives barge-in detection.
    SpeechStarted,
    /// The turn ended (silence run or hard cap). Emitted once per turn.
    EndOfTurn,
}

/// Mean absolute amplitude of i16 samples, normalized to 0.0–1.0.
pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|&s| (s as f32 / 32768.0).abs()).sum();
    sum / samples.len() as f32
}

/// Interpret little-endian PCM16 bytes as samples.
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Streaming energy-based turn detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    speech_ms: f64,
    silence_ms: f64,
    turn_ms: f64,
    speaking: bool,
    turn_ended: bool,
}

impl VoiceActivityDetector {
    /// Create a detector with the given config.
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speech_ms: 0.0,
            silence_ms: 0.0,
            turn_ms: 0.0,
            speaking: false,
            turn_ended: false,
        }
    }

    /// Feed one PCM16 frame and report what it signified.
    pub fn process(&mut self, samples: &[i16]) -> VadEvent {
        if samples.is_empty() || self.turn_ended {
            return VadEvent::None;
        }
        let frame_ms = samples.len() as f64 * 1000.0 / self.config.sample_rate as f64;
        self.turn_ms += frame_ms;

        let is_speech = frame_energy(samples) > self.config.energy_threshold;
        let started = is_speech && !self.speaking;
        if is_speech {
            self.speaking = true;
            self.speech_ms += frame_ms;
            self.silence_ms = 0.0;
        } else {
            self.speaking = false;
            self.silence_ms += frame_ms;
        }

        if self.turn_ms >= (self.config.max_turn_duration_s * 1000) as f64 {
            self.turn_ended = true;
            return VadEvent::EndOfTurn;
        }
        if self.speech_ms >= self.config.min_speech_ms as f64
            && self.silence_ms >= self.config.silence_threshold_ms as f64
        {
            self.turn_ended = true;
            return VadEvent::EndOfTurn;
        }

        if started {
            VadEvent::SpeechStarted
        } else {
            VadEvent::None
        }
    }

    /// Feed little-endian PCM16 bytes.
    pub fn process_bytes(&mut self, bytes: &[u8]) -> VadEvent {
        self.process(&pcm16_samples(bytes))
    }

    /// True while the most recent frame carried speech.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Reset all clocks for the next turn.
    pub fn reset(&mut self) {
        self.speech_ms = 0.0;
        self.silence_ms = 0.0;
        self.turn_ms = 0.0;
        self.speaking = false;
        self.turn_ended = false;
    }
}
