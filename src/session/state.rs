//! Per-session counters and flags shared by the session tasks

use crate::pool::ModelType;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Options chosen at login
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub model_type: ModelType,
    /// Tail length in seconds used for the race-ahead score
    pub vad_tail_seconds: f32,
    /// Full-window score below which an utterance may end
    pub vad_offset: f32,
    pub vad_race: bool,
    pub high_fps: bool,
    pub high_quality: bool,
    pub language: Option<String>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model_type: ModelType::Simplex,
            vad_tail_seconds: 0.4,
            vad_offset: 0.1,
            vad_race: false,
            high_fps: false,
            high_quality: false,
            language: None,
        }
    }
}

impl SessionParams {
    pub fn is_duplex(&self) -> bool {
        self.model_type.is_duplex()
    }

    /// Frames accepted per pairing id
    pub fn max_images_per_pair(&self) -> u32 {
        if self.high_fps {
            5
        } else {
            1
        }
    }
}

#[derive(Debug)]
pub struct SessionState {
    /// Completed generate cycles, plus one per break
    pub round: u64,
    /// Advanced each time an audio chunk is sent
    pub image_audio_id: u64,
    pub image_count_in_round: u32,
    pub high_fps: bool,
    /// Backend session is initialized
    pub model_ready: bool,
    /// Front end sent `init`, audio is accepted from now on
    pub accepting_audio: bool,
    /// A generate stream is open
    pub generating: bool,
    /// The front end finished playing the last output
    pub play_end: bool,
    /// Frames of the current output have started going out
    pub speaking: bool,
    pub generate_started: Option<Instant>,
    pub stopped: bool,
}

impl SessionState {
    pub fn new(high_fps: bool) -> Self {
        Self {
            round: 0,
            image_audio_id: 0,
            image_count_in_round: 0,
            high_fps,
            model_ready: false,
            accepting_audio: false,
            generating: false,
            play_end: true,
            speaking: false,
            generate_started: None,
            stopped: false,
        }
    }

    /// Output is still being generated or played back
    pub fn playback_active(&self) -> bool {
        !self.play_end
    }

    /// Pairing id for the audio chunk being sent; the next images pair with
    /// the following chunk
    pub fn consume_audio(&mut self) -> u64 {
        let id = self.image_audio_id;
        self.image_audio_id += 1;
        self.image_count_in_round = 0;
        id
    }

    /// Admit one more image for the current pairing id, returning the id and
    /// the frame index within it
    pub fn admit_image(&mut self, max_per_pair: u32) -> Option<(u64, u32)> {
        if self.image_count_in_round >= max_per_pair {
            return None;
        }
        let frame_index = self.image_count_in_round;
        self.image_count_in_round += 1;
        Some((self.image_audio_id, frame_index))
    }

    pub fn start_generate(&mut self) {
        self.generating = true;
        self.play_end = false;
        self.speaking = false;
        self.generate_started = Some(Instant::now());
    }

    /// A cut-short round was already counted by the break that ended it
    pub fn finish_generate(&mut self, completed: bool) {
        self.generating = false;
        if completed {
            self.round += 1;
        }
    }
}

pub type SharedState = Arc<Mutex<SessionState>>;

pub fn shared_state(high_fps: bool) -> SharedState {
    Arc::new(Mutex::new(SessionState::new(high_fps)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_id_advances_with_audio() {
        let mut state = SessionState::new(true);
        assert_eq!(state.admit_image(5), Some((0, 0)));
        assert_eq!(state.admit_image(5), Some((0, 1)));
        assert_eq!(state.consume_audio(), 0);
        assert_eq!(state.admit_image(5), Some((1, 0)));
    }

    #[test]
    fn test_image_cap_per_pair() {
        let mut state = SessionState::new(false);
        assert!(state.admit_image(1).is_some());
        assert!(state.admit_image(1).is_none());
        state.consume_audio();
        assert!(state.admit_image(1).is_some());
    }

    #[test]
    fn test_generate_cycle() {
        let mut state = SessionState::new(false);
        assert!(!state.playback_active());
        state.start_generate();
        assert!(state.generating && state.playback_active());
        state.finish_generate(true);
        assert!(!state.generating);
        assert_eq!(state.round, 1);

        state.start_generate();
        state.finish_generate(false);
        assert_eq!(state.round, 1);
    }
}
