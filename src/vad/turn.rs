use super::pool::DualScore;
use std::time::{Duration, Instant};
use tracing::debug;

/// Thresholds for the listening/speaking state machine
#[derive(Clone, Debug)]
pub struct TurnParams {
    /// Full-window speech seconds that start an utterance
    pub onset: f32,
    /// Full-window speech seconds below which the utterance ends
    pub offset: f32,
    /// Utterances shorter than this never confirm silence
    pub hold: Duration,
    /// Tail speech seconds below which a race may start
    pub tail_threshold: f32,
    /// Consecutive low tail readings required before racing
    pub race_debounce: u32,
}

impl Default for TurnParams {
    fn default() -> Self {
        Self {
            onset: 0.4,
            offset: 0.1,
            hold: Duration::from_millis(300),
            tail_threshold: 0.1,
            race_debounce: 2,
        }
    }
}

/// Outcome of one window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnVerdict {
    /// False once silence after an utterance is confirmed
    pub speech_active: bool,
    /// True when the tail predicts the utterance is about to end
    pub race_ready: bool,
    /// Speech in the tail, which cancels a running race
    pub tail_speech: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    Listening,
    Speaking { since: Instant },
}

/// Per-session turn detector fed with one dual score per window
pub struct TurnDetector {
    params: TurnParams,
    phase: TurnPhase,
    low_tail_streak: u32,
}

impl TurnDetector {
    pub fn new(params: TurnParams) -> Self {
        Self {
            params,
            phase: TurnPhase::Listening,
            low_tail_streak: 0,
        }
    }

    pub fn observe(&mut self, score: DualScore, now: Instant) -> TurnVerdict {
        let mut speech_active = true;

        match self.phase {
            TurnPhase::Listening if score.full > self.params.onset => {
                debug!(full = score.full, "utterance started");
                self.phase = TurnPhase::Speaking { since: now };
            }
            TurnPhase::Speaking { since } if score.full < self.params.offset => {
                self.phase = TurnPhase::Listening;
                self.low_tail_streak = 0;
                if now.duration_since(since) >= self.params.hold {
                    debug!(full = score.full, "silence confirmed");
                    speech_active = false;
                }
            }
            _ => {}
        }

        let mut race_ready = false;
        if self.is_speaking() {
            if score.tail < self.params.tail_threshold {
                self.low_tail_streak += 1;
                race_ready = self.low_tail_streak >= self.params.race_debounce;
            } else {
                self.low_tail_streak = 0;
            }
        }

        TurnVerdict {
            speech_active,
            race_ready,
            tail_speech: score.tail >= self.params.tail_threshold,
        }
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.phase, TurnPhase::Speaking { .. })
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Return to listening, e.g. after a generate starts or a break
    pub fn reset(&mut self) {
        self.phase = TurnPhase::Listening;
        self.low_tail_streak = 0;
    }
}
