pub mod pool;
pub mod scorer;
pub mod turn;

pub use pool::{dual_score, DualScore, ScorerFactory, VadPool};
pub use scorer::{EnergyScorer, SileroScorer, SpeechScorer};
pub use turn::{TurnDetector, TurnParams, TurnPhase, TurnVerdict};

use std::sync::Arc;
use tracing::warn;

/// Silero scorers, falling back to the energy gate if the model cannot load
pub fn default_scorer_factory() -> ScorerFactory {
    Arc::new(|| match SileroScorer::new(0.5) {
        Ok(scorer) => Ok(Box::new(scorer) as Box<dyn SpeechScorer>),
        Err(e) => {
            warn!("Silero VAD unavailable ({}), using energy VAD", e);
            Ok(Box::new(EnergyScorer::default()) as Box<dyn SpeechScorer>)
        }
    })
}
