//! Fixed-size thread pool for VAD scoring
//!
//! Scoring is CPU bound, so it runs on dedicated threads instead of the async
//! runtime. Each thread owns its own scorer; callers await the reply on a
//! oneshot channel.

use super::scorer::SpeechScorer;
use crate::audio::{resample_audio, MODEL_SAMPLE_RATE};
use crate::{ParleyError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Builds one scorer per pool thread
pub type ScorerFactory = Arc<dyn Fn() -> Result<Box<dyn SpeechScorer>> + Send + Sync>;

/// Scores for one window
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DualScore {
    /// Speech seconds in the whole window
    pub full: f32,
    /// Speech seconds in the tail, padded with silence to the window length
    pub tail: f32,
}

struct ScoreJob {
    window: Vec<f32>,
    sample_rate: u32,
    tail_seconds: f32,
    reply: oneshot::Sender<Result<DualScore>>,
}

pub struct VadPool {
    job_tx: Sender<ScoreJob>,
    workers: Vec<JoinHandle<()>>,
}

impl VadPool {
    pub fn new(threads: usize, factory: ScorerFactory) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<ScoreJob>();
        let mut workers = Vec::with_capacity(threads.max(1));

        for index in 0..threads.max(1) {
            let scorer = factory()?;
            let job_rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("vad-{}", index))
                .spawn(move || run_worker(scorer, job_rx))
                .map_err(|e| ParleyError::VadError(format!("Failed to spawn VAD thread: {}", e)))?;
            workers.push(handle);
        }

        info!("VAD pool started with {} threads", workers.len());
        Ok(Self { job_tx, workers })
    }

    /// Score a window and its tail off the async runtime
    pub async fn score(
        &self,
        window: Vec<f32>,
        sample_rate: u32,
        tail_seconds: f32,
    ) -> Result<DualScore> {
        let (reply, rx) = oneshot::channel();
        self.job_tx
            .send(ScoreJob {
                window,
                sample_rate,
                tail_seconds,
                reply,
            })
            .map_err(|e| ParleyError::ChannelError(format!("VAD pool closed: {}", e)))?;

        rx.await
            .map_err(|_| ParleyError::ChannelError("VAD worker dropped the job".into()))?
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

fn run_worker(mut scorer: Box<dyn SpeechScorer>, job_rx: Receiver<ScoreJob>) {
    while let Ok(job) = job_rx.recv() {
        let result = dual_score(scorer.as_mut(), &job.window, job.sample_rate, job.tail_seconds);
        if let Err(e) = &result {
            error!("VAD scoring failed: {}", e);
        }
        if job.reply.send(result).is_err() {
            debug!("VAD caller went away before the reply");
        }
    }
    debug!("VAD worker exiting");
}

/// Score the full window and its tail padded with silence
pub fn dual_score(
    scorer: &mut dyn SpeechScorer,
    window: &[f32],
    sample_rate: u32,
    tail_seconds: f32,
) -> Result<DualScore> {
    let samples = resample_audio(window, sample_rate, MODEL_SAMPLE_RATE)?;
    let full = scorer.speech_seconds(&samples)?;

    let total = samples.len();
    let tail_len = ((tail_seconds.clamp(0.0, 1.0) * MODEL_SAMPLE_RATE as f32) as usize).min(total);
    let mut tail = samples[total - tail_len..].to_vec();
    tail.resize(total, 0.0);
    let tail = scorer.speech_seconds(&tail)?;

    Ok(DualScore { full, tail })
}

impl Drop for VadPool {
    fn drop(&mut self) {
        // Workers exit once every sender is gone
        let (closed_tx, _) = unbounded();
        self.job_tx = closed_tx;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("VAD worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::scorer::EnergyScorer;

    fn energy_factory() -> ScorerFactory {
        Arc::new(|| Ok(Box::new(EnergyScorer::default()) as Box<dyn SpeechScorer>))
    }

    #[test]
    fn test_dual_score_tail() {
        let mut scorer = EnergyScorer::default();
        // Speech in the first 600 ms, silence in the last 400 ms
        let mut window = vec![0.5f32; 9600];
        window.extend(vec![0.0f32; 6400]);

        let score = dual_score(&mut scorer, &window, MODEL_SAMPLE_RATE, 0.4).unwrap();
        assert!(score.full > 0.5);
        assert_eq!(score.tail, 0.0);
    }

    #[tokio::test]
    async fn test_pool_scores_concurrently() {
        let pool = VadPool::new(2, energy_factory()).unwrap();
        assert_eq!(pool.threads(), 2);

        let loud = vec![0.5f32; 16000];
        let quiet = vec![0.0f32; 16000];
        let (a, b) = tokio::join!(
            pool.score(loud, MODEL_SAMPLE_RATE, 0.4),
            pool.score(quiet, MODEL_SAMPLE_RATE, 0.4)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.full > 0.9);
        assert!(a.tail > 0.3);
        assert_eq!(b.full, 0.0);
    }
}
