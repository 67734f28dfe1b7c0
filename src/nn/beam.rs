//! Host-side bookkeeping of beam search.
//!
//! The decoder computes next-token log-probabilities for `batch * beam`
//! hypotheses at a time and hands them to [`BeamSearch::step`], which picks
//! the surviving hypotheses and tells the decoder which rows of its state
//! to keep. [`BeamSearch::finalize`] follows the parent pointers back to
//! recover the sequences.

use std::cmp::Ordering;

use candle_core::{bail, Result};

/// Survivors of one step, both indexed by `batch * beam_width + beam`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStep {
    /// Row of the previous step every hypothesis extends.
    pub parents: Vec<u32>,
    pub tokens: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypotheses {
    /// `[batch][beam][time]`, best beam first. Positions after the end token
    /// hold the end token.
    pub ids: Vec<Vec<Vec<u32>>>,
    /// Cumulative log-probabilities, `[batch][beam]`.
    pub scores: Vec<Vec<f32>>,
}

pub struct BeamSearch {
    batch_size: usize,
    beam_width: usize,
    end_token: u32,
    length_penalty: f64,
    log_probs: Vec<f32>,
    lengths: Vec<usize>,
    finished: Vec<bool>,
    tokens: Vec<Vec<u32>>,
    parents: Vec<Vec<u32>>,
}

impl BeamSearch {
    pub fn new(batch_size: usize, beam_width: usize, end_token: u32, length_penalty: f64) -> Self {
        let rows = batch_size * beam_width;
        // only the first beam is alive at the start, the others are copies of it
        let log_probs = (0..rows)
            .map(|row| if row % beam_width == 0 { 0.0 } else { f32::NEG_INFINITY })
            .collect();
        Self {
            batch_size,
            beam_width,
            end_token,
            length_penalty,
            log_probs,
            lengths: vec![0; rows],
            finished: vec![false; rows],
            tokens: Vec::new(),
            parents: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.batch_size * self.beam_width
    }

    pub fn num_steps(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_done(&self) -> bool {
        self.finished.iter().all(|&f| f)
    }

    /// GNMT length penalty `((5 + len) / 6) ^ alpha`.
    fn penalty(&self, length: usize) -> f32 {
        if self.length_penalty == 0.0 {
            1.0
        } else {
            ((5.0 + length as f64) / 6.0).powf(self.length_penalty) as f32
        }
    }

    /// Advances every hypothesis by one token.
    ///
    /// `step_log_probs` holds one row of next-token log-probabilities per
    /// hypothesis.
    pub fn step(&mut self, step_log_probs: &[Vec<f32>]) -> Result<BeamStep> {
        if step_log_probs.len() != self.rows() {
            bail!(
                "beam search expects {} rows of log-probabilities, got {}",
                self.rows(),
                step_log_probs.len()
            )
        }
        let vocab_size = step_log_probs.first().map_or(0, Vec::len);
        if vocab_size <= self.end_token as usize {
            bail!("end token {} outside of vocabulary of size {vocab_size}", self.end_token)
        }

        let rows = self.rows();
        let mut parents = Vec::with_capacity(rows);
        let mut tokens = Vec::with_capacity(rows);
        let mut log_probs = Vec::with_capacity(rows);
        let mut lengths = Vec::with_capacity(rows);
        let mut finished = Vec::with_capacity(rows);

        for batch in 0..self.batch_size {
            // (score used for ranking, total log-prob, parent row, token, new length)
            let mut candidates = Vec::with_capacity(self.beam_width * vocab_size);
            for beam in 0..self.beam_width {
                let row = batch * self.beam_width + beam;
                let base = self.log_probs[row];
                if self.finished[row] {
                    // a finished hypothesis can only repeat the end token, for free
                    let length = self.lengths[row];
                    candidates.push((base / self.penalty(length), base, row, self.end_token, length));
                    continue;
                }
                if step_log_probs[row].len() != vocab_size {
                    bail!("ragged log-probabilities at row {row}")
                }
                for (token, &lp) in step_log_probs[row].iter().enumerate() {
                    let total = base + lp;
                    let length = if token as u32 == self.end_token {
                        self.lengths[row]
                    } else {
                        self.lengths[row] + 1
                    };
                    candidates.push((total / self.penalty(length), total, row, token as u32, length));
                }
            }
            // stable sort keeps earlier beams and smaller tokens first on ties
            candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
            for &(_, total, row, token, length) in candidates.iter().take(self.beam_width) {
                parents.push(row as u32);
                tokens.push(token);
                log_probs.push(total);
                lengths.push(length);
                finished.push(self.finished[row] || token == self.end_token);
            }
            // fewer candidates than beams only happens with a tiny vocabulary
            while parents.len() < (batch + 1) * self.beam_width {
                let row = batch * self.beam_width;
                parents.push(row as u32);
                tokens.push(self.end_token);
                log_probs.push(f32::NEG_INFINITY);
                lengths.push(self.lengths[row]);
                finished.push(true);
            }
        }

        self.log_probs = log_probs;
        self.lengths = lengths;
        self.finished = finished;
        self.tokens.push(tokens.clone());
        self.parents.push(parents.clone());
        Ok(BeamStep { parents, tokens })
    }

    /// Recovers the token sequences by walking the parent pointers back
    /// from the last step.
    pub fn finalize(self) -> Hypotheses {
        let steps = self.tokens.len();
        let mut ids = Vec::with_capacity(self.batch_size);
        let mut scores = Vec::with_capacity(self.batch_size);
        for batch in 0..self.batch_size {
            let mut batch_ids = Vec::with_capacity(self.beam_width);
            let mut batch_scores = Vec::with_capacity(self.beam_width);
            for beam in 0..self.beam_width {
                let mut row = batch * self.beam_width + beam;
                let mut seq = vec![self.end_token; steps];
                for t in (0..steps).rev() {
                    seq[t] = self.tokens[t][row];
                    row = self.parents[t][row] as usize;
                }
                if let Some(end) = seq.iter().position(|&id| id == self.end_token) {
                    seq[end..].fill(self.end_token);
                }
                batch_ids.push(seq);
                batch_scores.push(self.log_probs[batch * self.beam_width + beam]);
            }
            ids.push(batch_ids);
            scores.push(batch_scores);
        }
        Hypotheses { ids, scores }
    }
}
