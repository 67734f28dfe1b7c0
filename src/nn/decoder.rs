use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    loss,
    ops::log_softmax,
    rnn::{LSTMConfig, LSTMState},
    Embedding, Init, Linear, Module, VarBuilder, LSTM, RNN,
};
use tracing::trace;

use super::{beam::BeamSearch, utils::ensure_f32};
use crate::config::DecoderConfig;

/// Beam search result.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    /// `[B, T, K]` u32 token ids, best beam at index 0 of the last axis.
    pub predicted_ids: Tensor,
    /// `[B, K]` cumulative log-probabilities.
    pub scores: Tensor,
}
impl DecodeOutput {
    /// `[B, T]` ids of the best hypothesis of each batch entry.
    pub fn best(&self) -> Result<Tensor> {
        self.predicted_ids.i((.., .., 0))?.contiguous()
    }
}

/// LSTM decoder that turns a `[B, units]` graph embedding into a token
/// sequence.
///
/// The embedding is used as both the hidden and the cell state of the first
/// step.
pub struct SequenceDecoder {
    embeddings: Embedding,
    cell: LSTM,
    output: Linear,
    units: usize,
    vocab_size: usize,
}
impl SequenceDecoder {
    pub fn new(
        units: usize,
        embedding_size: usize,
        vocab_size: usize,
        init_range: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        let table = vs.get_with_hints(
            (vocab_size, embedding_size),
            "embeddings",
            Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        let uniform = Init::Uniform {
            lo: -init_range,
            up: init_range,
        };
        let cell = candle_nn::lstm(
            embedding_size,
            units,
            LSTMConfig {
                w_ih_init: uniform,
                w_hh_init: uniform,
                ..Default::default()
            },
            vs.pp("lstm"),
        )?;
        let output = candle_nn::linear_no_bias(units, vocab_size, vs.pp("output"))?;
        Ok(Self {
            embeddings: Embedding::new(table, embedding_size),
            cell,
            output,
            units,
            vocab_size,
        })
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn initial_state(&self, encoded: &Tensor) -> Result<LSTMState> {
        let (_, units) = encoded.dims2()?;
        if units != self.units {
            candle_core::bail!(
                "decoder with {} units cannot start from a state of width {units}",
                self.units
            )
        }
        Ok(LSTMState::new(encoded.clone(), encoded.clone()))
    }

    /// Logits `[B, T, vocab]` of predicting `targets[:, t]` from the go token
    /// followed by `targets[:, ..t]`.
    pub fn forward_teacher_forced(
        &self,
        encoded: &Tensor,
        targets: &Tensor,
        go_token: u32,
    ) -> Result<Tensor> {
        let (batch_size, steps) = targets.dims2()?;
        if steps == 0 {
            return Tensor::zeros(
                (batch_size, 0, self.vocab_size),
                encoded.dtype(),
                encoded.device(),
            );
        }
        let go = Tensor::full(go_token, (batch_size, 1), targets.device())?;
        let inputs = if steps > 1 {
            let shifted = targets.to_dtype(DType::U32)?.i((.., ..steps - 1))?.contiguous()?;
            Tensor::cat(&[&go, &shifted], 1)?
        } else {
            go
        };
        let embedded = self.embeddings.forward(&inputs)?;
        let states = self.cell.seq_init(&embedded, &self.initial_state(encoded)?)?;
        let hidden = self.cell.states_to_tensor(&states)?;
        self.output.forward(&hidden)
    }

    /// Beam search from the go token until every hypothesis produced the end
    /// token or `max_decode_len` steps were taken.
    pub fn beam_search(&self, encoded: &Tensor, config: &DecoderConfig) -> Result<DecodeOutput> {
        let device = encoded.device();
        let (batch_size, _) = encoded.dims2()?;
        let beam_width = config.beam_width.max(1);
        let tiled = tile_beams(encoded, beam_width)?;
        let mut state = self.initial_state(&tiled)?;
        let mut search = BeamSearch::new(
            batch_size,
            beam_width,
            config.end_token,
            config.length_penalty,
        );
        let mut tokens = Tensor::full(config.go_token, batch_size * beam_width, device)?;
        while search.num_steps() < config.max_decode_len && !search.is_done() {
            let embedded = self.embeddings.forward(&tokens)?;
            state = self.cell.step(&embedded, &state)?;
            let logits = self.output.forward(state.h())?;
            let log_probs = ensure_f32(&log_softmax(&logits, D::Minus1)?)?.to_vec2::<f32>()?;
            let step = search.step(&log_probs)?;
            let parents = Tensor::new(step.parents.as_slice(), device)?;
            state = LSTMState::new(
                state.h().index_select(&parents, 0)?,
                state.c().index_select(&parents, 0)?,
            );
            tokens = Tensor::new(step.tokens.as_slice(), device)?;
        }
        trace!(steps = search.num_steps(), "beam search finished");
        hypotheses_to_tensors(search, batch_size, beam_width, device)
    }
}

/// Repeats every row `beam_width` times: `[B, H] -> [B * beam_width, H]`.
fn tile_beams(xs: &Tensor, beam_width: usize) -> Result<Tensor> {
    let (batch_size, width) = xs.dims2()?;
    xs.unsqueeze(1)?
        .broadcast_as((batch_size, beam_width, width))?
        .contiguous()?
        .reshape((batch_size * beam_width, width))
}

fn hypotheses_to_tensors(
    search: BeamSearch,
    batch_size: usize,
    beam_width: usize,
    device: &Device,
) -> Result<DecodeOutput> {
    let steps = search.num_steps();
    let hyp = search.finalize();
    let mut ids = Vec::with_capacity(batch_size * steps * beam_width);
    for batch in &hyp.ids {
        for t in 0..steps {
            ids.extend(batch.iter().map(|beam| beam[t]));
        }
    }
    let scores: Vec<f32> = hyp.scores.into_iter().flatten().collect();
    Ok(DecodeOutput {
        predicted_ids: Tensor::from_vec(ids, (batch_size, steps, beam_width), device)?,
        scores: Tensor::from_vec(scores, (batch_size, beam_width), device)?,
    })
}

/// Mean cross-entropy of the unmasked positions of `targets`.
///
/// `logits: [B, T, V]`, `targets: [B, T]`, `mask: [B, T]`.
pub fn masked_sequence_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = log_softmax(&logits.reshape((b * t, v))?, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?.reshape((b * t, 1))?;
    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;
    let mask = mask.to_dtype(nll.dtype())?.reshape(b * t)?;
    let total = mask.sum_all()?.maximum(1.0)?;
    nll.mul(&mask)?.sum_all()?.div(&total)
}

/// Plain token cross-entropy, for sequences without padding.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    loss::cross_entropy(
        &logits.reshape((b * t, v))?,
        &targets.to_dtype(DType::U32)?.reshape(b * t)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ParamStore;

    fn decoder(store: &ParamStore) -> Result<SequenceDecoder> {
        SequenceDecoder::new(4, 3, 6, 0.1, store.var_builder().pp("decoder"))
    }

    #[test]
    fn teacher_forced_logits() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let dec = decoder(&store)?;
        let encoded = Tensor::randn(0f32, 1., (2, 4), &dev)?;
        let targets = Tensor::new(&[[3u32, 4, 2], [5, 2, 0]], &dev)?;
        let logits = dec.forward_teacher_forced(&encoded, &targets, 1)?;
        assert_eq!(logits.dims(), &[2, 3, 6]);

        let mask = Tensor::new(&[[1f32, 1., 1.], [1., 1., 0.]], &dev)?;
        let loss = masked_sequence_loss(&logits, &targets, &mask)?.to_scalar::<f32>()?;
        assert!(loss.is_finite() && loss > 0.0);
        let plain = sequence_loss(&logits, &targets)?.to_scalar::<f32>()?;
        assert!(plain.is_finite());
        Ok(())
    }

    #[test]
    fn rejects_mismatched_state() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let dec = decoder(&store)?;
        let encoded = Tensor::zeros((2, 5), DType::F32, &dev)?;
        let targets = Tensor::new(&[[3u32], [4]], &dev)?;
        assert!(dec.forward_teacher_forced(&encoded, &targets, 1).is_err());
        Ok(())
    }

    #[test]
    fn empty_targets_give_empty_logits() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let dec = decoder(&store)?;
        let encoded = Tensor::randn(0f32, 1., (2, 4), &dev)?;
        let targets = Tensor::zeros((2, 0), DType::U32, &dev)?;
        let logits = dec.forward_teacher_forced(&encoded, &targets, 1)?;
        assert_eq!(logits.dims(), &[2, 0, 6]);
        Ok(())
    }

    #[test]
    fn beam_search_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let dec = decoder(&store)?;
        let encoded = Tensor::randn(0f32, 1., (3, 4), &dev)?;
        let config = DecoderConfig {
            beam_width: 4,
            max_decode_len: 7,
            ..Default::default()
        };
        let out = dec.beam_search(&encoded, &config)?;
        let (b, t, k) = out.predicted_ids.dims3()?;
        assert_eq!((b, k), (3, 4));
        assert!(t >= 1 && t <= 7);
        assert_eq!(out.scores.dims(), &[3, 4]);
        assert_eq!(out.best()?.dims(), &[3, t]);

        // beams come out best first
        for row in out.scores.to_vec2::<f32>()? {
            assert!(row.windows(2).all(|w| w[0] >= w[1] || w[1].is_infinite()));
        }
        Ok(())
    }

    #[test]
    fn tiles_rows_consecutively() -> Result<()> {
        let xs = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        let tiled = tile_beams(&xs, 2)?.to_vec2::<f32>()?;
        assert_eq!(tiled, vec![vec![1., 2.], vec![1., 2.], vec![3., 4.], vec![3., 4.]]);
        Ok(())
    }
}
