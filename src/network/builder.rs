use std::collections::HashMap;

use candle_core::{Tensor, D};
use candle_nn::{Module, VarBuilder};
use tracing::{debug, trace};

use super::description::{LayerSpec, NetworkDescription};
use crate::config::NetworkConfig;
use crate::data::GraphBatch;
use crate::error::{Error, Result};
use crate::nn::{
    max_pool, moments, BatchNormConfig, Conv2dLayer, DecodeOutput, Embedding, GraphConv,
    GraphConvInit, GraphEmbedPool, MaskedBatchNorm, Padding, SequenceDecoder, WeightDecay,
};
use crate::store::ParamStore;

/// Per-layer switches shared by most `make_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOptions {
    /// Variable scope; a numbered default is used when absent.
    pub name: Option<String>,
    pub with_bn: bool,
    pub with_act_func: bool,
}
impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            name: None,
            with_bn: true,
            with_act_func: true,
        }
    }
}
impl LayerOptions {
    /// Defaults of fully-connected and convolutional layers: no batch norm.
    pub fn dense() -> Self {
        Self {
            with_bn: false,
            ..Self::default()
        }
    }
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn with_bn(mut self, with_bn: bool) -> Self {
        self.with_bn = with_bn;
        self
    }
    pub fn with_act_func(mut self, with_act_func: bool) -> Self {
        self.with_act_func = with_act_func;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvOptions {
    pub layer: LayerOptions,
    pub filter_size: usize,
    pub stride: usize,
    pub padding: Padding,
}
impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            layer: LayerOptions::dense(),
            filter_size: 3,
            stride: 1,
            padding: Padding::Same,
        }
    }
}

/// Sequential builder of a Graph-CNN.
///
/// The builder holds the *current* vertex tensor `V`, adjacency `A` and
/// vertex mask. Every `make_*` call appends one layer: it creates (or reuses)
/// the layer's variables in the [`ParamStore`] under the layer's scope,
/// applies the layer to `V` and stores the result as the new `V`.
///
/// Building the same sequence of layers against the same store reuses every
/// parameter, so a training loop builds the network once per batch:
///
/// ```no_run
/// # use graphcnn::{data::GraphBatch, network::*, store::ParamStore, NetworkConfig};
/// # fn run(store: &ParamStore, batch: GraphBatch) -> graphcnn::Result<()> {
/// let mut net = GraphCnnNetwork::new(store, NetworkConfig::default());
/// net.create_network(batch)?;
/// net.make_graphcnn_layer(64, LayerOptions::default())?;
/// net.make_graph_embed_pooling(1, LayerOptions::default())?;
/// let logits = net.make_fc_layer(10, LayerOptions::dense().with_act_func(false))?;
/// # Ok(())
/// # }
/// ```
pub struct GraphCnnNetwork<'a> {
    store: &'a ParamStore,
    config: NetworkConfig,
    pub is_training: bool,
    /// Number of optimisation steps so far; warms up batch-norm averages.
    pub global_step: Option<u64>,
    /// Logs shapes and moments of intermediate results.
    pub network_debug: bool,
    current_v: Option<Tensor>,
    current_a: Option<Tensor>,
    current_mask: Option<Tensor>,
    labels: Option<Tensor>,
    label_mask: Option<Tensor>,
    pred: Option<DecodeOutput>,
    scopes: HashMap<String, usize>,
    decay: WeightDecay,
    description: NetworkDescription,
}

impl<'a> GraphCnnNetwork<'a> {
    pub fn new(store: &'a ParamStore, config: NetworkConfig) -> Self {
        Self {
            store,
            config,
            is_training: true,
            global_step: None,
            network_debug: false,
            current_v: None,
            current_a: None,
            current_mask: None,
            labels: None,
            label_mask: None,
            pred: None,
            scopes: HashMap::new(),
            decay: WeightDecay::new(),
            description: NetworkDescription::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
    pub fn current_v(&self) -> Option<&Tensor> {
        self.current_v.as_ref()
    }
    pub fn current_a(&self) -> Option<&Tensor> {
        self.current_a.as_ref()
    }
    pub fn current_mask(&self) -> Option<&Tensor> {
        self.current_mask.as_ref()
    }
    pub fn labels(&self) -> Option<&Tensor> {
        self.labels.as_ref()
    }
    pub fn label_mask(&self) -> Option<&Tensor> {
        self.label_mask.as_ref()
    }
    /// Beam-search predictions of the last inference-mode decoder layer.
    pub fn pred(&self) -> Option<&DecodeOutput> {
        self.pred.as_ref()
    }
    pub fn description(&self) -> &NetworkDescription {
        &self.description
    }

    /// L2 penalty of every decayed weight created so far.
    pub fn weight_decay_loss(&self) -> Result<Option<Tensor>> {
        Ok(self.decay.loss()?)
    }

    /// Resolves the variable scope of a new layer: explicit names are used as
    /// given, default names get a suffix from their second use on.
    fn scope(&mut self, name: Option<&str>, default: &str) -> String {
        if let Some(name) = name {
            return name.to_string();
        }
        let count = self.scopes.entry(default.to_string()).or_insert(0);
        let scope = match *count {
            0 => default.to_string(),
            n => format!("{default}_{n}"),
        };
        *count += 1;
        scope
    }

    fn v(&self, op: &'static str) -> Result<Tensor> {
        self.current_v.clone().ok_or(Error::NotInitialized(op))
    }

    fn bn_config(&self) -> BatchNormConfig {
        BatchNormConfig {
            decay: self.config.bn_decay,
            eps: self.config.bn_epsilon,
            beta_init: self.config.bias_init,
        }
    }

    fn log_stats(&self, message: &str, scope: &str) -> Result<()> {
        if !self.network_debug {
            return Ok(());
        }
        if let Some(v) = &self.current_v {
            let (mean, var) = moments(v, None)?;
            let mean = mean.mean_all()?.to_scalar::<f32>()?;
            let var = var.mean_all()?.to_scalar::<f32>()?;
            debug!(scope, shape = ?v.dims(), mean, var, "{message}");
        }
        Ok(())
    }

    /// Stores the batch as the network input.
    pub fn create_network(&mut self, input: GraphBatch) -> Result<()> {
        if self.network_debug {
            let sizes = input.vertex_mask.sum(1)?;
            let max_size = sizes.max(0)?.to_scalar::<f32>()?;
            let avg_size = sizes.mean(0)?.to_scalar::<f32>()?;
            debug!(shape = ?input.v.dims(), max_size, avg_size, "input");
        }
        self.current_v = Some(input.v);
        self.current_a = Some(input.a);
        self.labels = Some(input.labels);
        self.current_mask = Some(input.vertex_mask);
        self.label_mask = Some(input.label_mask);
        Ok(())
    }

    /// Starts from a plain tensor, e.g. channels-last images for the CNN
    /// layers, without adjacency or masks.
    pub fn create_network_from(&mut self, v: Tensor, labels: Option<Tensor>) {
        self.current_v = Some(v);
        self.current_a = None;
        self.current_mask = None;
        self.labels = labels;
        self.label_mask = None;
    }

    fn batch_norm(&mut self, vs: VarBuilder) -> Result<Tensor> {
        let v = self.v("make_batchnorm_layer")?;
        let bn = MaskedBatchNorm::new(v.dim(D::Minus1)?, self.bn_config(), vs, self.store)?;
        let out = bn.forward_t(
            &v,
            self.current_mask.as_ref(),
            self.is_training,
            self.global_step,
        )?;
        self.current_v = Some(out.clone());
        Ok(out)
    }

    /// Optional batch norm and ReLU that close most layers.
    fn finish_layer(&mut self, vs: &VarBuilder, opts: &LayerOptions) -> Result<Tensor> {
        if opts.with_bn {
            self.batch_norm(vs.pp("batch_norm"))?;
        }
        let mut v = self.v("finish_layer")?;
        if opts.with_act_func {
            v = v.relu()?;
            self.current_v = Some(v.clone());
        }
        Ok(v)
    }

    pub fn make_batchnorm_layer(&mut self) -> Result<Tensor> {
        let scope = self.scope(None, "batch_norm");
        let out = self.batch_norm(self.store.var_builder().pp(&scope))?;
        trace!(scope, shape = ?out.dims(), "batch norm");
        self.description.push(LayerSpec::BatchNorm);
        Ok(out)
    }

    /// Dense projection of every vertex (a graph filter with zero hops).
    pub fn make_embedding_layer(
        &mut self,
        no_filters: usize,
        opts: LayerOptions,
    ) -> Result<(Tensor, Option<Tensor>, Option<Tensor>)> {
        let v = self.v("make_embedding_layer")?;
        let scope = self.scope(opts.name.as_deref(), "embed");
        let vs = self.store.var_builder().pp(&scope);
        let layer = Embedding::new(
            v.dim(D::Minus1)?,
            no_filters,
            self.config.bias_init,
            self.config.weight_decay,
            vs.clone(),
            &mut self.decay,
        )?;
        self.current_v = Some(layer.forward(&v)?);
        let v = self.finish_layer(&vs, &opts)?;
        trace!(scope, shape = ?v.dims(), "embedding");
        self.description.push(LayerSpec::Embed {
            filters: no_filters,
        });
        Ok((v, self.current_a.clone(), self.current_mask.clone()))
    }

    /// Dropout during training, identity otherwise.
    pub fn make_dropout_layer(&mut self, keep_prob: f32) -> Result<Tensor> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(Error::InvalidKeepProb(keep_prob));
        }
        let mut v = self.v("make_dropout_layer")?;
        if self.is_training && keep_prob < 1.0 {
            v = candle_nn::ops::dropout(&v, 1.0 - keep_prob)?;
            self.current_v = Some(v.clone());
        }
        self.description.push(LayerSpec::Dropout { keep_prob });
        Ok(v)
    }

    pub fn make_graphcnn_layer(&mut self, no_filters: usize, opts: LayerOptions) -> Result<Tensor> {
        let v = self.v("make_graphcnn_layer")?;
        let a = self
            .current_a
            .clone()
            .ok_or(Error::MissingAdjacency("make_graphcnn_layer"))?;
        expect_rank(&v, 3, "make_graphcnn_layer", "V of shape [B, N, F]")?;
        expect_rank(&a, 4, "make_graphcnn_layer", "A of shape [B, N, L, N]")?;
        let scope = self.scope(opts.name.as_deref(), "graph_cnn");
        let vs = self.store.var_builder().pp(&scope);
        let init = GraphConvInit {
            init_factor: self.config.graphcnn_init_factor,
            i_factor: self.config.graphcnn_i_factor,
            bias_init: self.config.bias_init,
            weight_decay: self.config.weight_decay,
        };
        let layer = GraphConv::new(
            v.dim(2)?,
            a.dim(2)?,
            no_filters,
            init,
            vs.clone(),
            &mut self.decay,
        )?;
        self.current_v = Some(layer.forward(&v, &a)?);
        let v = self.finish_layer(&vs, &opts)?;
        trace!(scope, shape = ?v.dims(), "graph convolution");
        self.log_stats("graph convolution", &scope)?;
        self.description.push(LayerSpec::GraphConv {
            filters: no_filters,
        });
        Ok(v)
    }

    /// Pools the graph onto `no_vertices` vertices. The vertex mask no longer
    /// applies afterwards and is cleared.
    pub fn make_graph_embed_pooling(
        &mut self,
        no_vertices: usize,
        opts: LayerOptions,
    ) -> Result<(Tensor, Option<Tensor>, Option<Tensor>)> {
        let v = self.v("make_graph_embed_pooling")?;
        expect_rank(&v, 3, "make_graph_embed_pooling", "V of shape [B, N, F]")?;
        let scope = self.scope(opts.name.as_deref(), "graph_embed_pool");
        let vs = self.store.var_builder().pp(&scope);
        let layer = GraphEmbedPool::new(
            v.dim(2)?,
            no_vertices,
            self.config.bias_init,
            self.config.weight_decay,
            vs.clone(),
            &mut self.decay,
        )?;
        let (v, a) = layer.forward(&v, self.current_a.as_ref(), self.current_mask.as_ref())?;
        self.current_v = Some(v);
        self.current_a = a;
        self.current_mask = None;
        let v = self.finish_layer(&vs, &opts)?;
        trace!(scope, shape = ?v.dims(), "graph embed pooling");
        self.log_stats("graph embed pooling", &scope)?;
        self.description.push(LayerSpec::GraphEmbedPool {
            vertices: no_vertices,
        });
        Ok((v, self.current_a.clone(), None))
    }

    /// Fully-connected layer; `V` is flattened to `[B, -1]` first.
    pub fn make_fc_layer(&mut self, no_filters: usize, opts: LayerOptions) -> Result<Tensor> {
        let mut v = self.v("make_fc_layer")?;
        self.current_mask = None;
        if v.rank() > 2 {
            v = v.flatten_from(1)?;
        }
        let scope = self.scope(opts.name.as_deref(), "fc");
        let vs = self.store.var_builder().pp(&scope);
        let layer = Embedding::new(
            v.dim(D::Minus1)?,
            no_filters,
            self.config.bias_init,
            self.config.weight_decay,
            vs.clone(),
            &mut self.decay,
        )?;
        self.current_v = Some(layer.forward(&v)?);
        let v = self.finish_layer(&vs, &opts)?;
        trace!(scope, shape = ?v.dims(), "fully connected");
        self.description.push(LayerSpec::Fc {
            filters: no_filters,
        });
        Ok(v)
    }

    /// 2D convolution of channels-last image data `[B, H, W, C]`.
    pub fn make_cnn_layer(&mut self, no_filters: usize, opts: ConvOptions) -> Result<Tensor> {
        let v = self.v("make_cnn_layer")?;
        expect_rank(&v, 4, "make_cnn_layer", "V of shape [B, H, W, C]")?;
        if opts.filter_size == 0 || opts.stride == 0 {
            return Err(Error::InvalidConvOptions {
                filter_size: opts.filter_size,
                stride: opts.stride,
            });
        }
        expect_spatial(&v, "make_cnn_layer")?;
        let scope = self.scope(opts.layer.name.as_deref(), "conv");
        let vs = self.store.var_builder().pp(&scope);
        let layer = Conv2dLayer::new(
            v.dim(3)?,
            no_filters,
            opts.filter_size,
            opts.stride,
            opts.padding,
            self.config.bias_init,
            self.config.weight_decay,
            vs.clone(),
            &mut self.decay,
        )?;
        self.current_v = Some(layer.forward(&v)?);
        let v = self.finish_layer(&vs, &opts.layer)?;
        trace!(scope, shape = ?v.dims(), "convolution");
        self.description.push(LayerSpec::Conv {
            filters: no_filters,
        });
        Ok(v)
    }

    /// 3x3 max pooling with stride 2.
    pub fn make_pool_layer(&mut self, padding: Padding) -> Result<Tensor> {
        let v = self.v("make_pool_layer")?;
        expect_rank(&v, 4, "make_pool_layer", "V of shape [B, H, W, C]")?;
        expect_spatial(&v, "make_pool_layer")?;
        let scope = self.scope(None, "pool");
        let v = max_pool(&v, padding)?;
        trace!(scope, shape = ?v.dims(), "max pooling");
        self.current_v = Some(v.clone());
        self.description.push(LayerSpec::Pool);
        Ok(v)
    }

    /// LSTM decoder started from `V: [B, number_units]`.
    ///
    /// In training `V` becomes the teacher-forced logits `[B, T, vocab_size]`
    /// for the labels. Otherwise beam search runs first and its result is
    /// kept in [`pred`](Self::pred); `V` then becomes the teacher-forced
    /// logits of the labels if there are any, of the best hypothesis if not.
    pub fn make_rnn_layer(
        &mut self,
        number_units: usize,
        embedding_size: usize,
        vocab_size: usize,
    ) -> Result<Tensor> {
        let v = self.v("make_rnn_layer")?;
        match v.dims() {
            [_, units] if *units == number_units => {}
            dims => {
                return Err(Error::ShapeMismatch {
                    layer: "make_rnn_layer",
                    expected: format!("V of shape [B, {number_units}]"),
                    actual: format!("{dims:?}"),
                })
            }
        }
        let scope = self.scope(None, "decoder");
        let decoder = SequenceDecoder::new(
            number_units,
            embedding_size,
            vocab_size,
            self.config.decoder.init_range,
            self.store.var_builder().pp(&scope),
        )?;
        let go = self.config.decoder.go_token;
        let logits = if self.is_training {
            let labels = match &self.labels {
                Some(labels) if labels.dim(1)? > 0 => labels.clone(),
                _ => return Err(Error::MissingLabels("make_rnn_layer")),
            };
            decoder.forward_teacher_forced(&v, &labels, go)?
        } else {
            let decoded = decoder.beam_search(&v, &self.config.decoder)?;
            let targets = match &self.labels {
                Some(labels) if labels.dim(1)? > 0 => labels.clone(),
                _ => decoded.best()?,
            };
            self.pred = Some(decoded);
            decoder.forward_teacher_forced(&v, &targets, go)?
        };
        trace!(scope, shape = ?logits.dims(), training = self.is_training, "decoder");
        self.current_v = Some(logits.clone());
        self.description.push(LayerSpec::Rnn {
            units: number_units,
            embedding_size,
            vocab_size,
        });
        Ok(logits)
    }

    /// Applies one layer with the default options of its `make_*` method.
    pub fn make_layer(&mut self, layer: &LayerSpec) -> Result<Tensor> {
        match *layer {
            LayerSpec::Embed { filters } => Ok(self
                .make_embedding_layer(filters, LayerOptions::default())?
                .0),
            LayerSpec::GraphConv { filters } => {
                self.make_graphcnn_layer(filters, LayerOptions::default())
            }
            LayerSpec::GraphEmbedPool { vertices } => Ok(self
                .make_graph_embed_pooling(vertices, LayerOptions::default())?
                .0),
            LayerSpec::Fc { filters } => self.make_fc_layer(filters, LayerOptions::dense()),
            LayerSpec::Conv { filters } => self.make_cnn_layer(filters, ConvOptions::default()),
            LayerSpec::Pool => self.make_pool_layer(Padding::Same),
            LayerSpec::Dropout { keep_prob } => self.make_dropout_layer(keep_prob),
            LayerSpec::BatchNorm => self.make_batchnorm_layer(),
            LayerSpec::Rnn {
                units,
                embedding_size,
                vocab_size,
            } => self.make_rnn_layer(units, embedding_size, vocab_size),
        }
    }

    /// Applies every layer of `layers` in order and returns the final `V`.
    pub fn build(&mut self, layers: &[LayerSpec]) -> Result<Tensor> {
        let mut v = self.v("build")?;
        for layer in layers {
            v = self.make_layer(layer)?;
        }
        Ok(v)
    }
}

fn expect_rank(xs: &Tensor, rank: usize, layer: &'static str, expected: &str) -> Result<()> {
    if xs.rank() == rank {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            layer,
            expected: expected.to_string(),
            actual: format!("{:?}", xs.dims()),
        })
    }
}

fn expect_spatial(xs: &Tensor, layer: &'static str) -> Result<()> {
    match xs.dims() {
        [_, h, w, _] if *h > 0 && *w > 0 => Ok(()),
        dims => Err(Error::ShapeMismatch {
            layer,
            expected: "non-empty spatial axes".to_string(),
            actual: format!("{dims:?}"),
        }),
    }
}
