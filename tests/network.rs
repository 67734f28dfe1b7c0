use candle_core::{Device, IndexOp, Tensor};
use candle_nn::{loss, Optimizer};

use graphcnn::data::{Edge, Graph, GraphBatch};
use graphcnn::network::{GraphCnnNetwork, LayerOptions, NetworkDescription};
use graphcnn::store::ParamStore;
use graphcnn::NetworkConfig;

// rings are labelled 0, stars 1
fn dataset() -> Vec<Graph> {
    let mut graphs = Vec::new();
    for n in 4..10 {
        let ring = (0..n)
            .flat_map(|i| [Edge::new(i, (i + 1) % n, 0), Edge::new((i + 1) % n, i, 0)])
            .collect();
        graphs.push(Graph::new(vec![vec![1.0]; n], ring, vec![0]));
        let star = (1..n)
            .flat_map(|i| [Edge::new(0, i, 0), Edge::new(i, 0, 0)])
            .collect();
        graphs.push(Graph::new(vec![vec![1.0]; n], star, vec![1]));
    }
    graphs
}

fn forward(
    store: &ParamStore,
    batch: &GraphBatch,
    layers: &NetworkDescription,
    training: bool,
) -> graphcnn::Result<Tensor> {
    let mut net = GraphCnnNetwork::new(store, NetworkConfig::default());
    net.is_training = training;
    net.create_network(batch.clone())?;
    net.build(layers.layers())?;
    net.make_fc_layer(2, LayerOptions::dense().with_act_func(false))
}

#[test]
fn training_reduces_loss() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let batch = GraphBatch::from_graphs(&dataset(), 1, &device)?;
    let targets = batch.labels.i((.., 0))?.contiguous()?;
    let layers: NetworkDescription = "embed:8,gc:16,gc:16,gep:1".parse()?;
    let store = ParamStore::new(&device);

    forward(&store, &batch, &layers, true)?;
    let mut optimizer = candle_nn::AdamW::new(
        store.trainable_vars(),
        candle_nn::ParamsAdamW {
            lr: 0.01,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let mut losses = Vec::new();
    for step in 0..60 {
        let mut net = GraphCnnNetwork::new(&store, NetworkConfig::default());
        net.global_step = Some(step);
        net.create_network(batch.clone())?;
        net.build(layers.layers())?;
        let logits = net.make_fc_layer(2, LayerOptions::dense().with_act_func(false))?;
        let loss = loss::cross_entropy(&logits, &targets)?;
        let loss = match net.weight_decay_loss()? {
            Some(decay) => (loss + decay)?,
            None => loss,
        };
        optimizer.backward_step(&loss)?;
        losses.push(loss.to_scalar::<f32>()?);
    }
    let first = losses[..5].iter().sum::<f32>();
    let last = losses[losses.len() - 5..].iter().sum::<f32>();
    assert!(last < first, "loss did not decrease: {losses:?}");
    Ok(())
}

#[test]
fn checkpoint_restores_predictions() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let batch = GraphBatch::from_graphs(&dataset(), 1, &device)?;
    let layers: NetworkDescription = "gc:8,gep:2,gc:8,gep:1".parse()?;

    let store = ParamStore::new(&device);
    // one training pass moves the batch-norm statistics away from their init
    forward(&store, &batch, &layers, true)?;
    let expected = forward(&store, &batch, &layers, false)?.to_vec2::<f32>()?;
    store.save(dir.path())?;

    let mut restored = ParamStore::new(&device);
    forward(&restored, &batch, &layers, false)?;
    restored.load(dir.path())?;
    let actual = forward(&restored, &batch, &layers, false)?.to_vec2::<f32>()?;
    assert_eq!(expected, actual);
    Ok(())
}
