use candle_core::{DType, Device, IndexOp, D};
use candle_nn::{loss, Optimizer};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use graphcnn::data::{Edge, Graph, GraphBatchLoader};
use graphcnn::network::{GraphCnnNetwork, LayerOptions, NetworkDescription};
use graphcnn::store::ParamStore;
use graphcnn::NetworkConfig;

const NUM_CLASSES: usize = 3;

// ring, star or path, with a one-hot degree as vertex feature
fn synthetic_graph(seed: usize) -> Graph {
    let class = seed % NUM_CLASSES;
    let n = 5 + seed % 7;
    let mut edges = Vec::new();
    match class {
        0 => (0..n).for_each(|i| edges.push(Edge::new(i, (i + 1) % n, 0))),
        1 => (1..n).for_each(|i| edges.push(Edge::new(0, i, 0))),
        _ => (0..n - 1).for_each(|i| edges.push(Edge::new(i, i + 1, 0))),
    }
    let mut degree = vec![0usize; n];
    for e in &edges {
        degree[e.source] += 1;
        degree[e.target] += 1;
    }
    let features = degree
        .iter()
        .map(|&d| (0..4).map(|k| if d.min(3) == k { 1.0 } else { 0.0 }).collect())
        .collect();
    Graph::new(features, edges, vec![class as u32]).undirected()
}

// RUST_LOG=info cargo run --example synthetic
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let device = Device::cuda_if_available(0)?;

    let graphs: Vec<Graph> = (0..240).map(synthetic_graph).collect();
    let (train, test) = graphs.split_at(192);
    let layers: NetworkDescription = "embed:16,gc:32,gc:32,gep:4,gc:32,gep:1,dropout:0.8".parse()?;
    info!(%layers, train = train.len(), test = test.len(), "synthetic graph classification");

    let store = ParamStore::new(&device);
    let config = NetworkConfig::default();
    let mut optimizer = None;
    let mut step = 0u64;

    let epochs = 30;
    let bar = ProgressBar::new(epochs);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40} {pos}/{len} epochs {msg}",
    )?);
    for epoch in 0..epochs {
        let mut epoch_loss = 0.0;
        let mut batches = 0;
        for batch in GraphBatchLoader::new(train, 32, 1, &device) {
            let batch = batch?;
            let targets = batch.labels.i((.., 0))?.contiguous()?;
            let mut net = GraphCnnNetwork::new(&store, config.clone());
            net.global_step = Some(step);
            net.create_network(batch)?;
            net.build(layers.layers())?;
            let logits =
                net.make_fc_layer(NUM_CLASSES, LayerOptions::dense().with_act_func(false))?;
            let mut loss = loss::cross_entropy(&logits, &targets)?;
            if let Some(decay) = net.weight_decay_loss()? {
                loss = (loss + decay)?;
            }

            // variables only exist after the first forward pass
            if optimizer.is_none() {
                optimizer = Some(candle_nn::AdamW::new(
                    store.trainable_vars(),
                    candle_nn::ParamsAdamW {
                        lr: 0.005,
                        weight_decay: 0.0,
                        ..Default::default()
                    },
                )?);
            }
            if let Some(optimizer) = optimizer.as_mut() {
                optimizer.backward_step(&loss)?;
            }
            epoch_loss += loss.to_scalar::<f32>()?;
            batches += 1;
            step += 1;
        }
        bar.set_message(format!("loss {:.4}", epoch_loss / batches as f32));
        bar.inc(1);

        if epoch % 5 == 4 {
            let mut correct = 0.0;
            for batch in GraphBatchLoader::new(test, 48, 1, &device) {
                let batch = batch?;
                let targets = batch.labels.i((.., 0))?.contiguous()?;
                let mut net = GraphCnnNetwork::new(&store, config.clone());
                net.is_training = false;
                net.create_network(batch)?;
                net.build(layers.layers())?;
                let logits =
                    net.make_fc_layer(NUM_CLASSES, LayerOptions::dense().with_act_func(false))?;
                correct += logits
                    .argmax(D::Minus1)?
                    .eq(&targets)?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?;
            }
            info!(
                epoch,
                loss = epoch_loss / batches as f32,
                accuracy = 100.0 * correct / test.len() as f32,
                "evaluated"
            );
        }
    }
    bar.finish();

    // vertex embeddings of the first test graph, without its padding
    if let Some(batch) = GraphBatchLoader::new(test, 4, 1, &device).next() {
        let batch = batch?;
        let mut net = GraphCnnNetwork::new(&store, config.clone());
        net.is_training = false;
        net.create_network(batch.clone())?;
        let (v, _, _) = net.make_embedding_layer(16, LayerOptions::default())?;
        let vertices = batch.unpad_vertices(&v, 0)?;
        let activity = vertices.mean(1)?.to_vec1::<f32>()?;
        info!(
            vertices = batch.sizes[0],
            padded = v.dim(1)?,
            ?activity,
            "first test graph after the embedding layer"
        );
    }
    store.save("checkpoints/synthetic")?;
    Ok(())
}
