use std::path::Path;

use candle_core::{DType, Device, Result, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use tracing::debug;

const PARAMS_FILE: &str = "params.safetensors";
const MOVING_FILE: &str = "moving_stats.safetensors";

/// Owns every variable a [`GraphCnnNetwork`](crate::network::GraphCnnNetwork)
/// creates.
///
/// Trainable parameters and batch-norm moving statistics live in separate
/// maps so that `trainable_vars` can be handed to an optimizer as is.
/// Variables are keyed by their scoped name, so building the same network
/// twice against one store shares its parameters.
pub struct ParamStore {
    trainable: VarMap,
    moving: VarMap,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    pub fn new(device: &Device) -> Self {
        Self {
            trainable: VarMap::new(),
            moving: VarMap::new(),
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn var_builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.trainable, self.dtype, &self.device)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.all_vars()
    }

    /// Sorted names of the trainable variables.
    pub fn trainable_names(&self) -> Result<Vec<String>> {
        let data = self
            .trainable
            .data()
            .lock()
            .map_err(|e| candle_core::Error::msg(e.to_string()))?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Fetches (creating on first use) a non-trainable statistic of `size`
    /// elements.
    pub fn moving_stat(&self, path: &str, size: usize, init: Init) -> Result<Var> {
        self.moving
            .get(size, path, init, self.dtype, &self.device)?;
        let data = self
            .moving
            .data()
            .lock()
            .map_err(|e| candle_core::Error::msg(e.to_string()))?;
        data.get(path)
            .cloned()
            .ok_or_else(|| candle_core::Error::msg(format!("missing moving statistic {path}")))
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> crate::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.trainable.save(dir.join(PARAMS_FILE))?;
        self.moving.save(dir.join(MOVING_FILE))?;
        debug!(dir = %dir.display(), "saved parameters");
        Ok(())
    }

    /// Loads a checkpoint into variables that already exist, i.e. the
    /// network has to be built once before loading.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> crate::Result<()> {
        let dir = dir.as_ref();
        self.trainable.load(dir.join(PARAMS_FILE))?;
        self.moving.load(dir.join(MOVING_FILE))?;
        debug!(dir = %dir.display(), "loaded parameters");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    #[test]
    fn moving_stat_is_shared_between_lookups() -> Result<()> {
        let store = ParamStore::new(&Device::Cpu);
        let a = store.moving_stat("bn.moving_mean", 3, Init::Const(0.0))?;
        a.set(&Tensor::new(&[1f32, 2., 3.], &Device::Cpu)?)?;
        let b = store.moving_stat("bn.moving_mean", 3, Init::Const(0.0))?;
        assert_eq!(b.to_vec1::<f32>()?, vec![1., 2., 3.]);
        assert!(store.trainable_vars().is_empty());
        Ok(())
    }

    #[test]
    fn var_builder_reuses_variables() -> Result<()> {
        let store = ParamStore::new(&Device::Cpu);
        let w1 = store
            .var_builder()
            .pp("layer")
            .get_with_hints(4, "w", Init::Randn { mean: 0., stdev: 1. })?;
        let w2 = store
            .var_builder()
            .pp("layer")
            .get_with_hints(4, "w", Init::Randn { mean: 0., stdev: 1. })?;
        assert_eq!(w1.to_vec1::<f32>()?, w2.to_vec1::<f32>()?);
        assert_eq!(store.trainable_vars().len(), 1);
        assert_eq!(store.trainable_names()?, vec!["layer.w".to_string()]);
        Ok(())
    }

    #[test]
    fn checkpoint_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ParamStore::new(&Device::Cpu);
        let w = store
            .var_builder()
            .get_with_hints(2, "w", Init::Const(0.5))?;
        store.moving_stat("m", 2, Init::Const(1.0))?;
        store.save(dir.path())?;

        let mut restored = ParamStore::new(&Device::Cpu);
        restored.var_builder().get_with_hints(2, "w", Init::Const(0.0))?;
        restored.moving_stat("m", 2, Init::Const(0.0))?;
        restored.load(dir.path())?;

        let w2 = restored.var_builder().get_with_hints(2, "w", Init::Const(0.0))?;
        assert_eq!(w.to_vec1::<f32>()?, w2.to_vec1::<f32>()?);
        let m = restored.moving_stat("m", 2, Init::Const(0.0))?;
        assert_eq!(m.to_vec1::<f32>()?, vec![1., 1.]);
        Ok(())
    }
}
