use candle_core::{DType, Device, Result, Tensor};

/// Positions of the non-zero entries of a 1-D mask.
pub fn mask_to_index(mask: &Tensor) -> Result<Tensor> {
    let idx: Vec<u32> = mask
        .to_dtype(DType::U8)?
        .to_vec1()?
        .into_iter()
        .enumerate()
        .filter_map(|(idx, m): (_, u8)| if m == 0 { None } else { Some(idx as u32) })
        .collect();
    let len = idx.len();
    Tensor::from_vec(idx, len, mask.device())
}

/// `[B, max_len]` f32 mask with `lengths[b]` leading ones per row.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}
