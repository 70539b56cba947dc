use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, IndexOp, Tensor};

/// Returns `tensor` cast to `dtype` only when needed.
pub fn to_dtype_if_needed(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Builds the `[1, seq]` `I64` id tensor decoder graphs take as `input_ids`.
pub fn token_ids_tensor(tokens: &[u32], device: &Device) -> Result<Tensor> {
    let ids: Vec<i64> = tokens.iter().map(|&id| i64::from(id)).collect();
    let len = ids.len();
    Ok(Tensor::from_vec(ids, (1, len), device)?)
}

/// Scores of the final sequence position of the first batch row.
///
/// Accepts `[batch, seq, vocab]` logits (and `[seq, vocab]` for graphs that
/// drop the batch axis) and returns them as `f32`.
pub fn last_position_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let row = match logits.rank() {
        3 => logits.i(0)?,
        2 => logits.clone(),
        rank => bail!("decoder logits must have rank 2 or 3, got rank {rank}"),
    };
    let (seq_len, vocab) = row.dims2()?;
    ensure!(seq_len > 0, "decoder logits have an empty sequence axis");
    ensure!(vocab > 0, "decoder logits have an empty vocabulary axis");
    let last = row.i(seq_len - 1)?;
    Ok(to_dtype_if_needed(&last, DType::F32)?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_have_batch_axis() -> Result<()> {
        let ids = token_ids_tensor(&[0, 42, 7], &Device::Cpu)?;
        assert_eq!(ids.dims2()?, (1, 3));
        assert_eq!(ids.dtype(), DType::I64);
        assert_eq!(ids.to_vec2::<i64>()?, vec![vec![0, 42, 7]]);
        Ok(())
    }

    #[test]
    fn last_position_is_selected() -> Result<()> {
        let logits = Tensor::from_vec(
            vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0],
            (1, 2, 3),
            &Device::Cpu,
        )?;
        assert_eq!(last_position_logits(&logits)?, vec![4.0, 5.0, 6.0]);
        let flat = logits.squeeze(0)?;
        assert_eq!(last_position_logits(&flat)?, vec![4.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn rank_one_logits_are_rejected() -> Result<()> {
        let logits = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        assert!(last_position_logits(&logits).is_err());
        Ok(())
    }
}
