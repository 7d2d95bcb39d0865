use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Uniform initializer over `[lo, up]`, used for every trainable tensor.
pub fn uniform(lo: f64, up: f64) -> Init {
    Init::Uniform { lo, up }
}

/// `Linear` layer with both weight and bias drawn from `init`.
pub fn linear_init(in_dim: usize, out_dim: usize, init: Init, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", init)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// `(batch,)` lengths to a `(batch, max_size)` u8 mask, 1 where the
/// position lies inside the sequence.
pub fn length_mask(lens: &Tensor, max_size: usize) -> Result<Tensor> {
    let positions = Tensor::arange(0u32, max_size as u32, lens.device())?.unsqueeze(0)?;
    let lens = lens.to_dtype(DType::U32)?.unsqueeze(1)?;
    positions.broadcast_lt(&lens)
}

pub fn masked_fill(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let device = scores.device();
    let dtype = scores.dtype();
    let shape = scores.shape();

    let mask = mask.broadcast_as(shape)?;
    let mask_value = Tensor::new(f32::NEG_INFINITY, device)?
        .broadcast_as(shape)?
        .to_dtype(dtype)?;
    mask.where_cond(scores, &mask_value)
}
