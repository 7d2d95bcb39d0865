use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{loss, Optimizer, SGD};

/// Cross-entropy of step-t logits against the token at step t+1, every
/// (row, step) pair weighted equally. The last step has no target and is
/// dropped.
///
/// `logits` is `(batch, max_size, t_nwords)`, `targets` `(batch, max_size)`.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, max_size, t_nwords) = logits.dims3()?;
    let steps = max_size - 1;
    let logits = logits
        .narrow(1, 0, steps)?
        .contiguous()?
        .reshape((batch_size * steps, t_nwords))?;
    let targets = targets
        .narrow(1, 1, steps)?
        .contiguous()?
        .reshape(batch_size * steps)?;
    loss::cross_entropy(&logits, &targets)
}

/// Global L2 norm of the gradients of `vars`. When it exceeds `max_norm`
/// every gradient is scaled by `max_norm / norm`. Returns the norm measured
/// before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_squared = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_squared += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sum_squared.sqrt();

    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Step decay: the rate stays at its initial value for the first
/// `decay_after` epochs, then is multiplied by `factor` at the start of
/// every later epoch.
#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    lr: f64,
    decay_after: usize,
    factor: f64,
}

impl LrSchedule {
    pub fn new(lr_init: f64, decay_after: usize, factor: f64) -> Self {
        Self {
            lr: lr_init,
            decay_after,
            factor,
        }
    }

    /// Call once at the start of each epoch (1-based). Returns the rate to
    /// use for that epoch.
    pub fn on_epoch_start(&mut self, epoch: usize) -> f64 {
        if epoch > self.decay_after {
            self.lr *= self.factor;
        }
        self.lr
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub grad_norm: f64,
    pub lr: f64,
}

/// Plain SGD over every trainable variable with global norm clipping
/// before each update.
pub struct ClippedSgd {
    sgd: SGD,
    vars: Vec<Var>,
    max_grad_norm: f64,
}

impl ClippedSgd {
    pub fn new(vars: Vec<Var>, lr: f64, max_grad_norm: f64) -> Result<Self> {
        let sgd = SGD::new(vars.clone(), lr)?;
        Ok(Self {
            sgd,
            vars,
            max_grad_norm,
        })
    }

    /// Backward pass, clip, then one update at `lr`. Gradients are computed
    /// and clipped before any variable changes; the update itself is applied
    /// one variable at a time.
    pub fn backward_step(&mut self, loss: &Tensor, lr: f64) -> Result<StepStats> {
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.max_grad_norm)?;
        self.sgd.set_learning_rate(lr);
        self.sgd.step(&grads)?;
        Ok(StepStats { grad_norm, lr })
    }
}
