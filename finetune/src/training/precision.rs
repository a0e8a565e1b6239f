use tch::{Kind, Tensor, nn};

/// Dynamic loss scaling for half-precision training on CUDA.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u32,
    growth_tracker: u32,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0, 2.0, 0.5, 2000)
    }
}

impl GradScaler {
    pub fn new(scale: f64, growth_factor: f64, backoff_factor: f64, growth_interval: u32) -> Self {
        Self {
            scale,
            growth_factor,
            backoff_factor,
            growth_interval: growth_interval.max(1),
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Shrinks the scale on overflow and grows it after `growth_interval` clean steps.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
    }

    /// Backpropagates the scaled loss, unscales the gradients of `trainable`
    /// and steps the optimizer unless one of them overflowed. Returns whether
    /// the step was taken.
    pub fn step(&mut self, optimizer: &mut nn::Optimizer, trainable: &[Tensor], loss: &Tensor) -> bool {
        optimizer.zero_grad();
        (loss * self.scale).backward();

        let inverse = 1.0 / self.scale;
        let found_inf = tch::no_grad(|| {
            let mut found_inf = false;
            for var in trainable {
                let mut grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let _ = grad.g_mul_scalar_(inverse);
                let finite = grad.isfinite().all().to_kind(Kind::Int64).int64_value(&[]);
                found_inf |= finite == 0;
            }
            found_inf
        });

        if found_inf {
            optimizer.zero_grad();
        } else {
            optimizer.step();
        }
        self.update(found_inf);
        !found_inf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;
    use tch::nn::{Module, OptimizerConfig};

    fn layer(vs: &nn::VarStore) -> nn::Linear {
        nn::linear(vs.root() / "fc", 3, 1, Default::default())
    }

    fn inputs() -> Tensor {
        Tensor::from_slice(&[1.0f32, -2.0, 0.5, 0.25, 1.5, -1.0]).view([2, 3])
    }

    #[test]
    fn backs_off_on_overflow_and_grows_after_clean_steps() {
        let mut scaler = GradScaler::new(8.0, 2.0, 0.5, 2);
        scaler.update(true);
        assert_eq!(scaler.scale(), 4.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 8.0);
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
    }

    #[test]
    fn scaled_step_matches_an_unscaled_step() {
        let plain_vs = nn::VarStore::new(Device::Cpu);
        let plain = layer(&plain_vs);
        let mut scaled_vs = nn::VarStore::new(Device::Cpu);
        let scaled = layer(&scaled_vs);
        scaled_vs.copy(&plain_vs).unwrap();

        let mut plain_opt = nn::Sgd::default().build(&plain_vs, 0.1).unwrap();
        let mut scaled_opt = nn::Sgd::default().build(&scaled_vs, 0.1).unwrap();

        plain_opt.backward_step(&plain.forward(&inputs()).sum(Kind::Float));

        let mut scaler = GradScaler::new(1024.0, 2.0, 0.5, 100);
        let loss = scaled.forward(&inputs()).sum(Kind::Float);
        assert!(scaler.step(&mut scaled_opt, &scaled_vs.trainable_variables(), &loss));

        let expected = plain_vs.variables();
        for (name, actual) in scaled_vs.variables() {
            assert!(actual.allclose(&expected[&name], 1e-5, 1e-6, false), "{name}");
        }
    }

    #[test]
    fn overflowing_gradients_skip_the_step() {
        let vs = nn::VarStore::new(Device::Cpu);
        let fc = layer(&vs);
        let before: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .map(|(name, t)| (name, t.detach().copy()))
            .collect();
        let mut optimizer = nn::Sgd::default().build(&vs, 0.1).unwrap();

        // Beyond the f32 range, so every scaled gradient is infinite.
        let mut scaler = GradScaler::new(1e40, 2.0, 0.5, 100);
        let loss = fc.forward(&inputs()).sum(Kind::Float);
        assert!(!scaler.step(&mut optimizer, &vs.trainable_variables(), &loss));
        assert_eq!(scaler.scale(), 5e39);

        let after = vs.variables();
        for (name, old) in &before {
            assert!(old.equal(&after[name]), "{name}");
        }
    }
}
