//! Multistep noise scheduler (DPM-Solver++ 2M).
//!
//! Built from the base Stable Diffusion scheduler configuration so the noise
//! schedule matches what the `UNet` was trained on, while needing far fewer
//! steps than the default PNDM schedule.

use ndarray::Array4;

/// Noise schedule of the base model.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Number of diffusion steps the model was trained with.
    pub num_train_timesteps: usize,
    /// First beta of the scaled-linear schedule.
    pub beta_start: f64,
    /// Last beta of the scaled-linear schedule.
    pub beta_end: f64,
}

impl Default for SchedulerConfig {
    /// Stable Diffusion 1.5's scheduler configuration.
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
        }
    }
}

/// DPM-Solver++ (2M) scheduler for epsilon-predicting models.
#[derive(Debug, Clone)]
pub struct MultistepScheduler {
    alphas_cumprod: Vec<f64>,
}

impl MultistepScheduler {
    /// Build the scheduler from an existing scheduler's configuration.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let n = config.num_train_timesteps.max(1);
        let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());

        let mut cumulative = 1.0;
        let alphas_cumprod = (0..n)
            .map(|i| {
                let frac = if n == 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
                let beta = (end - start).mul_add(frac, start).powi(2);
                cumulative *= 1.0 - beta;
                cumulative
            })
            .collect();

        Self { alphas_cumprod }
    }

    /// Standard deviation of the initial noise.
    #[must_use]
    pub const fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Cumulative product of alphas, indexed by training timestep.
    #[must_use]
    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Evenly spaced training timesteps for `steps` inference steps, noisiest
    /// first.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn timesteps(&self, steps: u32) -> Vec<usize> {
        if steps == 0 {
            return Vec::new();
        }
        let last = (self.alphas_cumprod.len() - 1) as f64;
        let steps = steps as usize;

        // linspace(0, last, steps + 1), rounded, reversed, final zero dropped
        let mut timesteps: Vec<usize> = (1..=steps)
            .rev()
            .map(|i| (last * i as f64 / steps as f64).round() as usize)
            .collect();

        // Past the training schedule rounding repeats timesteps; a repeat has
        // zero log-SNR step and would divide by zero in the solver.
        timesteps.dedup();
        timesteps
    }

    /// Start a solve over `steps` inference steps.
    #[must_use]
    pub fn begin(&self, steps: u32) -> Solver<'_> {
        Solver {
            scheduler: self,
            timesteps: self.timesteps(steps),
            previous: None,
            index: 0,
        }
    }

    /// (`alpha_t`, `sigma_t`, `lambda_t`) at a training timestep.
    fn coefficients(&self, t: usize) -> (f64, f64, f64) {
        let acp = self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)];
        let alpha = acp.sqrt();
        let sigma = (1.0 - acp).sqrt();
        (alpha, sigma, alpha.ln() - sigma.ln())
    }
}

/// State of one multistep solve.
pub struct Solver<'a> {
    scheduler: &'a MultistepScheduler,
    timesteps: Vec<usize>,
    previous: Option<(Array4<f32>, f64)>,
    index: usize,
}

impl Solver<'_> {
    /// Timesteps this solve visits, in order.
    #[must_use]
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Whether every timestep has been stepped.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.index >= self.timesteps.len()
    }

    /// Advance `sample` by one step given the model's noise prediction.
    ///
    /// The first step is first order, later steps second order. The last step
    /// lands on the clean sample (sigma 0).
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(&mut self, noise_pred: &Array4<f32>, sample: &Array4<f32>) -> Array4<f32> {
        let Some(&t) = self.timesteps.get(self.index) else {
            return sample.clone();
        };
        self.index += 1;

        let (alpha_t, sigma_t, lambda_t) = self.scheduler.coefficients(t);
        let x0 = (sample - &(noise_pred * sigma_t as f32)) / alpha_t as f32;

        let Some(&s) = self.timesteps.get(self.index) else {
            self.previous = None;
            return x0;
        };
        let (alpha_s, sigma_s, lambda_s) = self.scheduler.coefficients(s);
        let h = lambda_s - lambda_t;
        let decay = alpha_s * ((-h).exp() - 1.0);

        let mut next = sample * (sigma_s / sigma_t) as f32 - &(&x0 * decay as f32);

        if let Some((prev_x0, prev_lambda)) = &self.previous {
            let r0 = (lambda_t - prev_lambda) / h;
            let d1 = (&x0 - prev_x0) / r0 as f32;
            next = next - d1 * (0.5 * decay) as f32;
        }

        self.previous = Some((x0, lambda_t));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> MultistepScheduler {
        MultistepScheduler::from_config(&SchedulerConfig::default())
    }

    #[test]
    fn test_alphas_cumprod_decreasing() {
        let s = scheduler();
        let acp = s.alphas_cumprod();

        assert_eq!(acp.len(), 1000);
        assert!(acp.windows(2).all(|w| w[1] < w[0]));
        assert!(acp[0] < 1.0 && acp[999] > 0.0);
    }

    #[test]
    fn test_timesteps_spacing() {
        let ts = scheduler().timesteps(30);

        assert_eq!(ts.len(), 30);
        assert_eq!(ts[0], 999);
        assert!(ts.windows(2).all(|w| w[1] < w[0]));
        assert!(ts.iter().all(|&t| t > 0));
    }

    #[test]
    fn test_timesteps_never_repeat() {
        let s = scheduler();

        for steps in [999, 1000, 1500, 5000] {
            let ts = s.timesteps(steps);
            assert!(ts.windows(2).all(|w| w[1] < w[0]), "steps {steps}");
            assert!(ts.len() <= 1000);
            assert_eq!(ts[0], 999);
        }
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_long_solve_stays_finite() {
        let s = scheduler();
        let mut sample = Array4::<f32>::from_shape_fn((1, 4, 4, 4), |(_, c, y, x)| {
            ((c + y + x) % 5) as f32 / 2.5 - 1.0
        });

        for steps in [1000, 1500] {
            let mut solver = s.begin(steps);
            let mut i = 0_usize;
            while !solver.is_done() {
                // Noise prediction that changes every step
                let eps = sample.mapv(|v| (v + i as f32 * 0.01).sin());
                sample = solver.step(&eps, &sample);
                i += 1;
            }

            assert!(sample.iter().all(|v| v.is_finite()), "steps {steps}");
        }
    }

    #[test]
    fn test_zero_steps_has_no_timesteps() {
        let s = scheduler();
        assert!(s.timesteps(0).is_empty());
        assert!(s.begin(0).is_done());
    }

    /// With a perfect noise prediction the solver must land on the clean
    /// sample whatever the step count.
    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_recovers_clean_sample_with_oracle() {
        let s = scheduler();
        let x0 = Array4::<f32>::from_shape_fn((1, 4, 8, 8), |(_, c, y, x)| {
            (c as f32).mul_add(0.1, (x as f32 - y as f32) * 0.05)
        });
        let eps = Array4::<f32>::from_shape_fn((1, 4, 8, 8), |(_, c, y, x)| {
            ((c + 2 * y + 3 * x) % 7) as f32 / 3.5 - 1.0
        });

        for steps in [1, 2, 5, 20] {
            let mut solver = s.begin(steps);
            let (alpha, sigma, _) = s.coefficients(solver.timesteps()[0]);
            let mut sample = &x0 * alpha as f32 + &eps * sigma as f32;

            while !solver.is_done() {
                let t = solver.timesteps()[solver.index];
                let (alpha_t, sigma_t, _) = s.coefficients(t);
                let oracle = (&sample - &(&x0 * alpha_t as f32)) / sigma_t as f32;
                sample = solver.step(&oracle, &sample);
            }

            let max_err = (&sample - &x0)
                .iter()
                .fold(0.0_f32, |acc, v| acc.max(v.abs()));
            assert!(max_err < 1e-3, "steps {steps}: error {max_err}");
        }
    }

    #[test]
    fn test_step_past_end_is_identity() {
        let s = scheduler();
        let mut solver = s.begin(1);
        let sample = Array4::<f32>::ones((1, 4, 2, 2));
        let _ = solver.step(&Array4::zeros((1, 4, 2, 2)), &sample);

        assert!(solver.is_done());
        assert_eq!(solver.step(&Array4::zeros((1, 4, 2, 2)), &sample), sample);
    }
}
