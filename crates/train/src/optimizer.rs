//! Optimisers over the colour network's variables.
//!
//! `adam` maps onto candle's [`AdamW`] with zero weight decay. `sgd` is
//! momentum SGD with Nesterov look-ahead, implemented against the same
//! [`Optimizer`] trait so both are driven identically.

use candle_core::{backprop::GradStore, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use canet_common::OptimizerKind;

// ── SGD with Nesterov momentum ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
        }
    }
}

/// ```text
/// v ← μ·v + g
/// p ← p − lr·(g + μ·v)
/// ```
pub struct SgdNesterov {
    vars: Vec<(Var, Var)>,
    params: ParamsSgd,
}

impl Optimizer for SgdNesterov {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|v| {
                let velocity = Var::zeros(v.shape(), v.dtype(), v.device())?;
                Ok((v, velocity))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let mu = self.params.momentum;
        let lr = self.params.lr;
        for (var, velocity) in &self.vars {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next_v = (velocity.as_tensor().affine(mu, 0.0)? + g)?;
            let update = (g + next_v.affine(mu, 0.0)?)?;
            var.set(&(var.as_tensor() - update.affine(lr, 0.0)?)?)?;
            velocity.set(&next_v)?;
        }
        Ok(())
    }
}

// ── Selection ───────────────────────────────────────────────────────────────

/// The optimiser chosen by [`OptimizerKind`].
pub enum TrainOptimizer {
    Adam(AdamW),
    Sgd(SgdNesterov),
}

impl TrainOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Self::Sgd(SgdNesterov::new(
                vars,
                ParamsSgd {
                    lr,
                    ..Default::default()
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn scalar_var(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn nesterov_momentum_update() {
        let p = scalar_var(1.0);
        let mut opt = SgdNesterov::new(
            vec![p.clone()],
            ParamsSgd {
                lr: 0.1,
                momentum: 0.9,
            },
        )
        .unwrap();
        // d/dp (2p) = 2 at every step.
        for _ in 0..2 {
            let grads = p.as_tensor().affine(2.0, 0.0).unwrap().sum_all().unwrap().backward().unwrap();
            opt.step(&grads).unwrap();
        }
        // step 1: v = 2,   p = 1 − 0.1·(2 + 1.8)  = 0.62
        // step 2: v = 3.8, p = 0.62 − 0.1·(2 + 3.42) = 0.078
        assert!((value(&p) - 0.078).abs() < 1e-5, "{}", value(&p));
    }

    #[test]
    fn missing_gradient_leaves_parameter_untouched() {
        let p = scalar_var(1.0);
        let q = scalar_var(3.0);
        let mut opt = TrainOptimizer::new(OptimizerKind::Sgd, vec![p.clone(), q.clone()], 0.1).unwrap();
        let grads = p.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        assert!(value(&p) < 1.0);
        assert_eq!(value(&q), 3.0);
    }

    #[test]
    fn adam_descends_and_learning_rate_is_settable() {
        let p = scalar_var(1.0);
        let mut opt = TrainOptimizer::new(OptimizerKind::Adam, vec![p.clone()], 0.01).unwrap();
        assert_eq!(opt.learning_rate(), 0.01);
        let grads = p.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        assert!(value(&p) < 1.0);
        opt.set_learning_rate(1e-4);
        assert_eq!(opt.learning_rate(), 1e-4);
    }
}
