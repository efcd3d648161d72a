//! MLP / Slot Attention mix.
//!
//! At evaluation time only the MLP branch runs. At training time both branches
//! run and every sample takes the output of the branch it was assigned to;
//! if one branch got no samples, one random sample is moved onto it so both
//! branches see gradient every step.

use std::sync::Mutex;

use candle_core::{Module, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use projector_core::{
    Branch, ProjectorError, ProjectorInput, ProjectorKind, ProjectorOutput, ProjectorResult,
    VisionProjector,
};

use crate::batching::{check_batch, map_streams};
use crate::layers::{flatten_time, Mlp};
use crate::slot::SlotAttention;

/// Make sure both branches are used.
///
/// When every entry points at the same branch, one uniformly chosen entry is
/// flipped. Returns the flipped index.
pub fn rebalance_assignment<R: Rng + ?Sized>(
    assignment: &mut [Branch],
    rng: &mut R,
) -> Option<usize> {
    let first = *assignment.first()?;
    if assignment.iter().any(|&b| b != first) {
        return None;
    }
    let idx = rng.gen_range(0..assignment.len());
    assignment[idx] = first.flipped();
    Some(idx)
}

/// Projector that mixes an MLP and a Slot Attention branch.
pub struct MultiProjector {
    mlp: Mlp,
    sa: SlotAttention,
    training: bool,
    rng: Mutex<StdRng>,
}

impl MultiProjector {
    /// Create the projector; `seed = None` seeds the RNG from entropy.
    pub fn new(mlp: Mlp, sa: SlotAttention, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(mlp, sa, rng)
    }

    /// Create the projector with an explicit random source.
    pub fn with_rng(mlp: Mlp, sa: SlotAttention, rng: StdRng) -> Self {
        Self {
            mlp,
            sa,
            training: false,
            rng: Mutex::new(rng),
        }
    }

    /// Training forward over `[batch, tokens, c]`.
    ///
    /// `assignment` is rebalanced in place. Returns one tensor per sample in
    /// input order: `[tokens, hidden]` for MLP samples, `[num_slots, hidden]`
    /// for slot samples.
    pub fn forward_train(
        &self,
        inputs: &Tensor,
        assignment: &mut [Branch],
    ) -> ProjectorResult<Vec<Tensor>> {
        let batch = inputs.dim(0)?;
        if assignment.len() != batch {
            return Err(ProjectorError::InvalidAssignment(format!(
                "{} entries for a batch of {}",
                assignment.len(),
                batch
            )));
        }

        let feat_mlp = self.mlp.forward(inputs)?;
        let feat_sa = self.sa.forward(inputs)?;

        let flipped = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rebalance_assignment(assignment, &mut *rng)
        };
        if let Some(idx) = flipped {
            debug!(index = idx, branch = ?assignment[idx], "rebalanced branch assignment");
        }

        let output = assignment
            .iter()
            .enumerate()
            .map(|(i, branch)| match branch {
                Branch::Mlp => feat_mlp.get(i),
                Branch::Slot => feat_sa.get(i),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        if output.len() != batch {
            return Err(ProjectorError::BatchMismatch {
                expected: batch,
                actual: output.len(),
            });
        }
        Ok(output)
    }
}

impl VisionProjector for MultiProjector {
    fn kind(&self) -> ProjectorKind {
        ProjectorKind::MlpSlot
    }

    fn output_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        if !self.training {
            return map_streams(input, |x| self.mlp.forward(x));
        }
        let assignment = assignment.ok_or_else(|| {
            ProjectorError::InvalidAssignment("training forward requires an assignment".to_string())
        })?;
        let mut branches = Branch::from_tensor(assignment)?;
        self.forward_assigned(input, &mut branches)
    }

    fn forward_assigned(
        &self,
        input: &ProjectorInput,
        assignment: &mut [Branch],
    ) -> ProjectorResult<ProjectorOutput> {
        if !self.training {
            return map_streams(input, |x| self.mlp.forward(x));
        }

        let inputs = match input {
            ProjectorInput::Tensor(x) => flatten_time(x)?,
            other => {
                return Err(ProjectorError::UnsupportedInput(format!(
                    "mlpslot training expects a single tensor, got {}",
                    other.variant_name()
                )))
            }
        };
        let output = ProjectorOutput::Batch(self.forward_train(&inputs, assignment)?);
        check_batch(input.batch_size()?, &output)?;
        Ok(output)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn build(seed: u64) -> MultiProjector {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mlp = Mlp::new(2, 8, 6, vb.pp("mlp")).unwrap();
        let sa = SlotAttention::new(3, 8, 3, 6, 6, 1e-4, vb.pp("sa")).unwrap();
        MultiProjector::new(mlp, sa, Some(seed))
    }

    #[test]
    fn test_rebalance_all_mlp() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut assignment = vec![Branch::Mlp; 5];
        let idx = rebalance_assignment(&mut assignment, &mut rng).unwrap();
        assert_eq!(assignment[idx], Branch::Slot);
        assert_eq!(assignment.iter().filter(|b| **b == Branch::Slot).count(), 1);
    }

    #[test]
    fn test_rebalance_all_slot() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut assignment = vec![Branch::Slot; 4];
        let idx = rebalance_assignment(&mut assignment, &mut rng).unwrap();
        assert_eq!(assignment[idx], Branch::Mlp);
        assert_eq!(assignment.iter().filter(|b| **b == Branch::Mlp).count(), 1);
    }

    #[test]
    fn test_rebalance_mixed_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut assignment = vec![Branch::Slot, Branch::Mlp];
        assert!(rebalance_assignment(&mut assignment, &mut rng).is_none());
        assert_eq!(assignment, vec![Branch::Slot, Branch::Mlp]);
    }

    #[test]
    fn test_training_output_order() {
        let device = Device::Cpu;
        let mut projector = build(0);
        projector.set_training(true);

        let x = Tensor::randn(0f32, 1f32, (3, 5, 8), &device).unwrap();
        let mut branches = vec![Branch::Slot, Branch::Mlp, Branch::Slot];
        let out = projector.forward_train(&x, &mut branches).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].dims(), &[3, 6]);
        assert_eq!(out[1].dims(), &[5, 6]);
        assert_eq!(out[2].dims(), &[3, 6]);

        let mlp_row = projector.mlp.forward(&x).unwrap().get(1).unwrap();
        let diff = (&out[1] - mlp_row).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_training_forward_rebalances() {
        let device = Device::Cpu;
        let mut projector = build(1);
        projector.set_training(true);
        assert!(projector.is_training());

        let x = Tensor::randn(0f32, 1f32, (4, 5, 8), &device).unwrap();
        let assignment = Tensor::zeros((4, 1), DType::U32, &device).unwrap();
        let out = projector
            .forward(&ProjectorInput::Tensor(x), Some(&assignment))
            .unwrap()
            .into_batch()
            .unwrap();
        assert_eq!(out.len(), 4);
        let slot_rows = out.iter().filter(|t| t.dims() == [3, 6]).count();
        assert_eq!(slot_rows, 1);
    }

    #[test]
    fn test_forward_assigned_reports_flip() {
        let device = Device::Cpu;
        let mut projector = build(4);
        projector.set_training(true);

        let x = Tensor::randn(0f32, 1f32, (3, 5, 8), &device).unwrap();
        let mut branches = vec![Branch::Mlp; 3];
        let out = projector
            .forward_assigned(&ProjectorInput::Tensor(x), &mut branches)
            .unwrap()
            .into_batch()
            .unwrap();

        let flipped: Vec<usize> = (0..3).filter(|&i| branches[i] == Branch::Slot).collect();
        assert_eq!(flipped.len(), 1);
        assert_eq!(out[flipped[0]].dims(), &[3, 6]);

        let codes = Branch::to_tensor(&branches, &device)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<u32>()
            .unwrap();
        assert_eq!(codes.iter().sum::<u32>(), 1);
    }

    #[test]
    fn test_eval_runs_mlp_only() {
        let device = Device::Cpu;
        let projector = build(2);
        let x = Tensor::randn(0f32, 1f32, (2, 5, 8), &device).unwrap();
        let out = projector
            .forward(&ProjectorInput::Tensor(x), None)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.dims(), &[2, 5, 6]);
    }

    #[test]
    fn test_training_requires_assignment() {
        let device = Device::Cpu;
        let mut projector = build(3);
        projector.set_training(true);
        let x = Tensor::randn(0f32, 1f32, (2, 5, 8), &device).unwrap();
        let err = projector
            .forward(&ProjectorInput::Tensor(x), None)
            .unwrap_err();
        assert!(matches!(err, ProjectorError::InvalidAssignment(_)));
    }
}
