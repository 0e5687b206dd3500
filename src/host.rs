use std::fmt;

use tracing::info;

use crate::{
    error::Result,
    inference::InferenceResult,
    model::DepthPoseEstimator,
    sequence::FrameSequence,
    session::{ComputeSession, SessionBackend, SessionSettings},
};

/// Stages of a demo run, in the only order they can occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStage {
    Start,
    ConfigResolved,
    SequenceLoaded,
    ModelConstructed,
    SessionBound,
    InferenceExecuted,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Start => "start",
            RunStage::ConfigResolved => "config resolved",
            RunStage::SequenceLoaded => "sequence loaded",
            RunStage::ModelConstructed => "model constructed",
            RunStage::SessionBound => "session bound",
            RunStage::InferenceExecuted => "inference executed",
        };
        f.write_str(name)
    }
}

pub fn log_stage(stage: RunStage) {
    info!(%stage, "run stage");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub calibrated: bool,
    pub iters: usize,
    pub viz: bool,
}

/// Owns the compute session of a run and drives a single inference call.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionHost {
    settings: SessionSettings,
}

impl ExecutionHost {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Opens the session, binds `estimator`, then infers once over `sequence`.
    ///
    /// Intrinsics are handed to the estimator only for calibrated requests. The
    /// session is released before this returns, whether or not inference succeeded.
    pub fn run<B, E>(
        &self,
        estimator: &mut E,
        sequence: &FrameSequence,
        request: RunRequest,
    ) -> Result<InferenceResult>
    where
        B: SessionBackend,
        E: DepthPoseEstimator<B>,
    {
        let session = ComputeSession::<B>::open(self.settings);
        estimator.bind(&session)?;
        log_stage(RunStage::SessionBound);

        let images = sequence.to_batch::<B>(session.device())?;
        let intrinsics = request.calibrated.then(|| sequence.intrinsics());
        let result = estimator.infer(images, intrinsics, request.iters, request.viz)?;
        log_stage(RunStage::InferenceExecuted);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        inference::DepthMap,
        sequence::{FrameSelection, INTRINSICS_FILE, Intrinsics, load_test_sequence},
        session::released_sessions,
    };
    use burn::{backend::NdArray, prelude::*};
    use image::RgbImage;
    use nalgebra::Isometry3;
    use std::fs;

    type TestBackend = NdArray<f32>;

    #[derive(Debug, PartialEq)]
    struct Call {
        frames: usize,
        intrinsics: Option<Intrinsics>,
        iters: usize,
        viz: bool,
    }

    #[derive(Default)]
    struct RecordingEstimator {
        bound: bool,
        calls: std::cell::RefCell<Vec<Call>>,
        fail: bool,
    }

    impl DepthPoseEstimator<TestBackend> for RecordingEstimator {
        fn bind(&mut self, _session: &ComputeSession<TestBackend>) -> Result<()> {
            self.bound = true;
            Ok(())
        }

        fn infer(
            &self,
            images: Tensor<TestBackend, 4>,
            intrinsics: Option<&Intrinsics>,
            iters: usize,
            viz: bool,
        ) -> Result<InferenceResult> {
            assert!(self.bound, "inference before bind");
            if self.fail {
                return Err(Error::EmptyBatch);
            }

            let [frames, _, height, width] = images.dims();
            self.calls.borrow_mut().push(Call {
                frames,
                intrinsics: intrinsics.cloned(),
                iters,
                viz,
            });
            Ok(InferenceResult {
                depths: vec![
                    DepthMap {
                        width,
                        height,
                        values: vec![1.0; width * height],
                    };
                    frames
                ],
                poses: vec![Isometry3::identity(); frames],
                intrinsics: [1.0, 1.0, 0.0, 0.0],
            })
        }
    }

    fn demo_sequence(frames: usize) -> (tempfile::TempDir, FrameSequence) {
        let dir = tempfile::tempdir().unwrap();
        for idx in 0..frames {
            RgbImage::new(6, 4)
                .save(dir.path().join(format!("{idx:03}.png")))
                .unwrap();
        }
        fs::write(
            dir.path().join(INTRINSICS_FILE),
            "100 0 3\n0 100 2\n0 0 1\n",
        )
        .unwrap();
        let sequence = load_test_sequence(dir.path(), FrameSelection::all()).unwrap();
        (dir, sequence)
    }

    #[test]
    fn calibrated_run_passes_intrinsics_once() {
        let (_dir, sequence) = demo_sequence(5);
        let mut estimator = RecordingEstimator::default();
        let request = RunRequest {
            calibrated: true,
            iters: 3,
            viz: false,
        };

        let result = ExecutionHost::default()
            .run::<TestBackend, _>(&mut estimator, &sequence, request)
            .unwrap();

        let calls = estimator.calls.borrow();
        assert_eq!(
            *calls,
            vec![Call {
                frames: 5,
                intrinsics: Some(sequence.intrinsics().clone()),
                iters: 3,
                viz: false,
            }]
        );
        assert_eq!(calls[0].intrinsics.as_ref().unwrap().shape(), &[3, 3]);
        assert_eq!(result.depths.len(), 5);
        assert_eq!(result.poses.len(), 5);
    }

    #[test]
    fn uncalibrated_run_never_passes_intrinsics() {
        let (_dir, sequence) = demo_sequence(2);
        let mut estimator = RecordingEstimator::default();
        let request = RunRequest {
            calibrated: false,
            iters: 5,
            viz: true,
        };

        ExecutionHost::default()
            .run::<TestBackend, _>(&mut estimator, &sequence, request)
            .unwrap();

        let calls = estimator.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].intrinsics, None);
        assert!(calls[0].viz);
    }

    #[test]
    fn successful_run_releases_its_session() {
        let (_dir, sequence) = demo_sequence(2);
        let mut estimator = RecordingEstimator::default();
        let request = RunRequest {
            calibrated: true,
            iters: 1,
            viz: false,
        };

        let before = released_sessions();
        ExecutionHost::default()
            .run::<TestBackend, _>(&mut estimator, &sequence, request)
            .unwrap();
        assert_eq!(released_sessions(), before + 1);
    }

    #[test]
    fn estimator_errors_propagate() {
        let (_dir, sequence) = demo_sequence(2);
        let mut estimator = RecordingEstimator {
            fail: true,
            ..RecordingEstimator::default()
        };
        let request = RunRequest {
            calibrated: true,
            iters: 1,
            viz: false,
        };

        let before = released_sessions();
        let result = ExecutionHost::default().run::<TestBackend, _>(&mut estimator, &sequence, request);
        assert!(matches!(result, Err(Error::EmptyBatch)));
        assert!(estimator.bound);
        assert_eq!(released_sessions(), before + 1);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(RunStage::Start < RunStage::ConfigResolved);
        assert!(RunStage::SessionBound < RunStage::InferenceExecuted);
        assert_eq!(RunStage::ModelConstructed.to_string(), "model constructed");
    }
}
