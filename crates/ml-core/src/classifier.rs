//! Boundary between pipeline frames and the inference engine.

use std::{fmt, path::Path};

use capture::{Orientation, Resolution};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    engine::{EngineError, InferenceEngine, InputShape, ModelHandle, OutputDistribution},
    preprocess::prepare_input,
};

/// Most likely label for one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
}

impl fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class : {}, prob : {:.2}%",
            self.label,
            self.confidence * 100.0
        )
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("model could not be loaded: {0}")]
    ModelLoad(#[source] EngineError),
    #[error("model expects {channels} input channels, only RGB is supported")]
    UnsupportedInput { channels: u32 },
    #[error("inference engine error: {0}")]
    Engine(#[source] EngineError),
    #[error("inference engine returned no finite scores")]
    EmptyOutput,
}

/// Loads a model into an engine and turns converted frames into labels.
///
/// The model is unloaded when the classifier is dropped.
pub struct Classifier {
    engine: Box<dyn InferenceEngine>,
    model: ModelHandle,
    input: InputShape,
}

impl Classifier {
    pub fn load(
        mut engine: Box<dyn InferenceEngine>,
        model_path: &Path,
    ) -> Result<Self, ClassifyError> {
        let model = engine
            .load_model(model_path)
            .map_err(ClassifyError::ModelLoad)?;
        let input = match engine.input_shape(model) {
            Ok(shape) if shape.channels == 3 => shape,
            Ok(shape) => {
                engine.unload(model);
                return Err(ClassifyError::UnsupportedInput {
                    channels: shape.channels,
                });
            }
            Err(err) => {
                engine.unload(model);
                return Err(ClassifyError::ModelLoad(err));
            }
        };
        debug!(
            model = %model_path.display(),
            input = %input.size,
            "classifier ready"
        );
        Ok(Self {
            engine,
            model,
            input,
        })
    }

    /// Spatial size the model consumes.
    pub fn input_size(&self) -> Resolution {
        self.input.size
    }

    /// Classify an RGB frame captured at `orientation`.
    pub fn classify(
        &mut self,
        image: &RgbImage,
        orientation: Orientation,
    ) -> Result<ClassificationResult, ClassifyError> {
        let input = prepare_input(image, self.input.size, orientation);
        let output = self
            .engine
            .run(self.model, &input)
            .map_err(ClassifyError::Engine)?;
        top_label(output).ok_or(ClassifyError::EmptyOutput)
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        self.engine.unload(self.model);
    }
}

/// Highest-scoring label; the first one seen wins a tie.
///
/// Non-finite scores are skipped and the reported confidence is clamped to `[0, 1]`.
pub fn top_label(output: OutputDistribution) -> Option<ClassificationResult> {
    let mut best: Option<(String, f32)> = None;
    for (label, score) in output {
        if !score.is_finite() {
            warn!(%label, score, "ignoring non-finite score");
            continue;
        }
        if best.as_ref().is_none_or(|(_, top)| score > *top) {
            best = Some((label, score));
        }
    }
    best.map(|(label, score)| ClassificationResult {
        label,
        confidence: score.clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
    };

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::engine::InputTensor;

    #[derive(Default)]
    struct Calls {
        loaded: usize,
        unloaded: usize,
        inputs: Vec<(u32, u32)>,
    }

    struct FakeEngine {
        channels: u32,
        output: Result<OutputDistribution, String>,
        calls: Arc<Mutex<Calls>>,
    }

    impl InferenceEngine for FakeEngine {
        fn load_model(&mut self, _path: &Path) -> Result<ModelHandle, EngineError> {
            self.calls.lock().unwrap().loaded += 1;
            Ok(ModelHandle(7))
        }

        fn input_shape(&self, _model: ModelHandle) -> Result<InputShape, EngineError> {
            Ok(InputShape {
                size: Resolution::new(4, 4),
                channels: self.channels,
            })
        }

        fn run(
            &mut self,
            _model: ModelHandle,
            input: &InputTensor,
        ) -> Result<OutputDistribution, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .inputs
                .push((input.width, input.height));
            self.output.clone().map_err(EngineError::Run)
        }

        fn unload(&mut self, _model: ModelHandle) {
            self.calls.lock().unwrap().unloaded += 1;
        }
    }

    fn engine(
        channels: u32,
        output: Result<OutputDistribution, String>,
    ) -> (Box<FakeEngine>, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let engine = FakeEngine {
            channels,
            output,
            calls: calls.clone(),
        };
        (Box::new(engine), calls)
    }

    fn dist(entries: &[(&str, f32)]) -> OutputDistribution {
        entries
            .iter()
            .map(|(label, score)| (label.to_string(), *score))
            .collect()
    }

    #[test]
    fn top_label_prefers_first_on_ties() {
        let best = top_label(dist(&[("cat", 0.4), ("dog", 0.4), ("eel", 0.2)])).unwrap();
        assert_eq!(best.label, "cat");
        assert_eq!(top_label(Vec::new()), None);
    }

    #[test]
    fn top_label_skips_non_finite_scores() {
        let best = top_label(dist(&[("nan", f32::NAN), ("cat", 0.3), ("inf", f32::INFINITY)]))
            .unwrap();
        assert_eq!(best.label, "cat");
        assert_eq!(best.confidence, 0.3);
        assert_eq!(top_label(dist(&[("nan", f32::NAN)])), None);
    }

    #[test]
    fn top_label_clamps_confidence_into_unit_range() {
        assert_eq!(top_label(dist(&[("logit", 4.5)])).unwrap().confidence, 1.0);
        assert_eq!(top_label(dist(&[("logit", -2.0)])).unwrap().confidence, 0.0);
    }

    #[test]
    fn classify_rejects_all_nan_output() {
        let (engine, _) = engine(3, Ok(dist(&[("cat", f32::NAN)])));
        let mut classifier = Classifier::load(engine, Path::new("model.pt")).unwrap();
        let err = classifier
            .classify(&RgbImage::new(4, 4), Orientation::Deg0)
            .unwrap_err();
        assert!(matches!(err, ClassifyError::EmptyOutput));
    }

    #[test]
    fn top_label_accepts_zero_scores() {
        let best = top_label(dist(&[("background", 0.0)])).unwrap();
        assert_eq!(best.label, "background");
    }

    #[test]
    fn classify_returns_highest_confidence_label() {
        let (engine, calls) = engine(3, Ok(dist(&[("cat", 0.1), ("dog", 0.7), ("eel", 0.2)])));
        let mut classifier = Classifier::load(engine, Path::new("model.pt")).unwrap();
        assert_eq!(classifier.input_size(), Resolution::new(4, 4));

        let frame = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));
        let result = classifier.classify(&frame, Orientation::Deg90).unwrap();

        assert_eq!(
            result,
            ClassificationResult {
                label: "dog".into(),
                confidence: 0.7
            }
        );
        assert_eq!(calls.lock().unwrap().inputs, vec![(4, 4)]);
    }

    #[test]
    fn engine_failures_map_to_engine_error() {
        let (engine, _) = engine(3, Err("delegate crashed".into()));
        let mut classifier = Classifier::load(engine, Path::new("model.pt")).unwrap();
        let frame = RgbImage::new(4, 4);
        let err = classifier.classify(&frame, Orientation::Deg0).unwrap_err();
        assert!(matches!(err, ClassifyError::Engine(EngineError::Run(_))));
    }

    #[test]
    fn non_rgb_models_are_rejected_and_unloaded() {
        let (engine, calls) = engine(1, Ok(Vec::new()));
        let err = Classifier::load(engine, Path::new("gray.pt")).err().unwrap();
        assert!(matches!(err, ClassifyError::UnsupportedInput { channels: 1 }));
        let calls = calls.lock().unwrap();
        assert_eq!((calls.loaded, calls.unloaded), (1, 1));
    }

    #[test]
    fn dropping_classifier_unloads_model() {
        let (engine, calls) = engine(3, Ok(Vec::new()));
        let classifier = Classifier::load(engine, Path::new("model.pt")).unwrap();
        drop(classifier);
        assert_eq!(calls.lock().unwrap().unloaded, 1);
    }

    #[test]
    fn result_renders_as_percentage() {
        let result = ClassificationResult {
            label: "tabby".into(),
            confidence: 0.8312,
        };
        assert_eq!(result.to_string(), "class : tabby, prob : 83.12%");
    }
}
