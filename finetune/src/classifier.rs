use std::path::Path;

use image::DynamicImage;
use rand::SeedableRng;
use rand::rngs::StdRng;
use shared::{ClassificationResult, OTHER_LABEL};
use tch::{Kind, TchError, Tensor};

use crate::error::JobError;
use crate::remote::ImageSource;
use crate::storage::{ModelPersistence, ObjectStore};
use crate::vision::{ModelFactory, ModelState, Pipeline, eval_pipeline};

/// Predictions below this top probability are reported as "other/uncertain".
pub const CONFIDENCE_THRESHOLD: f32 = 0.58;

/// Open-set decision over a softmax vector. The probabilities are returned
/// unchanged either way.
pub fn apply_threshold(probabilities: Vec<f32>, threshold: f32) -> ClassificationResult {
    let best = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, top)) if top >= p => best,
            _ => Some((i, p)),
        });

    match best {
        Some((index, max_confidence)) if max_confidence >= threshold => ClassificationResult {
            predicted_class: Some(index),
            predicted_label: index.to_string(),
            confidences: probabilities,
            is_other: false,
            max_confidence,
        },
        best => ClassificationResult {
            predicted_class: None,
            predicted_label: OTHER_LABEL.to_string(),
            confidences: probabilities,
            is_other: true,
            max_confidence: best.map(|(_, p)| p).unwrap_or(0.0),
        },
    }
}

/// A trained model in inference mode.
pub struct Classifier {
    model: ModelState,
    pipeline: Pipeline,
    class_names: Option<Vec<String>>,
    threshold: f32,
}

impl Classifier {
    pub fn new(model: ModelState) -> Self {
        Self {
            model,
            pipeline: eval_pipeline(),
            class_names: None,
            threshold: CONFIDENCE_THRESHOLD,
        }
    }

    /// Rebuilds the skeleton for `num_classes` and fills it from the bucket
    /// copy, or the local file when that fails.
    pub async fn load<S: ObjectStore>(
        factory: &ModelFactory,
        num_classes: usize,
        persistence: &ModelPersistence<S>,
        local_path: &Path,
        cloud_path: &str,
    ) -> Result<Self, JobError> {
        let mut skeleton = factory.skeleton(num_classes)?;
        let loaded = persistence.load(&mut skeleton, local_path, cloud_path).await?;
        log::info!("Model weights resolved from {}", loaded.source);

        let mut classifier = Self::new(skeleton);
        classifier.class_names = loaded.metadata.map(|meta| meta.class_names);
        Ok(classifier)
    }

    pub fn class_names(&self) -> Option<&[String]> {
        self.class_names.as_deref()
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<ClassificationResult, TchError> {
        // The eval pipeline draws nothing; the generator only satisfies the signature.
        let pixels = self.pipeline.apply(image, &mut StdRng::seed_from_u64(0));
        let [c, h, w] = pixels.shape();
        let input = Tensor::from_slice(pixels.as_slice())
            .view([1, c, h, w])
            .to_device(self.model.device());

        let probabilities = tch::no_grad(|| {
            self.model
                .forward_t(&input, false)
                .softmax(-1, Kind::Float)
                .view([-1])
                .to_device(tch::Device::Cpu)
        });
        let probabilities = Vec::<f32>::try_from(&probabilities)?;
        let result = apply_threshold(probabilities, self.threshold);

        match (result.predicted_class, self.class_names()) {
            (Some(index), Some(names)) => log::info!(
                "Predicted class {} ({}) with confidence {:.4}",
                index,
                names.get(index).map(String::as_str).unwrap_or("?"),
                result.max_confidence
            ),
            (Some(index), None) => log::info!(
                "Predicted class {} with confidence {:.4}",
                index,
                result.max_confidence
            ),
            (None, _) => log::info!(
                "Top confidence {:.4} is below {}, reporting {}",
                result.max_confidence,
                self.threshold,
                OTHER_LABEL
            ),
        }
        Ok(result)
    }

    pub async fn classify_url<I: ImageSource>(&self, source: &I, url: &str) -> Result<ClassificationResult, JobError> {
        let image = source.fetch_image(url).await?;
        self.predict(&image)
            .map_err(|e| JobError::Training(format!("inference failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FetchError;
    use crate::vision::model::linear_test_model;
    use image::{Rgb, RgbImage};

    #[test]
    fn confident_prediction_keeps_argmax() {
        let result = apply_threshold(vec![0.1, 0.8, 0.1], CONFIDENCE_THRESHOLD);
        assert!(!result.is_other);
        assert_eq!(result.predicted_class, Some(1));
        assert_eq!(result.predicted_label, "1");
        assert_eq!(result.max_confidence, 0.8);
    }

    #[test]
    fn low_confidence_is_other_with_probabilities_intact() {
        let probabilities = vec![0.4, 0.35, 0.25];
        let result = apply_threshold(probabilities.clone(), CONFIDENCE_THRESHOLD);
        assert!(result.is_other);
        assert_eq!(result.predicted_class, None);
        assert_eq!(result.predicted_label, OTHER_LABEL);
        assert_eq!(result.confidences, probabilities);
        assert_eq!(result.max_confidence, 0.4);
    }

    #[test]
    fn threshold_is_inclusive_and_ties_take_the_first_class() {
        let result = apply_threshold(vec![0.58, 0.42], 0.58);
        assert_eq!(result.predicted_class, Some(0));
        let result = apply_threshold(vec![0.5, 0.5], 0.5);
        assert_eq!(result.predicted_class, Some(0));
    }

    #[test]
    fn predict_returns_a_distribution() {
        let classifier = Classifier::new(linear_test_model(224, 3));
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 240, Rgb([90, 120, 200])));
        let result = classifier.predict(&image).unwrap();
        assert_eq!(result.confidences.len(), 3);
        let total: f32 = result.confidences.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert_eq!(result.is_other, result.max_confidence < CONFIDENCE_THRESHOLD);
    }

    struct Unreachable;

    impl ImageSource for Unreachable {
        async fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
            Err(FetchError::Status {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn fetch_failure_is_a_remote_error() {
        let classifier = Classifier::new(linear_test_model(224, 2));
        let err = classifier
            .classify_url(&Unreachable, "https://cdn/x.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::RemoteFetch(_)));
    }
}
