use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Label reported when the top probability falls under the confidence threshold.
pub const OTHER_LABEL: &str = "other/uncertain";

/// The closed set of pretrained backbones a model can be fine-tuned from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
    EnumIter,
)]
pub enum Architecture {
    #[strum(serialize = "resnet50")]
    #[serde(rename = "resnet50")]
    ResNet50,
    #[strum(serialize = "inception_v3")]
    #[serde(rename = "inception_v3")]
    InceptionV3,
    #[strum(serialize = "mobilenet_v2")]
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,
}

/// Single-image prediction, printed as one JSON object by the classify job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub predicted_class: Option<usize>,
    pub predicted_label: String,
    pub confidences: Vec<f32>,
    pub is_other: bool,
    pub max_confidence: f32,
}

/// Where a trained model was written. Both writes must succeed for a save to count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedLocations {
    pub local_path: String,
    pub cloud_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[strum(serialize = "target accuracy reached")]
    TargetReached,
    #[strum(serialize = "early stopping")]
    EarlyStopped,
    #[strum(serialize = "epoch limit")]
    EpochLimit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTally {
    pub correct: usize,
    pub total: usize,
}

impl ClassTally {
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.correct as f64 / self.total as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
    pub per_class: Vec<ClassTally>,
}

/// Sidecar stored next to the weights. `class_names` fixes the label order
/// between the training and serving processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub run_id: Uuid,
    pub architecture: Architecture,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub weights_sha256: String,
    pub trained_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub best_val_accuracy: f64,
    #[serde(default)]
    pub history: Vec<EpochRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn architecture_names_round_trip() {
        for arch in Architecture::iter() {
            assert_eq!(Architecture::from_str(arch.as_ref()).unwrap(), arch);
        }
        assert!(Architecture::from_str("googlenet").is_err());
    }

    #[test]
    fn uncertain_result_serializes_null_class() {
        let result = ClassificationResult {
            predicted_class: None,
            predicted_label: OTHER_LABEL.to_string(),
            confidences: vec![0.4, 0.35, 0.25],
            is_other: true,
            max_confidence: 0.4,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["predicted_class"].is_null());
        assert_eq!(json["predicted_label"], "other/uncertain");
        assert_eq!(json["confidences"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn tally_accuracy_ignores_empty_classes() {
        assert_eq!(ClassTally::default().accuracy(), None);
        let tally = ClassTally { correct: 3, total: 4 };
        assert_eq!(tally.accuracy(), Some(0.75));
    }
}
