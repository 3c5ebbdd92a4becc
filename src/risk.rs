use crate::types::{HazardLabel, MetricsSnapshot};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const FEATURE_COUNT: usize = 6;

/// Classifier input, in the order the model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    pub vulnerable_population: f64,
    /// Ordinal of the vulnerability label, `Muy bajo` = 0 through `Muy alto` = 4.
    pub vulnerability_index: f64,
    pub threshold_12h_mm: f64,
    pub city_area_km2: f64,
    pub inundated_area_km2: f64,
    pub inundated_pct: f64,
}

impl FeatureVector {
    /// Builds the vector or lists the inputs that are missing.
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Result<Self, Vec<&'static str>> {
        let Some(hazard) = snapshot.hazard.as_ref() else {
            return Err(vec![
                "vulnerable_population",
                "vulnerability_index",
                "threshold_12h_mm",
                "city_area_km2",
                "inundated_area_km2",
                "inundated_pct",
            ]);
        };

        let vulnerability_index = hazard
            .vulnerability_index
            .as_deref()
            .and_then(HazardLabel::from_loose)
            .map(|label| f64::from(label.ordinal()));

        let mut missing = Vec::new();
        let mut require = |name: &'static str, value: Option<f64>| {
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };

        let vector = FeatureVector {
            vulnerable_population: require("vulnerable_population", hazard.vulnerable_population.map(|n| n as f64)),
            vulnerability_index: require("vulnerability_index", vulnerability_index),
            threshold_12h_mm: require("threshold_12h_mm", hazard.threshold_12h_mm),
            city_area_km2: require("city_area_km2", hazard.city_area_km2),
            inundated_area_km2: require("inundated_area_km2", hazard.inundated_area_km2),
            inundated_pct: require("inundated_pct", hazard.inundated_pct),
        };

        if missing.is_empty() {
            Ok(vector)
        } else {
            Err(missing)
        }
    }

    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.vulnerable_population,
            self.vulnerability_index,
            self.threshold_12h_mm,
            self.city_area_km2,
            self.inundated_area_km2,
            self.inundated_pct,
        ]
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier invocation failed: {0}")]
    Invocation(String),
    #[error("model references feature {0}, only 6 exist")]
    UnknownFeature(usize),
    #[error("model references missing node {0}")]
    MissingNode(usize),
}

/// Pre-trained hazard model. Returns its raw label string.
pub trait RiskClassifier: Send + Sync {
    fn classify(&self, features: &[f64; FEATURE_COUNT]) -> Result<String, ClassifierError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnavailableReason {
    MissingInputs { fields: Vec<&'static str> },
    Classifier { message: String },
    UnrecognisedLabel { label: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HazardAssessment {
    Assessed { label: HazardLabel },
    Unavailable { reason: UnavailableReason },
}

impl HazardAssessment {
    pub fn label(&self) -> Option<HazardLabel> {
        match self {
            HazardAssessment::Assessed { label } => Some(*label),
            HazardAssessment::Unavailable { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct RiskAssessor {
    classifier: Arc<dyn RiskClassifier>,
}

impl RiskAssessor {
    pub fn new(classifier: Arc<dyn RiskClassifier>) -> Self {
        Self { classifier }
    }

    /// Never fails: missing inputs or a classifier fault come back as
    /// `Unavailable`. The classifier is not invoked when inputs are missing.
    pub fn assess(&self, snapshot: &MetricsSnapshot) -> HazardAssessment {
        let features = match FeatureVector::from_snapshot(snapshot) {
            Ok(features) => features,
            Err(fields) => {
                debug!(code = %snapshot.code, ?fields, "Assessment inputs missing");
                return HazardAssessment::Unavailable {
                    reason: UnavailableReason::MissingInputs { fields },
                };
            }
        };

        match self.classifier.classify(&features.as_array()) {
            Ok(raw) => match HazardLabel::from_exact(&raw) {
                Some(label) => {
                    debug!(code = %snapshot.code, %label, "Hazard assessed");
                    HazardAssessment::Assessed { label }
                }
                None => {
                    warn!(code = %snapshot.code, label = %raw, "Classifier returned an unknown label");
                    HazardAssessment::Unavailable {
                        reason: UnavailableReason::UnrecognisedLabel { label: raw },
                    }
                }
            },
            Err(err) => {
                warn!(code = %snapshot.code, error = %err, "Classifier invocation failed");
                HazardAssessment::Unavailable {
                    reason: UnavailableReason::Classifier { message: err.to_string() },
                }
            }
        }
    }

    /// `assess` on the blocking pool, keeping model evaluation off the
    /// async workers.
    pub async fn assess_offloaded(&self, snapshot: MetricsSnapshot) -> HazardAssessment {
        let assessor = self.clone();
        match tokio::task::spawn_blocking(move || assessor.assess(&snapshot)).await {
            Ok(assessment) => assessment,
            Err(err) => {
                warn!(error = %err, "Assessment task failed");
                HazardAssessment::Unavailable {
                    reason: UnavailableReason::Classifier { message: err.to_string() },
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    /// `features[feature] <= threshold` goes left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        label: String,
    },
}

/// Decision tree exported as a flat JSON node list, root at index 0.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionTreeClassifier {
    nodes: Vec<TreeNode>,
}

impl DecisionTreeClassifier {
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read classifier model: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| "Failed to parse classifier model")
    }
}

impl RiskClassifier for DecisionTreeClassifier {
    fn classify(&self, features: &[f64; FEATURE_COUNT]) -> Result<String, ClassifierError> {
        let mut index = 0;
        // A well-formed tree visits each node at most once.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(index).ok_or(ClassifierError::MissingNode(index))? {
                TreeNode::Leaf { label } => return Ok(label.clone()),
                TreeNode::Split { feature, threshold, left, right } => {
                    let value = features.get(*feature).ok_or(ClassifierError::UnknownFeature(*feature))?;
                    index = if value <= threshold { *left } else { *right };
                }
            }
        }
        Err(ClassifierError::Invocation("decision tree contains a cycle".into()))
    }
}
