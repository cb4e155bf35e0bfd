// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseInformation {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub symptoms: String,
    #[serde(default)]
    pub treatment: String,
}

/// Body returned by the leaf-disease classification service.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceResponse {
    pub disease: String,
    pub confidence: f64,
    #[serde(default = "empty_information")]
    pub information: DiseaseInformation,
    #[serde(default)]
    pub recommendations: String,
}

fn empty_information() -> DiseaseInformation {
    DiseaseInformation {
        description: String::new(),
        symptoms: String::new(),
        treatment: String::new(),
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("confidence {0} is outside [0, 1]")]
pub struct InvalidConfidence(pub f64);

/// Classification outcome for one leaf image. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    disease: String,
    confidence: f64,
    information: DiseaseInformation,
    recommendations: String,
}

impl AnalysisResult {
    pub fn new(
        disease: impl Into<String>,
        confidence: f64,
        information: DiseaseInformation,
        recommendations: impl Into<String>,
    ) -> Result<Self, InvalidConfidence> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(InvalidConfidence(confidence));
        }
        Ok(Self {
            disease: disease.into(),
            confidence,
            information,
            recommendations: recommendations.into(),
        })
    }

    /// Raw label as reported by the service, e.g. `Apple_Black_rot`.
    pub fn disease(&self) -> &str {
        &self.disease
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn information(&self) -> &DiseaseInformation {
        &self.information
    }

    pub fn recommendations(&self) -> &str {
        &self.recommendations
    }

    /// Label with separators turned into spaces: `Apple Black rot`.
    pub fn display_label(&self) -> String {
        self.disease.replace('_', " ")
    }

    pub fn confidence_percent(&self) -> u8 {
        (self.confidence * 100.0).round() as u8
    }
}

impl TryFrom<InferenceResponse> for AnalysisResult {
    type Error = InvalidConfidence;

    fn try_from(body: InferenceResponse) -> Result<Self, Self::Error> {
        AnalysisResult::new(
            body.disease,
            body.confidence,
            body.information,
            body.recommendations,
        )
    }
}

// Session snapshots

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    Previewing,
    Analyzing,
    Result,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
    pub dimensions: Option<(u32, u32)>,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultView {
    pub disease: String,
    pub display_label: String,
    pub confidence: f64,
    pub confidence_percent: u8,
    pub confidence_display: String,
    pub description: String,
    pub symptoms: String,
    pub treatment: String,
    pub recommendations: String,
}

impl From<&AnalysisResult> for ResultView {
    fn from(result: &AnalysisResult) -> Self {
        let percent = result.confidence_percent();
        Self {
            disease: result.disease.clone(),
            display_label: result.display_label(),
            confidence: result.confidence(),
            confidence_percent: percent,
            confidence_display: format!("{}%", percent),
            description: result.information.description.clone(),
            symptoms: result.information.symptoms.clone(),
            treatment: result.information.treatment.clone(),
            recommendations: result.recommendations.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub state: WorkflowPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
}

// Profile analysis records

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFlag {
    IrrigationNeeded,
    FertilizationNeeded,
}

impl TaskFlag {
    pub const ALL: [TaskFlag; 2] = [TaskFlag::IrrigationNeeded, TaskFlag::FertilizationNeeded];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskFlag::IrrigationNeeded => "irrigation_needed",
            TaskFlag::FertilizationNeeded => "fertilization_needed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.as_str() == raw)
    }

    fn task_id(self) -> &'static str {
        match self {
            TaskFlag::IrrigationNeeded => "irrigation",
            TaskFlag::FertilizationNeeded => "fertilization",
        }
    }

    fn title(self) -> &'static str {
        match self {
            TaskFlag::IrrigationNeeded => "Irrigation Needed",
            TaskFlag::FertilizationNeeded => "Fertilization Needed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(rename = "_id")]
    pub id: Uuid,
    #[serde(default)]
    pub irrigation_needed: bool,
    #[serde(default)]
    pub fertilization_needed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl AnalysisRecord {
    pub fn flag(&self, flag: TaskFlag) -> bool {
        match flag {
            TaskFlag::IrrigationNeeded => self.irrigation_needed,
            TaskFlag::FertilizationNeeded => self.fertilization_needed,
        }
    }

    pub fn set_flag(&mut self, flag: TaskFlag, value: bool) {
        match flag {
            TaskFlag::IrrigationNeeded => self.irrigation_needed = value,
            TaskFlag::FertilizationNeeded => self.fertilization_needed = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(rename = "type")]
    pub task_type: TaskFlag,
    pub analysis_id: Uuid,
}

impl PendingTask {
    pub fn pending(flag: TaskFlag, analysis_id: Uuid) -> Self {
        Self {
            id: flag.task_id().to_string(),
            title: flag.title().to_string(),
            status: "Pending".to_string(),
            task_type: flag,
            analysis_id,
        }
    }
}

// Prediction placeholders

#[derive(Debug, Clone, Serialize)]
pub struct ApiEnvelope<T> {
    pub message: String,
    pub status: String,
    pub data: T,
}

impl<T> ApiEnvelope<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            message: message.into(),
            status: "success".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YieldPrediction {
    pub predicted_yield: f64,
    pub unit: String,
    pub confidence: f64,
    pub factors: Vec<String>,
}

impl YieldPrediction {
    pub fn placeholder() -> Self {
        Self {
            predicted_yield: 8.5,
            unit: "tons/acre".to_string(),
            confidence: 0.85,
            factors: vec![
                "Weather conditions favorable".to_string(),
                "Soil moisture adequate".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPrediction {
    pub predicted_price: f64,
    pub currency: String,
    pub per_unit: String,
    pub trend: String,
    pub suggested_action: String,
}

impl MarketPrediction {
    pub fn placeholder() -> Self {
        Self {
            predicted_price: 45.75,
            currency: "USD".to_string(),
            per_unit: "quintal".to_string(),
            trend: "increasing".to_string(),
            suggested_action: "Hold for 2 weeks before selling".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DiseaseInformation {
        DiseaseInformation {
            description: "d".into(),
            symptoms: "s".into(),
            treatment: "t".into(),
        }
    }

    #[test]
    fn display_label_replaces_every_underscore() {
        let result = AnalysisResult::new("Apple_Black_rot", 0.92, info(), "r").unwrap();
        assert_eq!(result.display_label(), "Apple Black rot");
        assert_eq!(result.disease(), "Apple_Black_rot");
    }

    #[test]
    fn confidence_percent_rounds() {
        let result = AnalysisResult::new("x", 0.92, info(), "").unwrap();
        assert_eq!(result.confidence_percent(), 92);
        let result = AnalysisResult::new("x", 0.875, info(), "").unwrap();
        assert_eq!(result.confidence_percent(), 88);
        let view = ResultView::from(&result);
        assert_eq!(view.confidence_display, "88%");
    }

    #[test]
    fn confidence_bounds_are_inclusive() {
        assert!(AnalysisResult::new("x", 0.0, info(), "").is_ok());
        assert!(AnalysisResult::new("x", 1.0, info(), "").is_ok());
        assert_eq!(
            AnalysisResult::new("x", 1.01, info(), ""),
            Err(InvalidConfidence(1.01))
        );
        assert!(AnalysisResult::new("x", f64::NAN, info(), "").is_err());
    }

    #[test]
    fn inference_response_tolerates_missing_texts() {
        let body: InferenceResponse =
            serde_json::from_str(r#"{"disease":"Tomato_healthy","confidence":0.5}"#).unwrap();
        let result = AnalysisResult::try_from(body).unwrap();
        assert_eq!(result.information().description, "");
        assert_eq!(result.recommendations(), "");
    }

    #[test]
    fn record_keeps_extra_fields_and_mongo_style_id() {
        let raw = r#"{
            "_id": "00000000-0000-0000-0000-000000000001",
            "irrigation_needed": true,
            "created_at": "2024-05-01T10:00:00Z",
            "soil_moisture": 0.31
        }"#;
        let record: AnalysisRecord = serde_json::from_str(raw).unwrap();
        assert!(record.flag(TaskFlag::IrrigationNeeded));
        assert!(!record.flag(TaskFlag::FertilizationNeeded));
        assert_eq!(record.details.get("soil_moisture"), Some(&Value::from(0.31)));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn pending_task_serializes_dashboard_shape() {
        let task = PendingTask::pending(TaskFlag::FertilizationNeeded, Uuid::nil());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["id"], "fertilization");
        assert_eq!(json["title"], "Fertilization Needed");
        assert_eq!(json["type"], "fertilization_needed");
        assert_eq!(json["analysisId"], Uuid::nil().to_string());
    }

    #[test]
    fn task_flag_parse_rejects_unknown_names() {
        assert_eq!(TaskFlag::parse("irrigation_needed"), Some(TaskFlag::IrrigationNeeded));
        assert_eq!(TaskFlag::parse("harvest_needed"), None);
    }
}
