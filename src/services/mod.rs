// src/services/mod.rs
pub mod analysis_session;
pub mod file_intake;
pub mod inference_client;
pub mod records;
pub mod redis_service;
pub mod report_exporter;

pub use analysis_session::SessionRegistry;
pub use inference_client::{Deadline, HttpInferenceClient, InferenceClient, MockInferenceClient};
pub use records::{AnalysisRecords, MemoryRecords};
pub use redis_service::RedisService;
pub use report_exporter::TextReportExporter;
