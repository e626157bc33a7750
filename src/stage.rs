//! Stage definitions for the paper-generation pipeline.
//!
//! The pipeline is a fixed, linearly ordered set of three stages:
//! - `Syllabus`: curriculum analysis, no dependencies
//! - `Pyqs`: previous-year-question analysis, needs the syllabus session
//! - `Paper`: blueprint and final paper generation, needs both sessions
//!
//! This module also holds the per-stage input and output types handed to and
//! returned from the remote worker.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// One step of the fixed three-step pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Syllabus,
    Pyqs,
    Paper,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [Stage::Syllabus, Stage::Pyqs, Stage::Paper];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syllabus => "syllabus",
            Self::Pyqs => "pyqs",
            Self::Paper => "paper",
        }
    }

    /// Human-readable label for terminal output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Syllabus => "Syllabus analysis",
            Self::Pyqs => "PYQ analysis",
            Self::Paper => "Paper generation",
        }
    }

    /// Zero-based position in the pipeline.
    pub fn index(&self) -> usize {
        match self {
            Self::Syllabus => 0,
            Self::Pyqs => 1,
            Self::Paper => 2,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// Stages whose session identifiers this stage requires, in request order.
    pub fn dependencies(&self) -> &'static [Stage] {
        match self {
            Self::Syllabus => &[],
            Self::Pyqs => &[Stage::Syllabus],
            Self::Paper => &[Stage::Syllabus, Stage::Pyqs],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "syllabus" | "a" => Ok(Self::Syllabus),
            "pyqs" | "pyq" | "b" => Ok(Self::Pyqs),
            "paper" | "c" => Ok(Self::Paper),
            _ => anyhow::bail!("Invalid stage '{}'. Valid values: syllabus, pyqs, paper", s),
        }
    }
}

/// Source material for the analysis stages: inline text or an uploaded file.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMaterial {
    Text(String),
    File {
        file_name: String,
        bytes: Vec<u8>,
        mime: String,
    },
}

impl SourceMaterial {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read source file: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::File {
            file_name,
            bytes,
            mime,
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::File { bytes, .. } => bytes.is_empty(),
        }
    }
}

/// Parameters for the final generation stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub total_marks: u32,
    pub total_questions: u32,
    /// Structured paper pattern (sections, marks per question, bloom targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<serde_json::Value>,
    /// Free-text instructions from the examiner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl GenerationParams {
    pub fn new(total_marks: u32, total_questions: u32) -> Self {
        Self {
            total_marks,
            total_questions,
            pattern: None,
            instructions: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.total_marks == 0 {
            return Err("total_marks must be greater than zero".to_string());
        }
        if self.total_questions == 0 {
            return Err("total_questions must be greater than zero".to_string());
        }
        if self.total_questions > self.total_marks {
            return Err(format!(
                "total_questions ({}) cannot exceed total_marks ({})",
                self.total_questions, self.total_marks
            ));
        }
        Ok(())
    }
}

/// Caller-supplied input for a single stage run.
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    Syllabus(SourceMaterial),
    Pyqs(SourceMaterial),
    Paper(GenerationParams),
}

impl StageInput {
    /// The stage this input feeds.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Syllabus(_) => Stage::Syllabus,
            Self::Pyqs(_) => Stage::Pyqs,
            Self::Paper(_) => Stage::Paper,
        }
    }

    /// Check the input is usable before anything touches the network.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Syllabus(material) | Self::Pyqs(material) => {
                if material.is_empty() {
                    Err("source material is empty".to_string())
                } else {
                    Ok(())
                }
            }
            Self::Paper(params) => params.validate(),
        }
    }
}

/// Result of a successful stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: Stage,
    pub session_id: String,
    pub correlation_id: String,
    /// Parsed analysis result or generated paper content.
    #[serde(default)]
    pub result: serde_json::Value,
    /// Number of questions extracted (PYQ stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// Reference to the generated artifact (paper stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Verification verdict for the generated paper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stage_order_and_next() {
        assert_eq!(Stage::Syllabus.next(), Some(Stage::Pyqs));
        assert_eq!(Stage::Pyqs.next(), Some(Stage::Paper));
        assert_eq!(Stage::Paper.next(), None);
        assert!(Stage::Syllabus < Stage::Pyqs && Stage::Pyqs < Stage::Paper);
    }

    #[test]
    fn test_stage_dependencies() {
        assert!(Stage::Syllabus.dependencies().is_empty());
        assert_eq!(Stage::Pyqs.dependencies(), &[Stage::Syllabus]);
        assert_eq!(Stage::Paper.dependencies(), &[Stage::Syllabus, Stage::Pyqs]);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("syllabus".parse::<Stage>().unwrap(), Stage::Syllabus);
        assert_eq!("PYQS".parse::<Stage>().unwrap(), Stage::Pyqs);
        assert_eq!("c".parse::<Stage>().unwrap(), Stage::Paper);
        let err = "blueprint".parse::<Stage>().unwrap_err();
        assert!(err.to_string().contains("Invalid stage"));
    }

    #[test]
    fn test_stage_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&Stage::Pyqs).unwrap(), "\"pyqs\"");
        let stage: Stage = serde_json::from_str("\"paper\"").unwrap();
        assert_eq!(stage, Stage::Paper);
    }

    #[test]
    fn test_input_stage_mapping() {
        assert_eq!(
            StageInput::Syllabus(SourceMaterial::text("Unit 1")).stage(),
            Stage::Syllabus
        );
        assert_eq!(
            StageInput::Paper(GenerationParams::new(80, 25)).stage(),
            Stage::Paper
        );
    }

    #[test]
    fn test_input_validation() {
        assert!(StageInput::Pyqs(SourceMaterial::text("  ")).validate().is_err());
        assert!(StageInput::Pyqs(SourceMaterial::text("Q1")).validate().is_ok());
        assert!(StageInput::Paper(GenerationParams::new(0, 5)).validate().is_err());
        assert!(StageInput::Paper(GenerationParams::new(10, 0)).validate().is_err());
        let err = StageInput::Paper(GenerationParams::new(10, 20))
            .validate()
            .unwrap_err();
        assert!(err.contains("cannot exceed"));
        assert!(StageInput::Paper(GenerationParams::new(80, 25)).validate().is_ok());
    }

    #[test]
    fn test_source_material_from_path_guesses_mime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("syllabus.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        match SourceMaterial::from_path(&path).unwrap() {
            SourceMaterial::File {
                file_name,
                bytes,
                mime,
            } => {
                assert_eq!(file_name, "syllabus.pdf");
                assert_eq!(bytes, b"%PDF-1.4");
                assert_eq!(mime, "application/pdf");
            }
            other => panic!("Expected File, got {:?}", other),
        }
    }

    #[test]
    fn test_source_material_missing_file() {
        let dir = tempdir().unwrap();
        let err = SourceMaterial::from_path(&dir.path().join("nope.txt")).unwrap_err();
        assert!(err.to_string().contains("Failed to read source file"));
    }
}
