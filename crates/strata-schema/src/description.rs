use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("failed to read pipeline description: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse pipeline description: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("failed to parse pipeline description: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("step name must not be empty")]
    EmptyStepName,
    #[error("invalid step name '{0}': must be a single path component")]
    InvalidStepName(String),
}

/// Serialized form of a pipeline, as read from a description file.
///
/// Descriptions nest: `build` holds the description of the pipeline whose
/// final tree is the execution environment for this one.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Box<PipelineDescription>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StepDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembler: Option<StepDescription>,
}

/// A single stage or assembler entry: the executable name and its options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl StepDescription {
    pub fn new(name: impl Into<String>, options: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

impl PipelineDescription {
    /// Check every step name in this description and all nested build descriptions.
    pub fn validate(&self) -> Result<(), DescriptionError> {
        if let Some(build) = &self.build {
            build.validate()?;
        }
        for step in self.stages.iter().chain(self.assembler.as_ref()) {
            validate_step_name(&step.name)?;
        }
        Ok(())
    }

    /// Number of pipelines in the build chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.build.as_ref().map_or(0, |b| b.depth())
    }

    pub fn to_json_pretty(&self) -> Result<String, DescriptionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Step names select an executable inside the stage or assembler directory,
/// so they must not escape it.
pub fn validate_step_name(name: &str) -> Result<(), DescriptionError> {
    if name.trim().is_empty() {
        return Err(DescriptionError::EmptyStepName);
    }
    if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(DescriptionError::InvalidStepName(name.to_owned()));
    }
    Ok(())
}

pub fn parse_description_str(content: &str) -> Result<PipelineDescription, DescriptionError> {
    let description: PipelineDescription = serde_json::from_str(content)?;
    description.validate()?;
    Ok(description)
}

pub fn parse_description_toml(content: &str) -> Result<PipelineDescription, DescriptionError> {
    let description: PipelineDescription = toml::from_str(content)?;
    description.validate()?;
    Ok(description)
}

/// Read a description file. Files ending in `.toml` are parsed as TOML,
/// everything else as JSON.
pub fn parse_description_file(path: &Path) -> Result<PipelineDescription, DescriptionError> {
    let content = fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        parse_description_toml(&content)
    } else {
        parse_description_str(&content)
    }
}
