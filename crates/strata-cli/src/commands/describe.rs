use super::{load_pipeline, EXIT_SUCCESS};
use std::path::Path;

/// Print the description of the loaded pipeline, build environment included.
pub fn run(description: &Path, build_env: Option<&Path>) -> Result<u8, String> {
    let pipeline = load_pipeline(description, build_env)?;
    let text = pipeline
        .description()
        .to_json_pretty()
        .map_err(|e| format!("description error: {e}"))?;
    println!("{text}");
    Ok(EXIT_SUCCESS)
}
