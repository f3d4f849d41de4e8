pub mod build;
pub mod describe;
pub mod id;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use strata_core::{load, Pipeline};
use strata_schema::parse_description_file;
use strata_store::TreeStore;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_DESCRIPTION_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_returncode(returncode: i32) -> String {
    use console::Style;
    if returncode == 0 {
        Style::new().green().apply_to("ok").to_string()
    } else {
        Style::new()
            .red()
            .bold()
            .apply_to(format!("failed ({returncode})"))
            .to_string()
    }
}

/// Process exit code for a failed step: the step's own code when it fits,
/// otherwise a generic failure.
pub fn step_exit_code(returncode: i32) -> u8 {
    match u8::try_from(returncode) {
        Ok(0) | Err(_) => EXIT_FAILURE,
        Ok(code) => code,
    }
}

/// Load a description file into a pipeline, splicing in a build environment
/// description if one is given.
pub fn load_pipeline(description: &Path, build_env: Option<&Path>) -> Result<Pipeline, String> {
    let read = |path: &Path| {
        parse_description_file(path)
            .map_err(|e| format!("description error: {}: {e}", path.display()))
            .and_then(|d| load(&d).map_err(|e| e.to_string()))
    };
    let mut pipeline = read(description)?;
    if let Some(path) = build_env {
        pipeline.prepend_build_pipeline(read(path)?);
    }
    Ok(pipeline)
}

pub fn open_store(path: &Path) -> Result<TreeStore, String> {
    TreeStore::open(path).map_err(|e| format!("store error: {e}"))
}
