use super::{
    colorize_returncode, json_pretty, load_pipeline, open_store, spin_fail, spin_ok, spinner,
    step_exit_code, EXIT_SUCCESS,
};
use std::path::{Path, PathBuf};
use strata_core::{CoreError, PipelineResult, RunOptions};
use strata_runtime::Backend;
use tracing::debug;

pub struct BuildArgs<'a> {
    pub description: &'a Path,
    pub build_env: Option<&'a Path>,
    pub output: Option<&'a Path>,
    pub libdir: Option<PathBuf>,
    pub interactive: bool,
    pub check: bool,
}

fn print_result(result: &PipelineResult, label: &str) {
    if let Some(build) = &result.build {
        print_result(build, &format!("{label}build "));
    }
    for stage in &result.stages {
        println!("{label}stage {}: {}", stage.name, colorize_returncode(stage.returncode));
    }
    if let Some(assembler) = &result.assembler {
        println!(
            "{label}assembler {}: {}",
            assembler.name,
            colorize_returncode(assembler.returncode)
        );
    }
}

/// Captured output of the first failing step, searched build pipelines first.
fn failed_output(result: &PipelineResult) -> Option<&str> {
    if let Some(output) = result.build.as_deref().and_then(failed_output) {
        return Some(output);
    }
    result
        .stages
        .iter()
        .chain(result.assembler.as_ref())
        .find(|s| !s.success())
        .and_then(|s| s.output.as_deref())
}

pub fn run(backend: &Backend, store_path: &Path, args: &BuildArgs<'_>, json: bool) -> Result<u8, String> {
    let pipeline = load_pipeline(args.description, args.build_env)?;
    let store = open_store(store_path)?;
    let opts = RunOptions {
        interactive: args.interactive,
        check: args.check,
        libdir: args.libdir.clone(),
    };
    debug!("running {} with the {} backend", args.description.display(), backend.name());

    let pb = if json || args.interactive {
        None
    } else {
        Some(spinner("running pipeline..."))
    };

    let result = match pipeline.run(args.output, &store, backend, &opts) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "pipeline failed");
            }
            return match &e {
                CoreError::TransformFailed { returncode, .. }
                | CoreError::OutputFailed { returncode, .. } => {
                    if let Some(output) = e.step_output() {
                        eprint!("{output}");
                    }
                    eprintln!("error: {e}");
                    Ok(step_exit_code(*returncode))
                }
                _ => Err(e.to_string()),
            };
        }
    };

    if let Some(ref pb) = pb {
        if result.success() {
            spin_ok(pb, "pipeline finished");
        } else {
            spin_fail(pb, "pipeline failed");
        }
    }

    let tree_id = pipeline.id().map(ToString::to_string);
    if json {
        let mut payload = serde_json::to_value(&result).map_err(|e| e.to_string())?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("tree_id".to_owned(), serde_json::json!(tree_id));
        }
        println!("{}", json_pretty(&payload)?);
    } else {
        print_result(&result, "");
        if let Some(output) = failed_output(&result) {
            eprint!("{output}");
        }
        if result.success() {
            if let Some(id) = &tree_id {
                println!("tree: {id}");
            }
        }
    }

    if result.success() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(step_exit_code(result.returncode))
    }
}
