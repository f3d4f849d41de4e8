use super::{json_pretty, load_pipeline, EXIT_SUCCESS};
use serde_json::{json, Value};
use std::path::Path;
use strata_core::Pipeline;

fn identities(pipeline: &Pipeline) -> Value {
    let stages: Vec<Value> = pipeline
        .stages()
        .iter()
        .map(|s| json!({"name": s.name(), "id": s.id().map(ToString::to_string)}))
        .collect();
    let mut value = json!({
        "stages": stages,
        "tree_id": pipeline.id().map(ToString::to_string),
    });
    if let (Some(build), Some(obj)) = (pipeline.build(), value.as_object_mut()) {
        obj.insert("build".to_owned(), identities(build));
    }
    value
}

fn print_identities(pipeline: &Pipeline, label: &str) {
    if let Some(build) = pipeline.build() {
        print_identities(build, &format!("{label}build "));
    }
    for stage in pipeline.stages() {
        if let Some(id) = stage.id() {
            println!("{label}{} {}", id.short(), stage.name());
        }
    }
}

pub fn run(description: &Path, build_env: Option<&Path>, json: bool) -> Result<u8, String> {
    let pipeline = load_pipeline(description, build_env)?;
    if json {
        println!("{}", json_pretty(&identities(&pipeline))?);
    } else {
        print_identities(&pipeline, "");
        match pipeline.id() {
            Some(id) => println!("tree: {id}"),
            None => println!("tree: none"),
        }
    }
    Ok(EXIT_SUCCESS)
}
