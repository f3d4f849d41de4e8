//! Pipeline descriptions and stage identity for strata.
//!
//! This crate defines the schema layer: the nested pipeline description format
//! (`PipelineDescription`), its JSON/TOML parsing and validation, the canonical
//! JSON encoding used for hashing, and deterministic stage identity computation
//! (`compute_stage_id`).

pub mod description;
pub mod identity;
pub mod types;

pub use description::{
    parse_description_file, parse_description_str, parse_description_toml, validate_step_name,
    DescriptionError, PipelineDescription, StepDescription,
};
pub use identity::{canonical_json, compute_stage_id};
pub use types::{ShortId, TreeId, SHORT_ID_LEN};
