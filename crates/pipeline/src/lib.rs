//! Kratix pipeline: the isolated, ordered stage sequence run for each resource request.
//!
//! [`PipelinePlan`] is purely declarative: it renders to one Pod whose init
//! containers run the stages in order and whose main container runs the work
//! creator. [`work_creator`] is the logic of that final step.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use kratix_core::CoreError;
use kratix_store::StoreError;

mod plan;
pub mod work_creator;

pub use plan::{Mount, PipelinePlan, PipelineRequest, PipelineSettings, Stage, Volume, VolumeSource};

/// Mount convention shared with user-supplied stage images.
pub mod paths {
    pub const STAGE_INPUT: &str = "/input";
    pub const STAGE_OUTPUT: &str = "/output";
    pub const STAGE_METADATA: &str = "/metadata";

    /// Root handed to the work creator as `--input-directory`.
    pub const WORK_CREATOR_ROOT: &str = "/work-creator-files";
    pub const WRITER_INPUT: &str = "/work-creator-files/input";
    pub const WRITER_METADATA: &str = "/work-creator-files/metadata";
    pub const WRITER_SYSTEM: &str = "/work-creator-files/kratix-system";

    /// Sub-directories of the work creator root.
    pub const INPUT_DIR: &str = "input";
    pub const METADATA_DIR: &str = "metadata";
    pub const SYSTEM_DIR: &str = "kratix-system";

    /// Config map key and projected file name of the Promise selector document.
    pub const SELECTORS_KEY: &str = "selectors";
    pub const SELECTORS_FILE: &str = "promise-cluster-selectors";
    /// Optional per-request selector overrides a stage may leave in the metadata area.
    pub const METADATA_SELECTORS_FILE: &str = "cluster-selectors";

    /// File the reader stage writes the request into.
    pub const REQUEST_OBJECT_FILE: &str = "object.yaml";
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    Invalid(String),
    #[error("io on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("yaml in {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
