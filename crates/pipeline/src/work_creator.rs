//! Final pipeline step: turn what the stages left behind into the request's Work.
//!
//! Layout under the input directory:
//! - `input/`: every file, in name order, may hold several YAML documents;
//! - `kratix-system/promise-cluster-selectors`: the Promise selector, `k=v` pairs;
//! - `metadata/cluster-selectors` (optional): request-level overrides, same format.

use std::fs;
use std::path::{Path, PathBuf};

use kratix_core::{kinds, to_dynamic, LabelSelector, Replicas, Work};
use kratix_store::{Created, ObjectStore, ObjectStoreExt};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{paths, PipelineError};

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io { path: path.to_path_buf(), source }
}

/// Parse every document of every file in `dir`, in file-name order. Null documents are dropped.
pub fn collect_manifests(dir: &Path) -> Result<Vec<serde_json::Value>, PipelineError> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if !path.is_file() {
            continue;
        }
        // Dotfiles are skipped; names need not be UTF-8.
        if path.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(true) {
            continue;
        }
        files.push(path);
    }
    files.sort();

    let mut out = Vec::new();
    for path in &files {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        let mut found = 0usize;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .map_err(|source| PipelineError::Yaml { path: path.clone(), source })?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(&value)?;
            if !json.is_object() {
                return Err(PipelineError::Invalid(format!("{}: document is not an object", path.display())));
            }
            out.push(json);
            found += 1;
        }
        debug!(file = %path.display(), documents = found, "read manifests");
    }
    Ok(out)
}

fn read_selector_file(path: &Path) -> Result<Option<LabelSelector>, PipelineError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.parse()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Promise selector merged with request-level overrides; overrides win.
pub fn read_selectors(root: &Path) -> Result<LabelSelector, PipelineError> {
    let promise_path = root.join(paths::SYSTEM_DIR).join(paths::SELECTORS_FILE);
    let promise = match read_selector_file(&promise_path)? {
        Some(s) => s,
        None => {
            warn!(file = %promise_path.display(), "no promise selector document; matching every cluster");
            LabelSelector::new()
        }
    };
    let overrides = read_selector_file(&root.join(paths::METADATA_DIR).join(paths::METADATA_SELECTORS_FILE))?;
    Ok(match overrides {
        Some(o) => promise.merged(&o),
        None => promise,
    })
}

/// Build the request-level Work from a work-creator directory.
pub fn build_work(identifier: &str, namespace: &str, root: &Path) -> Result<Work, PipelineError> {
    if identifier.trim().is_empty() {
        return Err(PipelineError::Invalid("empty identifier".into()));
    }
    let manifests = collect_manifests(&root.join(paths::INPUT_DIR))?;
    if manifests.is_empty() {
        return Err(PipelineError::Invalid(format!("{}: pipeline produced no manifests", identifier)));
    }
    let selector = read_selectors(root)?;
    Ok(Work::new(identifier, namespace, Replicas::Exactly(1), selector, manifests)?)
}

/// Submit a Work; one that already exists under the same name counts as done.
pub async fn submit(store: &dyn ObjectStore, work: &Work) -> Result<Created, PipelineError> {
    let obj = to_dynamic(work)?;
    let created = store.create_if_absent(&kinds::work(), &obj).await?;
    let outcome = match created {
        Created::New => "created",
        Created::Existing => "existing",
    };
    counter!("work_create_total", 1u64, "source" => "pipeline", "outcome" => outcome);
    info!(work = %work.name(), manifests = work.manifests().len(), outcome, "work submitted");
    Ok(created)
}

/// `build_work` then `submit`.
pub async fn run(store: &dyn ObjectStore, identifier: &str, namespace: &str, root: &Path) -> Result<Created, PipelineError> {
    let work = build_work(identifier, namespace, root)?;
    submit(store, &work).await
}
