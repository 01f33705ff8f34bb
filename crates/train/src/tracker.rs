//! Local experiment tracking: metrics, sample galleries, model artifacts.
//!
//! A run lives in `{root}/{project}/run-NNN/`:
//!
//! ```text
//! config.json                      run options
//! metrics.jsonl                    one JSON record per log call
//! media/<key>/epoch-<e>/<i>.png    image galleries
//! artifacts/<name>/v<k>/<file>     versioned files + metadata.json
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Tensor;
use serde::Serialize;
use serde_json::{json, Value};

use ct_common::save_image;

/// One tracking run. Every call writes through immediately.
pub struct RunTracker {
    dir: PathBuf,
    metrics: File,
    artifact_versions: HashMap<String, usize>,
}

impl RunTracker {
    /// Create the next free `run-NNN` directory under `root/project` and
    /// record `config` in it.
    pub fn init(root: &Path, project: &str, config: &impl Serialize) -> anyhow::Result<Self> {
        let project_dir = root.join(project);
        std::fs::create_dir_all(&project_dir)
            .with_context(|| format!("create tracking dir {}", project_dir.display()))?;
        let index = (1..)
            .find(|i| !project_dir.join(format!("run-{i:03}")).exists())
            .unwrap_or(1);
        let dir = project_dir.join(format!("run-{index:03}"));
        std::fs::create_dir_all(&dir)?;

        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(config)?)?;
        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        tracing::info!(run = %dir.display(), "Tracking run started");
        Ok(Self {
            dir,
            metrics,
            artifact_versions: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one scalar record, e.g. per-step loss.
    pub fn log(&mut self, record: &impl Serialize) -> anyhow::Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.metrics, "{line}")?;
        Ok(())
    }

    /// Save each `(c, h, w)` image of `images` (values in `[0, 1]`) and log
    /// the gallery under `key`.
    pub fn log_images(&mut self, key: &str, epoch: usize, images: &Tensor) -> anyhow::Result<()> {
        let gallery = self
            .dir
            .join("media")
            .join(key)
            .join(format!("epoch-{epoch}"));
        let mut files = Vec::new();
        for i in 0..images.dim(0)? {
            let path = gallery.join(format!("{i}.png"));
            save_image(&images.get(i)?, &path)?;
            files.push(path.strip_prefix(&self.dir)?.display().to_string());
        }
        let mut record = serde_json::Map::new();
        record.insert("epoch".to_string(), json!(epoch));
        record.insert(key.to_string(), json!(files));
        self.log(&Value::Object(record))
    }

    /// Copy `file` into a new version of artifact `name`. Returns the version.
    pub fn log_artifact(
        &mut self,
        name: &str,
        kind: &str,
        description: &str,
        file: &Path,
        metadata: Value,
    ) -> anyhow::Result<usize> {
        let version = self.artifact_versions.entry(name.to_string()).or_insert(0);
        let this_version = *version;
        *version += 1;

        let dest_dir = self
            .dir
            .join("artifacts")
            .join(name)
            .join(format!("v{this_version}"));
        std::fs::create_dir_all(&dest_dir)?;
        let file_name = file
            .file_name()
            .with_context(|| format!("artifact path has no file name: {}", file.display()))?;
        std::fs::copy(file, dest_dir.join(file_name))
            .with_context(|| format!("copy artifact {}", file.display()))?;
        let manifest = json!({
            "name": name,
            "type": kind,
            "description": description,
            "version": this_version,
            "metadata": metadata,
        });
        std::fs::write(dest_dir.join("metadata.json"), serde_json::to_string_pretty(&manifest)?)?;
        tracing::debug!(artifact = name, version = this_version, "Logged artifact");
        Ok(this_version)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[derive(Serialize)]
    struct Record {
        step: usize,
        loss: f32,
    }

    #[test]
    fn runs_get_distinct_directories() {
        let root = tempfile::tempdir().unwrap();
        let a = RunTracker::init(root.path(), "proj", &json!({"lr": 1e-3})).unwrap();
        let b = RunTracker::init(root.path(), "proj", &json!({"lr": 1e-3})).unwrap();
        assert!(a.dir().ends_with("run-001"));
        assert!(b.dir().ends_with("run-002"));
        assert!(a.dir().join("config.json").exists());
    }

    #[test]
    fn metrics_are_appended_as_json_lines() {
        let root = tempfile::tempdir().unwrap();
        let mut run = RunTracker::init(root.path(), "proj", &json!({})).unwrap();
        run.log(&Record { step: 0, loss: 1.5 }).unwrap();
        run.log(&Record { step: 1, loss: 0.5 }).unwrap();

        let text = std::fs::read_to_string(run.dir().join("metrics.jsonl")).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 1);
        assert_eq!(lines[1]["loss"], 0.5);
    }

    #[test]
    fn gallery_writes_one_file_per_image() {
        let root = tempfile::tempdir().unwrap();
        let mut run = RunTracker::init(root.path(), "proj", &json!({})).unwrap();
        let images = Tensor::zeros((3, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        run.log_images("sampled_images_5", 2, &images).unwrap();
        let gallery = run.dir().join("media/sampled_images_5/epoch-2");
        assert!(gallery.join("0.png").exists());
        assert!(gallery.join("2.png").exists());
    }

    #[test]
    fn artifacts_are_versioned() {
        let root = tempfile::tempdir().unwrap();
        let mut run = RunTracker::init(root.path(), "proj", &json!({})).unwrap();
        let weights = root.path().join("ct_mnist.safetensors");
        std::fs::write(&weights, b"abc").unwrap();

        let v0 = run
            .log_artifact("model", "model", "weights", &weights, json!({"epoch": 1}))
            .unwrap();
        let v1 = run
            .log_artifact("model", "model", "weights", &weights, json!({"epoch": 2}))
            .unwrap();
        assert_eq!((v0, v1), (0, 1));

        let meta: Value = serde_json::from_str(
            &std::fs::read_to_string(run.dir().join("artifacts/model/v1/metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["metadata"]["epoch"], 2);
        assert!(run.dir().join("artifacts/model/v0/ct_mnist.safetensors").exists());
    }
}
