//! Per-case working directory: the artifact store that staging, compilation,
//! inference and comparison all read from and write to.
//!
//! Layout under the root:
//! - `model.<ext>`: the serialized model;
//! - `model.kmodel`: the compiled artifact;
//! - `<case>.input.<ext>`, `<case>.expect.<ext>`, `<case>.candidate.<ext>`;
//! - `manifest.json`: shape, element type, format and digest of every staged file.

use crate::{HarnessError, StepLog, sha256_hex};
use ncv_interp::ModelSource;
use ncv_io::{DatasetFormat, decode_raw_flat, decode_tensor, encode_tensor};
use ncv_ndarray::{ElementType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const MODEL_STEM: &str = "model";
pub const ARTIFACT_FILE: &str = "model.kmodel";
pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Input,
    Expected,
    Candidate,
}

impl TensorRole {
    #[must_use]
    pub const fn stem(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Expected => "expect",
            Self::Candidate => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub file: String,
    pub format: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub case: String,
    pub role: TensorRole,
    pub file: String,
    /// `None` for headerless files written by an external tool.
    pub shape: Option<Vec<usize>>,
    pub dtype: String,
    pub format: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u8,
    #[serde(default)]
    pub model: Option<ModelEntry>,
    #[serde(default)]
    pub tensors: Vec<TensorEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            model: None,
            tensors: Vec::new(),
        }
    }
}

impl Manifest {
    fn upsert(&mut self, entry: TensorEntry) {
        self.tensors
            .retain(|existing| !(existing.case == entry.case && existing.role == entry.role));
        self.tensors.push(entry);
    }

    #[must_use]
    pub fn tensor(&self, case: &str, role: TensorRole) -> Option<&TensorEntry> {
        self.tensors
            .iter()
            .find(|entry| entry.case == case && entry.role == role)
    }
}

fn validate_case_name(case: &str) -> Result<(), HarnessError> {
    if case.trim().is_empty()
        || case.contains(['/', '\\'])
        || case.starts_with('.')
        || case == MODEL_STEM
    {
        return Err(HarnessError::Config(format!(
            "case name '{case}' is not a plain file stem"
        )));
    }
    Ok(())
}

/// A staging directory plus the dataset format its tensor files are written in.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    format: DatasetFormat,
}

impl WorkDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, format: DatasetFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn format(&self) -> DatasetFormat {
        self.format
    }

    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.root.join(ARTIFACT_FILE)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn tensor_path(&self, case: &str, role: TensorRole) -> PathBuf {
        self.root.join(format!(
            "{case}.{}.{}",
            role.stem(),
            self.format.extension()
        ))
    }

    /// Create-or-reset: afterwards the root exists and holds nothing.
    pub fn clear(&self) -> Result<(), HarnessError> {
        let mut step = StepLog::start("", "clear");
        step.add_artifact(&self.root);
        step.finish(self.reset_root())
    }

    fn reset_root(&self) -> Result<(), HarnessError> {
        match fs::symlink_metadata(&self.root) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.root)
                .map_err(|err| HarnessError::staging(&self.root, err))?,
            Ok(_) => {
                fs::remove_file(&self.root).map_err(|err| HarnessError::staging(&self.root, err))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(HarnessError::staging(&self.root, err)),
        }
        fs::create_dir_all(&self.root).map_err(|err| HarnessError::staging(&self.root, err))
    }

    pub fn save_model(&self, model: &dyn ModelSource) -> Result<PathBuf, HarnessError> {
        let mut step = StepLog::start("", "save_model");
        let result = (|| -> Result<PathBuf, HarnessError> {
            let bytes = model
                .serialize()
                .map_err(|err| HarnessError::ModelInvalid(err.to_string()))?;
            let format = model.format();
            let file = format!("{MODEL_STEM}.{}", format.extension);
            let path = self.root.join(&file);
            let digest = sha256_hex(&bytes);
            self.write_file(&path, &bytes)?;

            let mut manifest = self.read_manifest()?;
            manifest.model = Some(ModelEntry {
                file,
                format: format.name.to_string(),
                sha256: digest.clone(),
            });
            self.write_manifest(&manifest)?;
            step.output_digest = digest;
            step.add_artifact(&path);
            Ok(path)
        })();
        step.finish(result)
    }

    pub fn save_input(&self, case: &str, tensor: &Tensor) -> Result<PathBuf, HarnessError> {
        self.save_tensor(case, TensorRole::Input, tensor)
    }

    pub fn save_expect(&self, case: &str, tensor: &Tensor) -> Result<PathBuf, HarnessError> {
        self.save_tensor(case, TensorRole::Expected, tensor)
    }

    pub fn save_tensor(
        &self,
        case: &str,
        role: TensorRole,
        tensor: &Tensor,
    ) -> Result<PathBuf, HarnessError> {
        let mut step = StepLog::start(case, "stage");
        let result = (|| -> Result<PathBuf, HarnessError> {
            validate_case_name(case)?;
            let path = self.tensor_path(case, role);
            let bytes = encode_tensor(tensor, self.format)
                .map_err(|err| HarnessError::staging(&path, err))?;
            let digest = sha256_hex(&bytes);
            self.write_file(&path, &bytes)?;

            let mut manifest = self.read_manifest()?;
            manifest.upsert(TensorEntry {
                case: case.to_string(),
                role,
                file: file_name(&path),
                shape: Some(tensor.shape().to_vec()),
                dtype: tensor.element_type().name().to_string(),
                format: self.format.as_str().to_string(),
                sha256: digest.clone(),
            });
            self.write_manifest(&manifest)?;
            step.output_digest = digest;
            step.detail = role.stem().to_string();
            step.add_artifact(&path);
            Ok(path)
        })();
        step.finish(result)
    }

    /// Registers a tensor file that an external tool wrote at
    /// `tensor_path(case, role)`. Raw files are recorded without a shape.
    pub fn record_external(
        &self,
        case: &str,
        role: TensorRole,
        element_type: ElementType,
    ) -> Result<TensorEntry, HarnessError> {
        validate_case_name(case)?;
        let path = self.tensor_path(case, role);
        let bytes = read_existing(&path)?;
        let (shape, dtype) = match self.format {
            DatasetFormat::Raw => (None, element_type),
            DatasetFormat::Npy => {
                let tensor = decode_tensor(&bytes, self.format, &[], element_type)
                    .map_err(|err| decode_error(&path, err))?;
                (Some(tensor.shape().to_vec()), tensor.element_type())
            }
        };
        let entry = TensorEntry {
            case: case.to_string(),
            role,
            file: file_name(&path),
            shape,
            dtype: dtype.name().to_string(),
            format: self.format.as_str().to_string(),
            sha256: sha256_hex(&bytes),
        };
        let mut manifest = self.read_manifest()?;
        manifest.upsert(entry.clone());
        self.write_manifest(&manifest)?;
        Ok(entry)
    }

    /// Whether `(case, role)` is in the manifest and its file is on disk. An
    /// unreadable manifest is an error, not an absent tensor.
    pub fn has_tensor(&self, case: &str, role: TensorRole) -> Result<bool, HarnessError> {
        let manifest = self.read_manifest()?;
        Ok(manifest
            .tensor(case, role)
            .is_some_and(|entry| self.root.join(&entry.file).is_file()))
    }

    /// Manifest entries for staged `input` tensors whose files still exist.
    pub fn staged_inputs(&self) -> Result<Vec<TensorEntry>, HarnessError> {
        let manifest = self.read_manifest()?;
        Ok(manifest
            .tensors
            .into_iter()
            .filter(|entry| {
                entry.role == TensorRole::Input && self.root.join(&entry.file).is_file()
            })
            .collect())
    }

    pub fn tensor_entry(&self, case: &str, role: TensorRole) -> Result<TensorEntry, HarnessError> {
        let manifest = self.read_manifest()?;
        manifest.tensor(case, role).cloned().ok_or_else(|| {
            HarnessError::missing(
                &self.tensor_path(case, role),
                format!("no {} tensor staged for case '{case}'", role.stem()),
            )
        })
    }

    /// Loads a staged tensor. Entries without a recorded shape load flat.
    pub fn load_tensor(&self, case: &str, role: TensorRole) -> Result<Tensor, HarnessError> {
        let entry = self.tensor_entry(case, role)?;
        let path = self.root.join(&entry.file);
        let bytes = read_existing(&path)?;
        let format = DatasetFormat::parse(&entry.format).map_err(|err| decode_error(&path, err))?;
        let element_type = ElementType::parse(&entry.dtype).ok_or_else(|| {
            decode_error(&path, format!("unknown element type '{}'", entry.dtype))
        })?;
        let decoded = match &entry.shape {
            Some(shape) => decode_tensor(&bytes, format, shape, element_type),
            None if format == DatasetFormat::Raw => decode_raw_flat(&bytes, element_type),
            None => decode_tensor(&bytes, format, &[], element_type),
        };
        decoded.map_err(|err| decode_error(&path, err))
    }

    /// Path and format name of the staged model.
    pub fn model(&self) -> Result<(PathBuf, String), HarnessError> {
        let manifest = self.read_manifest()?;
        let entry = manifest.model.ok_or_else(|| {
            HarnessError::missing(&self.root.join(MODEL_STEM), "no model has been staged")
        })?;
        let path = self.root.join(&entry.file);
        if !path.is_file() {
            return Err(HarnessError::missing(&path, "staged model file was removed"));
        }
        Ok((path, entry.format))
    }

    /// Case names with at least one staged tensor, sorted.
    pub fn staged_cases(&self) -> Result<Vec<String>, HarnessError> {
        let manifest = self.read_manifest()?;
        let cases: BTreeSet<String> = manifest
            .tensors
            .into_iter()
            .map(|entry| entry.case)
            .collect();
        Ok(cases.into_iter().collect())
    }

    pub fn read_manifest(&self) -> Result<Manifest, HarnessError> {
        let path = self.manifest_path();
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| decode_error(&path, err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(err) => Err(HarnessError::staging(&path, err)),
        }
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<(), HarnessError> {
        let path = self.manifest_path();
        let raw = serde_json::to_string_pretty(manifest)
            .map_err(|err| HarnessError::staging(&path, err))?;
        self.write_file(&path, raw.as_bytes())
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
        fs::create_dir_all(&self.root).map_err(|err| HarnessError::staging(&self.root, err))?;
        fs::write(path, bytes).map_err(|err| HarnessError::staging(path, err))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn read_existing(path: &Path) -> Result<Vec<u8>, HarnessError> {
    fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            HarnessError::missing(path, "file does not exist")
        } else {
            HarnessError::staging(path, err)
        }
    })
}

fn decode_error(path: &Path, err: impl std::fmt::Display) -> HarnessError {
    HarnessError::TensorDecode {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}
