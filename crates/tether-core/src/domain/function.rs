//! Function descriptors as produced by the construct/metadata layer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::errors::TetherError;
use super::ids::FunctionId;

/// CPU architecture of the deployed function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[default]
    X86_64,
    #[serde(alias = "arm_64")]
    Arm64,
}

/// A file or directory copied into the artifact after a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFile {
    pub from: PathBuf,
    #[serde(default)]
    pub to: Option<PathBuf>,
}

/// Module format emitted by the node bundler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFormat {
    #[default]
    Esm,
    Cjs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeProps {
    pub format: NodeFormat,
    pub minify: bool,
    /// `Some(false)` disables sourcemaps in deploy mode. Start mode always emits them.
    pub sourcemap: Option<bool>,
    /// Packages left external and installed next to the bundle on deploy.
    pub install: Vec<String>,
    pub external: Vec<String>,
    pub banner: Option<String>,
    /// Path to the esbuild executable. Defaults to `esbuild` on `PATH`.
    pub esbuild: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaProps {
    pub build_task: Option<String>,
    pub build_output_dir: Option<String>,
    /// Classpath entries of the runtime interface client used to run the handler.
    pub runtime_classpath: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DotnetProps {
    /// Path of the bootstrap assembly that hosts the handler locally.
    pub bootstrap: Option<PathBuf>,
    pub framework: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerProps {
    pub file: Option<PathBuf>,
    pub build_args: BTreeMap<String, String>,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PythonProps {
    pub install_commands: Vec<String>,
}

/// Language specific build properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildProps {
    pub environment: HashMap<String, String>,
    pub architecture: Architecture,
    pub memory_size: Option<u32>,
    pub copy_files: Vec<CopyFile>,
    pub nodejs: NodeProps,
    pub java: JavaProps,
    pub dotnet: DotnetProps,
    pub container: ContainerProps,
    pub python: PythonProps,
}

/// One declared function. Immutable for the duration of a synth cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    #[serde(rename = "functionID")]
    pub function_id: FunctionId,
    pub runtime: String,
    /// `path/to/file.exportName` for node/python, a package path for go, etc.
    #[serde(rename = "handler")]
    pub handler_path: String,
    pub source_root: PathBuf,
    #[serde(default)]
    pub build_props: BuildProps,
}

impl FunctionDescriptor {
    pub fn new(
        function_id: impl Into<FunctionId>,
        runtime: impl Into<String>,
        handler_path: impl Into<String>,
        source_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            runtime: runtime.into(),
            handler_path: handler_path.into(),
            source_root: source_root.into(),
            build_props: BuildProps::default(),
        }
    }

    /// The handler path resolved against `source_root`.
    pub fn handler_file(&self) -> PathBuf {
        let handler = Path::new(&self.handler_path);
        if handler.is_absolute() {
            handler.to_path_buf()
        } else {
            self.source_root.join(handler)
        }
    }
}

/// The set of functions known in the current synth cycle.
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    functions: BTreeMap<FunctionId, FunctionDescriptor>,
}

impl FunctionCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = FunctionDescriptor>) -> Self {
        Self {
            functions: descriptors
                .into_iter()
                .map(|d| (d.function_id.clone(), d))
                .collect(),
        }
    }

    /// Parse a JSON array of descriptors.
    pub fn from_json(json: &str) -> Result<Self, TetherError> {
        let descriptors: Vec<FunctionDescriptor> = serde_json::from_str(json)?;
        Ok(Self::new(descriptors))
    }

    pub fn get(&self, function_id: &FunctionId) -> Result<&FunctionDescriptor, TetherError> {
        self.functions
            .get(function_id)
            .ok_or_else(|| TetherError::UnknownFunction(function_id.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
