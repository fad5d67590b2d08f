//! Node handler: bundles with the esbuild CLI and runs the bundle through the
//! embedded runtime client (`support/node-runtime.mjs`).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::{find_above, link, normalize};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{
    Architecture, BuildMode, FunctionDescriptor, FunctionId, NodeFormat, TetherError, WorkerId,
};
use crate::ports::{
    BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput,
};

const RUNTIME_SHIM: &str = include_str!("../../support/node-runtime.mjs");
const SHIM_FILE: &str = "__tether_runtime.mjs";
const METAFILE: &str = ".tether-metafile.json";

const SOURCE_EXTENSIONS: [&str; 8] = ["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"];
/// Never bundled.
const FORCE_EXTERNAL: [&str; 2] = ["sharp", "pg-native"];

const ESM_BANNER: &str = "import { createRequire as topLevelCreateRequire } from 'module';\n\
const require = topLevelCreateRequire(import.meta.url);\n\
import { fileURLToPath as topLevelFileUrlToPath, URL as topLevelURL } from \"url\";\n\
const __dirname = topLevelFileUrlToPath(new topLevelURL(\".\", import.meta.url));";

/// Inputs of the last bundle of a function.
#[derive(Debug, Default)]
struct BundleInputs {
    files: HashSet<PathBuf>,
    package_json: Option<PathBuf>,
}

/// Where a handler's bundle goes and how the runtime client finds it again.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BundleTarget {
    entry: PathBuf,
    outfile: PathBuf,
    handler: String,
}

pub struct NodeHandler {
    processes: ProcessTable,
    bundles: Mutex<HashMap<FunctionId, BundleInputs>>,
}

impl NodeHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            bundles: Mutex::new(HashMap::new()),
        }
    }

    async fn build_inner(&self, input: &BuildInput) -> Result<String, String> {
        let function = &input.function;
        let target = bundle_target(function, &input.out_dir)?;
        let handler_dir = target
            .entry
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| function.source_root.clone());
        let package_root = find_above(&handler_dir, "package.json");

        if input.mode == BuildMode::Start {
            let root = package_root.as_ref().ok_or_else(|| {
                format!(
                    "could not find package.json for handler \"{}\"",
                    function.handler_path
                )
            })?;
            let modules = root.join("node_modules");
            if modules.exists()
                && let Err(e) = link(&modules, &input.out_dir.join("node_modules"))
            {
                tracing::debug!(function_id = %function.function_id, error = %e, "node_modules link skipped");
            }
        }

        let metafile = input.out_dir.join(METAFILE);
        let esbuild = function
            .build_props
            .nodejs
            .esbuild
            .clone()
            .unwrap_or_else(|| PathBuf::from("esbuild"));
        let args = esbuild_args(function, input.mode, &target, &metafile);
        run_build(command(esbuild, args, &function.source_root)).await?;

        let meta = tokio::fs::read_to_string(&metafile)
            .await
            .map_err(|e| format!("failed to read esbuild metafile: {e}"))?;
        let files = metafile_inputs(&meta, &function.source_root)?;
        let _ = tokio::fs::remove_file(&metafile).await;
        tracing::debug!(function_id = %function.function_id, inputs = files.len(), "bundle inputs recorded");
        self.bundles.lock().insert(
            function.function_id.clone(),
            BundleInputs {
                files,
                package_json: package_root.as_ref().map(|root| root.join("package.json")),
            },
        );

        if input.mode == BuildMode::Deploy {
            install_packages(function, package_root.as_deref(), &input.out_dir).await?;
        }
        Ok(target.handler)
    }
}

#[async_trait]
impl RuntimeHandler for NodeHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Node
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        match self.build_inner(&input).await {
            Ok(handler) => BuildResult::success(handler),
            Err(diagnostic) => BuildResult::failed(diagnostic),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let dir = input.artifact_dir().to_path_buf();
        let shim = dir.join(SHIM_FILE);
        tokio::fs::write(&shim, RUNTIME_SHIM).await?;

        let mut env = input.process_env();
        env.insert("TETHER_ARTIFACT".into(), dir.to_string_lossy().into_owned());
        env.insert("TETHER_HANDLER".into(), input.artifact.entry_handler.clone());
        let args = [
            "--enable-source-maps".to_string(),
            shim.to_string_lossy().into_owned(),
        ];
        self.processes
            .spawn(&input.worker_id, worker_command("node", args, &dir, &env), input.signals)
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        self.processes.stop(worker_id).await;
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        let changed = normalize(changed_file);
        self.bundles.lock().get(function_id).is_some_and(|bundle| {
            bundle.files.contains(&changed) || bundle.package_json.as_ref() == Some(&changed)
        })
    }
}

/// `src/api.handler` -> entry `src/api.ts`, outfile `<out>/src/api.mjs`, handler `src/api.handler`.
fn bundle_target(function: &FunctionDescriptor, out_dir: &Path) -> Result<BundleTarget, String> {
    let handler_file = function.handler_file();
    let missing = || format!("could not find file for handler \"{}\"", function.handler_path);
    let dir = handler_file.parent().ok_or_else(missing)?;
    let stem = handler_file
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(missing)?;
    let export = handler_file
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(missing)?;

    let entry = SOURCE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(missing)?;

    let extension = match function.build_props.nodejs.format {
        NodeFormat::Esm => "mjs",
        NodeFormat::Cjs => "cjs",
    };
    // Lambda のハンドラ名はファイル名と関数名を区切るドットを 1 つしか許さない
    let name = stem.replace('.', "-");
    let relative = normalize(dir)
        .strip_prefix(normalize(&function.source_root))
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let outfile = out_dir.join(&relative).join(format!("{name}.{extension}"));
    let handler = relative
        .join(format!("{name}.{export}"))
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    Ok(BundleTarget {
        entry,
        outfile,
        handler,
    })
}

fn esbuild_args(
    function: &FunctionDescriptor,
    mode: BuildMode,
    target: &BundleTarget,
    metafile: &Path,
) -> Vec<String> {
    let nodejs = &function.build_props.nodejs;
    let mut args = vec![
        target.entry.to_string_lossy().into_owned(),
        "--bundle".to_string(),
        "--platform=node".to_string(),
        "--keep-names".to_string(),
        "--log-level=warning".to_string(),
        format!("--metafile={}", metafile.display()),
        format!("--outfile={}", target.outfile.display()),
    ];

    let externals = FORCE_EXTERNAL
        .iter()
        .map(|s| s.to_string())
        .chain(nodejs.install.iter().cloned())
        .chain(nodejs.external.iter().cloned());
    args.extend(externals.map(|pkg| format!("--external:{pkg}")));

    match nodejs.format {
        NodeFormat::Esm => {
            args.push("--format=esm".into());
            args.push("--target=esnext".into());
            args.push("--main-fields=module,main".into());
            let banner = match &nodejs.banner {
                Some(extra) => format!("{ESM_BANNER}\n{extra}"),
                None => ESM_BANNER.to_string(),
            };
            args.push(format!("--banner:js={banner}"));
        }
        NodeFormat::Cjs => {
            args.push("--format=cjs".into());
            args.push("--target=node14".into());
            if let Some(banner) = &nodejs.banner {
                args.push(format!("--banner:js={banner}"));
            }
        }
    }

    match mode {
        BuildMode::Start => args.push("--sourcemap=linked".into()),
        BuildMode::Deploy => {
            if nodejs.sourcemap != Some(false) {
                args.push("--sourcemap".into());
            }
            if nodejs.minify {
                args.push("--minify".into());
            }
        }
    }
    args
}

/// Input files of an esbuild metafile, resolved against the working directory
/// esbuild ran in.
fn metafile_inputs(metafile: &str, cwd: &Path) -> Result<HashSet<PathBuf>, String> {
    let meta: serde_json::Value =
        serde_json::from_str(metafile).map_err(|e| format!("invalid esbuild metafile: {e}"))?;
    let inputs = meta
        .get("inputs")
        .and_then(|v| v.as_object())
        .ok_or("esbuild metafile has no inputs")?;
    Ok(inputs
        .keys()
        // 名前空間付きの仮想モジュール（"ns:path"）は除外
        .filter(|key| !key.contains(':') || Path::new(key).is_absolute())
        .map(|key| normalize(&cwd.join(key)))
        .collect())
}

/// Deploy only: install the packages left external next to the bundle.
async fn install_packages(
    function: &FunctionDescriptor,
    package_root: Option<&Path>,
    out_dir: &Path,
) -> Result<(), String> {
    let install = &function.build_props.nodejs.install;
    if install.is_empty() {
        return Ok(());
    }
    let root = package_root.ok_or_else(|| {
        format!(
            "could not find package.json for handler \"{}\"",
            function.handler_path
        )
    })?;
    let manifest = tokio::fs::read_to_string(root.join("package.json"))
        .await
        .map_err(|e| format!("failed to read package.json: {e}"))?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest).map_err(|e| format!("invalid package.json: {e}"))?;

    let dependencies: BTreeMap<&str, String> = install
        .iter()
        .map(|pkg| {
            let version = manifest
                .get("dependencies")
                .and_then(|deps| deps.get(pkg))
                .and_then(|v| v.as_str())
                .unwrap_or("*");
            (pkg.as_str(), version.to_string())
        })
        .collect();
    let package = serde_json::json!({ "dependencies": dependencies });
    tokio::fs::write(out_dir.join("package.json"), package.to_string())
        .await
        .map_err(|e| format!("failed to write package.json: {e}"))?;

    let (arch, cpu) = match function.build_props.architecture {
        Architecture::Arm64 => ("--arch=arm64", "--cpu=arm64"),
        Architecture::X86_64 => ("--arch=x64", "--cpu=x64"),
    };
    let args = [
        "install",
        "--omit=dev",
        "--no-optional",
        "--force",
        "--platform=linux",
        arch,
        "--os=linux",
        cpu,
    ];
    run_build(command("npm", args, out_dir)).await.map(|_| ())
}
