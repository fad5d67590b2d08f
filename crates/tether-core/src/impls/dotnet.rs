//! .NET handler: `dotnet publish` into the artifact, run through a bootstrap
//! assembly that speaks the runtime API.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fs::{ProjectRoots, find_below, matches_source};
use super::process::{ProcessTable, command, run_build, worker_command};
use crate::domain::{FunctionDescriptor, FunctionId, TetherError, WorkerId};
use crate::ports::{BuildInput, BuildResult, RuntimeFamily, RuntimeHandler, StartWorkerInput};

pub struct DotnetHandler {
    processes: ProcessTable,
    roots: ProjectRoots,
}

impl DotnetHandler {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: ProcessTable::new(grace),
            roots: ProjectRoots::default(),
        }
    }
}

/// `Assembly::Namespace.Class::Method` -> `Assembly`
fn assembly_name(handler: &str) -> &str {
    handler.split(':').next().unwrap_or(handler)
}

/// Target framework for a `dotnet*` runtime. `None` for unknown runtimes.
fn framework(runtime: &str) -> Option<&'static str> {
    match runtime {
        "dotnetcore1.0" | "dotnetcore2.0" | "dotnetcore2.1" | "dotnetcore3.1" => {
            Some("netcoreapp3.1")
        }
        "dotnet6" => Some("net6.0"),
        "dotnet8" => Some("net8.0"),
        _ => None,
    }
}

fn publish_args(out_dir: &Path, framework: &str) -> Vec<String> {
    vec![
        "publish".into(),
        "--output".into(),
        out_dir.to_string_lossy().into_owned(),
        "--configuration".into(),
        "Release".into(),
        "--framework".into(),
        framework.to_string(),
        "/p:GenerateRuntimeConfigurationFiles=true".into(),
        "--self-contained".into(),
        "false".into(),
        "-nologo".into(),
    ]
}

fn locate(function: &FunctionDescriptor) -> Result<(PathBuf, String), String> {
    let name = assembly_name(&function.handler_path);
    let project = find_below(&function.source_root, &format!("{name}.csproj"))
        .ok_or_else(|| format!("could not find {name}.csproj"))?;
    let framework = function
        .build_props
        .dotnet
        .framework
        .clone()
        .or_else(|| framework(&function.runtime).map(str::to_string))
        .ok_or_else(|| format!("no target framework known for runtime {}", function.runtime))?;
    Ok((project, framework))
}

#[async_trait]
impl RuntimeHandler for DotnetHandler {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Dotnet
    }

    async fn build(&self, input: BuildInput) -> BuildResult {
        let (project, framework) = match locate(&input.function) {
            Ok(found) => found,
            Err(diagnostic) => return BuildResult::failed(diagnostic),
        };
        self.roots.record(input.function_id(), &project);

        let dotnet = command("dotnet", publish_args(&input.out_dir, &framework), &project);
        match run_build(dotnet).await {
            Ok(_) => BuildResult::success(input.function.handler_path.clone()),
            Err(diagnostic) => BuildResult::failed(diagnostic),
        }
    }

    async fn start_worker(&self, input: StartWorkerInput) -> Result<(), TetherError> {
        let bootstrap = input
            .function
            .build_props
            .dotnet
            .bootstrap
            .clone()
            .ok_or_else(|| TetherError::WorkerSpawn {
                worker_id: input.worker_id.clone(),
                message: "no dotnet bootstrap assembly configured (buildProps.dotnet.bootstrap)"
                    .into(),
            })?;
        let dir = input.artifact_dir().to_path_buf();
        let handler = input.artifact.entry_handler.clone();
        let args = [
            "exec".to_string(),
            bootstrap.to_string_lossy().into_owned(),
            format!("{}.dll", assembly_name(&handler)),
            handler,
        ];
        let mut env = input.process_env();
        env.insert("AWS_LAMBDA_DOTNET_DEBUG_RUN_ONCE".into(), "true".into());
        self.processes.spawn(
            &input.worker_id,
            worker_command("dotnet", args, &dir, &env),
            input.signals,
        )
    }

    async fn stop_worker(&self, worker_id: &WorkerId) -> Result<(), TetherError> {
        self.processes.stop(worker_id).await;
        Ok(())
    }

    fn should_rebuild(&self, changed_file: &Path, function_id: &FunctionId) -> bool {
        matches_source(changed_file, &["cs", "fs", "csproj", "fsproj"], &[])
            && self.roots.contains(function_id, changed_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    #[rstest]
    #[case("Orders::Orders.Function::Handle", "Orders")]
    #[case("Orders", "Orders")]
    fn assembly_is_the_first_segment(#[case] handler: &str, #[case] expected: &str) {
        assert_eq!(assembly_name(handler), expected);
    }

    #[rstest]
    #[case("dotnetcore3.1", Some("netcoreapp3.1"))]
    #[case("dotnet6", Some("net6.0"))]
    #[case("dotnet8", Some("net8.0"))]
    #[case("dotnet5", None)]
    fn maps_runtime_to_framework(#[case] runtime: &str, #[case] expected: Option<&str>) {
        assert_eq!(framework(runtime), expected);
    }

    #[test]
    fn locates_the_csproj_below_the_source_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("services/orders")).unwrap();
        fs::write(dir.path().join("services/orders/Orders.csproj"), "<Project/>").unwrap();
        let mut function =
            FunctionDescriptor::new("f1", "dotnet6", "Orders::Orders.Function::Handle", dir.path());

        let (project, framework) = locate(&function).unwrap();
        assert_eq!(project, dir.path().join("services/orders"));
        assert_eq!(framework, "net6.0");

        function.build_props.dotnet.framework = Some("net7.0".into());
        assert_eq!(locate(&function).unwrap().1, "net7.0");

        function.handler_path = "Billing::X::Y".into();
        assert_eq!(locate(&function).unwrap_err(), "could not find Billing.csproj");
    }

    #[test]
    fn publish_is_framework_dependent() {
        let args = publish_args(Path::new("/out"), "net6.0");
        assert_eq!(args[0], "publish");
        assert!(args.windows(2).any(|w| w == ["--framework", "net6.0"]));
        assert!(args.windows(2).any(|w| w == ["--self-contained", "false"]));
    }

    #[test]
    fn rebuilds_on_dotnet_sources() {
        let handler = DotnetHandler::new(Duration::from_millis(100));
        let f1 = FunctionId::new("f1");
        handler.roots.record(&f1, "/p");
        assert!(handler.should_rebuild(Path::new("/p/Function.cs"), &f1));
        assert!(handler.should_rebuild(Path::new("/p/Orders.csproj"), &f1));
        assert!(!handler.should_rebuild(Path::new("/p/bin/Orders.dll"), &f1));
    }
}
