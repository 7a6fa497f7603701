use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::{DbtflowError, ErrorCode, Result};
use crate::resolver::ResolvedEnvironment;
use crate::subprocess::ProcessCommand;

/// Project and profiles directories every stage runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelinePaths {
    pub project_dir: PathBuf,
    pub profiles_dir: PathBuf,
}

impl PipelinePaths {
    pub fn new(project_dir: impl Into<PathBuf>, profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            profiles_dir: profiles_dir.into(),
        }
    }

    /// Paths from config, made absolute against the current directory. The
    /// profiles dir is handed to a process running inside the project dir, so
    /// a relative value would otherwise change meaning.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| {
            DbtflowError::config("cannot determine current directory").with_source(e)
        })?;
        Ok(Self::new(
            absolutize(&cwd, &config.project_dir),
            absolutize(&cwd, &config.profiles_dir),
        ))
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// One argument of a command template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgTemplate {
    Literal(String),
    ProjectDir,
    ProfilesDir,
}

impl ArgTemplate {
    fn render(&self, paths: &PipelinePaths) -> String {
        match self {
            ArgTemplate::Literal(value) => value.clone(),
            ArgTemplate::ProjectDir => paths.project_dir.to_string_lossy().into_owned(),
            ArgTemplate::ProfilesDir => paths.profiles_dir.to_string_lossy().into_owned(),
        }
    }
}

/// Program plus argument templates, rendered per run into a `ProcessCommand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<ArgTemplate>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::Literal(value.into()));
        self
    }

    pub fn project_dir(mut self) -> Self {
        self.args.push(ArgTemplate::ProjectDir);
        self
    }

    pub fn profiles_dir(mut self) -> Self {
        self.args.push(ArgTemplate::ProfilesDir);
        self
    }

    /// Structured invocation: working directory is the project directory, the
    /// resolved environment (if any) is the overlay.
    pub fn render(
        &self,
        paths: &PipelinePaths,
        env: Option<&ResolvedEnvironment>,
    ) -> ProcessCommand {
        let command = ProcessCommand::new(&self.program)
            .args(self.args.iter().map(|arg| arg.render(paths)))
            .current_dir(&paths.project_dir);
        match env {
            Some(env) => command.envs(env.overlay()),
            None => command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStage {
    pub name: String,
    /// Run in order, first failure fails the stage
    pub commands: Vec<CommandTemplate>,
    pub requires_environment: bool,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            requires_environment: true,
        }
    }

    /// A boundary stage with nothing to run
    pub fn marker(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            requires_environment: false,
        }
    }

    pub fn command(mut self, command: CommandTemplate) -> Self {
        self.commands.push(command);
        self
    }

    pub fn is_marker(&self) -> bool {
        self.commands.is_empty()
    }
}

/// An ordered chain of uniquely named stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    name: String,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<PipelineStage>) -> Result<Self> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(DbtflowError::config_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    "stage name must not be empty",
                ));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(DbtflowError::config_with_code(
                    ErrorCode::DUPLICATE_STAGE,
                    format!("stage '{}' is defined more than once", stage.name),
                ));
            }
        }
        Ok(Self {
            name: name.into(),
            stages,
        })
    }

    /// `start → dbt_debug → dbt_deps → dbt_run → dbt_test → end`
    pub fn dbt(config: &PipelineConfig) -> Result<Self> {
        let dbt = || CommandTemplate::new(config.dbt_executable.clone());
        let with_dirs = |command: CommandTemplate| {
            command
                .arg("--profiles-dir")
                .profiles_dir()
                .arg("--project-dir")
                .project_dir()
        };
        let target = config.target.as_str();

        Self::new(
            "dbt_run",
            vec![
                PipelineStage::marker("start"),
                PipelineStage::new("dbt_debug")
                    .command(dbt().arg("--version"))
                    .command(with_dirs(dbt().arg("debug")).arg("-t").arg(target)),
                PipelineStage::new("dbt_deps").command(with_dirs(dbt().arg("deps"))),
                PipelineStage::new("dbt_run")
                    .command(with_dirs(dbt().arg("run")).arg("-t").arg(target)),
                PipelineStage::new("dbt_test")
                    .command(with_dirs(dbt().arg("test")).arg("-t").arg(target)),
                PipelineStage::marker("end"),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> PipelinePaths {
        PipelinePaths::new("/work/my project", "/work/profiles")
    }

    #[test]
    fn test_dbt_pipeline_order() {
        let pipeline = Pipeline::dbt(&PipelineConfig::default()).unwrap();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["start", "dbt_debug", "dbt_deps", "dbt_run", "dbt_test", "end"]
        );
        assert!(pipeline.stages()[0].is_marker());
        assert!(!pipeline.stages()[0].requires_environment);
        assert!(pipeline.stages()[1].requires_environment);
        assert_eq!(pipeline.stages()[1].commands.len(), 2);
    }

    #[test]
    fn test_render_run_command() {
        let pipeline = Pipeline::dbt(&PipelineConfig::default()).unwrap();
        let run = &pipeline.stages()[3];
        let command = run.commands[0].render(&paths(), None);

        assert_eq!(command.program, "dbt");
        assert_eq!(
            command.args,
            vec![
                "run",
                "--profiles-dir",
                "/work/profiles",
                "--project-dir",
                "/work/my project",
                "-t",
                "dev"
            ]
        );
        assert_eq!(command.working_dir, Some(PathBuf::from("/work/my project")));
        assert!(command.env.is_empty());
        assert_eq!(
            command.display_line(),
            "dbt run --profiles-dir /work/profiles --project-dir '/work/my project' -t dev"
        );
    }

    #[test]
    fn test_deps_has_no_target() {
        let pipeline = Pipeline::dbt(&PipelineConfig::default()).unwrap();
        let command = pipeline.stages()[2].commands[0].render(&paths(), None);
        assert!(!command.args.contains(&"-t".to_string()));
    }

    #[test]
    fn test_custom_executable_and_target() {
        let config = PipelineConfig {
            dbt_executable: "/opt/venv/bin/dbt".to_string(),
            target: "prod".to_string(),
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::dbt(&config).unwrap();
        let command = pipeline.stages()[4].commands[0].render(&paths(), None);
        assert_eq!(command.program, "/opt/venv/bin/dbt");
        assert_eq!(command.args.last().map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_duplicate_stage_names_rejected() {
        let err = Pipeline::new(
            "p",
            vec![PipelineStage::marker("a"), PipelineStage::marker("a")],
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DUPLICATE_STAGE);
    }

    #[test]
    fn test_empty_stage_name_rejected() {
        assert!(Pipeline::new("p", vec![PipelineStage::marker(" ")]).is_err());
    }

    #[test]
    fn test_relative_paths_are_absolutized() {
        let config = PipelineConfig {
            project_dir: PathBuf::from("dbt"),
            profiles_dir: PathBuf::from("/etc/dbt"),
            ..PipelineConfig::default()
        };
        let paths = PipelinePaths::from_config(&config).unwrap();
        assert!(paths.project_dir.is_absolute());
        assert!(paths.project_dir.ends_with("dbt"));
        assert_eq!(paths.profiles_dir, PathBuf::from("/etc/dbt"));
    }
}
