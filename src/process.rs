//! Launching the hosted instance.
//!
//! The instance runs with the parent's environment minus the embedded-runtime
//! flag (so it starts as a standalone application rather than a bare script
//! runtime) plus one variable naming the plugin directory to host.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{SupervisorConfig, PORT_PLACEHOLDER};

/// Set by embedding hosts; must not leak into the standalone instance.
pub const EMBEDDED_RUNTIME_VAR: &str = "ELECTRON_RUN_AS_NODE";

/// Tells the instance which plugin directory to host.
pub const PLUGIN_LOCATION_VAR: &str = "HOSTED_PLUGIN";

/// Inspector port used when debugging is requested without an explicit port.
pub const DEFAULT_INSPECT_PORT: u16 = 9339;

/// Everything needed to start one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Complete child environment. The child inherits nothing else.
    pub env: Vec<(OsString, OsString)>,
}

impl LaunchSpec {
    pub fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }
}

/// Opens the plugin host's inspector so a debugger can attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InspectOptions {
    /// `None` uses [`DEFAULT_INSPECT_PORT`].
    pub port: Option<u16>,
    /// Pause the plugin host before any plugin code runs.
    pub break_on_start: bool,
}

impl InspectOptions {
    fn to_arg(self) -> String {
        let flag = if self.break_on_start {
            "--hosted-plugin-inspect-brk"
        } else {
            "--hosted-plugin-inspect"
        };
        format!("{flag}={}", self.port.unwrap_or(DEFAULT_INSPECT_PORT))
    }
}

/// Starts instance processes.
pub trait ProcessHost: Send + Sync + 'static {
    /// Spawn with stdout and stderr piped. Must be called inside a tokio runtime.
    fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessHost;

impl ProcessHost for TokioProcessHost {
    fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A dropped supervisor must never leak its instance.
            .kill_on_drop(true);
        cmd.spawn()
    }
}

/// Copy of `vars` without the embedded-runtime flag.
pub fn shaped_environment(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> Vec<(OsString, OsString)> {
    vars.into_iter()
        .filter(|(key, _)| key != EMBEDDED_RUNTIME_VAR)
        .collect()
}

/// Build the launch spec for one run from config and the ambient environment.
pub(crate) fn build_launch_spec(
    config: &SupervisorConfig,
    port: u16,
    plugin_dir: &Path,
    inspect: Option<InspectOptions>,
    ambient: impl IntoIterator<Item = (OsString, OsString)>,
) -> std::io::Result<LaunchSpec> {
    let program = match &config.program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let working_dir = match &config.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let port_str = port.to_string();
    let mut args: Vec<String> = config
        .args
        .iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, &port_str))
        .collect();
    if let Some(inspect) = inspect {
        args.push(inspect.to_arg());
    }

    let mut env = shaped_environment(ambient);
    env.retain(|(key, _)| key != PLUGIN_LOCATION_VAR);
    env.push((PLUGIN_LOCATION_VAR.into(), plugin_dir.as_os_str().to_owned()));

    Ok(LaunchSpec {
        program,
        args,
        working_dir,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs.iter().map(|(k, v)| (k.into(), v.into())).collect()
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            program: Some(PathBuf::from("/opt/app/bin/app")),
            working_dir: Some(PathBuf::from("/opt/app")),
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn shaped_environment_strips_embedded_flag() {
        let env = shaped_environment(vars(&[
            ("PATH", "/usr/bin"),
            (EMBEDDED_RUNTIME_VAR, "1"),
            ("HOME", "/home/dev"),
        ]));
        assert_eq!(env, vars(&[("PATH", "/usr/bin"), ("HOME", "/home/dev")]));
    }

    #[test]
    fn launch_spec_substitutes_port_and_injects_location() {
        let spec = build_launch_spec(
            &test_config(),
            4123,
            Path::new("/work/my-plugin"),
            None,
            vars(&[("PATH", "/usr/bin"), (EMBEDDED_RUNTIME_VAR, "1")]),
        )
        .unwrap();

        assert_eq!(spec.program, PathBuf::from("/opt/app/bin/app"));
        assert_eq!(spec.working_dir, PathBuf::from("/opt/app"));
        assert_eq!(spec.args, vec!["start", "--port=4123"]);
        assert_eq!(spec.env_var(PLUGIN_LOCATION_VAR), Some(OsStr::new("/work/my-plugin")));
        assert_eq!(spec.env_var("PATH"), Some(OsStr::new("/usr/bin")));
        assert_eq!(spec.env_var(EMBEDDED_RUNTIME_VAR), None);
    }

    #[test]
    fn launch_spec_replaces_inherited_location() {
        let spec = build_launch_spec(
            &test_config(),
            3030,
            Path::new("/new"),
            None,
            vars(&[(PLUGIN_LOCATION_VAR, "/stale")]),
        )
        .unwrap();
        let locations: Vec<_> = spec.env.iter().filter(|(k, _)| k == PLUGIN_LOCATION_VAR).collect();
        assert_eq!(locations.len(), 1);
        assert_eq!(spec.env_var(PLUGIN_LOCATION_VAR), Some(OsStr::new("/new")));
    }

    #[test]
    fn launch_spec_appends_inspect_flag() {
        let plain = InspectOptions::default();
        let brk = InspectOptions { port: Some(9229), break_on_start: true };

        let spec = build_launch_spec(&test_config(), 3030, Path::new("/p"), Some(plain), vars(&[])).unwrap();
        assert_eq!(spec.args.last().unwrap(), "--hosted-plugin-inspect=9339");

        let spec = build_launch_spec(&test_config(), 3030, Path::new("/p"), Some(brk), vars(&[])).unwrap();
        assert_eq!(spec.args.last().unwrap(), "--hosted-plugin-inspect-brk=9229");
    }

    #[test]
    fn launch_spec_defaults_to_current_executable() {
        let config = SupervisorConfig::default();
        let spec = build_launch_spec(&config, 3030, Path::new("/p"), None, vars(&[])).unwrap();
        assert_eq!(spec.program, std::env::current_exe().unwrap());
        assert_eq!(spec.working_dir, std::env::current_dir().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_host_passes_only_shaped_environment() {
        let spec = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                format!("echo \"${PLUGIN_LOCATION_VAR}|${{{EMBEDDED_RUNTIME_VAR}:-unset}}\""),
            ],
            working_dir: std::env::temp_dir(),
            env: vars(&[(PLUGIN_LOCATION_VAR, "/plugins/demo")]),
        };
        let child = TokioProcessHost.spawn(&spec).unwrap();
        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "/plugins/demo|unset");
    }

    #[tokio::test]
    async fn tokio_host_reports_missing_program() {
        let spec = LaunchSpec {
            program: PathBuf::from("/definitely/not/a/real/binary"),
            args: vec![],
            working_dir: std::env::temp_dir(),
            env: vec![],
        };
        let err = TokioProcessHost.spawn(&spec).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
