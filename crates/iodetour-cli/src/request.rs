//! What to launch and how to track it.

use std::path::{Path, PathBuf};

use iodetour_config::Config;
use iodetour_ipc::{MountedPath, Options, Payload, PayloadError, StdioInheritance};

use crate::error::LaunchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub dependency_file: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub hooks_dll: PathBuf,
    pub ignored_applications: Vec<String>,
    pub mounted_paths: Vec<MountedPath>,
    pub options: Options,
    pub hooks_log: Option<PathBuf>,
    pub worker_thread: bool,
}

impl LaunchRequest {
    /// Combine the command line with the loaded configuration. `ignore`
    /// names options given with `--ignore`; they add to the configured ones.
    pub fn new(
        dependency_file: PathBuf,
        executable: String,
        args: Vec<String>,
        ignore: &[String],
        config: &Config,
        launcher_exe: &Path,
    ) -> Result<Self, LaunchError> {
        let mut options = config
            .options()
            .map_err(|e| LaunchError::Config(e.to_string()))?;
        for name in ignore {
            options |= Options::parse_list(name).map_err(|bad| {
                LaunchError::Config(format!("unknown option name: {bad}"))
            })?;
        }

        Ok(Self {
            dependency_file,
            executable,
            args,
            hooks_dll: config.hooks_dll(launcher_exe),
            ignored_applications: config.tracking.ignored_applications.clone(),
            mounted_paths: config.mounted_paths(),
            options,
            hooks_log: config.logging.hooks_log.clone(),
            worker_thread: config.launcher.worker_thread,
        })
    }

    /// Win32 command line for the root process.
    pub fn command_line(&self) -> String {
        let mut line = quote_arg(&self.executable);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }

    /// Payload for the root process (generation 1) of a run.
    pub fn root_payload(&self, named_pipe_id: &str, launcher_pid: u32) -> Result<Payload, PayloadError> {
        let mut root = Payload::root(named_pipe_id, launcher_pid);
        root.ignored_applications = self.ignored_applications.clone();
        root.mounted_paths = self.mounted_paths.clone();
        root.options = self.options;
        root.for_child(1, launcher_pid, &StdioInheritance::default())
    }
}

/// Quote one argument so `CommandLineToArgvW` and the CRT parse it back
/// unchanged.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{b}', '"']) {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Escape the run of backslashes and the quote itself.
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    // Backslashes before the closing quote must not escape it.
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use iodetour_config::MountConfig;

    fn config() -> Config {
        let mut config = Config::default();
        config.tracking.options = vec!["IgnoreSystem".into()];
        config.tracking.mounted_paths = vec![MountConfig {
            input: r"B:\".into(),
            real: r"C:\build".into(),
        }];
        config
    }

    fn request(ignore: &[String]) -> Result<LaunchRequest, LaunchError> {
        LaunchRequest::new(
            PathBuf::from("out.d"),
            "cl.exe".into(),
            vec!["/c".into(), "main.c".into()],
            ignore,
            &config(),
            &Path::new("tools").join("iowrapper.exe"),
        )
    }

    #[test]
    fn test_cli_ignores_add_to_config() {
        let req = request(&["IgnoreTemporary".into(), "ignore-pipe".into()]).unwrap();
        assert_eq!(
            req.options,
            Options::IGNORE_SYSTEM | Options::IGNORE_TEMPORARY | Options::IGNORE_PIPE
        );
        assert_eq!(req.ignored_applications, vec!["mspdbsrv.exe".to_string()]);
        assert_eq!(req.hooks_dll, Path::new("tools").join("iodetour_hooks.dll"));
    }

    #[test]
    fn test_request_from_project_file() {
        let temp = tempfile::tempdir().unwrap();
        let project = temp.path().join("config.toml");
        std::fs::write(
            &project,
            r#"
[tracking]
options = ["IgnoreDirectory"]
mounted_paths = [{ input = 'R:\', real = 'C:\repo' }]

[launcher]
hooks_dll = "hooks/custom.dll"
worker_thread = true
"#,
        )
        .unwrap();

        let config = Config::load_from(None, &project).unwrap();
        let req = LaunchRequest::new(
            PathBuf::from("out.d"),
            "link.exe".into(),
            Vec::new(),
            &["IgnoreStdio".into()],
            &config,
            &temp.path().join("iowrapper.exe"),
        )
        .unwrap();

        assert_eq!(req.options, Options::IGNORE_DIRECTORY | Options::IGNORE_STDIO);
        assert_eq!(req.mounted_paths, vec![MountedPath::new(r"R:\", r"C:\repo")]);
        assert_eq!(req.hooks_dll, PathBuf::from("hooks/custom.dll"));
        assert!(req.worker_thread);
        assert_eq!(req.ignored_applications, vec!["mspdbsrv.exe".to_string()]);
    }

    #[test]
    fn test_unknown_ignore_is_config_error() {
        let err = request(&["IgnoreEverything".into()]).unwrap_err();
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn test_root_payload_is_generation_one() {
        let req = request(&[]).unwrap();
        let payload = req.root_payload("AbC123", 4242).unwrap();
        assert_eq!(payload.ancestry, vec![1]);
        assert_eq!(payload.ancestry_label(), "1.");
        assert_eq!(payload.parent_process_id, 4242);
        assert_eq!(payload.trace_process_id, 4242);
        assert_eq!(payload.named_pipe_id, "AbC123");
        assert_eq!(payload.mounted_paths, vec![MountedPath::new(r"B:\", r"C:\build")]);
        assert!(payload.options.contains(Options::IGNORE_SYSTEM));
    }

    #[test]
    fn test_command_line() {
        let mut req = request(&[]).unwrap();
        assert_eq!(req.command_line(), "cl.exe /c main.c");
        req.executable = r"C:\Program Files\cl.exe".into();
        req.args = vec![String::new(), "/DNAME=\"x\"".into()];
        assert_eq!(
            req.command_line(),
            r#""C:\Program Files\cl.exe" "" "/DNAME=\"x\"""#
        );
    }

    #[test]
    fn test_quote_arg_backslashes() {
        assert_eq!(quote_arg(r"C:\dir\"), r"C:\dir\");
        assert_eq!(quote_arg(r"C:\my dir\"), r#""C:\my dir\\""#);
        assert_eq!(quote_arg(r#"a\"b"#), r#""a\\\"b""#);
        assert_eq!(quote_arg("plain"), "plain");
    }
}
