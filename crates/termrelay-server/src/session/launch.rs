//! Startup commands for persistent and ephemeral shells.

use super::pty::SpawnSpec;
use std::collections::HashMap;
use std::path::Path;

/// How shells and the assistant CLI are started.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    /// Interpreter for `-c` commands and the ephemeral interactive shell.
    pub shell: String,
    /// Assistant CLI invoked in persistent sessions.
    pub assistant_command: String,
    /// Flag that makes the assistant resume a prior conversation.
    pub resume_flag: String,
    /// Opaque variables merged into every subprocess environment.
    pub env: HashMap<String, String>,
}

impl ShellSettings {
    /// `cd <path> && <assistant [resume flag id || assistant]>`
    pub fn startup_command(&self, project: &Path, resume_target: Option<&str>) -> String {
        let assistant = &self.assistant_command;
        let invocation = match resume_target {
            Some(id) => format!(
                "{assistant} {} {} || {assistant}",
                self.resume_flag,
                shell_quote(id)
            ),
            None => assistant.clone(),
        };
        format!(
            "cd {} && {invocation}",
            shell_quote(&project.to_string_lossy())
        )
    }

    /// Spawn spec for a registry-backed session.
    pub fn persistent_spec(
        &self,
        project: &Path,
        resume_target: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> SpawnSpec {
        SpawnSpec {
            program: self.shell.clone(),
            args: vec!["-c".into(), self.startup_command(project, resume_target)],
            cwd: project.to_path_buf(),
            cols,
            rows,
            env: self.env.clone(),
        }
    }

    /// Spawn spec for a per-connection shell: the interactive shell itself,
    /// or `cd <path> && <command>` when an initial command is given.
    pub fn ephemeral_spec(
        &self,
        project: &Path,
        command: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> SpawnSpec {
        let args = match command.map(str::trim).filter(|c| !c.is_empty()) {
            Some(command) => vec![
                "-c".into(),
                format!("cd {} && {command}", shell_quote(&project.to_string_lossy())),
            ],
            None => Vec::new(),
        };
        SpawnSpec {
            program: self.shell.clone(),
            args,
            cwd: project.to_path_buf(),
            cols,
            rows,
            env: self.env.clone(),
        }
    }
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ShellSettings {
        ShellSettings {
            shell: "/bin/bash".into(),
            assistant_command: "claude".into(),
            resume_flag: "--resume".into(),
            env: HashMap::from([("ANTHROPIC_BASE_URL".to_string(), "http://proxy".to_string())]),
        }
    }

    #[test]
    fn plain_startup_command() {
        let cmd = settings().startup_command(Path::new("/proj/a"), None);
        assert_eq!(cmd, "cd '/proj/a' && claude");
    }

    #[test]
    fn resume_falls_back_to_plain_invocation() {
        let cmd = settings().startup_command(Path::new("/proj/a"), Some("abc-123"));
        assert_eq!(cmd, "cd '/proj/a' && claude --resume 'abc-123' || claude");
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        let cmd = settings().startup_command(Path::new("/tmp/it's here"), None);
        assert_eq!(cmd, r"cd '/tmp/it'\''s here' && claude");
    }

    #[test]
    fn persistent_spec_runs_through_shell() {
        let spec = settings().persistent_spec(Path::new("/proj/a"), None, 120, 40);
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args[0], "-c");
        assert_eq!(spec.cwd, Path::new("/proj/a"));
        assert_eq!((spec.cols, spec.rows), (120, 40));
        assert_eq!(spec.env.get("ANTHROPIC_BASE_URL").map(String::as_str), Some("http://proxy"));
    }

    #[test]
    fn ephemeral_spec_without_command_is_bare_shell() {
        let spec = settings().ephemeral_spec(Path::new("/proj/a"), None, 80, 24);
        assert!(spec.args.is_empty());
        let spec = settings().ephemeral_spec(Path::new("/proj/a"), Some("  "), 80, 24);
        assert!(spec.args.is_empty());
        let spec = settings().ephemeral_spec(Path::new("/proj/a"), Some("npm test"), 80, 24);
        assert_eq!(spec.args, vec!["-c".to_string(), "cd '/proj/a' && npm test".to_string()]);
    }
}
