//! Local compiler execution.
//!
//! Fallback path for unsupported/link/configure-test invocations and for any
//! remote failure. Runs inside the daemon (rather than handing back to the
//! wrapper) so one queue throttles every local compile even when the network
//! is down and a whole build falls back at once.

use std::os::unix::process::CommandExt;
use std::process::Command;

/// One local compiler launch with the caller's identity and cwd.
pub struct LocalCompilerLaunch<'a> {
    pub cwd: &'a str,
    pub compiler: &'a str,
    pub cmd_line: &'a [String],
    pub uid: u32,
    pub gid: u32,
}

/// Exit code, stdout and stderr of a finished compiler process.
#[derive(Debug, Clone, Default)]
pub struct LocalCompileResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl LocalCompilerLaunch<'_> {
    pub fn run(&self) -> LocalCompileResult {
        tracing::info!("compile locally: {} {:?}", self.compiler, self.cmd_line);

        let mut command = Command::new(self.compiler);
        command.args(self.cmd_line).current_dir(self.cwd);
        // run as the wrapper's caller, not as the daemon
        if self.uid != 0 || self.gid != 0 {
            command.uid(self.uid).gid(self.gid);
        }

        match command.output() {
            Ok(output) => LocalCompileResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(e) => LocalCompileResult {
                exit_code: 1,
                stdout: Vec::new(),
                stderr: format!("can't launch {}: {e}\n", self.compiler).into_bytes(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch<'a>(compiler: &'a str, cmd_line: &'a [String]) -> LocalCompilerLaunch<'a> {
        LocalCompilerLaunch {
            cwd: "/tmp",
            compiler,
            cmd_line,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn test_run_captures_output_and_exit_code() {
        let args = vec!["hello".to_string()];
        let result = launch("echo", &args).run();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hello\n");
    }

    #[test]
    fn test_nonzero_exit_code() {
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let result = launch("sh", &args).run();
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn test_missing_binary_reports_error() {
        let args: Vec<String> = vec![];
        let result = launch("/no/such/compiler", &args).run();
        assert_eq!(result.exit_code, 1);
        assert!(!result.stderr.is_empty());
    }
}
