//! Runs script commands with an optional timeout, capturing bounded output.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;
const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            success: false,
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// Executes one already-validated command line inside `cwd`.
///
/// A command that ran and failed is an `Ok` output with `success == false`; `Err`
/// is reserved for faults in the runner itself.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
        let mut cmd = build_command(command)?;
        cmd.current_dir(cwd);
        run_with_timeout(cmd, self.timeout)
    }
}

fn build_command(command: &str) -> Result<Command> {
    if needs_shell(command) {
        return Ok(shell_command(command));
    }
    let args = split_command_line(command);
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("cannot run an empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(rest);
    Ok(cmd)
}

fn needs_shell(command: &str) -> bool {
    command
        .chars()
        .any(|ch| matches!(ch, '|' | '<' | '>' | '&' | '$' | '*' | '?'))
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Splits a command line into arguments, honouring single and double quotes.
pub(crate) fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(open), c) if c == open => quote = None,
            (Some('"'), '\\') if !cfg!(windows) => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                in_token = true;
            }
            (None, '\\') if !cfg!(windows) => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_token = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning command");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(CommandOutput::failed(
                EXIT_NOT_FOUND,
                format!("command not found: {program}"),
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to spawn command '{program}'"));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_limited(stdout, OUTPUT_LIMIT_BYTES));
    let stderr_handle = thread::spawn(move || read_limited(stderr, OUTPUT_LIMIT_BYTES));

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("failed waiting for command")?,
        Some(limit) => match child
            .wait_timeout(limit)
            .context("failed waiting for command")?
        {
            Some(status) => status,
            None => {
                warn!(program = %program, timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                kill_process_tree(&mut child)?;
                child
                    .wait()
                    .context("failed waiting for command after kill")?
            }
        },
    };

    let stdout = join_reader(stdout_handle).context("failed reading command stdout")?;
    let stderr = join_reader(stderr_handle).context("failed reading command stderr")?;
    debug!(program = %program, exit_code = ?status.code(), timed_out, "command finished");

    Ok(CommandOutput {
        exit_code: status.code(),
        success: status.success() && !timed_out,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

/// Puts the command in its own process group so a timeout can reach every
/// process a shell pipeline starts.
#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("failed killing timed out command group"),
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("failed killing timed out command")
}

fn read_limited(mut reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(kept);
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&buffer[..read.min(room)]);
    }
}

fn join_reader(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_line_honours_quotes() {
        assert_eq!(
            split_command_line(r#"git commit -m "first change" 'a b'"#),
            vec!["git", "commit", "-m", "first change", "a b"]
        );
        assert_eq!(split_command_line("  echo   hi  "), vec!["echo", "hi"]);
        assert_eq!(split_command_line(r#"echo """#), vec!["echo", ""]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn needs_shell_detects_redirection_and_pipes() {
        assert!(needs_shell("ls | wc -l"));
        assert!(needs_shell("echo hi > out.txt"));
        assert!(needs_shell("echo $HOME"));
        assert!(!needs_shell("echo hello"));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output_and_exit_codes() {
        let runner = SystemCommandRunner::new(Some(Duration::from_secs(10)));
        let cwd = std::env::temp_dir();

        let ok = runner.run("echo hello", &cwd).expect("echo must run");
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.run("false", &cwd).expect("false must run");
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(1));

        let missing = runner
            .run("rigger-definitely-not-a-real-binary", &cwd)
            .expect("missing binary must be reported as output");
        assert!(!missing.success);
        assert_eq!(missing.exit_code, Some(EXIT_NOT_FOUND));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_kills_commands_past_the_timeout() {
        let runner = SystemCommandRunner::new(Some(Duration::from_millis(200)));
        let output = runner
            .run("sleep 5", &std::env::temp_dir())
            .expect("sleep must run");
        assert!(output.timed_out);
        assert!(!output.success);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_every_process_in_a_pipeline() {
        let runner = SystemCommandRunner::new(Some(Duration::from_millis(300)));
        let started = std::time::Instant::now();
        let output = runner
            .run("sleep 4 | cat", &std::env::temp_dir())
            .expect("pipeline must run");
        assert!(output.timed_out);
        assert!(!output.success);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "pipeline outlived its timeout: {:?}",
            started.elapsed()
        );
    }
}
