//! Shell command construction

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Commands that resolve against the configured bin directory
const RALPH_COMMANDS: [&str; 2] = ["ralph", "ralph-once"];

/// Rewrite a bare `ralph`/`ralph-once` invocation to an absolute path under `bin_dir`
pub fn resolve_command(command: &str, bin_dir: Option<&Path>) -> String {
    let Some(bin_dir) = bin_dir else {
        return command.to_string();
    };

    let trimmed = command.trim_start();
    let head_len = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let (head, rest) = trimmed.split_at(head_len);

    if RALPH_COMMANDS.contains(&head) {
        format!("{}{}", bin_dir.join(head).display(), rest)
    } else {
        command.to_string()
    }
}

/// Build a command that runs `command` through the platform shell
pub fn shell_command(command: &str, cwd: Option<&str>) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        // Own process group, so signals reach every stage of a pipeline
        cmd.process_group(0);
        cmd
    };

    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    cmd
}
