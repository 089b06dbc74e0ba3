//! Pseudo-terminal spawning

use std::io::{Read, Write};

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};

/// Options for opening a pty and launching a shell in it
#[derive(Debug, Clone)]
pub struct PtySpawnOptions {
    pub shell: String,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

/// Handles to a running pty child
pub struct PtyProcess {
    pub pid: Option<u32>,
    pub master: Box<dyn MasterPty + Send>,
    pub writer: Box<dyn Write + Send>,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Terminal size, with zero dimensions clamped to one cell
pub fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Exit code of a pty child, or `None` if a signal ended it.
///
/// portable-pty reports signal deaths as code 1 and only names the signal
/// in its `Display` output.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if !status.success() && status.to_string().starts_with("Terminated by") {
        None
    } else {
        Some(status.exit_code() as i32)
    }
}

/// Open a pty and spawn the shell inside it
pub fn spawn_pty(opts: &PtySpawnOptions) -> anyhow::Result<PtyProcess> {
    let pty_system = native_pty_system();

    let pair = pty_system.openpty(pty_size(opts.cols, opts.rows))?;

    let mut cmd = CommandBuilder::new(&opts.shell);
    if let Some(cwd) = &opts.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let child = pair.slave.spawn_command(cmd)?;
    // The reader only sees EOF once our copy of the slave side is closed
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    Ok(PtyProcess {
        pid,
        master: pair.master,
        writer,
        reader,
        child,
        killer,
    })
}
