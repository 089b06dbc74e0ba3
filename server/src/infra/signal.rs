//! Process signalling

/// Signals the runner sends to process groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

#[cfg(unix)]
impl From<KillSignal> for nix::sys::signal::Signal {
    fn from(signal: KillSignal) -> Self {
        match signal {
            KillSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
            KillSignal::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

/// Send `signal` to the process group led by `pid`
pub fn signal_group(pid: u32, signal: KillSignal) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        killpg(Pid::from_raw(pid as i32), nix::sys::signal::Signal::from(signal))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        anyhow::bail!("Process signalling not supported on this platform");
    }

    Ok(())
}

/// Send `signal` to every process in the session led by `sid`.
///
/// Job-control shells put background jobs in their own process groups, so
/// the leader's group alone misses them. Members are found through `/proc`;
/// where that is unavailable only the leader's group is signalled.
/// Returns how many processes were signalled.
pub fn signal_session(sid: u32, signal: KillSignal) -> anyhow::Result<usize> {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::{getsid, Pid};

        let leader = Pid::from_raw(sid as i32);
        let nix_signal = nix::sys::signal::Signal::from(signal);

        let mut signalled = 0;
        if let Ok(entries) = std::fs::read_dir("/proc") {
            for entry in entries.flatten() {
                let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
                    continue;
                };
                let pid = Pid::from_raw(pid);
                if getsid(Some(pid)) == Ok(leader) && kill(pid, nix_signal).is_ok() {
                    signalled += 1;
                }
            }
        }

        if signalled == 0 {
            signal_group(sid, signal)?;
            signalled = 1;
        }
        Ok(signalled)
    }

    #[cfg(not(unix))]
    {
        let _ = (sid, signal);
        anyhow::bail!("Process signalling not supported on this platform");
    }
}
