//! Process setup around the server: PID file, daemonizing and dropping
//! privileges.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::config::Config;

/// An exclusively locked PID file. The lock lives as long as the value.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Lock `path`, failing if another process already holds it.
    pub fn lock(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open PID file {:?}", path))?;
        try_lock(&file)
            .map_err(|_| anyhow!("{:?} is already locked; another instance running?", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn write_pid(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// Remove the PID file at shutdown.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("could not remove PID file {:?}: {}", path, e);
    }
}

/// The uid/gid to switch to, looked up before anything irreversible happens.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Privileges {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[cfg(unix)]
impl Privileges {
    pub fn resolve(config: &Config) -> Result<Self> {
        let gid = match &config.group {
            Some(name) => Some(
                users::get_group_by_name(name)
                    .ok_or_else(|| {
                        anyhow!("Group {} not found, unable to drop privs, aborting", name)
                    })?
                    .gid(),
            ),
            None => None,
        };
        let uid = match &config.user {
            Some(name) => Some(
                users::get_user_by_name(name)
                    .ok_or_else(|| {
                        anyhow!("User {} not found, unable to drop privs, aborting", name)
                    })?
                    .uid(),
            ),
            None => None,
        };
        Ok(Self { uid, gid })
    }

    /// Group first: once the uid is gone we may no longer change it.
    pub fn apply(&self) -> Result<()> {
        if let Some(gid) = self.gid {
            // SAFETY: plain syscall, no pointers involved.
            if unsafe { libc::setgid(gid) } != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("setgid({gid}) failed"));
            }
        }
        if let Some(uid) = self.uid {
            // SAFETY: plain syscall, no pointers involved.
            if unsafe { libc::setuid(uid) } != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("setuid({uid}) failed"));
            }
        }
        Ok(())
    }

    /// Create the log file if needed and hand it to the unprivileged user.
    pub fn prepare_log_file(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        if !dir.exists() {
            bail!("[setting up logging] No such directory {:?}", dir);
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot create file {:?}", path))?;
        if self.uid.is_some() || self.gid.is_some() {
            std::os::unix::fs::chown(path, self.uid, self.gid)
                .with_context(|| format!("Cannot chown {:?}", path))?;
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl Privileges {
    pub fn resolve(config: &Config) -> Result<Self> {
        if config.user.is_some() || config.group.is_some() {
            bail!("Dropping privileges is not supported on this platform");
        }
        Ok(Self::default())
    }

    pub fn apply(&self) -> Result<()> {
        Ok(())
    }

    pub fn prepare_log_file(&self, path: &Path) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot create file {:?}", path))?;
        Ok(())
    }
}

/// Fork into the background. The child writes and locks the PID file,
/// switches user and group, and sends stdout/stderr to the log file.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let pid_file = config
        .pid_file
        .as_ref()
        .ok_or_else(|| anyhow!("cannot daemonize without a pid file"))?;

    let mut daemonize = Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory("/")
        .umask(0o027);
    if let Some(user) = &config.user {
        daemonize = daemonize.user(user.as_str());
    }
    if let Some(group) = &config.group {
        daemonize = daemonize.group(group.as_str());
    }
    if let Some(log_file) = &config.log_file {
        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .with_context(|| format!("Could not access log file {:?}", log_file))
        };
        daemonize = daemonize.stdout(open()?).stderr(open()?);
    }

    daemonize
        .start()
        .map_err(|e| anyhow!("Failed to start daemon mode: {}", e))
}

#[cfg(not(unix))]
pub fn daemonize(_config: &Config) -> Result<()> {
    bail!("Daemon mode not supported on this platform")
}
