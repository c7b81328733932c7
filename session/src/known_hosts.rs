//! Trust-on-first-use key pinning.
//!
//! One record per line in `~/.ascii-chat/known_hosts`:
//! `hostname:port <algo> <hex-key> [comment]`, `#` starts a comment line.
//! The first line whose `hostname:port ` prefix matches wins. Adds append;
//! removes rewrite the file without the matching lines. Not safe across
//! processes; one mutex serializes access within this one.

use std::env;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use log::{info, warn};

use base::sync::TrackedMutex;
use base::Error;

/// Session keys are X25519 public keys.
pub const KEY_LEN: usize = 32;

pub const KEY_ALGO: &str = "x25519";

#[derive(Debug, PartialEq, Eq)]
pub enum HostCheck {
    /// Stored key matches the presented key.
    Match,
    /// Stored key differs: treat as a man-in-the-middle until the operator
    /// says otherwise.
    Mismatch { expected: [u8; KEY_LEN] },
    /// No entry (or no file) for this host.
    Unknown,
}

pub struct KnownHosts {
    path: PathBuf,
    lock: TrackedMutex<()>,
}

fn home_dir() -> Result<PathBuf, Error> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    if cfg!(windows) {
        if let Ok(home) = env::var("USERPROFILE") {
            if !home.is_empty() {
                return Ok(PathBuf::from(home));
            }
        }
    }
    Err(Error::NotFound("no home directory in environment".to_owned()))
}

/// `~/.ascii-chat`, the config directory shared with the identity key.
pub fn config_dir() -> Result<PathBuf, Error> {
    Ok(home_dir()?.join(".ascii-chat"))
}

/// Creates `~/.ascii-chat` (mode 0700) if absent and returns its path.
pub fn ensure_config_dir() -> Result<PathBuf, Error> {
    let dir = config_dir()?;
    create_config_dir(&dir)?;
    Ok(dir)
}

fn create_config_dir(dir: &Path) -> Result<(), Error> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    Ok(())
}

impl KnownHosts {
    /// Opens the default store at `~/.ascii-chat/known_hosts`.
    pub fn open_default() -> Result<KnownHosts, Error> {
        Ok(KnownHosts::with_path(config_dir()?.join("known_hosts")))
    }

    pub fn with_path(path: PathBuf) -> KnownHosts {
        KnownHosts {
            path,
            lock: TrackedMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks `host:port` up against the store. Read-only and repeatable; a
    /// missing file is simply [HostCheck::Unknown].
    pub fn check(&self, host: &str, port: u16, key: &[u8; KEY_LEN]) -> Result<HostCheck, Error> {
        let _guard = self.lock.lock();
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HostCheck::Unknown),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}:{} ", host, port);
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || !line.starts_with(&prefix) {
                continue;
            }
            let mut fields = line.split_whitespace();
            let _hostport = fields.next();
            let _algo = fields.next();
            let hex_key = fields.next().ok_or_else(|| {
                Error::Corrupt(format!("known-hosts entry for {}:{} has no key", host, port))
            })?;
            let stored = hex::decode(hex_key)
                .map_err(|_| Error::Corrupt(format!("bad hex key for {}:{}", host, port)))?;
            if stored.len() != KEY_LEN {
                return Err(Error::Corrupt(format!(
                    "{}-byte key for {}:{}, want {}",
                    stored.len(),
                    host,
                    port,
                    KEY_LEN
                )));
            }
            if stored[..] == key[..] {
                return Ok(HostCheck::Match);
            }
            let mut expected = [0u8; KEY_LEN];
            expected.copy_from_slice(&stored);
            return Ok(HostCheck::Mismatch { expected });
        }
        Ok(HostCheck::Unknown)
    }

    /// Appends a record, creating `~/.ascii-chat` (0700) and the file
    /// (0600) if absent.
    pub fn add(
        &self,
        host: &str,
        port: u16,
        key: &[u8; KEY_LEN],
        comment: Option<&str>,
    ) -> Result<(), Error> {
        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent() {
            create_config_dir(dir)?;
        }
        let mut options = fs::OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut f = options.open(&self.path)?;
        let mut line = format!("{}:{} {} {}", host, port, KEY_ALGO, hex::encode(key));
        if let Some(comment) = comment {
            line.push(' ');
            line.push_str(comment);
        }
        line.push('\n');
        f.write_all(line.as_bytes())?;
        info!("pinned key for {}:{} in {}", host, port, self.path.display());
        Ok(())
    }

    /// Rewrites the file without any record for `host:port`. Returns true
    /// if something was removed.
    pub fn remove(&self, host: &str, port: u16) -> Result<bool, Error> {
        let _guard = self.lock.lock();
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}:{} ", host, port);
        let mut kept = String::with_capacity(contents.len());
        let mut removed = false;
        for line in contents.lines() {
            if line.trim().starts_with(&prefix) {
                removed = true;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        if removed {
            fs::write(&self.path, kept)?;
        }
        Ok(removed)
    }

    /// The fixed warning banner for a pinned-key mismatch. The caller
    /// prints it and aborts the connection.
    pub fn mitm_warning(
        &self,
        host: &str,
        port: u16,
        expected: &[u8; KEY_LEN],
        received: &[u8; KEY_LEN],
    ) -> String {
        warn!("host key mismatch for {}:{}", host, port);
        format!(
            "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
             @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n\
             @@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
             Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
             The {} key sent by {}:{} does not match the key on record.\n\
             Expected: {}\n\
             Received: {}\n\
             If the host really did change its key, remove the stale entry:\n\
             \x20   ascii-chat hosts remove {} {}\n\
             and connect again. The entry is stored in {}.\n",
            KEY_ALGO,
            host,
            port,
            hex::encode(expected),
            hex::encode(received),
            host,
            port,
            self.path.display(),
        )
    }
}
