//! The local identity key: 32 bytes peers pin via the known-hosts store.
//!
//! The real key agreement lives in the secure transport; this only
//! persists the public half at `~/.ascii-chat/identity`.

use std::fs;

use failure::{bail, Error};
use log::info;
use rand::RngCore;

use session::known_hosts::{self, KEY_LEN};

pub fn load_or_create() -> Result<[u8; KEY_LEN], Error> {
    let path = known_hosts::ensure_config_dir()?.join("identity");
    match fs::read(&path) {
        Ok(bytes) => {
            if bytes.len() != KEY_LEN {
                bail!(
                    "identity key at {} is {} bytes, want {}",
                    path.display(),
                    bytes.len(),
                    KEY_LEN
                );
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            use std::io::Write;
            options.open(&path)?.write_all(&key)?;
            info!("generated identity key at {}", path.display());
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}
