//! Pinned host key management.

use failure::{bail, Error};
use structopt::StructOpt;

use session::known_hosts::{HostCheck, KnownHosts, KEY_LEN};

#[derive(StructOpt)]
pub enum Opts {
    /// Pin a host key.
    Add {
        host: String,
        port: u16,
        /// 64 hex characters.
        key: String,
    },
    /// Remove a pinned host key.
    Remove { host: String, port: u16 },
    /// Compare a key against the pinned one.
    Check {
        host: String,
        port: u16,
        /// 64 hex characters.
        key: String,
    },
}

fn parse_key(hex_key: &str) -> Result<[u8; KEY_LEN], Error> {
    let bytes = hex::decode(hex_key)?;
    if bytes.len() != KEY_LEN {
        bail!("key is {} bytes, want {}", bytes.len(), KEY_LEN);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

pub fn run(opts: Opts) -> Result<(), Error> {
    let store = KnownHosts::open_default()?;
    match opts {
        Opts::Add { host, port, key } => {
            store.add(&host, port, &parse_key(&key)?, None)?;
            println!("pinned {}:{}", host, port);
        }
        Opts::Remove { host, port } => {
            if store.remove(&host, port)? {
                println!("removed {}:{}", host, port);
            } else {
                println!("no entry for {}:{}", host, port);
            }
        }
        Opts::Check { host, port, key } => {
            let key = parse_key(&key)?;
            match store.check(&host, port, &key)? {
                HostCheck::Match => println!("match"),
                HostCheck::Unknown => println!("unknown host"),
                HostCheck::Mismatch { expected } => {
                    eprintln!("{}", store.mitm_warning(&host, port, &expected, &key));
                    return Err(base::Error::MitmDetected(format!("{}:{}", host, port)).into());
                }
            }
        }
    }
    Ok(())
}
