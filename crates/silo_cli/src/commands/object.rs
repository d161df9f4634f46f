//! Object and ban commands.
//!
//! These mount the silo for the duration of one command. The aging
//! thread is not started; the silo is closed cleanly before returning.

use serde::Serialize;
use sha2::{Digest, Sha256};
use silo_core::{Expiry, NewObject, ObjectHash, Silo, SiloConfig};
use std::io::Write;
use std::path::Path;

/// A listed object.
#[derive(Debug, Serialize)]
pub struct ObjectEntry {
    /// Object handle, `serial:index`.
    pub handle: String,
    /// Hex encoded hash.
    pub hash: String,
    /// Payload length in bytes.
    pub len: u64,
    /// Unix time the object becomes dead.
    pub expires: f64,
    /// Newest ban at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban: Option<u64>,
}

/// Hashes a key into an object hash.
pub fn key_hash(key: &str) -> ObjectHash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(key.as_bytes()));
    hash
}

fn hex(hash: &ObjectHash) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn mount(path: &Path) -> Result<Silo, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No silo found at {}", path.display()).into());
    }
    let config = SiloConfig::default()
        .name(path.display().to_string())
        .background_aging(false);
    Ok(Silo::open_path(path, None, config)?)
}

/// Stores `value` under `key`.
pub fn put(
    path: &Path,
    key: &str,
    value: &[u8],
    ttl: f64,
    grace: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let silo = mount(path)?;
    let bans = silo.bans()?;
    let handle = silo.insert(&NewObject {
        hash: key_hash(key),
        expiry: Expiry::new(ttl, grace, 0.0),
        ban: bans.last().map(|b| b.generation),
        payload: value,
    })?;
    silo.close()?;
    println!("{handle}");
    Ok(())
}

/// Writes the newest value stored under `key` to stdout.
pub fn get(path: &Path, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let silo = mount(path)?;
    let object = match silo.find(&key_hash(key))? {
        Some(handle) => silo.lookup(handle)?,
        None => None,
    };
    silo.close()?;
    let object = object.ok_or_else(|| format!("{key}: not found"))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&object.payload)?;
    stdout.flush()?;
    Ok(())
}

/// Lists every live object.
pub fn list(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let silo = mount(path)?;
    let entries: Vec<ObjectEntry> = silo
        .objects()?
        .into_iter()
        .map(|o| ObjectEntry {
            handle: o.handle.to_string(),
            hash: hex(&o.hash),
            len: o.len,
            expires: o.expiry.when(),
            ban: o.ban,
        })
        .collect();
    silo.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => {
            for e in &entries {
                println!("{:<10} {} {:>10} bytes", e.handle, e.hash, e.len);
            }
            println!("{} objects", entries.len());
        }
    }
    Ok(())
}

/// Records a ban.
pub fn ban(path: &Path, spec: &str) -> Result<(), Box<dyn std::error::Error>> {
    let silo = mount(path)?;
    let generation = silo.add_ban(spec.as_bytes())?;
    silo.close()?;
    println!("ban {generation}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_hash_is_sha256() {
        assert_eq!(
            hex(&key_hash("")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn put_then_find() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silo.bin");
        super::super::create::run(&path, "4M", 512).unwrap();
        put(&path, "/index.html", b"<html>", 60.0, 0.0).unwrap();
        ban(&path, "req.url ~ /old").unwrap();
        put(&path, "/index.html", b"<html>v2", 60.0, 0.0).unwrap();

        let silo = mount(&path).unwrap();
        let handle = silo.find(&key_hash("/index.html")).unwrap().unwrap();
        let object = silo.lookup(handle).unwrap().unwrap();
        assert_eq!(object.payload, b"<html>v2");
        assert_eq!(object.ban, Some(1));
        assert_eq!(silo.objects().unwrap().len(), 2);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silo.bin");
        super::super::create::run(&path, "4M", 512).unwrap();
        assert!(super::super::create::run(&path, "4M", 512).is_err());
    }
}
