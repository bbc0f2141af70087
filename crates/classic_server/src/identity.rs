//! The identity registry backing `/register` and `/login`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha512};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed identity database: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Salted password digests keyed by lower-cased username.
///
/// The database is one JSON object mapping each name to `"{salt}${digest}"`
/// with `digest = Sha512(salt || password)`. Every change rewrites the file
/// through a temp-file-and-rename swap.
pub struct IdentityStore {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl IdentityStore {
    /// Loads the database, starting empty when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let users = match File::open(&path) {
            Ok(file) => serde_json::from_reader(BufReader::new(file))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    /// Stores a new identity. Returns `false` when the name is already taken.
    pub fn register(&self, username: &str, password: &str) -> Result<bool, IdentityError> {
        let key = username.to_lowercase();
        let mut users = self.users.lock();
        if users.contains_key(&key) {
            return Ok(false);
        }

        let salt = hex(&thread_rng().gen::<[u8; 16]>());
        let entry = format!("{salt}${}", digest(&salt, password));
        users.insert(key.clone(), entry);

        if let Err(e) = self.persist(&users) {
            users.remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    /// Checks a password against the stored digest.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let users = self.users.lock();
        let Some(stored) = users.get(&username.to_lowercase()) else {
            return false;
        };
        match stored.split_once('$') {
            Some((salt, expected)) => digest(salt, password) == expected,
            None => false,
        }
    }

    fn persist(&self, users: &HashMap<String, String>) -> Result<(), IdentityError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut out, users)?;
        out.flush()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> IdentityStore {
        IdentityStore::load(dir.path().join("users.json")).unwrap()
    }

    #[test]
    fn register_then_login() {
        let dir = tempfile::tempdir().unwrap();
        let ids = store(&dir);

        assert!(ids.register("Alice", "hunter2").unwrap());
        assert!(ids.verify("Alice", "hunter2"));
        assert!(!ids.verify("Alice", "wrong"));
        assert!(!ids.verify("Nobody", "hunter2"));
    }

    #[test]
    fn names_fold_case() {
        let dir = tempfile::tempdir().unwrap();
        let ids = store(&dir);

        assert!(ids.register("Alice", "hunter2").unwrap());
        assert!(!ids.register("ALICE", "other").unwrap());
        assert!(ids.verify("aLiCe", "hunter2"));
    }

    #[test]
    fn database_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).register("Alice", "hunter2").unwrap());

        let reloaded = store(&dir);
        assert!(reloaded.verify("Alice", "hunter2"));
        assert!(!reloaded.register("alice", "other").unwrap());
    }

    #[test]
    fn salts_differ_between_identities() {
        let dir = tempfile::tempdir().unwrap();
        let ids = store(&dir);
        assert!(ids.register("a", "pw").unwrap());
        assert!(ids.register("b", "pw").unwrap());

        let users = ids.users.lock();
        let salt_a = users["a"].split_once('$').unwrap().0.to_owned();
        let salt_b = users["b"].split_once('$').unwrap().0.to_owned();
        assert_ne!(salt_a, salt_b);
        assert_ne!(users["a"], users["b"]);
    }
}
