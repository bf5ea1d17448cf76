use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use {fd_lock::RwLock as FileLock, serde_json::Value, tempfile::NamedTempFile};

use crate::error::{Error, Result};

/// Mutation applied by [`KeyValueStore::update`]. Returning `None` leaves the
/// key untouched.
pub type Update<'a> = dyn FnMut(Option<Value>) -> Result<Option<Value>> + 'a;

/// Host-provided key-value persistence: get/set/delete by key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Read, transform and write one key. Stores shared between processes
    /// hold their lock across the whole cycle.
    fn update(&self, key: &str, apply: &mut Update<'_>) -> Result<()> {
        match apply(self.get(key)?)? {
            Some(value) => self.set(key, value),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// JSON file store, by default at `~/.hublink/store.json`.
///
/// Writers take an exclusive lock on a sibling `.lock` file and replace the
/// store file by rename, so other processes never read a partial file and
/// never lose each other's keys.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn io_error(&self, op: &str) -> impl Fn(std::io::Error) -> Error + '_ {
        let op = op.to_string();
        move |e| Error::Store(format!("{op} {}: {e}", self.path.display()))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn read_map(&self) -> Result<HashMap<String, Value>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(self.io_error("read")(e)),
        };
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&data).map_err(|e| Error::parse("store file", e))
    }

    fn write_map(&self, dir: &Path, map: &HashMap<String, Value>) -> Result<()> {
        let io = self.io_error("write");
        let data = serde_json::to_string_pretty(map).map_err(|e| Error::parse("store file", e))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(&io)?;
        tmp.write_all(data.as_bytes()).map_err(&io)?;
        tmp.as_file().sync_all().map_err(&io)?;

        // Tokens live in this file.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(&io)?;
        }
        tmp.persist(&self.path).map_err(|e| io(e.error))?;
        Ok(())
    }

    /// Run `apply` on the whole map while holding the in-process and the
    /// cross-process lock.
    fn modify(
        &self,
        apply: impl FnOnce(&mut HashMap<String, Value>) -> Result<bool>,
    ) -> Result<()> {
        let io = self.io_error("lock");
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(&io)?;

        let _guard = lock(&self.write_lock);
        let file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(&io)?;
        let mut file_lock = FileLock::new(file);
        let _held = file_lock.write().map_err(&io)?;

        let mut map = self.read_map()?;
        if apply(&mut map)? {
            self.write_map(&dir, &map)?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.modify(|map| {
            map.insert(key.to_string(), value);
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.modify(|map| Ok(map.remove(key).is_some()))
    }

    fn update(&self, key: &str, apply: &mut Update<'_>) -> Result<()> {
        self.modify(|map| match apply(map.get(key).cloned())? {
            Some(value) => {
                map.insert(key.to_string(), value);
                Ok(true)
            },
            None => Ok(false),
        })
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn update(&self, key: &str, apply: &mut Update<'_>) -> Result<()> {
        let mut entries = lock(&self.entries);
        if let Some(value) = apply(entries.get(key).cloned())? {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }
}
