//! Three-slot persistence.
//!
//! `<name>.tf1` is the primary copy, `<name>.tf2` the previous one and
//! `<name>.tf3` a save in progress. A save writes `.tf3`, syncs it, moves
//! `.tf1` to `.tf2` and finally `.tf3` to `.tf1`, so at every instant at
//! least one complete copy exists.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lws_config::{log_tables_debug, log_tables_warn};
use tracing::instrument;

use crate::{Result, TableError};

#[derive(Debug, Clone)]
pub struct SlotFiles {
    dir: PathBuf,
    name: String,
}

/// A table decoded from disk.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    /// The primary was unreadable and the backup was used instead
    pub from_backup: bool,
}

impl SlotFiles {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn primary(&self) -> PathBuf {
        self.dir.join(format!("{}.tf1", self.name))
    }

    pub fn backup(&self) -> PathBuf {
        self.dir.join(format!("{}.tf2", self.name))
    }

    pub fn in_progress(&self) -> PathBuf {
        self.dir.join(format!("{}.tf3", self.name))
    }

    /// Repair the slot set after an interrupted save.
    pub fn recover(&self) -> Result<()> {
        remove_if_exists(&self.in_progress())?;
        let primary = self.primary();
        let backup = self.backup();
        if !primary.exists() && backup.exists() {
            log_tables_warn!(
                "Promoting backup table",
                table = self.name.as_str()
            );
            fs::rename(&backup, &primary)?;
        }
        Ok(())
    }

    /// Load and decode the table. `Ok(None)` when no slot exists.
    #[instrument(skip(self, decode), fields(table = %self.name), level = "debug")]
    pub fn load_with<T, F>(&self, decode: F) -> Result<Option<Loaded<T>>>
    where
        F: Fn(&[u8], &Path) -> Result<T>,
    {
        self.recover()?;
        let primary = self.primary();
        let bytes = match fs::read(&primary) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match decode(&bytes, &primary) {
            Ok(value) => Ok(Some(Loaded {
                value,
                from_backup: false,
            })),
            Err(err @ TableError::InvalidTable { .. }) => {
                let backup = self.backup();
                let Ok(backup_bytes) = fs::read(&backup) else {
                    return Err(err);
                };
                match decode(&backup_bytes, &backup) {
                    Ok(value) => {
                        log_tables_warn!(
                            "Primary table invalid, using backup",
                            table = self.name.as_str(),
                            error = tracing::field::display(&err)
                        );
                        Ok(Some(Loaded {
                            value,
                            from_backup: true,
                        }))
                    }
                    Err(_) => Err(err),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write a new primary copy, keeping the old one as backup.
    #[instrument(skip(self, bytes), fields(table = %self.name, len = bytes.len()), level = "debug")]
    pub fn save(&self, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let in_progress = self.in_progress();
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&in_progress)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&in_progress);
            return Err(e.into());
        }

        let primary = self.primary();
        if primary.exists() {
            fs::rename(&primary, self.backup())?;
        }
        fs::rename(&in_progress, &primary)?;
        log_tables_debug!("Saved table", table = self.name.as_str());
        Ok(())
    }

    /// Remove every slot.
    pub fn delete(&self) -> Result<()> {
        for path in [self.primary(), self.backup(), self.in_progress()] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A table persisted through [`SlotFiles`].
pub trait MetadataTable: Default + Sized {
    /// Slot base name, e.g. `pendingchanges`
    const NAME: &'static str;

    fn decode(bytes: &[u8], path: &Path) -> Result<Self>;
    fn encode(&self) -> Result<Vec<u8>>;

    fn is_dirty(&self) -> bool;
    fn set_dirty(&mut self, dirty: bool);

    /// Hook run right before a dirty table is encoded.
    fn before_save(&mut self) {}

    /// Load from `dir`; an absent table loads empty. A table recovered from
    /// its backup comes back dirty so the next save rewrites the primary.
    fn load(dir: &Path) -> Result<Self> {
        match SlotFiles::new(dir, Self::NAME).load_with(Self::decode)? {
            Some(loaded) => {
                let mut table = loaded.value;
                table.set_dirty(loaded.from_backup);
                Ok(table)
            }
            None => Ok(Self::default()),
        }
    }

    /// Save to `dir` when dirty.
    fn save(&mut self, dir: &Path) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.before_save();
        let bytes = self.encode()?;
        SlotFiles::new(dir, Self::NAME).save(&bytes)?;
        self.set_dirty(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decode_text(bytes: &[u8], path: &Path) -> Result<String> {
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| TableError::InvalidTable {
            path: path.to_path_buf(),
            reason: "not utf-8".into(),
        })?;
        if s.starts_with("ok:") {
            Ok(s)
        } else {
            Err(TableError::InvalidTable {
                path: path.to_path_buf(),
                reason: "bad header".into(),
            })
        }
    }

    #[test]
    fn test_save_rotates_primary_into_backup() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        slots.save(b"ok:1").unwrap();
        slots.save(b"ok:2").unwrap();
        assert_eq!(fs::read(slots.primary()).unwrap(), b"ok:2");
        assert_eq!(fs::read(slots.backup()).unwrap(), b"ok:1");
        assert!(!slots.in_progress().exists());
    }

    #[test]
    fn test_missing_table_loads_none() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        assert!(slots.load_with(decode_text).unwrap().is_none());
    }

    #[test]
    fn test_stray_in_progress_is_deleted() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        slots.save(b"ok:1").unwrap();
        fs::write(slots.in_progress(), b"half writ").unwrap();
        let loaded = slots.load_with(decode_text).unwrap().unwrap();
        assert_eq!(loaded.value, "ok:1");
        assert!(!slots.in_progress().exists());
    }

    #[test]
    fn test_backup_promoted_when_primary_missing() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        fs::write(slots.backup(), b"ok:old").unwrap();
        let loaded = slots.load_with(decode_text).unwrap().unwrap();
        assert_eq!(loaded.value, "ok:old");
        assert!(!loaded.from_backup);
        assert!(slots.primary().exists());
    }

    #[test]
    fn test_invalid_primary_falls_back_to_backup() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        slots.save(b"ok:1").unwrap();
        slots.save(b"ok:2").unwrap();
        fs::write(slots.primary(), b"garbage").unwrap();

        let loaded = slots.load_with(decode_text).unwrap().unwrap();
        assert_eq!(loaded.value, "ok:1");
        assert!(loaded.from_backup);
    }

    #[test]
    fn test_both_slots_invalid_fails() {
        let temp = TempDir::new().unwrap();
        let slots = SlotFiles::new(temp.path(), "t");
        fs::write(slots.primary(), b"bad").unwrap();
        fs::write(slots.backup(), b"worse").unwrap();
        assert!(matches!(
            slots.load_with(decode_text),
            Err(TableError::InvalidTable { .. })
        ));
    }
}
