// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use faultline_common::{Error, LockMode, LockedFile, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SETTINGS_MAGIC: u32 = 0x464c_5354; // "TSLF"
const SETTINGS_VERSION: u32 = 1;
const SETTINGS_RECORD_LEN: usize = 40;

const OPTION_UPLOADS_ENABLED: u32 = 1 << 0;

/// The fixed-size record stored in `settings.dat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Data {
    magic: u32,
    version: u32,
    options: u32,
    padding: u32,
    last_upload_attempt_time: u64,
    client_id: Uuid,
}

impl Data {
    fn with_client_id(client_id: Uuid) -> Self {
        Data {
            magic: SETTINGS_MAGIC,
            version: SETTINGS_VERSION,
            options: 0,
            padding: 0,
            last_upload_attempt_time: 0,
            client_id,
        }
    }

    fn encode(&self) -> [u8; SETTINGS_RECORD_LEN] {
        let mut out = [0u8; SETTINGS_RECORD_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.options.to_le_bytes());
        out[12..16].copy_from_slice(&self.padding.to_le_bytes());
        out[16..24].copy_from_slice(&self.last_upload_attempt_time.to_le_bytes());
        out[24..40].copy_from_slice(self.client_id.as_bytes());
        out
    }

    fn decode(bytes: &[u8; SETTINGS_RECORD_LEN]) -> Result<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != SETTINGS_MAGIC {
            return Err(Error::Corrupt(format!("settings magic {magic:#010x}")));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != SETTINGS_VERSION {
            return Err(Error::Corrupt(format!("settings version {version}")));
        }
        let mut client_id = [0u8; 16];
        client_id.copy_from_slice(&bytes[24..40]);
        Ok(Data {
            magic,
            version,
            options: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            padding: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            last_upload_attempt_time: u64::from_le_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
            client_id: Uuid::from_bytes(client_id),
        })
    }
}

/// Process-wide per-database settings, backed by a fixed-size record under a
/// whole-file advisory lock: shared for reads, exclusive for writes.
///
/// Magic and version are validated on every read. A record that fails
/// validation is reinitialized under the exclusive lock; the `client_id` is
/// retained when the old bytes were still readable, otherwise a fresh one is
/// generated. The `client_id` never changes after that.
pub struct Settings {
    path: PathBuf,
}

impl Settings {
    pub(crate) fn initialize(path: &Path) -> Result<Self> {
        let settings = Settings { path: path.into() };
        // Create-and-validate up front so later reads only contend on the
        // shared lock.
        settings.read_or_recover()?;
        Ok(settings)
    }

    pub fn get_client_id(&self) -> Result<Uuid> {
        Ok(self.read_or_recover()?.client_id)
    }

    pub fn get_uploads_enabled(&self) -> Result<bool> {
        Ok(self.read_or_recover()?.options & OPTION_UPLOADS_ENABLED != 0)
    }

    pub fn set_uploads_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|data| {
            if enabled {
                data.options |= OPTION_UPLOADS_ENABLED;
            } else {
                data.options &= !OPTION_UPLOADS_ENABLED;
            }
        })
    }

    pub fn get_last_upload_attempt_time(&self) -> Result<u64> {
        Ok(self.read_or_recover()?.last_upload_attempt_time)
    }

    pub fn set_last_upload_attempt_time(&self, time: u64) -> Result<()> {
        self.update(|data| data.last_upload_attempt_time = time)
    }

    fn read_or_recover(&self) -> Result<Data> {
        let mut read_only = OpenOptions::new();
        read_only.read(true);
        match LockedFile::open(&self.path, &read_only, LockMode::Shared) {
            Ok(mut file) => match read_record(&mut file) {
                Ok(data) => Ok(data),
                Err(e) => {
                    drop(file);
                    tracing::warn!(error = %e, "settings record invalid, reinitializing");
                    self.recover()
                }
            },
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => self.recover(),
            Err(e) => Err(e),
        }
    }

    /// Re-reads under the exclusive lock and rewrites the record if it is
    /// still bad. Another process may have recovered it in the window after
    /// the failed shared-lock read.
    fn recover(&self) -> Result<Data> {
        let mut file = self.open_for_writing()?;
        let salvaged_client_id = match read_record(&mut file) {
            Ok(data) => return Ok(data),
            Err(e) => salvage_client_id(&mut file).filter(|_| matches!(e, Error::Corrupt(_))),
        };

        let data = Data::with_client_id(salvaged_client_id.unwrap_or_else(Uuid::new_v4));
        write_record(&mut file, &data)?;
        Ok(data)
    }

    fn update(&self, mutate: impl FnOnce(&mut Data)) -> Result<()> {
        let mut file = self.open_for_writing()?;
        let mut data = match read_record(&mut file) {
            Ok(data) => data,
            Err(_) => {
                let salvaged = salvage_client_id(&mut file);
                Data::with_client_id(salvaged.unwrap_or_else(Uuid::new_v4))
            }
        };
        mutate(&mut data);
        write_record(&mut file, &data)
    }

    fn open_for_writing(&self) -> Result<LockedFile> {
        let mut read_write = OpenOptions::new();
        read_write.read(true).write(true).create(true);
        LockedFile::open(&self.path, &read_write, LockMode::Exclusive)
    }
}

fn read_record(file: &mut LockedFile) -> Result<Data> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = [0u8; SETTINGS_RECORD_LEN];
    file.read_exact(&mut bytes)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Corrupt("settings record truncated".into()),
            _ => Error::Io(e),
        })?;
    Data::decode(&bytes)
}

/// Pulls a plausible client id out of a record that failed validation, so
/// reinitialization keeps the identity stable when the bytes are intact.
fn salvage_client_id(file: &mut LockedFile) -> Option<Uuid> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut bytes = [0u8; SETTINGS_RECORD_LEN];
    file.read_exact(&mut bytes).ok()?;
    let mut client_id = [0u8; 16];
    client_id.copy_from_slice(&bytes[24..40]);
    let uuid = Uuid::from_bytes(client_id);
    (!uuid.is_nil()).then_some(uuid)
}

fn write_record(file: &mut LockedFile, data: &Data) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&data.encode())?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(dir: &tempfile::TempDir) -> Settings {
        Settings::initialize(&dir.path().join("settings.dat")).unwrap()
    }

    #[test]
    fn test_record_encode_decode() {
        let data = Data {
            magic: SETTINGS_MAGIC,
            version: SETTINGS_VERSION,
            options: OPTION_UPLOADS_ENABLED,
            padding: 0,
            last_upload_attempt_time: 1_700_000_000,
            client_id: Uuid::new_v4(),
        };
        assert_eq!(Data::decode(&data.encode()).unwrap(), data);
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);
        assert!(!settings.get_uploads_enabled().unwrap());
        assert_eq!(settings.get_last_upload_attempt_time().unwrap(), 0);
        assert!(!settings.get_client_id().unwrap().is_nil());
    }

    #[test]
    fn test_client_id_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = settings_in(&dir).get_client_id().unwrap();
        let second = settings_in(&dir).get_client_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_and_get_options() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);
        settings.set_uploads_enabled(true).unwrap();
        assert!(settings.get_uploads_enabled().unwrap());
        settings.set_last_upload_attempt_time(42).unwrap();
        assert_eq!(settings.get_last_upload_attempt_time().unwrap(), 42);
        settings.set_uploads_enabled(false).unwrap();
        assert!(!settings.get_uploads_enabled().unwrap());
        // Unrelated fields survive each write.
        assert_eq!(settings.get_last_upload_attempt_time().unwrap(), 42);
    }

    #[test]
    fn test_corrupt_magic_reinitializes_keeping_client_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        let settings = Settings::initialize(&path).unwrap();
        settings.set_uploads_enabled(true).unwrap();
        let client_id = settings.get_client_id().unwrap();

        // Stomp the magic, leaving the rest of the record intact.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let reopened = Settings::initialize(&path).unwrap();
        assert_eq!(reopened.get_client_id().unwrap(), client_id);
        // Reinitialization preserves no state beyond the client id.
        assert!(!reopened.get_uploads_enabled().unwrap());
    }

    #[test]
    fn test_truncated_record_reinitializes_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        let old = Settings::initialize(&path).unwrap().get_client_id().unwrap();

        std::fs::write(&path, b"short").unwrap();

        let new = Settings::initialize(&path).unwrap().get_client_id().unwrap();
        assert!(!new.is_nil());
        assert_ne!(new, old);
    }
}
