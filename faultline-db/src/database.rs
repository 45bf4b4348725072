// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::report::{NewReport, Report, ReportLease, ReportRecord, ReportState};
use crate::settings::Settings;
use faultline_common::{write_atomically, Error, LockMode, LockedFile, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const SETTINGS_FILE: &str = "settings.dat";
const NEW_DIR: &str = "new";
const PENDING_DIR: &str = "pending";
const COMPLETED_DIR: &str = "completed";
const METADATA_DIR: &str = "metadata";

const DUMP_EXTENSION: &str = "dmp";
const RECORD_EXTENSION: &str = "meta";
const LOCK_EXTENSION: &str = "lock";

/// Concurrency-safe repository of crash reports rooted at a directory tree.
///
/// Any number of processes may hold a `CrashReportDatabase` against the same
/// root. Mutations are serialized by per-report lock files plus the settings
/// lock; dump files and metadata records are only ever moved into place by
/// same-volume rename, so readers never observe a partially-written report.
pub struct CrashReportDatabase {
    root: PathBuf,
    settings: Settings,
}

impl CrashReportDatabase {
    /// Opens the database at `root`, creating the directory tree on first
    /// use and sweeping leftovers of writers that died mid-flight.
    pub fn initialize(root: &Path) -> Result<Self> {
        for dir in [
            root.to_path_buf(),
            root.join(NEW_DIR),
            root.join(PENDING_DIR),
            root.join(COMPLETED_DIR),
            root.join(METADATA_DIR),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let settings = Settings::initialize(&root.join(SETTINGS_FILE))?;
        let db = CrashReportDatabase {
            root: root.into(),
            settings,
        };
        db.clean();
        Ok(db)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reserves a fresh uuid and opens a writable dump file under `new/`.
    /// The file stays exclusively locked until the handle is consumed, which
    /// is how `clean` distinguishes live writers from orphans.
    pub fn prepare_new_report(&self) -> Result<NewReport> {
        let uuid = Uuid::new_v4();
        let path = self.dump_path(NEW_DIR, uuid);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        let file = LockedFile::try_open(&path, &options, LockMode::Exclusive)?;
        Ok(NewReport { uuid, path, file })
    }

    /// Finalizes an in-progress report: flushes the dump, renames it into
    /// `pending/`, then publishes the metadata record. A report becomes
    /// visible to queries only once its dump bytes are fully in place, so
    /// readers on the same volume see it appear all at once.
    pub fn finished_writing_report(&self, mut new_report: NewReport) -> Result<Uuid> {
        let uuid = new_report.uuid;
        new_report.finish_file()?;

        let pending = self.dump_path(PENDING_DIR, uuid);
        if let Err(e) = std::fs::rename(&new_report.path, &pending) {
            let _ = std::fs::remove_file(&new_report.path);
            return Err(e.into());
        }

        let record = ReportRecord {
            uuid,
            state: ReportState::Pending,
            creation_time: now_seconds(),
            id: String::new(),
            uploaded: false,
            last_upload_attempt_time: 0,
            upload_attempts: 0,
            dump_name: dump_name(uuid),
        };
        if let Err(e) = self.write_record(&record) {
            // Roll the dump back out so the uuid never surfaces half-made.
            let _ = std::fs::remove_file(&pending);
            return Err(e);
        }
        // The dump lock is released when the handle drops, after the rename;
        // the inode is the same file now living under pending/.
        drop(new_report);
        Ok(uuid)
    }

    /// Abandons an in-progress report, deleting the `new/` file and
    /// discarding the uuid.
    pub fn error_writing_report(&self, new_report: NewReport) -> Result<()> {
        std::fs::remove_file(&new_report.path)?;
        drop(new_report);
        Ok(())
    }

    pub fn look_up_report(&self, uuid: Uuid) -> Result<Report> {
        let record = self.read_record(uuid)?;
        Ok(self.report_from_record(record))
    }

    /// Reports awaiting upload. A report mid-upload still counts as pending
    /// for queries.
    pub fn get_pending_reports(&self) -> Result<Vec<Report>> {
        self.reports_in_state(|state| {
            matches!(state, ReportState::Pending | ReportState::Uploading)
        })
    }

    pub fn get_completed_reports(&self) -> Result<Vec<Report>> {
        self.reports_in_state(|state| matches!(state, ReportState::Completed))
    }

    /// Acquires the exclusive upload lease for `uuid` and transitions
    /// `Pending → Uploading`. Returns [`Error::Busy`] while any other
    /// holder, in this process or another, has the lease.
    pub fn get_report_for_uploading(&self, uuid: Uuid) -> Result<ReportLease> {
        let record = self.read_record(uuid)?;
        if record.state == ReportState::Completed {
            return Err(Error::NotFound);
        }

        let lock = self.acquire_lease_lock(uuid)?;

        // Re-read under the lease: the state may have moved while we raced
        // for the lock.
        let mut record = self.read_record(uuid)?;
        if record.state == ReportState::Completed {
            return Err(Error::NotFound);
        }
        // Open the dump before publishing the state change so a vanished
        // file leaves the record untouched.
        let dump_path = self.dump_path(PENDING_DIR, uuid);
        let dump_file = match std::fs::File::open(&dump_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };

        record.state = ReportState::Uploading;
        self.write_record(&record)?;

        Ok(ReportLease {
            report: self.report_from_record(record),
            _lock: lock,
            dump_file,
        })
    }

    /// Records the outcome of an upload attempt and releases the lease.
    ///
    /// Success stores the server-assigned id, marks the report uploaded,
    /// and moves the dump to `completed/`; failure returns the report to
    /// `Pending` for a later retry.
    pub fn record_upload_attempt(
        &self,
        lease: ReportLease,
        success: bool,
        server_id: &str,
    ) -> Result<()> {
        let uuid = lease.uuid();
        let mut record = self.read_record(uuid)?;

        record.upload_attempts += 1;
        record.last_upload_attempt_time = now_seconds();
        if success {
            record.uploaded = true;
            record.id = server_id.into();
            record.state = ReportState::Completed;
        } else {
            record.state = ReportState::Pending;
        }
        self.write_record(&record)?;

        if success {
            std::fs::rename(
                self.dump_path(PENDING_DIR, uuid),
                self.dump_path(COMPLETED_DIR, uuid),
            )?;
        }
        drop(lease);
        Ok(())
    }

    /// Transitions `Pending → Completed` without an upload attempt; the
    /// attempt counters stay untouched. Fails with [`Error::Busy`] while an
    /// upload lease is held.
    pub fn skip_report_upload(&self, uuid: Uuid) -> Result<()> {
        let mut record = self.read_record(uuid)?;
        if record.state == ReportState::Completed {
            return Err(Error::NotFound);
        }

        let lock = self.acquire_lease_lock(uuid)?;
        record = self.read_record(uuid)?;
        if record.state == ReportState::Completed {
            return Err(Error::NotFound);
        }

        record.state = ReportState::Completed;
        self.write_record(&record)?;
        std::fs::rename(
            self.dump_path(PENDING_DIR, uuid),
            self.dump_path(COMPLETED_DIR, uuid),
        )?;
        drop(lock);
        Ok(())
    }

    /// Removes a report's dump, metadata and lock file. Used by the prune
    /// worker; fails with [`Error::Busy`] while a lease is held.
    pub fn delete_report(&self, uuid: Uuid) -> Result<()> {
        let record = self.read_record(uuid)?;
        let lock = self.acquire_lease_lock(uuid)?;

        for dir in [NEW_DIR, PENDING_DIR, COMPLETED_DIR] {
            let _ = std::fs::remove_file(self.dump_path(dir, record.uuid));
        }
        std::fs::remove_file(self.record_path(uuid))?;
        drop(lock);
        let _ = std::fs::remove_file(self.lock_path(uuid));
        Ok(())
    }

    /// Startup sweep: deletes `new/` orphans no writer holds locked,
    /// demotes stale `Uploading` records whose uploader died, and drops
    /// records whose dump file has vanished.
    fn clean(&self) {
        let new_dir = self.root.join(NEW_DIR);
        for entry in read_dir_or_warn(&new_dir) {
            let mut options = OpenOptions::new();
            options.read(true);
            match LockedFile::try_open(&entry, &options, LockMode::Exclusive) {
                Ok(orphan) => {
                    drop(orphan);
                    warn!(path = %entry.display(), "removing orphaned in-progress dump");
                    let _ = std::fs::remove_file(&entry);
                }
                Err(Error::Busy) => {} // live writer
                Err(e) => warn!(path = %entry.display(), error = %e, "cannot inspect new/ entry"),
            }
        }

        // A writer that died between the pending/ rename and the record
        // publish leaves a dump no query can reach.
        for entry in read_dir_or_warn(&self.root.join(PENDING_DIR)) {
            let has_record = entry
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|uuid| self.record_path(uuid).exists());
            if !has_record {
                // The writer's dump lock survives the rename, so Busy means
                // a live writer between its rename and its record publish.
                let mut options = OpenOptions::new();
                options.read(true);
                if let Ok(orphan) = LockedFile::try_open(&entry, &options, LockMode::Exclusive) {
                    drop(orphan);
                    warn!(path = %entry.display(), "removing pending dump with no record");
                    let _ = std::fs::remove_file(&entry);
                }
            }
        }

        for entry in read_dir_or_warn(&self.root.join(METADATA_DIR)) {
            if entry.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(record) = self.load_record_at(&entry) else {
                continue;
            };

            let dump_dir = match record.state {
                ReportState::Completed => COMPLETED_DIR,
                _ => PENDING_DIR,
            };
            let dump_present = self.dump_path(dump_dir, record.uuid).exists();

            match record.state {
                // Completed reports may legitimately outlive their dump.
                ReportState::Completed => {}
                _ if !dump_present => {
                    if let Ok(lock) = self.acquire_lease_lock(record.uuid) {
                        warn!(uuid = %record.uuid, "dropping report whose dump file vanished");
                        let _ = std::fs::remove_file(&entry);
                        drop(lock);
                        let _ = std::fs::remove_file(self.lock_path(record.uuid));
                    }
                }
                ReportState::Uploading => {
                    // A lease we can steal means the uploader is gone.
                    if let Ok(lock) = self.acquire_lease_lock(record.uuid) {
                        let mut demoted = record;
                        demoted.state = ReportState::Pending;
                        if self.write_record(&demoted).is_ok() {
                            warn!(uuid = %demoted.uuid, "reset stale uploading report to pending");
                        }
                        drop(lock);
                    }
                }
                ReportState::Pending => {}
            }
        }
    }

    fn reports_in_state(&self, want: impl Fn(ReportState) -> bool) -> Result<Vec<Report>> {
        let mut reports = Vec::new();
        for entry in read_dir_or_warn(&self.root.join(METADATA_DIR)) {
            if entry.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(record) = self.load_record_at(&entry) {
                if want(record.state) {
                    reports.push(self.report_from_record(record));
                }
            }
        }
        reports.sort_by_key(|r| (r.creation_time, r.uuid));
        Ok(reports)
    }

    fn report_from_record(&self, record: ReportRecord) -> Report {
        let dir = match record.state {
            ReportState::Completed => COMPLETED_DIR,
            ReportState::Pending | ReportState::Uploading => PENDING_DIR,
        };
        Report {
            uuid: record.uuid,
            file_path: self.root.join(dir).join(&record.dump_name),
            creation_time: record.creation_time,
            id: record.id,
            uploaded: record.uploaded,
            last_upload_attempt_time: record.last_upload_attempt_time,
            upload_attempts: record.upload_attempts,
            state: record.state,
        }
    }

    fn acquire_lease_lock(&self, uuid: Uuid) -> Result<LockedFile> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        LockedFile::try_open(&self.lock_path(uuid), &options, LockMode::Exclusive)
    }

    fn read_record(&self, uuid: Uuid) -> Result<ReportRecord> {
        let path = self.record_path(uuid);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corrupt(format!("report record {}: {e}", uuid)))
    }

    /// Best-effort record load for directory scans: corrupt or vanished
    /// records are skipped with a warning instead of failing the listing.
    fn load_record_at(&self, path: &Path) -> Option<ReportRecord> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable report record");
                None
            }
        }
    }

    fn write_record(&self, record: &ReportRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| Error::Internal(format!("encoding report record: {e}")))?;
        write_atomically(&self.record_path(record.uuid), &bytes)
    }

    fn dump_path(&self, dir: &str, uuid: Uuid) -> PathBuf {
        self.root.join(dir).join(dump_name(uuid))
    }

    fn record_path(&self, uuid: Uuid) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{uuid}.{RECORD_EXTENSION}"))
    }

    fn lock_path(&self, uuid: Uuid) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{uuid}.{LOCK_EXTENSION}"))
    }
}

fn dump_name(uuid: Uuid) -> String {
    format!("{uuid}.{DUMP_EXTENSION}")
}

fn now_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn read_dir_or_warn(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                // Skip the staging files write_atomically leaves behind only
                // if a writer dies between create and rename.
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
            })
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list database directory");
            Vec::new()
        }
    }
}
