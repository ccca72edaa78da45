//! Daily JSONL files with size-based rotation.
//!
//! One writer per directory. Appends and rotation share a mutex, so a
//! rotation can never split or drop a line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};

use crate::audit::AuditError;

const FILE_PREFIX: &str = "audit-";
const ACTIVE_SUFFIX: &str = ".log";
const BACKUP_SUFFIX: &str = ".backup";

/// `audit-YYYY-MM-DD.log`
pub fn file_name_for(date: NaiveDate) -> String {
    format!("{FILE_PREFIX}{}{ACTIVE_SUFFIX}", date.format("%Y-%m-%d"))
}

/// A file in the audit directory, parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub date: NaiveDate,
    /// Rotation stamp for backups, `None` for the day's active file.
    pub rotated_at: Option<String>,
}

impl LogFile {
    fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(FILE_PREFIX)?;
        let date = NaiveDate::parse_from_str(rest.get(..10)?, "%Y-%m-%d").ok()?;
        let rest = rest.get(10..)?.strip_prefix(ACTIVE_SUFFIX)?;
        let rotated_at = if rest.is_empty() {
            None
        } else {
            let stamp = rest.strip_prefix('.')?.strip_suffix(BACKUP_SUFFIX)?;
            if stamp.is_empty() {
                return None;
            }
            Some(stamp.to_string())
        };
        Some(Self {
            path,
            date,
            rotated_at,
        })
    }

    pub fn is_backup(&self) -> bool {
        self.rotated_at.is_some()
    }

    /// Rotation stamp and collision counter, so `...Z-10` sorts after `...Z-2`.
    fn rotation_order(&self) -> Option<(&str, u64)> {
        let stamp = self.rotated_at.as_deref()?;
        Some(match stamp.split_once("Z-") {
            Some((base, n)) => (base, n.parse().unwrap_or(0)),
            None => (stamp.strip_suffix('Z').unwrap_or(stamp), 0),
        })
    }
}

/// Audit files in `dir`, newest first: date descending, the active file
/// before its backups, backups by rotation stamp descending.
pub fn list_log_files(dir: &Path) -> Result<Vec<LogFile>, AuditError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(file) = LogFile::parse(entry.path()) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| a.is_backup().cmp(&b.is_backup()))
            .then_with(|| b.rotation_order().cmp(&a.rotation_order()))
    });
    Ok(files)
}

/// Lines terminated by a newline. A trailing partial line is an append in
/// flight and is left out.
pub fn complete_lines(content: &str) -> impl DoubleEndedIterator<Item = &str> {
    let end = content.rfind('\n').map_or(0, |i| i + 1);
    content[..end].lines().filter(|line| !line.trim().is_empty())
}

#[derive(Debug, Default)]
struct WriterState {
    date: Option<NaiveDate>,
    file: Option<File>,
    size: u64,
}

/// Serialized appender for the audit directory.
#[derive(Debug)]
pub struct LogWriter {
    dir: PathBuf,
    max_file_bytes: u64,
    state: Mutex<WriterState>,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_bytes,
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.dir.join(file_name_for(now.date_naive()))
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one line to the file for `at`'s day, rotating first if the
    /// line would push the file past the size limit. A rotation is stamped
    /// with `at`.
    pub fn append(&self, line: &str, at: DateTime<Utc>) -> Result<(), AuditError> {
        let mut state = self.lock();
        let date = at.date_naive();
        self.open_for(&mut state, date)?;

        let len = line.len() as u64 + 1;
        if state.size > 0 && state.size + len > self.max_file_bytes {
            self.rotate_locked(&mut state, date, at)?;
            self.open_for(&mut state, date)?;
        }

        let Some(file) = state.file.as_mut() else {
            return Err(AuditError::Io(std::io::Error::other("audit file not open")));
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.sync_data()?;
        state.size += len;
        Ok(())
    }

    /// Rotate today's file if it has reached the size limit.
    pub fn rotate_if_needed(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>, AuditError> {
        let mut state = self.lock();
        let date = now.date_naive();
        let active = self.dir.join(file_name_for(date));
        let size = match fs::metadata(&active) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if size < self.max_file_bytes {
            return Ok(None);
        }
        self.rotate_locked(&mut state, date, now).map(Some)
    }

    fn open_for(&self, state: &mut WriterState, date: NaiveDate) -> Result<(), AuditError> {
        if state.date == Some(date) && state.file.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name_for(date));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        state.size = file.metadata()?.len();
        state.file = Some(file);
        state.date = Some(date);
        Ok(())
    }

    fn rotate_locked(
        &self,
        state: &mut WriterState,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, AuditError> {
        let active = self.dir.join(file_name_for(date));
        if state.date == Some(date) {
            state.file = None;
            state.size = 0;
        }
        let stamp = now.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string();
        let mut target = backup_path(&active, &stamp);
        let mut n = 1;
        while target.exists() {
            target = backup_path(&active, &format!("{stamp}-{n}"));
            n += 1;
        }
        fs::rename(&active, &target)?;
        tracing::info!(from = %active.display(), to = %target.display(), "Audit log rotated");
        Ok(target)
    }
}

fn backup_path(active: &Path, stamp: &str) -> PathBuf {
    let mut name = active.as_os_str().to_os_string();
    name.push(format!(".{stamp}{BACKUP_SUFFIX}"));
    PathBuf::from(name)
}
