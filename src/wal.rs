//! Write-ahead log (C2): an append-only, checksummed, textual record of
//! mutating operations since the last snapshot.
//!
//! Record encoding: `<ts>|<op>|<esc(key)>|<esc(value)>|<crc32>\n`. The
//! checksum covers `ts|op|raw_key|raw_value` (unescaped fields, single `|`
//! separators) so it is independent of the escaping scheme used on the wire.

use crate::error::{KvError, KvResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One mutating operation as recorded in (and replayed from) the log.
///
/// Modeled as a tagged variant rather than a raw opcode string so replay
/// dispatches on a match arm instead of comparing command names on the hot
/// path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Set { key: String, value: String },
    Delete { key: String },
    Clear,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Set { .. } => "SET",
            Op::Delete { .. } => "DELETE",
            Op::Clear => "CLEAR",
        }
    }

    fn key(&self) -> &str {
        match self {
            Op::Set { key, .. } | Op::Delete { key } => key,
            Op::Clear => "",
        }
    }

    fn value(&self) -> &str {
        match self {
            Op::Set { value, .. } => value,
            Op::Delete { .. } | Op::Clear => "",
        }
    }
}

/// A decoded log entry with its timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub timestamp_nanos: u128,
    pub op: Op,
}

/// Append-only log file guarded by a single writer mutex.
pub struct Wal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_mode: bool,
}

impl Wal {
    /// Opens (creating if absent) the log at `path`, creating its parent
    /// directory (mode 0755) if missing.
    pub fn open(path: impl AsRef<Path>, sync_mode: bool) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(parent)?.permissions();
                perms.set_mode(0o755);
                fs::set_permissions(parent, perms)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sync_mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> KvResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Serializes `op`, writes it to the user-space buffer, flushes it to
    /// the file handle, and fsyncs when `sync_mode` is set.
    pub fn append(&self, op: &Op) -> KvResult<()> {
        let timestamp_nanos = now_nanos();
        let line = encode_record(timestamp_nanos, op);
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        if self.sync_mode {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flushes the buffer and fsyncs unconditionally.
    pub fn sync(&self) -> KvResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flushes and closes, truncates the file to zero length, and reopens
    /// it in append mode.
    pub fn truncate(&self) -> KvResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        *writer = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .read(true)
                .append(true)
                .open(&self.path)?,
        );
        Ok(())
    }

    /// Replays every complete record in file order, invoking `f` for each.
    /// An absent or empty file is not an error. A malformed or
    /// checksum-failing record fails replay with `WalCorrupt`, *unless* it
    /// is an incomplete trailing record (the file does not end in `\n`),
    /// which is silently dropped as an artifact of a crash mid-append.
    pub fn replay<F: FnMut(&Record)>(&self, mut f: F) -> KvResult<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|err| KvError::WalCorrupt {
            line: 0,
            reason: format!("log is not valid utf-8: {err}"),
        })?;

        if contents.is_empty() {
            return Ok(());
        }

        let ends_with_newline = contents.ends_with('\n');
        let mut lines: Vec<&str> = contents.split('\n').collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        let last_index = lines.len().saturating_sub(1);

        for (idx, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match decode_record(line) {
                Ok(record) => f(&record),
                Err(reason) => {
                    if idx == last_index && !ends_with_newline {
                        // Partial trailing record from a crash mid-write; drop it.
                        break;
                    }
                    return Err(KvError::WalCorrupt {
                        line: idx as u64 + 1,
                        reason,
                    });
                }
            }
        }

        Ok(())
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn encode_record(timestamp_nanos: u128, op: &Op) -> String {
    let checksum = checksum_of(timestamp_nanos, op);
    format!(
        "{}|{}|{}|{}|{}\n",
        timestamp_nanos,
        op.name(),
        escape(op.key()),
        escape(op.value()),
        checksum
    )
}

fn checksum_of(timestamp_nanos: u128, op: &Op) -> u32 {
    let canonical = format!("{}|{}|{}|{}", timestamp_nanos, op.name(), op.key(), op.value());
    crc32fast::hash(canonical.as_bytes())
}

/// Splits `line` on unescaped `|` into exactly `fields` segments,
/// unescaping each segment in the same pass.
fn split_escaped(line: &str, fields: usize) -> Result<Vec<String>, String> {
    let mut out = Vec::with_capacity(fields);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\\') => current.push('\\'),
                Some('|') => current.push('|'),
                Some('n') => current.push('\n'),
                Some(other) => return Err(format!("invalid escape sequence '\\{other}'")),
                None => return Err("trailing backslash".to_string()),
            },
            '|' => {
                out.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    out.push(current);

    if out.len() != fields {
        return Err(format!("expected {fields} fields, found {}", out.len()));
    }
    Ok(out)
}

fn decode_record(line: &str) -> Result<Record, String> {
    let fields = split_escaped(line, 5)?;
    let timestamp_nanos: u128 = fields[0]
        .parse()
        .map_err(|_| "invalid timestamp".to_string())?;
    let op = match fields[1].as_str() {
        "SET" => Op::Set {
            key: fields[2].clone(),
            value: fields[3].clone(),
        },
        "DELETE" => Op::Delete {
            key: fields[2].clone(),
        },
        "CLEAR" => Op::Clear,
        other => return Err(format!("unknown op '{other}'")),
    };
    let checksum: u32 = fields[4]
        .parse()
        .map_err(|_| "invalid checksum".to_string())?;

    let expected = checksum_of(timestamp_nanos, &op);
    if expected != checksum {
        return Err(format!(
            "checksum mismatch: expected {expected}, found {checksum}"
        ));
    }

    Ok(Record {
        timestamp_nanos,
        op,
    })
}
