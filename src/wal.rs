//! Conversation log (write-ahead log).
//!
//! Every message the runtime appends to history is mirrored here as a
//! [`WalEntry`]. Entries fill a 50-entry active segment held in memory; a
//! full segment is sealed and never changes again. [`ConversationLog::flush`]
//! writes sealed segments that are not on disk yet, one newline-delimited
//! JSON file each, and [`ConversationLog::recover`] rebuilds the log from
//! those files after a restart. The active segment is not durable, except
//! right after [`ConversationLog::prune`], which writes the survivors out in
//! full (a trailing partial segment included) before deleting the old files.
//!
//! File I/O failures are logged and swallowed: losing the log must never
//! take a run down with it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

use crate::tokens::estimate_messages;
use crate::types::{Message, Role, ToolCallRequest, ToolResultRef};

/// Entries per segment.
pub const SEGMENT_CAPACITY: usize = 50;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// One logged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Unix milliseconds at append time.
    pub timestamp: u64,
    pub token_estimate: u64,
    /// Call id answered by a tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl WalEntry {
    pub fn from_message(message: &Message) -> Self {
        let result = message.tool_result.as_ref();
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_id: result.map(|r| r.tool_id.clone()),
            timestamp: now_unix_millis(),
            token_estimate: estimate_messages(std::slice::from_ref(message)),
            call_id: result.map(|r| r.call_id.clone()),
            is_error: result.map(|r| r.is_error),
            tool_calls: message.tool_calls.clone(),
        }
    }

    /// Rebuild the history message this entry was logged from.
    pub fn to_message(&self) -> Message {
        let tool_result = match (&self.tool_id, &self.call_id) {
            (Some(tool_id), Some(call_id)) if self.role == Role::Tool => Some(ToolResultRef {
                call_id: call_id.clone(),
                tool_id: tool_id.clone(),
                is_error: self.is_error.unwrap_or(false),
            }),
            _ => None,
        };
        Message {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_result,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Segment {
    index: u64,
    entries: Vec<WalEntry>,
    tokens: u64,
}

impl Segment {
    fn new(index: u64) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    fn push(&mut self, entry: WalEntry) {
        self.tokens = self.tokens.saturating_add(entry.token_estimate);
        self.entries.push(entry);
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= SEGMENT_CAPACITY
    }
}

/// Segmented, append-only conversation log rooted at one directory.
#[derive(Debug)]
pub struct ConversationLog {
    dir: PathBuf,
    sealed: Vec<Segment>,
    active: Segment,
    total_tokens: u64,
    /// Sealed segments already on disk; they are a prefix of `sealed`.
    flushed: usize,
}

impl ConversationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sealed: Vec::new(),
            active: Segment::new(0),
            total_tokens: 0,
            flushed: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&mut self, entry: WalEntry) {
        self.total_tokens = self.total_tokens.saturating_add(entry.token_estimate);
        self.active.push(entry);
        if self.active.is_full() {
            let next = Segment::new(self.active.index + 1);
            let full = std::mem::replace(&mut self.active, next);
            debug!(segment = full.index, "sealed conversation log segment");
            self.sealed.push(full);
        }
    }

    pub fn append_message(&mut self, message: &Message) {
        self.append(WalEntry::from_message(message));
    }

    /// Running token estimate over every entry.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn len(&self) -> usize {
        self.sealed
            .iter()
            .map(|segment| segment.entries.len())
            .sum::<usize>()
            + self.active.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sealed_segments(&self) -> usize {
        self.sealed.len()
    }

    /// Sealed segments not yet written by [`flush`](Self::flush).
    pub fn unflushed_segments(&self) -> usize {
        self.sealed.len() - self.flushed
    }

    /// All entries in order: sealed segments, then the active one.
    pub fn entries(&self) -> Vec<WalEntry> {
        self.sealed
            .iter()
            .chain(std::iter::once(&self.active))
            .flat_map(|segment| segment.entries.iter().cloned())
            .collect()
    }

    /// Rebuild history messages from the logged entries.
    pub fn messages(&self) -> Vec<Message> {
        self.sealed
            .iter()
            .chain(std::iter::once(&self.active))
            .flat_map(|segment| segment.entries.iter().map(WalEntry::to_message))
            .collect()
    }

    /// Persist sealed segments written since the last flush.
    ///
    /// Returns how many segment files were written. Stops at the first
    /// failure so the next flush retries from there.
    pub fn flush(&mut self) -> usize {
        if self.flushed >= self.sealed.len() {
            return 0;
        }
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot create conversation log directory");
            return 0;
        }
        let mut written = 0usize;
        while self.flushed < self.sealed.len() {
            let segment = &self.sealed[self.flushed];
            if let Err(e) = write_segment(&self.dir, segment) {
                warn!(segment = segment.index, error = %e, "failed to write conversation log segment");
                break;
            }
            self.flushed += 1;
            written += 1;
        }
        written
    }

    /// Replace in-memory state with the segments found on disk.
    ///
    /// All or nothing: a segment that fails to parse aborts recovery and
    /// leaves the current state untouched. A missing directory recovers an
    /// empty log.
    pub fn recover(&mut self) -> bool {
        let files = match list_segment_files(&self.dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "cannot list conversation log segments");
                return false;
            }
        };

        let mut sealed = Vec::with_capacity(files.len());
        for (index, path) in files {
            match read_segment(&path, index) {
                Ok(segment) => sealed.push(segment),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "conversation log recovery aborted");
                    return false;
                }
            }
        }

        // A short last file was written by prune; it keeps filling.
        let partial_tail = sealed.last().is_some_and(|last: &Segment| !last.is_full());
        let active = if partial_tail { sealed.pop() } else { None };
        let active = active.unwrap_or_else(|| {
            Segment::new(sealed.last().map(|s: &Segment| s.index + 1).unwrap_or(0))
        });
        self.total_tokens = sealed.iter().map(|s| s.tokens).sum::<u64>() + active.tokens;
        self.flushed = sealed.len();
        self.sealed = sealed;
        self.active = active;
        debug!(entries = self.len(), "recovered conversation log");
        true
    }

    /// Keep only the newest `keep` entries, re-segmented from scratch.
    ///
    /// The survivors are written under fresh segment numbers before any old
    /// file is deleted, so a crash in between leaves duplicates rather than
    /// a hole. If writing fails the old files stay and only memory is pruned.
    /// Returns the number of entries removed.
    pub fn prune(&mut self, keep: usize) -> usize {
        let entries = self.entries();
        let removed = entries.len().saturating_sub(keep);
        if removed == 0 {
            return 0;
        }

        let stale = match list_segment_files(&self.dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list conversation log segments");
                Vec::new()
            }
        };
        let first_index = stale
            .iter()
            .map(|(index, _)| index + 1)
            .max()
            .unwrap_or(0)
            .max(self.active.index + 1);

        self.sealed.clear();
        self.active = Segment::new(first_index);
        self.total_tokens = 0;
        self.flushed = 0;
        for entry in entries.into_iter().skip(removed) {
            self.append(entry);
        }

        if !self.write_everything() {
            warn!(dir = %self.dir.display(), "pruned log not persisted; old segments kept");
            return removed;
        }
        for (_, path) in stale {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete pruned segment");
            }
        }
        removed
    }

    /// Flush sealed segments and also write the active one if it has entries.
    fn write_everything(&mut self) -> bool {
        self.flush();
        if self.flushed < self.sealed.len() {
            return false;
        }
        if self.active.entries.is_empty() {
            return true;
        }
        let written = fs::create_dir_all(&self.dir)
            .and_then(|()| write_segment(&self.dir, &self.active));
        match written {
            Ok(()) => true,
            Err(e) => {
                warn!(segment = self.active.index, error = %e, "failed to write conversation log segment");
                false
            }
        }
    }
}

fn segment_file_name(index: u64) -> String {
    format!("{SEGMENT_PREFIX}{index:06}{SEGMENT_SUFFIX}")
}

fn parse_segment_index(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segment files in `dir`, sorted by numeric index.
fn list_segment_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(index) = name.to_str().and_then(parse_segment_index) {
            files.push((index, entry.path()));
        }
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

fn write_segment(dir: &Path, segment: &Segment) -> io::Result<()> {
    let mut body = String::new();
    for entry in &segment.entries {
        let line = serde_json::to_string(entry).map_err(io::Error::other)?;
        body.push_str(&line);
        body.push('\n');
    }
    let path = dir.join(segment_file_name(segment.index));
    // Sibling temp file plus rename keeps a crash from leaving half a segment.
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, &path)
}

fn read_segment(path: &Path, index: u64) -> Result<Segment, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut segment = Segment::new(index);
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: WalEntry = serde_json::from_str(line)
            .map_err(|e| format!("line {}: {e}", line_no + 1))?;
        segment.push(entry);
    }
    Ok(segment)
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
