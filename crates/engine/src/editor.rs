//! Editor and commit
//!
//! An [`Editor`] collects edits into one [`Commit`]. Finishing the editor
//! writes the whole commit into the cache at once, then persists it:
//! - [`Editor::apply`] queues the commit on the serial worker and returns
//! - [`Editor::commit`] runs it on the calling thread, in queue order, and
//!   reports whether the store accepted it
//!
//! A clear always runs before the other edits of the same commit.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::warn;

use sharedprefs_concurrency::{BatchOperation, BatchOutcome, EditOp};
use sharedprefs_core::{PrefValue, Result};

use crate::coordinator::StorageCoordinator;
use crate::preferences::Preferences;

/// One batch of edits from an editor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    clear: bool,
    edits: Vec<EditOp>,
}

impl Commit {
    /// Create an empty commit
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edit; a `Clear` is hoisted in front of everything else
    pub fn add(&mut self, op: EditOp) {
        match op {
            EditOp::Clear => self.clear = true,
            op => self.edits.push(op),
        }
    }

    /// True if nothing was staged
    pub fn is_empty(&self) -> bool {
        !self.clear && self.edits.is_empty()
    }

    /// Number of operations, the clear included
    pub fn len(&self) -> usize {
        self.edits.len() + usize::from(self.clear)
    }

    /// True if the commit clears the store first
    pub fn clears(&self) -> bool {
        self.clear
    }

    /// Operations in execution order
    pub fn operations(&self) -> Vec<EditOp> {
        let mut ops = Vec::with_capacity(self.len());
        if self.clear {
            ops.push(EditOp::Clear);
        }
        ops.extend(self.edits.iter().cloned());
        ops
    }

    /// Build the batch request; every `yield_interval`th operation may yield
    pub fn to_batch(&self, yield_interval: usize) -> Vec<BatchOperation> {
        self.operations()
            .into_iter()
            .filter(|op| op.key() != Some(""))
            .enumerate()
            .map(|(i, op)| {
                if i > 0 && yield_interval > 0 && i % yield_interval == 0 {
                    BatchOperation::with_yield(op)
                } else {
                    BatchOperation::new(op)
                }
            })
            .collect()
    }

    /// Persist the commit as one batch
    ///
    /// # Errors
    /// Whatever [`StorageCoordinator::apply_batch`] reports.
    pub fn execute(
        &self,
        coordinator: &StorageCoordinator,
        yield_interval: usize,
    ) -> Result<BatchOutcome> {
        coordinator.apply_batch(&self.to_batch(yield_interval))
    }
}

/// Stages edits against a [`Preferences`] handle
///
/// Builder methods return `&mut Self`, so edits chain:
///
/// ```ignore
/// prefs.edit().put_string("theme", "dark").put_int("volume", 7).apply();
/// ```
///
/// Finishing takes the staged commit, leaving the editor empty and reusable.
pub struct Editor<'a> {
    prefs: &'a Preferences,
    commit: Commit,
}

impl<'a> std::fmt::Debug for Editor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor").field("commit", &self.commit).finish()
    }
}

impl<'a> Editor<'a> {
    pub(crate) fn new(prefs: &'a Preferences) -> Self {
        Self {
            prefs,
            commit: Commit::new(),
        }
    }

    /// Stage `key = value`
    pub fn put(&mut self, key: &str, value: impl Into<PrefValue>) -> &mut Self {
        if key.is_empty() {
            warn!(target: "sharedprefs::editor", "Dropping write with empty key");
            return self;
        }
        self.commit.add(EditOp::InsertOrUpdate {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    /// Stage a bool
    pub fn put_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.put(key, PrefValue::Bool(value))
    }

    /// Stage an i32
    pub fn put_int(&mut self, key: &str, value: i32) -> &mut Self {
        self.put(key, PrefValue::Int(value))
    }

    /// Stage an i64
    pub fn put_long(&mut self, key: &str, value: i64) -> &mut Self {
        self.put(key, PrefValue::Long(value))
    }

    /// Stage an f32
    pub fn put_float(&mut self, key: &str, value: f32) -> &mut Self {
        self.put(key, PrefValue::Float(value))
    }

    /// Stage a string
    pub fn put_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.put(key, PrefValue::String(value.into()))
    }

    /// Stage a string set
    pub fn put_string_set<I, S>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        self.put(key, PrefValue::StringSet(set))
    }

    /// Stage any serializable value as an opaque entry
    ///
    /// # Errors
    /// `Encode` if `value` cannot be serialized; nothing is staged then.
    pub fn put_opaque<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<&mut Self> {
        let value = PrefValue::opaque(key, value)?;
        Ok(self.put(key, value))
    }

    /// Stage removal of `key`
    pub fn remove(&mut self, key: &str) -> &mut Self {
        if key.is_empty() {
            warn!(target: "sharedprefs::editor", "Dropping remove with empty key");
            return self;
        }
        self.commit.add(EditOp::Remove {
            key: key.to_string(),
        });
        self
    }

    /// Stage removal of every key this origin owns
    pub fn clear(&mut self) -> &mut Self {
        self.commit.add(EditOp::Clear);
        self
    }

    /// Edits staged so far
    pub fn pending(&self) -> &Commit {
        &self.commit
    }

    /// Write to the cache now and persist in the background
    ///
    /// Persistence failures are logged, never reported.
    pub fn apply(&mut self) {
        let commit = std::mem::take(&mut self.commit);
        self.prefs.on_apply(commit);
    }

    /// Write to the cache and persist before returning
    ///
    /// Returns false if the store did not accept the commit. The cache write
    /// stays in place either way.
    pub fn commit(&mut self) -> bool {
        let commit = std::mem::take(&mut self.commit);
        self.prefs.on_commit(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, n: i32) -> EditOp {
        EditOp::InsertOrUpdate {
            key: key.to_string(),
            value: PrefValue::Int(n),
        }
    }

    #[test]
    fn test_clear_is_hoisted() {
        let mut commit = Commit::new();
        commit.add(put("a", 1));
        commit.add(EditOp::Remove { key: "b".into() });
        commit.add(EditOp::Clear);

        assert_eq!(commit.len(), 3);
        assert!(commit.clears());
        assert_eq!(
            commit.operations(),
            vec![EditOp::Clear, put("a", 1), EditOp::Remove { key: "b".into() }]
        );
    }

    #[test]
    fn test_repeated_clear_counts_once() {
        let mut commit = Commit::new();
        commit.add(EditOp::Clear);
        commit.add(EditOp::Clear);
        assert_eq!(commit.operations(), vec![EditOp::Clear]);
    }

    #[test]
    fn test_empty_commit() {
        let commit = Commit::new();
        assert!(commit.is_empty());
        assert!(commit.to_batch(10).is_empty());
    }

    #[test]
    fn test_yield_interval_marks_operations() {
        let mut commit = Commit::new();
        for i in 0..7 {
            commit.add(put(&format!("k{}", i), i));
        }
        let flags: Vec<bool> = commit.to_batch(3).iter().map(|op| op.yield_allowed).collect();
        assert_eq!(flags, vec![false, false, false, true, false, false, true]);
    }

    #[test]
    fn test_empty_keys_left_out_of_batch() {
        let mut commit = Commit::new();
        commit.add(put("", 1));
        commit.add(put("a", 2));
        let batch = commit.to_batch(100);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op, put("a", 2));
    }

    /// Log sink shared between the subscriber and the test
    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_key_logged_under_editor_target() {
        use sharedprefs_storage::{LocalChangeBus, MemoryStore};
        use std::sync::Arc;

        let prefs = Preferences::open(
            crate::PrefsConfig {
                authority: "editor".to_string(),
                origin: Some("me".to_string()),
                ..crate::PrefsConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(LocalChangeBus::new()),
        )
        .unwrap();

        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let mut editor = prefs.edit();
        tracing::subscriber::with_default(subscriber, || {
            editor.put_int("", 1).remove("");
        });
        assert!(editor.pending().is_empty());

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert_eq!(output.matches("sharedprefs::editor").count(), 2);
        assert!(output.contains("Dropping write with empty key"));
        assert!(output.contains("Dropping remove with empty key"));
    }
}
