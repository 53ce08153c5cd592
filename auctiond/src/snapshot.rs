//! Durable whole-state snapshot.
//!
//! One JSON document, written atomically: serialize to a temp file in the
//! same directory, flush to disk, rename over the target. Readers never see
//! a torn file. Loading migrates the legacy "weeks" naming in place before
//! deserializing.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;

use crate::model::State;

/// Load a snapshot, applying the weeks->days migration when needed.
pub fn load(path: &Path) -> anyhow::Result<State> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let mut doc: Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    if migrate_weeks_to_days(&mut doc) {
        tracing::info!(path = %path.display(), "migrated legacy weeks-named state file");
    }

    let state = serde_json::from_value(doc).context("deserializing state document")?;
    Ok(state)
}

/// Rename `weeks` -> `days` (when `days` is absent) and per-day
/// `week_start` -> `day_start`. Returns whether anything changed.
fn migrate_weeks_to_days(doc: &mut Value) -> bool {
    let Some(root) = doc.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    if !root.contains_key("days") {
        if let Some(weeks) = root.remove("weeks") {
            root.insert("days".to_string(), weeks);
            changed = true;
        }
    }

    if let Some(days) = root.get_mut("days").and_then(Value::as_object_mut) {
        for day in days.values_mut() {
            let Some(day) = day.as_object_mut() else {
                continue;
            };
            if !day.contains_key("day_start") {
                if let Some(start) = day.remove("week_start") {
                    day.insert("day_start".to_string(), start);
                    changed = true;
                }
            }
        }
    }

    changed
}

/// Atomically persist the state: temp file in the target directory, flush,
/// rename. The temp name is fixed; saves are serialized by the state lock.
pub fn save(path: &Path, state: &State) -> anyhow::Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("creating temp state file {}", tmp.display()))?;
        let buf = serde_json::to_vec(state).context("serializing state")?;
        file.write_all(&buf).context("writing state")?;
        file.sync_all().context("flushing state")?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming snapshot into place at {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
