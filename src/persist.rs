//! JSON document persistence shared by the state, prefs, log and snapshot stores.
//!
//! A `None` path means the store is memory-only: loads return defaults and
//! saves are no-ops.

use crate::error::{Result, TetherError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load a JSON document, returning `T::default()` when the file does not exist.
pub(crate) fn load_json<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };

    let bytes = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(TetherError::Storage(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| TetherError::Storage(format!("cannot parse {}: {e}", path.display())))
}

/// Write a JSON document through a sibling temp file and rename it into place,
/// so readers never observe a half-written file.
pub(crate) fn save_json<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let Some(path) = path else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TetherError::Storage(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| TetherError::Storage(format!("cannot serialize {}: {e}", path.display())))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| TetherError::Storage(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        TetherError::Storage(format!(
            "cannot move {} into place: {e}",
            tmp.display()
        ))
    })?;
    Ok(())
}
