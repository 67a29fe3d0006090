//! Stable node identity.
//!
//! Resolution order: explicit `uid`, then the contents of the id file, then a
//! freshly generated UUIDv4 that is written to the id file for next time.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist node id to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub fn resolve_node_id(uid: &str, id_file: &str) -> Result<String, IdentityError> {
    let uid = uid.trim();
    if !uid.is_empty() {
        return Ok(uid.to_string());
    }

    let path = Path::new(id_file);
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(IdentityError::Read {
                path: id_file.to_string(),
                source,
            })
        }
    }

    let generated = uuid::Uuid::new_v4().to_string();
    let write = |source| IdentityError::Write {
        path: id_file.to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write)?;
    }
    std::fs::write(path, format!("{generated}\n")).map_err(write)?;
    info!(node_id = %generated, path = id_file, "Generated new node id");
    Ok(generated)
}
