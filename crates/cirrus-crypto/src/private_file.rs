//! "Private" credential files: readable and writable only by their owner.
//!
//! Secret files (service credentials, raw volume keys, OAuth refresh
//! tokens) are rejected unless their permissions are exactly `0600`, and
//! are created with those permissions.

use std::fs::{File, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::CryptoError;

const PRIVATE_MODE: u32 = 0o600;

/// Read the first line of a private file.
///
/// # Errors
///
/// Returns [`CryptoError::PrivateFile`] when the file cannot be opened or
/// is accessible to anyone but its owner.
pub fn read_private_file(path: impl AsRef<Path>) -> Result<String, CryptoError> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| CryptoError::PrivateFile(format!("unable to open {}: {e}", path.display())))?;

    let mode = file
        .metadata()
        .map_err(|e| CryptoError::PrivateFile(e.to_string()))?
        .permissions()
        .mode()
        & 0o777;

    if mode != PRIVATE_MODE {
        return Err(CryptoError::PrivateFile(format!(
            "{} must be readable/writable only by its owner (mode {mode:04o})",
            path.display()
        )));
    }

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| CryptoError::PrivateFile(e.to_string()))?;

    Ok(contents.lines().next().unwrap_or("").to_owned())
}

/// Create (or truncate) a private file holding a single line.
///
/// # Errors
///
/// Returns [`CryptoError::PrivateFile`] on I/O failure.
pub fn write_private_file(path: impl AsRef<Path>, line: &str) -> Result<(), CryptoError> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            CryptoError::PrivateFile(format!("unable to create {}: {e}", path.display()))
        })?;

    file.set_permissions(Permissions::from_mode(PRIVATE_MODE))
        .map_err(|e| CryptoError::PrivateFile(e.to_string()))?;

    writeln!(file, "{line}").map_err(|e| CryptoError::PrivateFile(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_trip_private_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret");

        write_private_file(&path, "key-id secret-value").expect("write");
        assert_eq!(read_private_file(&path).expect("read"), "key-id secret-value");
    }

    #[test]
    fn test_should_set_owner_only_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret");

        write_private_file(&path, "x").expect("write");
        let mode = std::fs::metadata(&path).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_should_reject_world_readable_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("leaky");

        std::fs::write(&path, "secret\n").expect("write");
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).expect("chmod");

        assert!(read_private_file(&path).is_err());
    }

    #[test]
    fn test_should_reject_missing_file() {
        assert!(read_private_file("/nonexistent/private").is_err());
    }

    #[test]
    fn test_should_read_only_first_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret");

        write_private_file(&path, "first").expect("write");
        // Append a second line out of band.
        {
            let mut f = OpenOptions::new().append(true).open(&path).expect("open");
            writeln!(f, "second").expect("append");
        }

        assert_eq!(read_private_file(&path).expect("read"), "first");
    }
}
