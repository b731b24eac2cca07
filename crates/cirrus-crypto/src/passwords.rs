//! Terminal password entry.

use crate::CryptoError;

/// Prompt on the controlling terminal and read a password without echo.
///
/// # Errors
///
/// Returns [`CryptoError::PrivateFile`] when no terminal is available or
/// the read fails.
pub fn read_password(prompt: &str) -> Result<String, CryptoError> {
    rpassword::prompt_password(prompt)
        .map_err(|e| CryptoError::PrivateFile(format!("unable to read password: {e}")))
}
