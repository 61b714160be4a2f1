//! Secret strings that never print and are wiped on drop

use std::fmt;

/// Password or passphrase material
///
/// `Debug` shows only the length. The buffer is zeroed when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        SecretString(secret.into())
    }

    /// Borrow the secret; keep the borrow short
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        SecretString(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        SecretString(value.to_string())
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        for byte in bytes.iter_mut() {
            // SAFETY: `byte` is a valid, exclusively borrowed u8 inside our own buffer
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(*** {} bytes ***)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_does_not_leak() {
        let secret = SecretString::new("hunter22");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter22"));
        assert!(debug.contains("8 bytes"));
    }

    #[test]
    fn test_expose() {
        let secret = SecretString::from("pw");
        assert_eq!(secret.expose(), "pw");
        assert_eq!(secret.len(), 2);
        assert!(!secret.is_empty());
    }
}
