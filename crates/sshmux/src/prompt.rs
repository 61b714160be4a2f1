//! Interactive secret prompt on the controlling terminal
//!
//! Input is read in raw mode without echo. Ctrl+C and Esc cancel.

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use sshmux_core::{CoreError, Prompt, Result, SecretString};
use std::io::Write;

/// Enables raw mode and restores normal mode on drop (even on panic)
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Continue,
    Submit,
    Cancel,
}

fn apply_key(buffer: &mut String, key: KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Continue;
    }
    match key.code {
        KeyCode::Enter => KeyAction::Submit,
        KeyCode::Esc => KeyAction::Cancel,
        KeyCode::Char('c') | KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            KeyAction::Cancel
        }
        KeyCode::Backspace => {
            buffer.pop();
            KeyAction::Continue
        }
        KeyCode::Char(c) => {
            buffer.push(c);
            KeyAction::Continue
        }
        _ => KeyAction::Continue,
    }
}

/// [`Prompt`] reading from the terminal this process runs in
#[derive(Debug, Clone, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    pub fn new() -> Self {
        Self
    }
}

fn read_secret(text: &str) -> Result<SecretString> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", text)?;
    stderr.flush()?;

    let mut buffer = String::new();
    let action = {
        let _guard = RawModeGuard::enable()?;
        loop {
            if let Event::Key(key) = event::read()? {
                match apply_key(&mut buffer, key) {
                    KeyAction::Continue => continue,
                    done => break done,
                }
            }
        }
    };
    writeln!(stderr)?;

    let secret = SecretString::from(std::mem::take(&mut buffer));
    match action {
        KeyAction::Submit => Ok(secret),
        _ => Err(CoreError::UserCancelled),
    }
}

#[async_trait]
impl Prompt for TerminalPrompt {
    async fn prompt(&self, text: &str) -> Result<SecretString> {
        let text = text.to_string();
        tokio::task::spawn_blocking(move || read_secret(&text))
            .await
            .map_err(|e| CoreError::Io(std::io::Error::other(e)))?
    }
}
