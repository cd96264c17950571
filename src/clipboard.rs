use anyhow::Result;

/// Capability for the pause-time branch-name copy. Writes are best-effort:
/// callers ignore every error from this trait.
pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> Result<()>;
}

/// System clipboard via arboard. Construction happens per write because
/// arboard contexts are not `Sync` on all platforms.
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()?;
        clipboard.set_text(text.to_string())?;
        Ok(())
    }
}

/// No-op provider for headless hosts and tests.
#[derive(Default)]
pub struct NullClipboard;

impl Clipboard for NullClipboard {
    fn write_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_clipboard_accepts_writes() {
        assert!(NullClipboard.write_text("branch-name").is_ok());
    }
}
