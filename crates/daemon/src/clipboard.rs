use anyhow::Result;

/// Seam over the OS clipboard. The daemon only ever reads the current text
/// (to compare against a stored fingerprint) and clears it; copying is the
/// client's job.
pub trait Clipboard: Send + Sync {
    /// Current clipboard text, or None when empty or holding non-text data.
    fn get(&self) -> Result<Option<String>>;

    fn clear(&self) -> Result<()>;
}

pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn get(&self) -> Result<Option<String>> {
        let mut clipboard = arboard::Clipboard::new()?;
        match clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()?;
        clipboard.clear()?;
        Ok(())
    }
}
