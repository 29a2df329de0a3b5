//! Logging helpers that keep radio frames on a single, bounded log line.

use std::fmt::Write;

/// Bytes rendered before the preview is cut off.
const MAX_PREVIEW: usize = 64;

/// Space-separated hex, e.g. `00 3d 05`, truncated with an ellipsis past
/// [`MAX_PREVIEW`] bytes.
pub fn hex_preview(bytes: &[u8]) -> String {
    let shown = bytes.len().min(MAX_PREVIEW);
    let mut out = String::with_capacity(shown * 3 + 4);
    for (i, b) in bytes[..shown].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02x}", b);
    }
    if bytes.len() > MAX_PREVIEW {
        let _ = write!(&mut out, " …(+{})", bytes.len() - MAX_PREVIEW);
    }
    out
}

/// Contiguous lowercase hex, the inverse of the replay script format.
pub fn hex_compact(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frames_render_fully() {
        assert_eq!(hex_preview(&[0x00, 0x3d, 0xff]), "00 3d ff");
        assert_eq!(hex_preview(&[]), "");
        assert_eq!(hex_compact(&[0x00, 0x3d, 0xff]), "003dff");
    }

    #[test]
    fn long_frames_are_truncated() {
        let bytes = vec![0xab; MAX_PREVIEW + 6];
        let s = hex_preview(&bytes);
        assert!(s.ends_with(" …(+6)"));
        assert_eq!(s.matches("ab").count(), MAX_PREVIEW);
    }
}
