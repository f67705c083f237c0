//! Synthetic frames built from ciphertext.
//!
//! Shows what an eavesdropper without the key would see: the encrypted
//! bytes laid out directly as pixels.

use crate::{MediaError, RawFrame, Resolution, Result};

/// Repeat-and-truncate `ciphertext` to exactly one frame at `target`.
///
/// Deterministic: the same ciphertext always yields the same frame.
pub fn noise_frame(ciphertext: &[u8], target: Resolution) -> Result<RawFrame> {
    if ciphertext.is_empty() {
        return Err(MediaError::EmptyInput);
    }
    if target.is_empty() {
        return Err(MediaError::InvalidResolution(target.width, target.height));
    }
    let data: Vec<u8> = ciphertext
        .iter()
        .copied()
        .cycle()
        .take(target.frame_len())
        .collect();
    Ok(RawFrame {
        width: target.width,
        height: target.height,
        data,
    })
}
