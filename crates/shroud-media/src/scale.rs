use crate::{MediaError, RawFrame, Resolution, Result, CHANNELS};

/// Nearest-neighbour resize to `target`.
///
/// Returns the input untouched when it already has the target geometry.
pub fn resize(frame: RawFrame, target: Resolution) -> Result<RawFrame> {
    if target.is_empty() {
        return Err(MediaError::InvalidResolution(target.width, target.height));
    }
    frame.validate()?;
    if frame.resolution() == target {
        return Ok(frame);
    }

    let (src_w, src_h) = (frame.width as usize, frame.height as usize);
    let (dst_w, dst_h) = (target.width as usize, target.height as usize);
    let mut data = Vec::with_capacity(target.frame_len());

    for y in 0..dst_h {
        let src_row = (y * src_h / dst_h) * src_w;
        for x in 0..dst_w {
            let offset = (src_row + x * src_w / dst_w) * CHANNELS;
            data.extend_from_slice(&frame.data[offset..offset + CHANNELS]);
        }
    }

    Ok(RawFrame {
        width: target.width,
        height: target.height,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let frame = RawFrame::filled(Resolution::new(4, 4), 9);
        let out = resize(frame.clone(), Resolution::new(4, 4)).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_downscale_keeps_uniform_colour() {
        let frame = RawFrame::filled(Resolution::new(1280, 720), 42);
        let out = resize(frame, Resolution::new(640, 360)).unwrap();
        assert_eq!(out.resolution(), Resolution::new(640, 360));
        assert!(out.data.iter().all(|&b| b == 42));
    }

    #[test]
    fn test_upscale_picks_nearest() {
        // 2x1: left pixel red, right pixel blue.
        let frame = RawFrame::new(2, 1, vec![255, 0, 0, 0, 0, 255]).unwrap();
        let out = resize(frame, Resolution::new(4, 2)).unwrap();
        assert_eq!(out.pixel(0, 0), Some([255, 0, 0]));
        assert_eq!(out.pixel(1, 1), Some([255, 0, 0]));
        assert_eq!(out.pixel(2, 0), Some([0, 0, 255]));
        assert_eq!(out.pixel(3, 1), Some([0, 0, 255]));
    }

    #[test]
    fn test_rejects_empty_target() {
        let frame = RawFrame::filled(Resolution::new(2, 2), 0);
        assert!(resize(frame, Resolution::new(0, 10)).is_err());
    }
}
