//! Frame type and pixel helpers: YUYV conversion, dark detection, downscaling.

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap grayscale pixels, classifying the frame as dark or not.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Bilinear downscale by `factor` (0 < factor < 1).
    ///
    /// Factors of 1 or more (or non-positive) return an unchanged copy.
    pub fn downscaled(&self, factor: f32) -> Frame {
        if !(factor > 0.0 && factor < 1.0) || self.width == 0 || self.height == 0 {
            return self.clone();
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let new_w = ((w as f32 * factor).round() as usize).max(1);
        let new_h = ((h as f32 * factor).round() as usize).max(1);
        let inv_x = w as f32 / new_w as f32;
        let inv_y = h as f32 / new_h as f32;

        let mut data = Vec::with_capacity(new_w * new_h);
        for y in 0..new_h {
            let sy = ((y as f32 + 0.5) * inv_y - 0.5).max(0.0);
            let y0 = (sy as usize).min(h - 1);
            let y1 = (y0 + 1).min(h - 1);
            let fy = sy - y0 as f32;
            for x in 0..new_w {
                let sx = ((x as f32 + 0.5) * inv_x - 0.5).max(0.0);
                let x0 = (sx as usize).min(w - 1);
                let x1 = (x0 + 1).min(w - 1);
                let fx = sx - x0 as f32;

                let px = |xx: usize, yy: usize| self.data[yy * w + xx] as f32;
                let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
                let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
                data.push((top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8);
            }
        }

        Frame {
            data,
            width: new_w as u32,
            height: new_h as u32,
            timestamp: self.timestamp,
            sequence: self.sequence,
            is_dark: self.is_dark,
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
