//! Raw video buffer to RGBA8 conversion.

/// Pixel layouts offered to the portal's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgrx,
    Rgbx,
    Bgra,
    Rgba,
    Rgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            _ => 4,
        }
    }
}

/// Copies a `width`x`height` image with rows `stride` bytes apart into a
/// tightly packed RGBA buffer. Returns `None` if `src` is too short.
pub fn to_rgba(
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    src: &[u8],
) -> Option<Vec<u8>> {
    let width = width as usize;
    let height = height as usize;
    let bpp = format.bytes_per_pixel();
    let row_len = width * bpp;
    if width == 0 || height == 0 || stride < row_len {
        return None;
    }
    if src.len() < stride * (height - 1) + row_len {
        return None;
    }

    let mut out = Vec::with_capacity(width * height * 4);
    for row in src.chunks(stride).take(height) {
        for px in row[..row_len].chunks_exact(bpp) {
            let rgba = match format {
                PixelFormat::Bgrx => [px[2], px[1], px[0], 0xff],
                PixelFormat::Bgra => [px[2], px[1], px[0], px[3]],
                PixelFormat::Rgbx => [px[0], px[1], px[2], 0xff],
                PixelFormat::Rgba => [px[0], px[1], px[2], px[3]],
                PixelFormat::Rgb => [px[0], px[1], px[2], 0xff],
            };
            out.extend_from_slice(&rgba);
        }
    }
    Some(out)
}
