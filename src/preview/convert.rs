//! Pixel format conversion into packed RGB24.
//!
//! All YUV paths use BT.601 with fixed-point integer arithmetic (<<8) since
//! they run once per frame on the frame-dispatch thread. Every function
//! returns an empty buffer when the input is too small for the given
//! dimensions.

use crate::camera::types::Plane;

#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32, out: &mut [u8]) {
    out[0] = ((y * 256 + 359 * v) >> 8).clamp(0, 255) as u8;
    out[1] = ((y * 256 - 88 * u - 183 * v) >> 8).clamp(0, 255) as u8;
    out[2] = ((y * 256 + 454 * u) >> 8).clamp(0, 255) as u8;
}

/// Bytes per row of the interleaved chroma plane for a 4:2:0 image.
fn chroma_row_len(width: usize) -> usize {
    width.div_ceil(2) * 2
}

/// Size of a packed 4:2:0 semi-planar buffer.
pub fn semi_planar_len(width: usize, height: usize) -> usize {
    width * height + chroma_row_len(width) * height.div_ceil(2)
}

fn sample(plane: &Plane, row: usize, col: usize) -> Option<u8> {
    plane
        .data
        .get(row * plane.row_stride + col * plane.pixel_stride)
        .copied()
}

/// Interleave three YUV 4:2:0 planes into NV21 (Y, then V/U pairs).
///
/// Row and pixel strides of every plane are honoured, so padded rows and
/// semi-planar chroma layouts (pixel stride 2) both work.
pub fn yuv420_planes_to_nv21(planes: &[Plane], width: usize, height: usize) -> Vec<u8> {
    let [y_plane, u_plane, v_plane] = planes else {
        return Vec::new();
    };
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(semi_planar_len(width, height));

    for row in 0..height {
        for col in 0..width {
            match sample(y_plane, row, col) {
                Some(y) => out.push(y),
                None => return Vec::new(),
            }
        }
    }

    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    for row in 0..ch {
        for col in 0..cw {
            match (sample(v_plane, row, col), sample(u_plane, row, col)) {
                (Some(v), Some(u)) => {
                    out.push(v);
                    out.push(u);
                }
                _ => return Vec::new(),
            }
        }
    }

    out
}

fn semi_planar_to_rgb(data: &[u8], width: usize, height: usize, v_first: bool) -> Vec<u8> {
    if width == 0 || height == 0 || data.len() < semi_planar_len(width, height) {
        return Vec::new();
    }

    let y_plane = &data[..width * height];
    let uv_plane = &data[width * height..];
    let uv_row = chroma_row_len(width);
    let (first, second) = if v_first { (1, 0) } else { (0, 1) };

    let mut rgb = vec![0u8; width * height * 3];
    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as i32;
            let uv_index = (row / 2) * uv_row + (col / 2) * 2;
            let u = uv_plane[uv_index + first] as i32 - 128;
            let v = uv_plane[uv_index + second] as i32 - 128;

            let base = (row * width + col) * 3;
            yuv_to_rgb(y, u, v, &mut rgb[base..base + 3]);
        }
    }

    rgb
}

/// Convert NV12 (Y plane, interleaved U/V) to RGB24.
pub fn convert_nv12_to_rgb(nv12: &[u8], width: usize, height: usize) -> Vec<u8> {
    semi_planar_to_rgb(nv12, width, height, false)
}

/// Convert NV21 (Y plane, interleaved V/U) to RGB24.
pub fn convert_nv21_to_rgb(nv21: &[u8], width: usize, height: usize) -> Vec<u8> {
    semi_planar_to_rgb(nv21, width, height, true)
}

/// Convert YUY2 (YUYV) packed data to RGB24.
///
/// YUY2 stores two pixels per 4-byte macro-pixel: [Y0, U, Y1, V].
/// Width must be even.
pub fn convert_yuy2_to_rgb(yuy2: &[u8], width: usize, height: usize) -> Vec<u8> {
    let expected = width * height * 2;
    if yuy2.len() < expected || width == 0 || height == 0 {
        return Vec::new();
    }

    let mut rgb = vec![0u8; width * height * 3];
    for i in 0..(width * height / 2) {
        let y0 = yuy2[i * 4] as i32;
        let u = yuy2[i * 4 + 1] as i32 - 128;
        let y1 = yuy2[i * 4 + 2] as i32;
        let v = yuy2[i * 4 + 3] as i32 - 128;

        let base = i * 6;
        yuv_to_rgb(y0, u, v, &mut rgb[base..base + 3]);
        yuv_to_rgb(y1, u, v, &mut rgb[base + 3..base + 6]);
    }
    rgb
}

/// Copy a possibly padded RGB24 plane into a tightly packed buffer.
pub fn pack_rgb(plane: &Plane, width: usize, height: usize) -> Vec<u8> {
    let row_len = width * 3;
    if width == 0 || height == 0 || plane.row_stride < row_len {
        return Vec::new();
    }
    let needed = plane.row_stride * (height - 1) + row_len;
    if plane.data.len() < needed {
        return Vec::new();
    }

    if plane.row_stride == row_len {
        return plane.data[..row_len * height].to_vec();
    }

    let mut out = Vec::with_capacity(row_len * height);
    for row in 0..height {
        let start = row * plane.row_stride;
        out.extend_from_slice(&plane.data[start..start + row_len]);
    }
    out
}
