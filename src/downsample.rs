//! Bayer-aware image downsampling.
//!
//! World camera frames are recorded raw, straight off the sensor mosaic.
//! Before a buffer generation goes to disk, each frame is shrunk to cut
//! write time (and for privacy): every 4×4 tile of the mosaic collapses to
//! a 2×2 tile by averaging the four photosites of each color position, so
//! the output is again a valid mosaic at half the resolution. One unit of
//! `factor` halves each dimension once.
//!
//! The capture pipeline treats this as a black box: raw bytes in, smaller
//! raw bytes out, into a caller-provided buffer of the pre-computed size.

/// Image dimensions after downsampling by `factor`.
pub fn downsampled_dims(rows: u16, cols: u16, factor: u8) -> (u16, u16) {
    (rows >> factor, cols >> factor)
}

/// Byte size of one image after downsampling by `factor` (one byte per
/// photosite).
pub fn downsampled_len(rows: u16, cols: u16, factor: u8) -> usize {
    let (rows, cols) = downsampled_dims(rows, cols, factor);
    rows as usize * cols as usize
}

/// Downsamples one raw mosaic image into `output`.
///
/// `input` must hold exactly `rows × cols` bytes and `output` exactly
/// [`downsampled_len`] bytes. Each dimension must stay divisible by 4 at
/// every halving step, so `rows` and `cols` must be divisible by
/// `2^(factor + 1)`.
pub fn downsample(input: &[u8], rows: u16, cols: u16, factor: u8, output: &mut [u8]) {
    assert_eq!(input.len(), rows as usize * cols as usize);
    assert_eq!(output.len(), downsampled_len(rows, cols, factor));

    match factor {
        0 => output.copy_from_slice(input),
        1 => halve_mosaic(input, rows as usize, cols as usize, output),
        _ => {
            let mut current = input.to_vec();
            let (mut rows, mut cols) = (rows as usize, cols as usize);
            for _ in 0..factor - 1 {
                let mut next = vec![0u8; (rows / 2) * (cols / 2)];
                halve_mosaic(&current, rows, cols, &mut next);
                current = next;
                rows /= 2;
                cols /= 2;
            }
            halve_mosaic(&current, rows, cols, output);
        }
    }
}

/// Halves each dimension once. Within a 4×4 tile, photosites of the same
/// color position sit two apart in both directions; their average lands in
/// the matching position of the output's 2×2 tile.
fn halve_mosaic(input: &[u8], rows: usize, cols: usize, output: &mut [u8]) {
    assert!(rows % 4 == 0 && cols % 4 == 0, "dimensions must be divisible by 4");

    let new_cols = cols / 2;
    let at = |r: usize, c: usize| input[r * cols + c];
    let average =
        |a: u8, b: u8, c: u8, d: u8| ((a as u32 + b as u32 + c as u32 + d as u32) / 4) as u8;

    for (tile_r, r) in (0..rows).step_by(4).enumerate() {
        for (tile_c, c) in (0..cols).step_by(4).enumerate() {
            let p00 = average(at(r, c), at(r, c + 2), at(r + 2, c), at(r + 2, c + 2));
            let p01 = average(at(r, c + 1), at(r, c + 3), at(r + 2, c + 1), at(r + 2, c + 3));
            let p10 = average(at(r + 1, c), at(r + 1, c + 2), at(r + 3, c), at(r + 3, c + 2));
            let p11 = average(
                at(r + 1, c + 1),
                at(r + 1, c + 3),
                at(r + 3, c + 1),
                at(r + 3, c + 3),
            );

            let out_r = tile_r * 2;
            let out_c = tile_c * 2;
            output[out_r * new_cols + out_c] = p00;
            output[out_r * new_cols + out_c + 1] = p01;
            output[(out_r + 1) * new_cols + out_c] = p10;
            output[(out_r + 1) * new_cols + out_c + 1] = p11;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_halve_per_factor_unit() {
        assert_eq!(downsampled_dims(480, 640, 0), (480, 640));
        assert_eq!(downsampled_dims(480, 640, 1), (240, 320));
        assert_eq!(downsampled_dims(480, 640, 3), (60, 80));
        assert_eq!(downsampled_len(480, 640, 1), 240 * 320);
    }

    #[test]
    fn factor_zero_copies() {
        let input: Vec<u8> = (0..16).collect();
        let mut output = vec![0u8; 16];
        downsample(&input, 4, 4, 0, &mut output);
        assert_eq!(output, input);
    }

    #[test]
    fn uniform_image_stays_uniform() {
        let input = vec![37u8; 8 * 8];
        let mut output = vec![0u8; downsampled_len(8, 8, 1)];
        downsample(&input, 8, 8, 1, &mut output);
        assert!(output.iter().all(|&p| p == 37));
    }

    #[test]
    fn averages_each_color_position_separately() {
        // One 4x4 tile where every color position holds a distinct constant:
        //   a g a g        row parity 0: a at even cols, g at odd
        //   h b h b        row parity 1: h at even cols, b at odd
        let (a, g, h, b) = (40u8, 80u8, 120u8, 200u8);
        #[rustfmt::skip]
        let input = vec![
            a, g, a, g,
            h, b, h, b,
            a, g, a, g,
            h, b, h, b,
        ];
        let mut output = vec![0u8; 4];
        downsample(&input, 4, 4, 1, &mut output);
        assert_eq!(output, vec![a, g, h, b]);
    }

    #[test]
    fn factor_two_halves_twice() {
        let input = vec![9u8; 16 * 16];
        let mut output = vec![0u8; downsampled_len(16, 16, 2)];
        downsample(&input, 16, 16, 2, &mut output);
        assert_eq!(output.len(), 4 * 4);
        assert!(output.iter().all(|&p| p == 9));
    }
}
