//! 验证码图片渲染
//!
//! 用 5x7 点阵字体绘制数字，叠加干扰线与噪点后编码为 PNG。

use crate::auth::error::AuthError;
use image::{ImageFormat, Rgb, RgbImage};
use rand::Rng;
use std::io::Cursor;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const SCALE: u32 = 4;
const PADDING: u32 = 10;
const GAP: u32 = 6;
const NOISE_LINES: usize = 4;
const NOISE_DOTS: usize = 120;

/// 数字 0-9 的点阵，每行低 5 位有效，最高位在左
const DIGITS: [[u8; 7]; 10] = [
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
    [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
];

fn glyph(c: char) -> Option<&'static [u8; 7]> {
    c.to_digit(10).map(|d| &DIGITS[d as usize])
}

fn random_dark<R: Rng>(rng: &mut R) -> Rgb<u8> {
    Rgb([rng.gen_range(0..120), rng.gen_range(0..120), rng.gen_range(0..120)])
}

fn random_light<R: Rng>(rng: &mut R) -> Rgb<u8> {
    Rgb([
        rng.gen_range(140..230),
        rng.gen_range(140..230),
        rng.gen_range(140..230),
    ])
}

fn draw_line<R: Rng>(img: &mut RgbImage, rng: &mut R) {
    let (w, h) = img.dimensions();
    let color = random_light(rng);
    let (x0, y0) = (0i64, rng.gen_range(0..h) as i64);
    let (x1, y1) = ((w - 1) as i64, rng.gen_range(0..h) as i64);
    let steps = (x1 - x0).max(1);
    for step in 0..=steps {
        let x = x0 + step;
        let y = y0 + (y1 - y0) * step / steps;
        if (0..w as i64).contains(&x) && (0..h as i64).contains(&y) {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// 渲染验证码，返回 PNG 字节
pub fn render_png(code: &str) -> Result<Vec<u8>, AuthError> {
    let count = code.chars().count().max(1) as u32;
    let width = PADDING * 2 + count * GLYPH_WIDTH * SCALE + (count - 1) * GAP;
    let height = PADDING * 2 + GLYPH_HEIGHT * SCALE;

    let mut rng = rand::thread_rng();
    let mut img = RgbImage::from_pixel(width, height, Rgb([245, 245, 245]));

    for _ in 0..NOISE_LINES {
        draw_line(&mut img, &mut rng);
    }

    for (index, c) in code.chars().enumerate() {
        let rows = glyph(c)
            .ok_or_else(|| AuthError::Internal(format!("验证码包含不支持的字符: {}", c)))?;
        let color = random_dark(&mut rng);
        let left = PADDING + index as u32 * (GLYPH_WIDTH * SCALE + GAP);
        let jitter = rng.gen_range(0..PADDING);
        let top = PADDING / 2 + jitter;

        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if *bits & (1u8 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..SCALE {
                    for dx in 0..SCALE {
                        let x = left + col * SCALE + dx;
                        let y = top + row as u32 * SCALE + dy;
                        if x < width && y < height {
                            img.put_pixel(x, y, color);
                        }
                    }
                }
            }
        }
    }

    for _ in 0..NOISE_DOTS {
        let x = rng.gen_range(0..width);
        let y = rng.gen_range(0..height);
        let color = random_dark(&mut rng);
        img.put_pixel(x, y, color);
    }

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| AuthError::Internal(format!("验证码图片编码失败: {}", e)))?;
    Ok(buf.into_inner())
}
