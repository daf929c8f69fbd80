//! BlurHash encoding: a short string describing a blurred placeholder.

use std::f32::consts::PI;

use image::{imageops::FilterType, DynamicImage, GenericImageView};

const BASE83_CHARS: &[u8; 83] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz#$%*+,-.:;=?@[]^_{|}~";

/// Horizontal DCT components
const COMPONENTS_X: usize = 4;

/// Vertical DCT components
const COMPONENTS_Y: usize = 3;

/// Images are shrunk to this size before the transform
const SAMPLE_DIMENSION: u32 = 64;

fn encode_base83(value: u32, length: u32, out: &mut String) {
    for i in 1..=length {
        let digit = (value / 83u32.pow(length - i)) % 83;
        out.push(BASE83_CHARS[digit as usize] as char);
    }
}

fn srgb_to_linear(value: u8) -> f32 {
    let v = f32::from(value) / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> u32 {
    let v = value.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        (v * 12.92 * 255.0 + 0.5) as u32
    } else {
        ((1.055 * v.powf(1.0 / 2.4) - 0.055) * 255.0 + 0.5) as u32
    }
}

fn sign_pow(value: f32, exponent: f32) -> f32 {
    value.abs().powf(exponent).copysign(value)
}

fn encode_dc([r, g, b]: [f32; 3]) -> u32 {
    (linear_to_srgb(r) << 16) + (linear_to_srgb(g) << 8) + linear_to_srgb(b)
}

fn encode_ac(color: [f32; 3], maximum: f32) -> u32 {
    let quantize =
        |v: f32| ((sign_pow(v / maximum, 0.5) * 9.0 + 9.5).floor()).clamp(0.0, 18.0) as u32;
    quantize(color[0]) * 19 * 19 + quantize(color[1]) * 19 + quantize(color[2])
}

/// Encode an image as a BlurHash string.
///
/// Returns `None` for images with no pixels.
pub fn encode_image(image: &DynamicImage) -> Option<String> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let sample = if width > SAMPLE_DIMENSION || height > SAMPLE_DIMENSION {
        image.resize(SAMPLE_DIMENSION, SAMPLE_DIMENSION, FilterType::Triangle)
    } else {
        image.clone()
    };
    let rgb = sample.to_rgb8();
    let (width, height) = rgb.dimensions();

    let linear: Vec<[f32; 3]> = rgb
        .pixels()
        .map(|p| [srgb_to_linear(p[0]), srgb_to_linear(p[1]), srgb_to_linear(p[2])])
        .collect();

    let mut factors = Vec::with_capacity(COMPONENTS_X * COMPONENTS_Y);
    for j in 0..COMPONENTS_Y {
        for i in 0..COMPONENTS_X {
            let normalization = if i == 0 && j == 0 { 1.0 } else { 2.0 };
            let mut sum = [0f32; 3];
            for y in 0..height {
                let basis_y = (PI * j as f32 * y as f32 / height as f32).cos();
                for x in 0..width {
                    let basis = basis_y * (PI * i as f32 * x as f32 / width as f32).cos();
                    let pixel = linear[(y * width + x) as usize];
                    sum[0] += basis * pixel[0];
                    sum[1] += basis * pixel[1];
                    sum[2] += basis * pixel[2];
                }
            }
            let scale = normalization / (width * height) as f32;
            factors.push([sum[0] * scale, sum[1] * scale, sum[2] * scale]);
        }
    }

    let mut hash = String::with_capacity(4 + 2 * factors.len());
    let size_flag = (COMPONENTS_X - 1) + (COMPONENTS_Y - 1) * 9;
    encode_base83(size_flag as u32, 1, &mut hash);

    let (dc, ac) = factors.split_first()?;
    let actual_maximum = ac
        .iter()
        .flat_map(|c| c.iter())
        .fold(0f32, |max, v| max.max(v.abs()));

    let maximum = if ac.is_empty() {
        encode_base83(0, 1, &mut hash);
        1.0
    } else {
        let quantised = ((actual_maximum * 166.0 - 0.5).floor()).clamp(0.0, 82.0) as u32;
        encode_base83(quantised, 1, &mut hash);
        (quantised + 1) as f32 / 166.0
    };

    encode_base83(encode_dc(*dc), 4, &mut hash);
    for component in ac {
        encode_base83(encode_ac(*component, maximum), 2, &mut hash);
    }

    Some(hash)
}
