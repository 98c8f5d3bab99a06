//! 叠加绘制: 粒子圆圈、编号、区域框、帧号、裁剪与翻转
//! Overlay drawing for annotated frames.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{imageops, DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;

use super::Marker;
use crate::config::{AnnotateConfig, Flip};
use crate::error::{Error, ErrorKind, Result};
use crate::video::CropRect;

const REGION_COLOR: Rgba<u8> = Rgba([255, 220, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);
const PAD: i32 = 2;

/// Distinct colour per particle id (golden-angle hue sampling).
pub fn id_to_color(id: i64) -> Rgba<u8> {
    let hue = (id.unsigned_abs() as f64 * 137.508) % 360.0;
    let (r, g, b) = hsv_to_rgb(hue as f32, 0.8, 0.9);
    Rgba([r, g, b, 255])
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}

// 3x5 点阵数字, 每行低 3 位有效
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b001, 0b001, 0b001],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];
const MINUS: [u8; 5] = [0b000, 0b000, 0b111, 0b000, 0b000];

/// Text renderer for labels: a TrueType font when one is configured,
/// otherwise built-in block digits.
pub enum LabelFont {
    Glyphs { font: FontVec, scale: PxScale },
    Digits { cell: u32 },
}

impl LabelFont {
    pub fn load(font: Option<&Path>, size: f32) -> Result<Self> {
        match font {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                let font = FontVec::try_from_vec(bytes).map_err(|e| {
                    Error::with_source(
                        ErrorKind::Unsupported,
                        format!("cannot read font {}", path.display()),
                        e,
                    )
                })?;
                Ok(LabelFont::Glyphs {
                    font,
                    scale: PxScale::from(size),
                })
            }
            // 字号 14 → 每个点 2 像素
            None => Ok(LabelFont::Digits {
                cell: ((size / 7.0).round() as u32).max(1),
            }),
        }
    }

    pub fn text_size(&self, text: &str) -> (u32, u32) {
        match self {
            LabelFont::Glyphs { font, scale } => text_size(*scale, font, text),
            LabelFont::Digits { cell } => {
                let n = text.chars().count() as u32;
                if n == 0 {
                    return (0, 0);
                }
                (n * 3 * cell + (n - 1) * cell, 5 * cell)
            }
        }
    }

    pub fn draw(&self, canvas: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>, text: &str) {
        match self {
            LabelFont::Glyphs { font, scale } => draw_text_mut(canvas, color, x, y, *scale, font, text),
            LabelFont::Digits { cell } => {
                let cell = *cell as i32;
                for (i, ch) in text.chars().enumerate() {
                    let bitmap = match ch {
                        '0'..='9' => &DIGITS[(ch as u8 - b'0') as usize],
                        '-' => &MINUS,
                        _ => continue,
                    };
                    let left = x + i as i32 * 4 * cell;
                    for (row, bits) in bitmap.iter().enumerate() {
                        for col in 0..3 {
                            if bits & (0b100 >> col) != 0 {
                                let rect = Rect::at(left + col * cell, y + row as i32 * cell)
                                    .of_size(cell as u32, cell as u32);
                                draw_filled_rect_mut(canvas, rect, color);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Where a label sits relative to its reference rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPlacement {
    AboveLeft,
    AboveRight,
    BelowLeft,
    BelowRight,
    InsideTopLeft,
    InsideTopRight,
    InsideBottomLeft,
    InsideBottomRight,
}

impl LabelPlacement {
    /// Pick a placement for a `text`-sized label around `reference`, keeping
    /// it inside `visible`. Outside placements are only used when `outside`
    /// is set. Inside labels go to the bottom edge when the frame will be
    /// flipped vertically, so they read at the top of the output.
    pub fn choose(
        reference: Rect,
        visible: Rect,
        text: (u32, u32),
        outside: bool,
        flipped: bool,
    ) -> Self {
        let (tw, th) = (text.0 as i32, text.1 as i32);
        let ref_bottom = reference.top() + reference.height() as i32;
        let vis_right = visible.left() + visible.width() as i32;
        let vis_bottom = visible.top() + visible.height() as i32;

        let above = outside && reference.top() - th - PAD >= visible.top();
        let below = outside && !above && ref_bottom + PAD + th <= vis_bottom;
        let left_x = if above || below {
            reference.left()
        } else {
            reference.left() + PAD
        };
        let right = left_x + tw > vis_right;

        match (above, below, right) {
            (true, _, false) => LabelPlacement::AboveLeft,
            (true, _, true) => LabelPlacement::AboveRight,
            (_, true, false) => LabelPlacement::BelowLeft,
            (_, true, true) => LabelPlacement::BelowRight,
            (_, _, false) if flipped => LabelPlacement::InsideBottomLeft,
            (_, _, true) if flipped => LabelPlacement::InsideBottomRight,
            (_, _, false) => LabelPlacement::InsideTopLeft,
            (_, _, true) => LabelPlacement::InsideTopRight,
        }
    }

    /// Top-left corner of the label.
    pub fn position(&self, reference: Rect, text: (u32, u32)) -> (i32, i32) {
        let (tw, th) = (text.0 as i32, text.1 as i32);
        let (rx, ry) = (reference.left(), reference.top());
        let (rw, rh) = (reference.width() as i32, reference.height() as i32);
        match self {
            LabelPlacement::AboveLeft => (rx, ry - th - PAD),
            LabelPlacement::AboveRight => (rx + rw - tw, ry - th - PAD),
            LabelPlacement::BelowLeft => (rx, ry + rh + PAD),
            LabelPlacement::BelowRight => (rx + rw - tw, ry + rh + PAD),
            LabelPlacement::InsideTopLeft => (rx + PAD, ry + PAD),
            LabelPlacement::InsideTopRight => (rx + rw - tw - PAD, ry + PAD),
            LabelPlacement::InsideBottomLeft => (rx + PAD, ry + rh - th - PAD),
            LabelPlacement::InsideBottomRight => (rx + rw - tw - PAD, ry + rh - th - PAD),
        }
    }
}

fn rect_of(crop: CropRect) -> Rect {
    Rect::at(crop.x as i32, crop.y as i32).of_size(crop.width, crop.height)
}

/// Renders one annotated frame. Shared read-only between pool workers.
pub struct Painter {
    radius: i32,
    show_region: bool,
    frame_number: bool,
    flip: Flip,
    font: LabelFont,
    region: Option<CropRect>,
    crop_output: bool,
}

impl Painter {
    pub fn new(config: &AnnotateConfig, region: Option<CropRect>) -> Result<Self> {
        Ok(Self {
            radius: config.radius as i32,
            show_region: config.show_region,
            frame_number: config.frame_number,
            flip: config.flip,
            font: LabelFont::load(config.font.as_deref(), config.font_size)?,
            crop_output: config.crop && region.is_some(),
            region,
        })
    }

    /// Part of the source frame that ends up in the output.
    fn visible_area(&self, width: u32, height: u32) -> Rect {
        match self.region {
            Some(region) if self.crop_output => rect_of(region),
            _ => Rect::at(0, 0).of_size(width, height),
        }
    }

    pub fn render(&self, frame: &DynamicImage, frame_number: usize, markers: &[Marker]) -> RgbaImage {
        let mut canvas = frame.to_rgba8();
        let (width, height) = canvas.dimensions();

        for m in markers {
            let color = id_to_color(m.particle);
            let (cx, cy) = (m.x.round() as i32, m.y.round() as i32);
            draw_hollow_circle_mut(&mut canvas, (cx, cy), self.radius, color);
            let label = m.particle.to_string();
            let (_, th) = self.font.text_size(&label);
            self.font.draw(
                &mut canvas,
                cx + self.radius + 1,
                cy - self.radius - th as i32,
                color,
                &label,
            );
        }

        let boxed_region = self.region.filter(|_| self.show_region);
        if let Some(region) = boxed_region {
            draw_hollow_rect_mut(&mut canvas, rect_of(region), REGION_COLOR);
        }

        if self.frame_number {
            let visible = self.visible_area(width, height);
            let (reference, outside) = match boxed_region {
                Some(region) if !self.crop_output => (rect_of(region), true),
                _ => (visible, false),
            };
            let label = frame_number.to_string();
            let size = self.font.text_size(&label);
            let flipped = matches!(self.flip, Flip::Vertical | Flip::Both);
            let placement = LabelPlacement::choose(reference, visible, size, outside, flipped);
            let (x, y) = placement.position(reference, size);
            if size.0 > 0 && size.1 > 0 {
                let background = Rect::at(x - 1, y - 1).of_size(size.0 + 2, size.1 + 2);
                draw_filled_rect_mut(&mut canvas, background, LABEL_BACKGROUND);
            }
            self.font.draw(&mut canvas, x, y, TEXT_COLOR, &label);
        }

        let canvas = match self.region {
            Some(r) if self.crop_output => {
                imageops::crop_imm(&canvas, r.x, r.y, r.width, r.height).to_image()
            }
            _ => canvas,
        };
        match self.flip {
            Flip::None => canvas,
            Flip::Horizontal => imageops::flip_horizontal(&canvas),
            Flip::Vertical => imageops::flip_vertical(&canvas),
            Flip::Both => imageops::rotate180(&canvas),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> Rect {
        Rect::at(x, y).of_size(w, h)
    }

    #[test]
    fn test_id_colors_are_stable_and_distinct() {
        assert_eq!(id_to_color(3), id_to_color(3));
        assert_ne!(id_to_color(0), id_to_color(1));
        assert_eq!(id_to_color(7).0[3], 255);
    }

    #[test]
    fn test_digit_font_metrics() {
        let font = LabelFont::load(None, 14.0).unwrap();
        assert_eq!(font.text_size("7"), (6, 10));
        assert_eq!(font.text_size("42"), (14, 10));
        assert_eq!(font.text_size(""), (0, 0));

        let mut canvas = RgbaImage::new(20, 12);
        font.draw(&mut canvas, 0, 0, TEXT_COLOR, "1");
        // "1" 顶行只有中间一点
        assert_eq!(*canvas.get_pixel(2, 0), TEXT_COLOR);
        assert_eq!(*canvas.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_missing_font_file() {
        let err = LabelFont::load(Some(Path::new("/no/such/font.ttf")), 12.0)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_label_placement() {
        let visible = rect(0, 0, 200, 100);
        let text = (20, 10);
        // 区域上方有空间
        assert_eq!(
            LabelPlacement::choose(rect(10, 30, 50, 40), visible, text, true, false),
            LabelPlacement::AboveLeft
        );
        // 上方不够, 下方够
        assert_eq!(
            LabelPlacement::choose(rect(10, 5, 50, 40), visible, text, true, false),
            LabelPlacement::BelowLeft
        );
        // 上下都不够
        assert_eq!(
            LabelPlacement::choose(rect(10, 5, 50, 90), visible, text, true, false),
            LabelPlacement::InsideTopLeft
        );
        // 左对齐会越界
        assert_eq!(
            LabelPlacement::choose(rect(190, 30, 10, 40), visible, text, true, false),
            LabelPlacement::AboveRight
        );
        assert_eq!(
            LabelPlacement::choose(rect(185, 5, 15, 40), visible, text, true, false),
            LabelPlacement::BelowRight
        );
        assert_eq!(
            LabelPlacement::choose(visible, visible, text, false, false),
            LabelPlacement::InsideTopLeft
        );
        assert_eq!(
            LabelPlacement::choose(rect(0, 0, 15, 100), rect(0, 0, 15, 100), text, false, false),
            LabelPlacement::InsideTopRight
        );
        // 垂直翻转后底部标签显示在顶部
        assert_eq!(
            LabelPlacement::choose(visible, visible, text, false, true),
            LabelPlacement::InsideBottomLeft
        );
        assert_eq!(
            LabelPlacement::choose(rect(0, 0, 15, 100), rect(0, 0, 15, 100), text, false, true),
            LabelPlacement::InsideBottomRight
        );
        assert_eq!(
            LabelPlacement::choose(rect(10, 5, 50, 90), visible, text, true, true),
            LabelPlacement::InsideBottomLeft
        );
        // 外部位置不受翻转影响
        assert_eq!(
            LabelPlacement::choose(rect(10, 30, 50, 40), visible, text, true, true),
            LabelPlacement::AboveLeft
        );
    }

    #[test]
    fn test_label_positions() {
        let r = rect(10, 20, 100, 50);
        let t = (20, 8);
        assert_eq!(LabelPlacement::AboveLeft.position(r, t), (10, 10));
        assert_eq!(LabelPlacement::AboveRight.position(r, t), (90, 10));
        assert_eq!(LabelPlacement::BelowLeft.position(r, t), (10, 72));
        assert_eq!(LabelPlacement::BelowRight.position(r, t), (90, 72));
        assert_eq!(LabelPlacement::InsideTopLeft.position(r, t), (12, 22));
        assert_eq!(LabelPlacement::InsideTopRight.position(r, t), (88, 22));
        assert_eq!(LabelPlacement::InsideBottomLeft.position(r, t), (12, 60));
        assert_eq!(LabelPlacement::InsideBottomRight.position(r, t), (88, 60));
    }

    #[test]
    fn test_render_crops_and_flips() {
        let mut config = AnnotateConfig::new(5);
        config.frame_number = false;
        config.crop = true;
        config.flip = Flip::Horizontal;
        let region = CropRect { x: 10, y: 5, width: 30, height: 20 };
        let painter = Painter::new(&config, Some(region)).unwrap();

        let mut source = RgbaImage::from_pixel(64, 48, Rgba([0, 0, 0, 255]));
        source.put_pixel(11, 6, Rgba([9, 9, 9, 255]));
        let out = painter.render(&DynamicImage::ImageRgba8(source), 0, &[]);
        assert_eq!(out.dimensions(), (30, 20));
        // (11, 6) → 裁剪后 (1, 1) → 水平翻转 (28, 1)
        assert_eq!(out.get_pixel(28, 1).0, [9, 9, 9, 255]);
    }

    #[test]
    fn test_frame_label_stays_on_top_after_vertical_flip() {
        let mut config = AnnotateConfig::new(5);
        config.frame_number = true;
        config.flip = Flip::Vertical;
        let painter = Painter::new(&config, None).unwrap();
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255])));
        let out = painter.render(&source, 7, &[]);
        let white_rows: Vec<u32> = out
            .enumerate_pixels()
            .filter(|(_, _, p)| **p == TEXT_COLOR)
            .map(|(_, y, _)| y)
            .collect();
        assert!(!white_rows.is_empty());
        assert!(white_rows.iter().all(|y| *y < 14));
    }

    #[test]
    fn test_render_draws_markers() {
        let config = AnnotateConfig::new(5);
        let painter = Painter::new(&config, None).unwrap();
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255])));
        let marker = Marker { x: 20.0, y: 20.0, particle: 3 };
        let out = painter.render(&source, 7, &[marker]);
        assert_eq!(out.dimensions(), (40, 40));
        // radius = 5 / 2 + 2 = 4
        assert_eq!(*out.get_pixel(24, 20), id_to_color(3));
        assert_eq!(*out.get_pixel(20, 20), Rgba([0, 0, 0, 255]));
    }
}
