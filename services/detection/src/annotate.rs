use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;

use crate::detection_engine::DetectionBox;
use crate::error::DetectionError;

/// Border thickness in pixels
const BORDER_WIDTH: u32 = 2;

/// Box colors, picked by class id
const PALETTE: [[u8; 4]; 6] = [
    [255, 56, 56, 255],
    [255, 157, 151, 255],
    [255, 112, 31, 255],
    [72, 249, 10, 255],
    [0, 194, 255, 255],
    [132, 56, 255, 255],
];

/// Draw detection boxes over the image and encode the result as PNG
pub fn render_annotations(
    image: &DynamicImage,
    detections: &[DetectionBox],
) -> Result<Bytes, DetectionError> {
    let mut canvas = image.to_rgba8();

    for detection in detections {
        draw_box(&mut canvas, detection);
    }

    encode_png(&DynamicImage::ImageRgba8(canvas))
}

/// Encode an image as PNG bytes
pub fn encode_png(image: &DynamicImage) -> Result<Bytes, DetectionError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| DetectionError::Inference(format!("Failed to encode annotated image: {e}")))?;
    Ok(Bytes::from(buf))
}

fn draw_box(canvas: &mut RgbaImage, detection: &DetectionBox) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x1 = detection.bbox.x1.clamp(0.0, max_x) as i32;
    let y1 = detection.bbox.y1.clamp(0.0, max_y) as i32;
    let x2 = detection.bbox.x2.clamp(0.0, max_x) as i32;
    let y2 = detection.bbox.y2.clamp(0.0, max_y) as i32;

    let color = Rgba(PALETTE[detection.class_id as usize % PALETTE.len()]);
    let base = Rect::at(x1, y1).of_size((x2 - x1).max(1) as u32, (y2 - y1).max(1) as u32);

    for i in 0..BORDER_WIDTH {
        let offset = Rect::at(base.left() - i as i32, base.top() - i as i32)
            .of_size(base.width() + 2 * i, base.height() + 2 * i);
        draw_hollow_rect_mut(canvas, offset, color);
    }
}
