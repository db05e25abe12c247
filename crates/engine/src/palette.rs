//! The fixed set of candidate images, cut into tiles on demand.

use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::grid::{Coord, GridSnapshot, TileState, MAX_PALETTE};

#[derive(Debug, Clone)]
pub struct Palette {
    images: Vec<RgbImage>,
    width: u32,
    height: u32,
}

/// Pixel rectangle covered by one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Palette {
    pub fn from_images(images: Vec<RgbImage>) -> Result<Self> {
        let Some(first) = images.first() else {
            return Err(EngineError::Palette("palette is empty".into()));
        };
        if images.len() > MAX_PALETTE {
            return Err(EngineError::Palette(format!(
                "palette has {} images, at most {MAX_PALETTE} are supported",
                images.len()
            )));
        }

        let (width, height) = first.dimensions();
        if width == 0 || height == 0 {
            return Err(EngineError::Palette("images must not be empty".into()));
        }
        if let Some((idx, odd)) = images
            .iter()
            .enumerate()
            .find(|(_, img)| img.dimensions() != (width, height))
        {
            return Err(EngineError::Palette(format!(
                "image {idx} is {}x{}, expected {width}x{height}",
                odd.width(),
                odd.height()
            )));
        }

        Ok(Self {
            images,
            width,
            height,
        })
    }

    /// Loads every image in `dir` (sorted by file name), shrinking each by
    /// the integer factor `resize`.
    pub fn load_dir(dir: &Path, resize: u32) -> Result<Self> {
        if resize == 0 {
            return Err(EngineError::Config("resize factor must be at least 1".into()));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::Palette(format!("read image dir {}: {e}", dir.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in &paths {
            let decoded = image::open(path)
                .map_err(|e| EngineError::Palette(format!("decode {}: {e}", path.display())))?
                .to_rgb8();
            let (w, h) = decoded.dimensions();
            let (nw, nh) = ((w / resize).max(1), (h / resize).max(1));
            info!(
                path = %path.display(),
                from = %format!("{w}x{h}"),
                to = %format!("{nw}x{nh}"),
                "loaded palette image"
            );
            let image = if resize == 1 {
                decoded
            } else {
                imageops::resize(&decoded, nw, nh, FilterType::Triangle)
            };
            images.push(image);
        }

        Self::from_images(images)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Fails if a `columns x rows` grid would leave tiles without pixels.
    pub fn check_grid(&self, columns: u32, rows: u32) -> Result<()> {
        if columns > self.width || rows > self.height {
            return Err(EngineError::Config(format!(
                "{columns}x{rows} grid does not fit {}x{} images",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Tiles are equal-sized; leftover pixels on the right and bottom edge
    /// belong to no tile.
    pub fn tile_rect(&self, coord: Coord, columns: u32, rows: u32) -> TileRect {
        let width = self.width / columns;
        let height = self.height / rows;
        TileRect {
            x: coord.column * width,
            y: coord.row * height,
            width,
            height,
        }
    }

    pub fn tile(&self, state: TileState, coord: Coord, columns: u32, rows: u32) -> RgbImage {
        let rect = self.tile_rect(coord, columns, rows);
        let source = &self.images[state as usize % self.images.len()];
        imageops::crop_imm(source, rect.x, rect.y, rect.width, rect.height).to_image()
    }

    /// Stitches the full picture from each tile's current palette entry.
    pub fn composite(&self, snapshot: &GridSnapshot) -> RgbImage {
        let mut out = RgbImage::new(self.width, self.height);
        for column in 0..snapshot.columns {
            for row in 0..snapshot.rows {
                let coord = Coord::new(column, row);
                let Some(state) = snapshot.get(coord) else {
                    continue;
                };
                let rect = self.tile_rect(coord, snapshot.columns, snapshot.rows);
                let tile = self.tile(state, coord, snapshot.columns, snapshot.rows);
                imageops::replace(&mut out, &tile, rect.x.into(), rect.y.into());
            }
        }
        out
    }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| EngineError::Palette(format!("png encode failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn solid_palette(count: usize, width: u32, height: u32) -> Palette {
    let images = (0..count)
        .map(|i| RgbImage::from_pixel(width, height, image::Rgb([i as u8 * 40, 0, 255])))
        .collect();
    Palette::from_images(images).unwrap()
}
