//! Sample grids: rescale model output, tile it, write PNGs.

use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Result, Tensor};

/// Gap in pixels between grid cells (and around the border).
pub const GRID_PADDING: usize = 2;

/// Map model output from `[-1, 1]` to `[0, 1]` and clip whatever falls outside.
pub fn to_unit_range(images: &Tensor) -> Result<Tensor> {
    images.affine(0.5, 0.5)?.clamp(0f32, 1f32)
}

/// Tile a `(n, c, h, w)` batch into one `(c, H, W)` image with `nrow` images
/// per row, [`GRID_PADDING`] pixels of zeros between cells.
pub fn make_grid(images: &Tensor, nrow: usize) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4()?;
    let cols = nrow.min(n).max(1);
    let rows = n.div_ceil(cols);
    let cell_h = h + GRID_PADDING;
    let cell_w = w + GRID_PADDING;
    let grid_h = rows * cell_h + GRID_PADDING;
    let grid_w = cols * cell_w + GRID_PADDING;

    let images = images.to_device(&Device::Cpu)?;
    let mut grid = vec![0f32; c * grid_h * grid_w];
    for k in 0..n {
        let img = images.get(k)?.to_vec3::<f32>()?;
        let top = (k / cols) * cell_h + GRID_PADDING;
        let left = (k % cols) * cell_w + GRID_PADDING;
        for (ch, plane) in img.iter().enumerate() {
            for (y, row) in plane.iter().enumerate() {
                let offset = ch * grid_h * grid_w + (top + y) * grid_w + left;
                grid[offset..offset + w].copy_from_slice(row);
            }
        }
    }
    Tensor::from_vec(grid, (c, grid_h, grid_w), &Device::Cpu)
}

/// Write a `(c, h, w)` tensor with values in `[0, 1]` as an 8-bit PNG.
/// One channel is saved as grayscale, three as RGB.
pub fn save_image(image: &Tensor, path: &Path) -> anyhow::Result<()> {
    let (c, h, w) = image.dims3()?;
    let bytes: Vec<u8> = image
        .to_device(&Device::Cpu)?
        .affine(255.0, 0.5)?
        .clamp(0f32, 255f32)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| v as u8)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match c {
        1 => image::GrayImage::from_raw(w as u32, h as u32, bytes)
            .context("grayscale buffer size mismatch")?
            .save(path)?,
        3 => image::RgbImage::from_raw(w as u32, h as u32, bytes)
            .context("rgb buffer size mismatch")?
            .save(path)?,
        other => anyhow::bail!("cannot save image with {other} channels"),
    }
    Ok(())
}

/// Rescale, tile and save a batch of raw model samples in one go.
pub fn save_sample_grid(samples: &Tensor, nrow: usize, path: &Path) -> anyhow::Result<Tensor> {
    let unit = to_unit_range(samples)?;
    let grid = make_grid(&unit, nrow)?;
    save_image(&grid, path).with_context(|| format!("save sample grid {}", path.display()))?;
    Ok(unit)
}

// ── Tests ───────────────────────────────────────────────────────────────────
