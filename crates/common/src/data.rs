//! Data pipeline: dataset loading, shuffling, batching, prefetch.
//!
//! Images are held on the CPU as one `(n, c, h, w)` f32 tensor scaled to
//! `[-1, 1]`. Each epoch draws a fresh permutation and yields batches of
//! `batch_size` images (the last one may be smaller).

use std::path::Path;
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::DatasetKind;

// ── ImageDataset ────────────────────────────────────────────────────────────

/// In-memory image dataset. Cloning is cheap (tensor storage is shared).
#[derive(Clone)]
pub struct ImageDataset {
    images: Tensor,
    hflip: bool,
}

impl ImageDataset {
    /// Fetch the training split of `kind` from `data_dir` (or the hub) and
    /// resize it to `img_size × img_size`.
    pub fn load(kind: DatasetKind, data_dir: Option<&Path>, img_size: usize) -> anyhow::Result<Self> {
        use candle_datasets::vision::{cifar, mnist};

        let raw = match (kind, data_dir) {
            (DatasetKind::Mnist, Some(dir)) => mnist::load_dir(dir),
            (DatasetKind::Mnist, None) => mnist::load(),
            (DatasetKind::Cifar10, Some(dir)) => cifar::load_dir(dir),
            // The hub parquet loader truncates pixels to u8 before scaling and
            // keeps HWC bytes under a CHW shape; only the binary batches decode.
            (DatasetKind::Cifar10, None) => anyhow::bail!(
                "cifar10 needs --data_dir pointing at the binary batches \
                 (data_batch_1.bin .. data_batch_5.bin, test_batch.bin)"
            ),
        }
        .with_context(|| format!("load {} dataset", kind.name()))?;

        let dataset = Self::from_unit_images(&raw.train_images, kind.channels(), img_size)?
            .with_hflip(kind.hflip());
        tracing::info!(
            dataset = kind.name(),
            images = dataset.len(),
            img_size,
            "Loaded training images"
        );
        Ok(dataset)
    }

    /// Build from pixels in `[0, 1]`, either flat `(n, c·h·w)` or `(n, c, h, w)`.
    ///
    /// Integer tensors and values outside `[0, 1]` are rejected: they mean the
    /// pixels were never scaled, or were truncated before scaling.
    pub fn from_unit_images(images: &Tensor, channels: usize, img_size: usize) -> Result<Self> {
        if !images.dtype().is_float() {
            candle_core::bail!("expected float pixels in [0, 1], got {:?}", images.dtype());
        }
        let images = images.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
        if images.elem_count() > 0 {
            let lo = images.min_all()?.to_scalar::<f32>()?;
            let hi = images.max_all()?.to_scalar::<f32>()?;
            if !(lo >= 0.0 && hi <= 1.0) {
                candle_core::bail!("pixels must lie in [0, 1], found [{lo}, {hi}]");
            }
        }
        let images = match images.rank() {
            2 => {
                let (n, flat) = images.dims2()?;
                let side = ((flat / channels) as f64).sqrt() as usize;
                if side * side * channels != flat {
                    candle_core::bail!("cannot reshape {flat} pixels into {channels} square channels");
                }
                images.reshape((n, channels, side, side))?
            }
            4 => images,
            r => candle_core::bail!("expected rank 2 or 4 image tensor, got rank {r}"),
        };
        let (_, _, h, w) = images.dims4()?;
        let images = if h != img_size || w != img_size {
            images.upsample_nearest2d(img_size, img_size)?
        } else {
            images
        };
        // [0, 1] → [-1, 1]
        let images = images.affine(2.0, -1.0)?;
        Ok(Self {
            images,
            hflip: false,
        })
    }

    pub fn with_hflip(mut self, hflip: bool) -> Self {
        self.hflip = hflip;
        self
    }

    pub fn len(&self) -> usize {
        self.images.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channels, height, width)` of a single image.
    pub fn image_dims(&self) -> Result<(usize, usize, usize)> {
        let (_, c, h, w) = self.images.dims4()?;
        Ok((c, h, w))
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size)
    }

    pub fn shuffled_order(&self, rng: &mut impl Rng) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
    }

    /// Batches in `order`. Flip decisions are pre-drawn from `rng` so the
    /// iterator can move to a prefetch thread without it.
    pub fn batches(
        &self,
        order: Vec<usize>,
        batch_size: usize,
        rng: &mut impl Rng,
    ) -> impl Iterator<Item = Result<Tensor>> + Send + 'static {
        let flips: Vec<bool> = if self.hflip {
            order.iter().map(|_| rng.gen_bool(0.5)).collect()
        } else {
            Vec::new()
        };
        let images = self.images.clone();
        let mut start = 0usize;
        std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let batch = gather(&images, &order[start..end], flips.get(start..end));
            start = end;
            Some(batch)
        })
    }
}

fn gather(images: &Tensor, ids: &[usize], flips: Option<&[bool]>) -> Result<Tensor> {
    let ids_u32: Vec<u32> = ids.iter().map(|&i| i as u32).collect();
    let index = Tensor::from_vec(ids_u32, ids.len(), images.device())?;
    let batch = images.index_select(&index, 0)?;
    match flips {
        Some(flips) if flips.iter().any(|&f| f) => {
            let rows = flips
                .iter()
                .enumerate()
                .map(|(i, &flip)| {
                    let img = batch.narrow(0, i, 1)?;
                    if flip {
                        hflip(&img)
                    } else {
                        Ok(img)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&rows, 0)
        }
        _ => Ok(batch),
    }
}

/// Mirror images along the width axis.
pub fn hflip(images: &Tensor) -> Result<Tensor> {
    let w = images.dim(images.rank() - 1)?;
    let rev: Vec<u32> = (0..w as u32).rev().collect();
    let rev = Tensor::from_vec(rev, w, images.device())?;
    images.index_select(&rev, images.rank() - 1)
}

// ── Prefetch ────────────────────────────────────────────────────────────────

/// Run `batches` on a producer thread, buffering up to `depth` items so the
/// training thread is not starved. `depth == 0` iterates inline.
///
/// A panic on the producer thread is re-raised on the consuming thread once
/// the queue drains, so a dead producer never looks like a short epoch.
pub fn prefetch<I>(batches: I, depth: usize) -> Box<dyn Iterator<Item = I::Item>>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    if depth == 0 {
        return Box::new(batches);
    }
    let (tx, rx) = mpsc::sync_channel(depth);
    let producer = thread::spawn(move || {
        for batch in batches {
            if tx.send(batch).is_err() {
                return;
            }
        }
    });
    Box::new(Prefetch {
        rx,
        producer: Some(producer),
    })
}

struct Prefetch<T> {
    rx: mpsc::Receiver<T>,
    producer: Option<thread::JoinHandle<()>>,
}

impl<T> Iterator for Prefetch<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                if let Some(producer) = self.producer.take() {
                    if let Err(panic) = producer.join() {
                        std::panic::resume_unwind(panic);
                    }
                }
                None
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp_dataset(n: usize) -> ImageDataset {
        // Image i is filled with i / n so batches can be traced back to ids.
        let pixels: Vec<f32> = (0..n)
            .flat_map(|i| std::iter::repeat(i as f32 / n as f32).take(16))
            .collect();
        let t = Tensor::from_vec(pixels, (n, 16), &Device::Cpu).unwrap();
        ImageDataset::from_unit_images(&t, 1, 4).unwrap()
    }

    #[test]
    fn flat_images_are_reshaped_and_normalised() {
        let ds = ramp_dataset(5);
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.image_dims().unwrap(), (1, 4, 4));
        let first: Vec<f32> = ds.images.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(first.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn resize_to_requested_size() {
        let t = Tensor::zeros((3, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let ds = ImageDataset::from_unit_images(&t, 1, 32).unwrap();
        assert_eq!(ds.image_dims().unwrap(), (1, 32, 32));
    }

    #[test]
    fn batches_cover_every_image_once() {
        let ds = ramp_dataset(10);
        let mut rng = StdRng::seed_from_u64(7);
        let order = ds.shuffled_order(&mut rng);
        assert_eq!(ds.num_batches(4), 3);

        let batches: Vec<Tensor> = ds
            .batches(order, 4, &mut rng)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.dim(0).unwrap()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let mut ids: Vec<usize> = batches
            .iter()
            .flat_map(|b| {
                let firsts: Vec<f32> = b.flatten_from(1).unwrap().narrow(1, 0, 1).unwrap()
                    .flatten_all().unwrap().to_vec1().unwrap();
                firsts.into_iter().map(|v| (((v + 1.0) / 2.0) * 10.0).round() as usize)
            })
            .collect();
        ids.sort();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_is_seeded() {
        let ds = ramp_dataset(32);
        let a = ds.shuffled_order(&mut StdRng::seed_from_u64(3));
        let b = ds.shuffled_order(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        assert_ne!(a, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn hflip_reverses_columns() {
        let t = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0], (1, 1, 2, 3), &Device::Cpu)
            .unwrap();
        let flipped: Vec<Vec<f32>> = hflip(&t).unwrap().squeeze(0).unwrap().squeeze(0).unwrap()
            .to_vec2().unwrap();
        assert_eq!(flipped, vec![vec![3.0, 2.0, 1.0], vec![6.0, 5.0, 4.0]]);
    }

    #[test]
    fn prefetch_preserves_order() {
        let items: Vec<u32> = prefetch(0..20u32, 3).collect();
        assert_eq!(items, (0..20).collect::<Vec<_>>());
        let inline: Vec<u32> = prefetch(0..5u32, 0).collect();
        assert_eq!(inline, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "decode failed")]
    fn prefetch_reraises_producer_panic() {
        let failing = (0..5u32).map(|i| {
            if i == 2 {
                panic!("decode failed");
            }
            i
        });
        let seen: Vec<u32> = prefetch(failing, 2).collect();
        // Unreachable: the panic surfaces before the iterator reports its end.
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn truncated_pixels_are_rejected() {
        // What a loader that casts to u8 before dividing by 255 hands over.
        let bytes = Tensor::new(&[0u8, 64, 128, 200, 255], &Device::Cpu)
            .unwrap()
            .reshape((1, 5))
            .unwrap();
        assert!(ImageDataset::from_unit_images(&bytes, 1, 4).is_err());

        let unscaled = Tensor::new(&[[0f32, 64.0, 128.0, 255.0]], &Device::Cpu).unwrap();
        assert!(ImageDataset::from_unit_images(&unscaled, 1, 2).is_err());
    }

    #[test]
    fn rgb_pixels_keep_range_and_channel_layout() {
        // Two 2×2 RGB images in the binary batch layout (label-free): one
        // full plane per channel, red = 0, green = 128/255, blue = 1.
        let plane = |v: f32| std::iter::repeat(v).take(4);
        let pixels: Vec<f32> = (0..2)
            .flat_map(|_| plane(0.0).chain(plane(128.0 / 255.0)).chain(plane(1.0)))
            .collect();
        let t = Tensor::from_vec(pixels, (2, 3 * 2 * 2), &Device::Cpu).unwrap();
        let ds = ImageDataset::from_unit_images(&t, 3, 2).unwrap();
        assert_eq!(ds.image_dims().unwrap(), (3, 2, 2));

        let img: Vec<Vec<Vec<f32>>> = ds.images.get(1).unwrap().to_vec3().unwrap();
        assert!(img[0].iter().flatten().all(|&v| v == -1.0));
        assert!(img[1].iter().flatten().all(|&v| (v - 0.003_921_6).abs() < 1e-5));
        assert!(img[2].iter().flatten().all(|&v| v == 1.0));
    }

    #[test]
    fn cifar10_requires_a_local_copy() {
        let err = ImageDataset::load(DatasetKind::Cifar10, None, 32)
            .err()
            .expect("cifar10 without data_dir must fail");
        assert!(format!("{err:#}").contains("--data_dir"));
    }
}
