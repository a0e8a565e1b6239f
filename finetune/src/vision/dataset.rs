use futures::{StreamExt, stream};
use rand::Rng;
use rand::seq::SliceRandom;
use tch::{Device, Tensor};

use super::augmentations::{PixelBuffer, Pipeline};
use crate::catalog::class_catalog::SampleRef;
use crate::remote::ImageSource;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub pixels: PixelBuffer,
    pub label: usize,
}

/// A sample that could not be materialized. Skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub index: usize,
    pub url: String,
    pub reason: String,
}

/// Collated tensors of the samples that survived fetching.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub dropped: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazily fetched view over a subset of the catalog.
pub struct SampledDataset<'a, S> {
    source: &'a S,
    samples: Vec<SampleRef>,
    pipeline: Pipeline,
    class_names: &'a [String],
}

impl<'a, S: ImageSource> SampledDataset<'a, S> {
    pub fn new(source: &'a S, samples: Vec<SampleRef>, pipeline: Pipeline, class_names: &'a [String]) -> Self {
        Self {
            source,
            samples,
            pipeline,
            class_names,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.class_index).collect()
    }

    pub async fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample, Dropped> {
        let fetched = self.fetch(index).await;
        self.finish(index, fetched, rng)
    }

    /// Fetches `indices` with at most `workers` requests in flight, then
    /// transforms them in order so the augmentation draws stay reproducible.
    pub async fn load_batch<R: Rng + ?Sized>(
        &self,
        indices: &[usize],
        workers: usize,
        rng: &mut R,
    ) -> Vec<Result<Sample, Dropped>> {
        let fetched: Vec<_> = stream::iter(indices.iter().copied())
            .map(|index| async move { (index, self.fetch(index).await) })
            .buffered(workers.max(1))
            .collect()
            .await;
        fetched
            .into_iter()
            .map(|(index, result)| self.finish(index, result, rng))
            .collect()
    }

    async fn fetch(&self, index: usize) -> Result<image::DynamicImage, Dropped> {
        let sample = self.samples.get(index).ok_or_else(|| Dropped {
            index,
            url: String::new(),
            reason: format!("index {} out of range for {} samples", index, self.samples.len()),
        })?;
        self.source
            .fetch_image(&sample.url)
            .await
            .map_err(|err| Dropped {
                index,
                url: sample.url.clone(),
                reason: err.to_string(),
            })
    }

    fn finish<R: Rng + ?Sized>(
        &self,
        index: usize,
        fetched: Result<image::DynamicImage, Dropped>,
        rng: &mut R,
    ) -> Result<Sample, Dropped> {
        match fetched {
            Ok(image) => Ok(Sample {
                pixels: self.pipeline.apply(&image, rng),
                label: self.samples[index].class_index,
            }),
            Err(dropped) => {
                let class = self
                    .samples
                    .get(index)
                    .and_then(|s| self.class_names.get(s.class_index))
                    .map(String::as_str)
                    .unwrap_or("?");
                log::warn!("Dropping sample of class '{}' ({}): {}", class, dropped.url, dropped.reason);
                Err(dropped)
            }
        }
    }
}

/// Splits the results into survivors and drops, preserving order.
pub fn partition(results: Vec<Result<Sample, Dropped>>) -> (Vec<Sample>, Vec<Dropped>) {
    let mut kept = Vec::with_capacity(results.len());
    let mut dropped = Vec::new();
    for result in results {
        match result {
            Ok(sample) => kept.push(sample),
            Err(d) => dropped.push(d),
        }
    }
    (kept, dropped)
}

/// Stacks the surviving samples into `[N, 3, H, W]` images and `[N]` labels.
/// Returns `None` when nothing survived.
pub fn collate(results: Vec<Result<Sample, Dropped>>, device: Device) -> Option<Batch> {
    let (kept, dropped) = partition(results);
    let first = kept.first()?;
    let [c, h, w] = first.pixels.shape();

    let mut flat = Vec::with_capacity(kept.len() * first.pixels.as_slice().len());
    let mut labels = Vec::with_capacity(kept.len());
    for sample in &kept {
        flat.extend_from_slice(sample.pixels.as_slice());
        labels.push(sample.label as i64);
    }
    Some(Batch {
        images: Tensor::from_slice(&flat)
            .view([kept.len() as i64, c, h, w])
            .to_device(device),
        labels: Tensor::from_slice(&labels).to_device(device),
        dropped: dropped.len(),
    })
}

/// Shuffles `0..n` and splits it into train and validation indices. Both
/// sides get at least one sample whenever `n >= 2`.
pub fn train_val_split<R: Rng + ?Sized>(n: usize, train_fraction: f64, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let mut train_len = (n as f64 * train_fraction).round() as usize;
    if n >= 2 {
        train_len = train_len.clamp(1, n - 1);
    }
    let val = indices.split_off(train_len.min(n));
    (indices, val)
}
