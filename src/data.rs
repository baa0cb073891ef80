use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Settings for decoding and assembling triplet batches.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub image_size: u32,
    pub seed: u64,
}

/// Sketch and photo files of one class.
#[derive(Debug, Clone, Default)]
pub struct ClassSamples {
    pub sketches: Vec<PathBuf>,
    pub photos: Vec<PathBuf>,
}

/// A batch of (sketch, matching photo, non-matching photo) triples.
#[derive(Clone, Debug)]
pub struct TripletBatch<B: Backend> {
    pub anchors: Tensor<B, 4>,
    pub positives: Tensor<B, 4>,
    pub negatives: Tensor<B, 4>,
    pub label_embeddings: Tensor<B, 2>,
    pub positive_labels: Tensor<B, 1, Int>,
    pub negative_labels: Tensor<B, 1, Int>,
}

impl<B: Backend> TripletBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.anchors.dims()[0]
    }
}

/// On-disk sketch/photo dataset split into seen (train) and unseen (test) classes.
///
/// Layout under `data_dir`:
/// `sketches/<class>/*`, `photos/<class>/*`, `train_classes.txt`, optionally
/// `test_classes.txt` and `label_embeddings.json` (`{"class": [f32, ...]}`).
/// Without the embeddings file each class gets a one-hot vector over the
/// sorted class vocabulary.
pub struct Dataloaders {
    pub train_dict: BTreeMap<String, ClassSamples>,
    pub test_dict: BTreeMap<String, ClassSamples>,
    label_embeddings: BTreeMap<String, Vec<f32>>,
    config: DataConfig,
}

impl Dataloaders {
    pub fn new(data_dir: &Path, config: DataConfig) -> Result<Self> {
        let train_classes = read_class_list(&data_dir.join("train_classes.txt"))?;
        let test_list = data_dir.join("test_classes.txt");
        let test_classes = if test_list.exists() {
            read_class_list(&test_list)?
        } else {
            Vec::new()
        };

        if train_classes.len() < 2 {
            anyhow::bail!(
                "need at least two training classes to sample negatives, found {}",
                train_classes.len()
            );
        }
        let overlap: Vec<_> = test_classes
            .iter()
            .filter(|class| train_classes.contains(class))
            .collect();
        if !overlap.is_empty() {
            log::warn!("classes present in both splits: {overlap:?}");
        }

        let train_dict = load_split(data_dir, &train_classes)?;
        let test_dict = load_split(data_dir, &test_classes)?;

        let vocabulary: BTreeSet<String> = train_classes
            .iter()
            .chain(test_classes.iter())
            .cloned()
            .collect();
        let embeddings_path = data_dir.join("label_embeddings.json");
        let label_embeddings = if embeddings_path.exists() {
            load_label_embeddings(&embeddings_path, &vocabulary)?
        } else {
            one_hot_embeddings(&vocabulary)
        };

        Ok(Self {
            train_dict,
            test_dict,
            label_embeddings,
            config,
        })
    }

    /// Number of training sketches, i.e. triplets per epoch.
    pub fn train_len(&self) -> usize {
        self.train_dict.values().map(|c| c.sketches.len()).sum()
    }

    pub fn test_len(&self) -> usize {
        self.test_dict.values().map(|c| c.sketches.len()).sum()
    }

    pub fn embedding_dim(&self) -> usize {
        self.label_embeddings
            .values()
            .next()
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Loader over one triplet per training sketch.
    ///
    /// Each call to [`TrainDataloader::iter`] starts a new epoch; with
    /// `shuffle` the order is redrawn every time.
    pub fn get_train_dataloader<B: Backend>(
        &self,
        batch_size: usize,
        shuffle: bool,
        device: B::Device,
    ) -> TrainDataloader<B> {
        let classes: Vec<ClassEntry> = self
            .train_dict
            .iter()
            .map(|(name, samples)| ClassEntry {
                name: name.clone(),
                photos: samples.photos.clone(),
                embedding: self.label_embeddings[name].clone(),
            })
            .collect();
        let items: Vec<TripletItem> = classes
            .iter()
            .enumerate()
            .flat_map(|(label, class)| {
                self.train_dict[&class.name]
                    .sketches
                    .iter()
                    .map(move |sketch| TripletItem {
                        sketch: sketch.clone(),
                        label,
                    })
            })
            .collect();

        let batch_size = batch_size.max(1);
        let num_batches = items.len().div_ceil(batch_size);
        let batcher = TripletBatcher::new(
            Arc::new(classes),
            self.config.image_size,
            self.config.seed,
        );

        let mut builder =
            DataLoaderBuilder::<B, TripletItem, TripletBatch<B>>::new(batcher).batch_size(batch_size);
        if shuffle {
            builder = builder.shuffle(self.config.seed);
        }
        let loader = builder
            .set_device(device)
            .build(TripletDataset { items });

        TrainDataloader {
            loader,
            num_batches,
        }
    }
}

/// Finite, restartable sequence of [`TripletBatch`]es with a known length.
pub struct TrainDataloader<B: Backend> {
    loader: Arc<dyn DataLoader<B, TripletBatch<B>>>,
    num_batches: usize,
}

impl<B: Backend> TrainDataloader<B> {
    pub fn iter(&self) -> Box<dyn DataLoaderIterator<TripletBatch<B>> + '_> {
        self.loader.iter()
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

#[derive(Debug, Clone)]
struct ClassEntry {
    name: String,
    photos: Vec<PathBuf>,
    embedding: Vec<f32>,
}

/// One training sketch and the index of its class.
#[derive(Debug, Clone)]
struct TripletItem {
    sketch: PathBuf,
    label: usize,
}

struct TripletDataset {
    items: Vec<TripletItem>,
}

impl Dataset<TripletItem> for TripletDataset {
    fn get(&self, index: usize) -> Option<TripletItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Samples a positive and a negative photo per sketch and decodes all three.
#[derive(Clone)]
struct TripletBatcher {
    classes: Arc<Vec<ClassEntry>>,
    image_size: u32,
    rng: Arc<Mutex<StdRng>>,
}

impl TripletBatcher {
    fn new(classes: Arc<Vec<ClassEntry>>, image_size: u32, seed: u64) -> Self {
        Self {
            classes,
            image_size,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, TripletItem, TripletBatch<B>> for TripletBatcher {
    fn batch(&self, items: Vec<TripletItem>, device: &B::Device) -> TripletBatch<B> {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        build_triplet_batch::<B>(&items, &self.classes, self.image_size, &mut *rng, device)
            .expect("failed to build triplet batch")
    }
}

fn build_triplet_batch<B: Backend>(
    items: &[TripletItem],
    classes: &[ClassEntry],
    image_size: u32,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<TripletBatch<B>> {
    let batch_size = items.len();
    let size = image_size as usize;
    let per_image = 3 * size * size;
    let embedding_dim = classes.first().map(|c| c.embedding.len()).unwrap_or(0);

    let mut anchors = Vec::with_capacity(batch_size * per_image);
    let mut positives = Vec::with_capacity(batch_size * per_image);
    let mut negatives = Vec::with_capacity(batch_size * per_image);
    let mut embeddings = Vec::with_capacity(batch_size * embedding_dim);
    let mut positive_labels = Vec::with_capacity(batch_size);
    let mut negative_labels = Vec::with_capacity(batch_size);

    for item in items {
        let class = classes
            .get(item.label)
            .with_context(|| format!("label {} out of range", item.label))?;
        let negative_label = sample_other_class(item.label, classes.len(), rng)?;
        let negative_class = &classes[negative_label];

        let positive_path = pick(&class.photos, rng)
            .with_context(|| format!("class {} has no photos", class.name))?;
        let negative_path = pick(&negative_class.photos, rng)
            .with_context(|| format!("class {} has no photos", negative_class.name))?;

        anchors.append(&mut image_to_chw(&load_image(&item.sketch, image_size)?));
        positives.append(&mut image_to_chw(&load_image(positive_path, image_size)?));
        negatives.append(&mut image_to_chw(&load_image(negative_path, image_size)?));
        embeddings.extend_from_slice(&class.embedding);
        positive_labels.push(item.label as i64);
        negative_labels.push(negative_label as i64);
    }

    let shape = [batch_size, 3, size, size];
    Ok(TripletBatch {
        anchors: Tensor::from_data(TensorData::new(anchors, shape), device),
        positives: Tensor::from_data(TensorData::new(positives, shape), device),
        negatives: Tensor::from_data(TensorData::new(negatives, shape), device),
        label_embeddings: Tensor::from_data(
            TensorData::new(embeddings, [batch_size, embedding_dim]),
            device,
        ),
        positive_labels: Tensor::from_data(TensorData::new(positive_labels, [batch_size]), device),
        negative_labels: Tensor::from_data(TensorData::new(negative_labels, [batch_size]), device),
    })
}

/// Uniformly pick a class index different from `label`.
fn sample_other_class(label: usize, num_classes: usize, rng: &mut impl Rng) -> Result<usize> {
    if num_classes < 2 {
        anyhow::bail!("cannot sample a negative class from {num_classes} class(es)");
    }
    let mut other = rng.gen_range(0..num_classes - 1);
    if other >= label {
        other += 1;
    }
    Ok(other)
}

fn pick<'a, T>(items: &'a [T], rng: &mut impl Rng) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        items.get(rng.gen_range(0..items.len()))
    }
}

fn read_class_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class list {}", path.display()))?;
    Ok(parse_class_list(&contents))
}

/// One class per line; blank lines and `#` comments are skipped, duplicates dropped.
fn parse_class_list(contents: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

fn load_split(data_dir: &Path, classes: &[String]) -> Result<BTreeMap<String, ClassSamples>> {
    let mut split = BTreeMap::new();
    for class in classes {
        let sketches = list_images(&data_dir.join("sketches").join(class))?;
        let photos = list_images(&data_dir.join("photos").join(class))?;
        if sketches.is_empty() {
            anyhow::bail!("class {class} has no sketches");
        }
        if photos.is_empty() {
            anyhow::bail!("class {class} has no photos");
        }
        split.insert(class.clone(), ClassSamples { sketches, photos });
    }
    Ok(split)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*", dir.display());
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("invalid directory {}", dir.display()))?
        .filter_map(Result::ok)
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();
    if paths.is_empty() && !dir.is_dir() {
        anyhow::bail!("missing directory {}", dir.display());
    }
    paths.sort();
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn load_label_embeddings(
    path: &Path,
    vocabulary: &BTreeSet<String>,
) -> Result<BTreeMap<String, Vec<f32>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let all: BTreeMap<String, Vec<f32>> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut embeddings = BTreeMap::new();
    let mut dim = None;
    for class in vocabulary {
        let embedding = all
            .get(class)
            .with_context(|| format!("no label embedding for class {class}"))?;
        match dim {
            None => dim = Some(embedding.len()),
            Some(d) if d != embedding.len() => anyhow::bail!(
                "label embedding for {class} has length {}, expected {d}",
                embedding.len()
            ),
            Some(_) => {}
        }
        embeddings.insert(class.clone(), embedding.clone());
    }
    Ok(embeddings)
}

fn one_hot_embeddings(vocabulary: &BTreeSet<String>) -> BTreeMap<String, Vec<f32>> {
    vocabulary
        .iter()
        .enumerate()
        .map(|(idx, class)| {
            let mut embedding = vec![0.0; vocabulary.len()];
            embedding[idx] = 1.0;
            (class.clone(), embedding)
        })
        .collect()
}

/// Decode an image file to RGB at `size x size`.
fn load_image(path: &Path, size: u32) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    if img.width() != size || img.height() != size {
        return Ok(image::imageops::resize(
            &img,
            size,
            size,
            image::imageops::FilterType::CatmullRom,
        ));
    }
    Ok(img)
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        for channel in 0..3 {
            out[channel * hw + idx] = (pixel.0[channel] as f32 / 127.5) - 1.0;
        }
    }

    out
}
