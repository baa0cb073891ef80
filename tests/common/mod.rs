#![allow(dead_code)]
use burn::backend::{ndarray::NdArray, Autodiff};
use burn::prelude::*;
use burn::tensor::Distribution;
use std::fs;
use std::path::Path;
use zssbir_burn::data::TripletBatch;
use zssbir_burn::model::ModelConfig;
use zssbir_burn::training::TrainingConfig;

pub type ADBackend = Autodiff<NdArray<f32>>;

pub const IMAGE_SIZE: usize = 16;

pub fn device() -> <ADBackend as Backend>::Device {
    Default::default()
}

/// Small enough to run a few optimizer steps on the CPU.
pub fn tiny_model() -> ModelConfig {
    ModelConfig::new()
        .with_image_size(IMAGE_SIZE)
        .with_encoder_dim(4)
        .with_encoder_blocks(2)
        .with_embedding_dim(8)
        .with_domain_hidden_dim(8)
}

pub fn tiny_config(data_dir: &Path, checkpoint_dir: &Path) -> TrainingConfig {
    TrainingConfig::new(
        data_dir.display().to_string(),
        checkpoint_dir.display().to_string(),
    )
    .with_batch_size(4)
    .with_epochs(2)
    .with_print_every(1)
    .with_model(tiny_model())
}

/// Train classes `cat` and `dog` with three sketches each, test class `owl`.
pub fn synthetic_dataset(root: &Path) -> anyhow::Result<()> {
    let classes: [(&str, [u8; 3], usize); 3] = [
        ("cat", [220, 40, 40], 3),
        ("dog", [40, 220, 40], 3),
        ("owl", [40, 40, 220], 2),
    ];
    for (name, color, count) in classes {
        let sketch_dir = root.join("sketches").join(name);
        let photo_dir = root.join("photos").join(name);
        fs::create_dir_all(&sketch_dir)?;
        fs::create_dir_all(&photo_dir)?;
        for i in 0..count {
            let shade = (i as u8) * 30;
            let sketch = image::RgbImage::from_fn(20, 20, |x, y| {
                if (x + y) % 4 == 0 {
                    image::Rgb([shade, shade, shade])
                } else {
                    image::Rgb([255, 255, 255])
                }
            });
            sketch.save(sketch_dir.join(format!("{i}.png")))?;
            let photo = image::RgbImage::from_fn(20, 20, |x, _| {
                image::Rgb([color[0].saturating_sub(shade), color[1], color[2] ^ (x as u8)])
            });
            photo.save(photo_dir.join(format!("{i}.png")))?;
        }
    }
    // Unrelated files next to images are ignored.
    fs::write(root.join("photos").join("cat").join("notes.txt"), "not an image")?;
    fs::write(root.join("train_classes.txt"), "cat\ndog\n")?;
    fs::write(root.join("test_classes.txt"), "owl\n")?;
    Ok(())
}

/// Random triplet batch with one-hot labels over two classes.
pub fn random_batch(batch_size: usize) -> TripletBatch<ADBackend> {
    let device = device();
    let shape = [batch_size, 3, IMAGE_SIZE, IMAGE_SIZE];
    let uniform = Distribution::Uniform(-1.0, 1.0);
    let positive: Vec<i64> = (0..batch_size as i64).map(|i| i % 2).collect();
    let negative: Vec<i64> = positive.iter().map(|l| 1 - l).collect();
    TripletBatch {
        anchors: Tensor::random(shape, uniform, &device),
        positives: Tensor::random(shape, uniform, &device),
        negatives: Tensor::random(shape, uniform, &device),
        label_embeddings: Tensor::zeros([batch_size, 2], &device),
        positive_labels: Tensor::from_data(TensorData::new(positive, [batch_size]), &device),
        negative_labels: Tensor::from_data(TensorData::new(negative, [batch_size]), &device),
    }
}
