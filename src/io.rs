use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{BlendMode, CanvasState, Layer, PixelBuffer};
use crate::matrix::{self, AffineMatrix};

// ============================================================================
// REHYDRATION RECORDS — input from a persistence collaborator
// ============================================================================

/// One stored layer, handed over on startup in back-to-front order.
/// `pixel_data` may be empty (or the wrong length) — the engine rehydrates
/// such layers blank instead of failing the whole load.
#[derive(Clone, Debug)]
pub struct LayerRecord {
    pub layer_id: Uuid,
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: u8,
    pub pixel_data: Vec<u8>,
}

// ============================================================================
// IMP PROJECT FILE FORMAT
// ============================================================================

/// Magic header for the layered project format (v1)
const IMP_MAGIC_V1: &str = "IMP1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
const MAX_LAYERS: usize = 256;

/// Serializable project file structure
#[derive(Serialize, Deserialize)]
struct ProjectFileV1 {
    magic: String,
    width: u32,
    height: u32,
    active_layer_index: usize,
    layers: Vec<LayerDataV1>,
}

/// Serializable layer data — flat pixel buffer plus metadata
#[derive(Serialize, Deserialize)]
struct LayerDataV1 {
    name: String,
    visible: bool,
    opacity: f32,
    blend_mode: u8,
    matrix: [f32; 16],
    pixels: Vec<u8>,
}

/// Error type for project file operations
#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {}", e),
            ProjectError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ProjectError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for ProjectError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectError::Serialize(e.to_string())
    }
}

/// Save a document as a .imp project file (layers, matrices, blend modes).
pub fn save_project(state: &CanvasState, path: &Path) -> Result<(), ProjectError> {
    let project = ProjectFileV1 {
        magic: IMP_MAGIC_V1.to_string(),
        width: state.width,
        height: state.height,
        active_layer_index: state.active_layer_index,
        layers: state
            .layers
            .iter()
            .map(|layer| LayerDataV1 {
                name: layer.name.clone(),
                visible: layer.visible,
                opacity: layer.opacity,
                blend_mode: layer.blend_mode.to_u8(),
                matrix: matrix::valid_or_identity(layer.matrix, "project save").m,
                pixels: layer.pixels.as_raw().to_vec(),
            })
            .collect(),
    };

    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &project)?;
    Ok(())
}

/// Load a .imp project file into a fresh [`CanvasState`].
pub fn load_project(path: &Path) -> Result<CanvasState, ProjectError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(ProjectError::InvalidFormat("File too small".into()));
    }

    // bincode encodes a String as: 8-byte length prefix + UTF-8 data.
    // The magic string is 4 chars, so bytes 8..12 hold it.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != IMP_MAGIC_V1 {
        return Err(ProjectError::InvalidFormat(format!(
            "Unknown magic '{}'",
            magic
        )));
    }

    let project: ProjectFileV1 = bincode::deserialize(&raw)?;
    if project.width == 0
        || project.height == 0
        || project.width > MAX_CANVAS_DIM
        || project.height > MAX_CANVAS_DIM
    {
        return Err(ProjectError::InvalidFormat(format!(
            "Canvas dimensions {}×{} out of range",
            project.width, project.height
        )));
    }
    if project.layers.is_empty() || project.layers.len() > MAX_LAYERS {
        return Err(ProjectError::InvalidFormat(format!(
            "Layer count {} out of range",
            project.layers.len()
        )));
    }

    let (width, height) = (project.width, project.height);
    let layers: Vec<Layer> = project
        .layers
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            let pixels = match PixelBuffer::from_raw_rgba(width, height, &data.pixels) {
                Some(buf) => buf,
                None => {
                    crate::log_warn!(
                        "project layer '{}': pixel data mismatch, loaded blank",
                        data.name
                    );
                    PixelBuffer::new(width, height)
                }
            };
            Layer {
                id: Uuid::new_v4(),
                name: data.name,
                visible: data.visible,
                opacity: data.opacity.clamp(0.0, 1.0),
                blend_mode: BlendMode::from_u8(data.blend_mode),
                pixels,
                matrix: matrix::valid_or_identity(AffineMatrix { m: data.matrix }, "project load"),
                is_background: i == 0,
                gpu_generation: 0,
            }
        })
        .collect();

    let active = project.active_layer_index.min(layers.len() - 1);
    let mut state = CanvasState::new(width, height);
    state.layers = layers;
    state.active_layer_index = active;
    state.mark_dirty(None);
    Ok(state)
}

// ============================================================================
// RASTER IMAGE LOAD / ENCODE
// ============================================================================

/// Output format for raster export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
    Bmp,
    /// Layered native project.
    Project,
}

impl SaveFormat {
    pub fn from_extension(ext: &str) -> Option<SaveFormat> {
        match ext.to_lowercase().as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "bmp" => Some(SaveFormat::Bmp),
            "imp" => Some(SaveFormat::Project),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Bmp => "bmp",
            SaveFormat::Project => "imp",
        }
    }
}

/// Synchronously load any supported input into a [`CanvasState`]:
/// `.imp` projects keep their layers, every other format becomes a
/// single background layer.
pub fn load_input(path: &Path) -> Result<CanvasState, String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if ext == "imp" {
        return load_project(path).map_err(|e| e.to_string());
    }

    let img: RgbaImage = image::open(path).map_err(|e| e.to_string())?.to_rgba8();
    let (w, h) = img.dimensions();
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Background")
        .to_string();

    let mut layer = Layer::new(name, w, h, Rgba([0, 0, 0, 0]));
    layer.pixels = PixelBuffer::from_rgba_image(&img);
    layer.is_background = true;

    let mut state = CanvasState::new(w, h);
    state.layers = vec![layer];
    state.active_layer_index = 0;
    Ok(state)
}

/// Encode a flattened image and write it to `path`.
/// JPEG drops alpha (the flatten path already produced opaque pixels) and
/// honours `quality` (1–100).
pub fn encode_and_write(
    img: &RgbaImage,
    path: &Path,
    format: SaveFormat,
    quality: u8,
) -> Result<(), String> {
    match format {
        SaveFormat::Png => img
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| e.to_string()),
        SaveFormat::Bmp => img
            .save_with_format(path, ImageFormat::Bmp)
            .map_err(|e| e.to_string()),
        SaveFormat::Jpeg => {
            let rgb = image::DynamicImage::ImageRgba8(img.clone()).to_rgb8();
            let file = File::create(path).map_err(|e| e.to_string())?;
            let mut writer = BufWriter::new(file);
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut writer,
                quality.clamp(1, 100),
            );
            encoder.encode_image(&rgb).map_err(|e| e.to_string())
        }
        SaveFormat::Project => Err("use save_project for layered output".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_format_maps_extensions() {
        assert_eq!(SaveFormat::from_extension("PNG"), Some(SaveFormat::Png));
        assert_eq!(SaveFormat::from_extension("jpeg"), Some(SaveFormat::Jpeg));
        assert_eq!(SaveFormat::from_extension("imp"), Some(SaveFormat::Project));
        assert_eq!(SaveFormat::from_extension("tiff"), None);
    }

    #[test]
    fn project_round_trips_layers_and_metadata() {
        let dir = std::env::temp_dir().join("impasto_test_project");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.imp");

        let mut state = CanvasState::new(6, 4);
        let mut ink = Layer::new("Ink".into(), 6, 4, Rgba([0, 0, 0, 0]));
        ink.pixels.put_pixel(3, 2, Rgba([10, 20, 30, 40]));
        ink.opacity = 0.25;
        ink.blend_mode = BlendMode::Screen;
        ink.matrix = AffineMatrix::translation(1.0, 2.0);
        state.layers.push(ink);
        state.active_layer_index = 1;

        save_project(&state, &path).unwrap();
        let loaded = load_project(&path).unwrap();

        assert_eq!((loaded.width, loaded.height), (6, 4));
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.active_layer_index, 1);
        assert!(loaded.layers[0].is_background);

        let ink = &loaded.layers[1];
        assert_eq!(ink.name, "Ink");
        assert_eq!(ink.opacity, 0.25);
        assert_eq!(ink.blend_mode, BlendMode::Screen);
        assert_eq!(ink.pixels.get_pixel(3, 2), Rgba([10, 20, 30, 40]));
        assert_eq!(ink.matrix, AffineMatrix::translation(1.0, 2.0));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn malformed_project_files_are_rejected() {
        let dir = std::env::temp_dir().join("impasto_test_project");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.imp");
        std::fs::write(&path, b"not a project file at all").unwrap();

        match load_project(&path) {
            Err(ProjectError::InvalidFormat(_)) => {}
            other => panic!("expected InvalidFormat, got {:?}", other.map(|_| ())),
        }
        std::fs::remove_file(&path).ok();
    }
}
