//! impasto — a layered raster-painting engine.
//!
//! A stack of RGBA8 pixel layers composited into a display buffer, with
//! pressure-sensitive freehand strokes, transactional geometric transforms
//! of a layer's content, and snapshot-based undo/redo.  UI chrome, GPU
//! pipelines and persistence stores are external collaborators reached
//! through [`engine::Engine`]'s records, callbacks and event queue.

#![allow(clippy::too_many_arguments)]

pub mod logger;

pub mod canvas;
pub mod cli;
pub mod components;
pub mod engine;
pub mod io;
pub mod matrix;
pub mod ops;
pub mod viewport;

pub use canvas::{BlendMode, CanvasState, DirtyRect, Layer, PixelBuffer, Sampling};
pub use components::tools::{PressureSettings, Tool, ToolContext};
pub use engine::{DocumentEvent, Engine, PointerEvent};
pub use matrix::AffineMatrix;
pub use ops::transform::{CommitOutcome, FlipAxis, TransformDelta};
pub use viewport::ViewTransform;
