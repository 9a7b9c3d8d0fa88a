//! The text layer source: an engine-agnostic result tree ([`model`]) and the
//! collaborator trait that produces it from a rasterized page image
//! ([`provider`]).

pub mod model;
pub mod provider;

pub use model::{
    Baseline, BoundingBox, Direction, Line, OcrModelError, OcrPage, Paragraph, StyleHints, Word,
};
pub use provider::{
    MockOcrProvider, OcrError, OcrOptions, OcrProvider, OcrResult, SubprocessOcrProvider,
};
