use std::fmt;

use image::GrayImage;
use nalgebra::Point2;

/// A detected point of interest.
///
/// Follows the OpenCV conventions: `size` is the diameter of the meaningful
/// neighbourhood in pixels, `angle` is in degrees and `-1.0` when the detector
/// does not estimate one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub position: Point2<f32>,
    pub size: f32,
    pub angle: f32,
    /// Detector quality score, larger is better.
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, size: f32) -> Self {
        Self {
            position: Point2::new(x, y),
            size,
            angle: -1.0,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }

    pub fn with_response(self, response: f32) -> Self {
        Self { response, ..self }
    }

    pub fn with_angle(self, angle: f32) -> Self {
        Self { angle, ..self }
    }

    pub fn with_octave(self, octave: i32) -> Self {
        Self { octave, ..self }
    }

    pub fn x(&self) -> f32 {
        self.position.x
    }

    pub fn y(&self) -> f32 {
        self.position.y
    }

    pub fn has_angle(&self) -> bool {
        self.angle >= 0.0
    }
}

/// Element type of a descriptor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    /// Bit strings packed into bytes.
    Binary,
    /// Real valued vectors.
    Float,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Binary => f.write_str("binary"),
            Representation::Float => f.write_str("floating-point"),
        }
    }
}

/// Row-major descriptor storage, one row per keypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorMatrix<T> {
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> DescriptorMatrix<T> {
    /// ### Panics
    /// When `cols` is zero, every descriptor algorithm has a positive width.
    pub fn new(cols: usize) -> Self {
        Self::with_capacity(cols, 0)
    }

    pub fn with_capacity(cols: usize, rows: usize) -> Self {
        assert!(cols > 0, "descriptor width must be positive");
        Self {
            cols,
            data: Vec::with_capacity(cols * rows),
        }
    }

    pub fn from_rows<R: AsRef<[T]>>(cols: usize, rows: impl IntoIterator<Item = R>) -> Self {
        let mut matrix = Self::new(cols);
        for row in rows {
            matrix.push_row(row.as_ref());
        }
        matrix
    }

    pub fn push_row(&mut self, row: &[T]) {
        assert_eq!(row.len(), self.cols, "descriptor row has the wrong width");
        self.data.extend_from_slice(row);
    }

    pub fn rows(&self) -> usize {
        self.data.len() / self.cols
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, index: usize) -> &[T] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> std::slice::ChunksExact<'_, T> {
        self.data.chunks_exact(self.cols)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

/// The descriptor matrix of a frame, tagged with its representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(DescriptorMatrix<u8>),
    Float(DescriptorMatrix<f32>),
}

impl Descriptors {
    pub fn representation(&self) -> Representation {
        match self {
            Descriptors::Binary(_) => Representation::Binary,
            Descriptors::Float(_) => Representation::Float,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Descriptors::Binary(m) => m.rows(),
            Descriptors::Float(m) => m.rows(),
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Descriptors::Binary(m) => m.cols(),
            Descriptors::Float(m) => m.cols(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Floating point view of the matrix for backends that only accept `f32`.
    ///
    /// Binary rows are unpacked bit by bit (most significant bit first) into
    /// `0.0`/`1.0` elements, so the conversion is lossless and the number of
    /// differing elements between two widened rows equals their Hamming distance.
    pub fn widened(&self) -> DescriptorMatrix<f32> {
        match self {
            Descriptors::Float(m) => m.clone(),
            Descriptors::Binary(m) => {
                let mut widened = DescriptorMatrix::with_capacity(m.cols() * 8, m.rows());
                let mut buffer = Vec::with_capacity(m.cols() * 8);
                for row in m.iter_rows() {
                    buffer.clear();
                    buffer.extend(
                        row.iter()
                            .flat_map(|byte| (0..8).rev().map(move |bit| ((byte >> bit) & 1) as f32)),
                    );
                    widened.push_row(&buffer);
                }
                widened
            }
        }
    }
}

/// A correspondence between a row of the earlier frame's descriptors (source)
/// and a row of the later frame's descriptors (reference).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub source_index: usize,
    pub reference_index: usize,
    pub distance: f32,
}

/// One processed unit of the image stream.
///
/// Created empty and filled progressively by the pipeline stages.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position of the frame in the input sequence.
    pub index: usize,
    pub image: GrayImage,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Option<Descriptors>,
    /// Only set on frames that were the current frame during matching.
    pub matches: Vec<Match>,
}

impl Frame {
    pub fn new(index: usize, image: GrayImage) -> Self {
        Self {
            index,
            image,
            keypoints: Vec::new(),
            descriptors: None,
            matches: Vec::new(),
        }
    }
}
