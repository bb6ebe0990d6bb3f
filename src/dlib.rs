//! Reader and writer for dlib's shape_predictor .dat format.
//!
//! Both raw `.dat` files and bzip2-compressed `.dat.bz2` files are supported,
//! so models trained here can be used by dlib and pre-trained dlib models can
//! be evaluated here.
//!
//! # Example
//!
//! ```ignore
//! use landmark_ert::dlib::{load_dlib_model, save_dlib_model};
//!
//! let model = load_dlib_model("shape_predictor_68_face_landmarks.dat.bz2")?;
//! save_dlib_model(&model, "copy.dat")?;
//! ```
//!
//! # Obtaining Models
//!
//! Pre-trained models are available from the dlib-models repository:
//!
//! ```bash
//! git clone --depth 1 git@github.com:davisking/dlib-models.git
//! ```
//!
//! # Layout
//!
//! dlib stores each tree as a complete binary tree in heap order: split `i`
//! has children `2i + 1` and `2i + 2`, and leaves follow the splits. Trees
//! trained here may stop early, so on export every early leaf is expanded
//! into splits whose children all carry the leaf's delta.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::FeaturePool;
use crate::model::ShapePredictor;
use crate::tree::{CascadeStage, RegressionTree, SplitFeature, TreeNode};
use crate::training::PaddingMode;
use crate::types::{Point, Shape};

const DLIB_SHAPE_PREDICTOR_VERSION: i64 = 1;

/// Significant bits written for every float; enough to hold an f32 exactly.
const FLOAT_MANTISSA_BITS: i32 = 24;

/// Upper bound for capacities taken from untrusted length fields.
const MAX_PREALLOC: usize = 1 << 16;

/// Reader wrapper for parsing dlib's binary format.
///
/// dlib uses a variable-length integer encoding:
/// - Control byte: high bit = sign (1 = negative), low 4 bits = number of bytes following
/// - Value bytes: little-endian integer value
///
/// Floats are stored as (mantissa, exponent) pairs, reconstructed via ldexp.
struct DlibReader<R: Read> {
    reader: R,
}

impl<R: Read> DlibReader<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Decode a variable-length integer.
    fn read_int(&mut self) -> Result<i64> {
        let control = self.read_byte()?;
        let is_negative = (control & 0x80) != 0;
        let num_bytes = (control & 0x0F) as usize;

        if num_bytes > 8 {
            return Err(Error::ModelLoad(format!(
                "integer field of {} bytes",
                num_bytes
            )));
        }

        let mut val: u64 = 0;
        for i in 0..num_bytes {
            let byte = self.read_byte()? as u64;
            val |= byte << (8 * i);
        }

        let signed_val = val as i64;
        Ok(if is_negative { signed_val.wrapping_neg() } else { signed_val })
    }

    /// Read an unsigned long.
    fn read_ulong(&mut self) -> Result<u64> {
        let val = self.read_int()?;
        if val < 0 {
            return Err(Error::ModelLoad(format!(
                "expected unsigned value, got {}",
                val
            )));
        }
        Ok(val as u64)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_ulong()? as usize)
    }

    /// Decode a float stored as (mantissa, exponent) pair.
    fn read_float(&mut self) -> Result<f32> {
        let mantissa = self.read_int()?;
        let exponent = self.read_int()? as i32;

        if mantissa == 0 {
            return Ok(0.0);
        }

        let result = (mantissa as f64) * (2.0_f64).powi(exponent);
        Ok(result as f32)
    }

    /// Read a column vector stored as (-rows, -cols, data...).
    fn read_float_matrix(&mut self) -> Result<(usize, usize, Vec<f32>)> {
        let rows = self.read_int()?.unsigned_abs() as usize;
        let cols = self.read_int()?.unsigned_abs() as usize;

        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| Error::ModelLoad(format!("matrix of {}x{} elements", rows, cols)))?;
        let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
        for _ in 0..len {
            data.push(self.read_float()?);
        }

        Ok((rows, cols, data))
    }

    fn read_shape(&mut self, expected_landmarks: Option<usize>, what: &str) -> Result<Shape> {
        let (rows, cols, data) = self.read_float_matrix()?;
        let valid = cols == 1
            && rows % 2 == 0
            && expected_landmarks.map_or(rows > 0, |n| rows == 2 * n);
        if !valid {
            return Err(Error::ModelLoad(format!(
                "invalid {} dimensions: {}x{}",
                what, rows, cols
            )));
        }
        Ok(Shape::from_flat_vec(&data))
    }
}

/// Writer counterpart of [`DlibReader`].
struct DlibWriter<W: Write> {
    writer: W,
}

impl<W: Write> DlibWriter<W> {
    fn new(writer: W) -> Self {
        Self { writer }
    }

    fn into_inner(self) -> W {
        self.writer
    }

    /// Encode a variable-length integer with the fewest value bytes.
    fn write_int(&mut self, val: i64) -> Result<()> {
        let mut buf = [0u8; 9];
        let mut abs_val = val.unsigned_abs();
        let mut num_bytes = 0usize;
        while abs_val != 0 {
            buf[1 + num_bytes] = (abs_val & 0xFF) as u8;
            abs_val >>= 8;
            num_bytes += 1;
        }
        buf[0] = num_bytes as u8 | if val < 0 { 0x80 } else { 0x00 };
        self.writer.write_all(&buf[..=num_bytes])?;
        Ok(())
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        self.write_int(len as i64)
    }

    /// Encode a float as a 24-bit integer mantissa and a binary exponent.
    fn write_float(&mut self, val: f32) -> Result<()> {
        if !val.is_finite() {
            return Err(Error::Export(format!("non-finite value {}", val)));
        }
        let (mantissa, exponent) = float_parts(val);
        self.write_int(mantissa)?;
        self.write_int(i64::from(exponent))
    }

    fn write_float_matrix(&mut self, data: &[f32]) -> Result<()> {
        self.write_int(-(data.len() as i64))?;
        self.write_int(-1)?;
        for &v in data {
            self.write_float(v)?;
        }
        Ok(())
    }

    fn write_shape(&mut self, shape: &Shape) -> Result<()> {
        self.write_float_matrix(&shape.to_flat_vec())
    }
}

/// Split a finite float into `(m, e)` with `val == m * 2^e` and
/// `|m| < 2^24`.
fn float_parts(val: f32) -> (i64, i32) {
    if val == 0.0 {
        return (0, 0);
    }
    // Every f32, subnormals included, is a normal f64
    let bits = f64::from(val).to_bits();
    let biased = ((bits >> 52) & 0x7FF) as i32;
    let exponent = biased - 1022;
    let fraction = f64::from_bits((bits & !(0x7FF << 52)) | (1022 << 52));
    let mantissa = (fraction * f64::from(1u32 << FLOAT_MANTISSA_BITS)) as i64;
    (mantissa, exponent - FLOAT_MANTISSA_BITS)
}

/// Raw split feature data before anchor/delta resolution.
struct RawSplit {
    feature_idx1: u64,
    feature_idx2: u64,
    threshold: f32,
}

/// Raw regression tree before anchor/delta resolution.
struct RawTree {
    splits: Vec<RawSplit>,
    leaf_deltas: Vec<Shape>,
}

fn into_load_error(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::ModelLoad(format!("truncated or unreadable dlib model: {}", e)),
        other => other,
    }
}

/// Load a dlib shape_predictor from a .dat or .dat.bz2 file.
pub fn load_dlib_model<P: AsRef<Path>>(path: P) -> Result<ShapePredictor> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::ModelLoad(format!("cannot open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);

    let is_bz2 = path.extension().is_some_and(|ext| ext == "bz2");
    debug!(path = %path.display(), compressed = is_bz2, "loading dlib model");

    if is_bz2 {
        load_dlib_model_from_reader(BzDecoder::new(reader))
    } else {
        load_dlib_model_from_reader(reader)
    }
}

/// Load a dlib model from an already-opened, uncompressed reader.
pub fn load_dlib_model_from_reader<R: Read>(reader: R) -> Result<ShapePredictor> {
    let mut r = DlibReader::new(reader);
    let model = parse_shape_predictor(&mut r).map_err(into_load_error)?;
    model.validate()?;
    Ok(model)
}

fn parse_shape_predictor<R: Read>(r: &mut DlibReader<R>) -> Result<ShapePredictor> {
    // 1. Version
    let version = r.read_int()?;
    if version != DLIB_SHAPE_PREDICTOR_VERSION {
        return Err(Error::ModelLoad(format!(
            "unsupported shape_predictor version: {}",
            version
        )));
    }

    // 2. Mean shape, normalized to the unit box
    let initial_shape = r.read_shape(None, "initial_shape")?;
    let num_landmarks = initial_shape.num_landmarks();

    // 3. Forests: vector<vector<regression_tree>>
    let num_cascades = r.read_len()?;
    let mut raw_cascades: Vec<Vec<RawTree>> = Vec::with_capacity(num_cascades.min(MAX_PREALLOC));
    for _ in 0..num_cascades {
        let num_trees = r.read_len()?;
        let mut trees = Vec::with_capacity(num_trees.min(MAX_PREALLOC));
        for _ in 0..num_trees {
            trees.push(parse_raw_tree(r, num_landmarks)?);
        }
        raw_cascades.push(trees);
    }

    // 4. anchor_idx[cascade][feature] = landmark index
    let num_anchor_cascades = r.read_len()?;
    let mut anchor_idx: Vec<Vec<u32>> = Vec::with_capacity(num_anchor_cascades.min(MAX_PREALLOC));
    for _ in 0..num_anchor_cascades {
        let num_anchors = r.read_len()?;
        let mut anchors = Vec::with_capacity(num_anchors.min(MAX_PREALLOC));
        for _ in 0..num_anchors {
            let anchor = r.read_ulong()?;
            anchors.push(u32::try_from(anchor).map_err(|_| {
                Error::ModelLoad(format!("anchor index {} out of range", anchor))
            })?);
        }
        anchor_idx.push(anchors);
    }

    // 5. deltas[cascade][feature] = (dx, dy) offset from the anchor
    let num_delta_cascades = r.read_len()?;
    let mut deltas: Vec<Vec<Point>> = Vec::with_capacity(num_delta_cascades.min(MAX_PREALLOC));
    for _ in 0..num_delta_cascades {
        let num_deltas = r.read_len()?;
        let mut cascade_deltas = Vec::with_capacity(num_deltas.min(MAX_PREALLOC));
        for _ in 0..num_deltas {
            let dx = r.read_float()?;
            let dy = r.read_float()?;
            cascade_deltas.push(Point::new(dx, dy));
        }
        deltas.push(cascade_deltas);
    }

    if anchor_idx.len() != num_cascades || deltas.len() != num_cascades {
        return Err(Error::ModelLoad(format!(
            "{} cascades but {} anchor lists and {} delta lists",
            num_cascades,
            anchor_idx.len(),
            deltas.len()
        )));
    }

    // 6. Assemble stages
    let mut cascade = Vec::with_capacity(num_cascades);
    for ((raw_trees, anchors), offsets) in raw_cascades.into_iter().zip(anchor_idx).zip(deltas) {
        if anchors.len() != offsets.len() {
            return Err(Error::ModelLoad(format!(
                "feature pool has {} anchors but {} offsets",
                anchors.len(),
                offsets.len()
            )));
        }
        let trees = raw_trees.into_iter().map(resolve_tree).collect();
        cascade.push(CascadeStage::new(
            FeaturePool::new(anchors, offsets),
            trees,
            num_landmarks,
        ));
    }

    Ok(ShapePredictor::new(
        initial_shape,
        cascade,
        PaddingMode::default(),
    ))
}

fn parse_raw_tree<R: Read>(r: &mut DlibReader<R>, num_landmarks: usize) -> Result<RawTree> {
    let num_splits = r.read_len()?;
    let mut splits = Vec::with_capacity(num_splits.min(MAX_PREALLOC));

    for _ in 0..num_splits {
        let feature_idx1 = r.read_ulong()?;
        let feature_idx2 = r.read_ulong()?;
        let threshold = r.read_float()?;

        splits.push(RawSplit {
            feature_idx1,
            feature_idx2,
            threshold,
        });
    }

    let num_leaves = r.read_len()?;
    if Some(num_leaves) != num_splits.checked_add(1) {
        return Err(Error::ModelLoad(format!(
            "invalid tree: {} splits with {} leaves",
            num_splits, num_leaves
        )));
    }

    let mut leaf_deltas = Vec::with_capacity(num_leaves.min(MAX_PREALLOC));
    for _ in 0..num_leaves {
        leaf_deltas.push(r.read_shape(Some(num_landmarks), "leaf delta")?);
    }

    Ok(RawTree { splits, leaf_deltas })
}

/// Lay out a heap-ordered dlib tree as nodes. Leaves follow the splits, so
/// heap position and node index coincide; structural problems (incomplete
/// trees, pool indices out of range) are caught by model validation.
fn resolve_tree(raw: RawTree) -> RegressionTree {
    let mut nodes = Vec::with_capacity(raw.splits.len() + raw.leaf_deltas.len());

    for (i, split) in raw.splits.into_iter().enumerate() {
        nodes.push(TreeNode::Split {
            feature: SplitFeature {
                idx1: u32::try_from(split.feature_idx1).unwrap_or(u32::MAX),
                idx2: u32::try_from(split.feature_idx2).unwrap_or(u32::MAX),
            },
            threshold: split.threshold,
            left: u32::try_from(2 * i + 1).unwrap_or(u32::MAX),
            right: u32::try_from(2 * i + 2).unwrap_or(u32::MAX),
        });
    }

    for delta in raw.leaf_deltas {
        nodes.push(TreeNode::Leaf { delta });
    }

    RegressionTree::new(nodes)
}

/// A tree expanded to dlib's complete heap layout.
struct HeapTree {
    splits: Vec<(SplitFeature, f32)>,
    leaves: Vec<Shape>,
}

fn expand_tree(tree: &RegressionTree, pool_size: usize) -> Result<HeapTree> {
    let depth = tree.depth();
    if depth > 30 {
        return Err(Error::Export(format!("tree depth {} too large", depth)));
    }
    let num_splits = (1usize << depth) - 1;

    // An early leaf becomes a split whose subtrees are copies of the leaf.
    // The filler test compares a pool entry with itself.
    if pool_size == 0 && num_splits > 0 {
        return Err(Error::Export("tree has splits but the feature pool is empty".into()));
    }
    let filler = (SplitFeature { idx1: 0, idx2: 0 }, 0.0f32);

    let mut splits = vec![filler; num_splits];
    let mut leaves = vec![Shape::zeros(0); num_splits + 1];

    let mut stack = vec![(0usize, 0usize)];
    while let Some((heap_idx, node_idx)) = stack.pop() {
        let node = &tree.nodes[node_idx];
        if heap_idx >= num_splits {
            let TreeNode::Leaf { delta } = node else {
                return Err(Error::Export("split below the tree depth".into()));
            };
            leaves[heap_idx - num_splits] = delta.clone();
            continue;
        }
        match node {
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                splits[heap_idx] = (*feature, *threshold);
                stack.push((2 * heap_idx + 1, *left as usize));
                stack.push((2 * heap_idx + 2, *right as usize));
            }
            TreeNode::Leaf { .. } => {
                stack.push((2 * heap_idx + 1, node_idx));
                stack.push((2 * heap_idx + 2, node_idx));
            }
        }
    }

    Ok(HeapTree { splits, leaves })
}

/// Write a model in dlib's format to an uncompressed writer.
pub fn save_dlib_model_to_writer<W: Write>(model: &ShapePredictor, writer: W) -> Result<W> {
    let mut w = DlibWriter::new(writer);

    w.write_int(DLIB_SHAPE_PREDICTOR_VERSION)?;
    w.write_shape(model.mean_shape())?;

    let cascade = model.cascade();
    w.write_len(cascade.len())?;
    for stage in cascade {
        w.write_len(stage.trees.len())?;
        for tree in &stage.trees {
            let heap = expand_tree(tree, stage.feature_pool.len())?;
            w.write_len(heap.splits.len())?;
            for (feature, threshold) in &heap.splits {
                w.write_len(feature.idx1 as usize)?;
                w.write_len(feature.idx2 as usize)?;
                w.write_float(*threshold)?;
            }
            w.write_len(heap.leaves.len())?;
            for leaf in &heap.leaves {
                w.write_shape(leaf)?;
            }
        }
    }

    w.write_len(cascade.len())?;
    for stage in cascade {
        w.write_len(stage.feature_pool.anchor_idx.len())?;
        for &anchor in &stage.feature_pool.anchor_idx {
            w.write_len(anchor as usize)?;
        }
    }

    w.write_len(cascade.len())?;
    for stage in cascade {
        w.write_len(stage.feature_pool.deltas.len())?;
        for delta in &stage.feature_pool.deltas {
            w.write_float(delta.x)?;
            w.write_float(delta.y)?;
        }
    }

    Ok(w.into_inner())
}

/// Save a model as a dlib .dat file, bzip2-compressed when the path ends in
/// `.bz2`.
///
/// The model is encoded completely before the file is created, so an
/// [`Error::Export`] leaves nothing behind.
pub fn save_dlib_model<P: AsRef<Path>>(model: &ShapePredictor, path: P) -> Result<()> {
    let path = path.as_ref();
    let encoded = save_dlib_model_to_writer(model, Vec::new())?;

    let is_bz2 = path.extension().is_some_and(|ext| ext == "bz2");
    let bytes = if is_bz2 {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&encoded)?;
        encoder.finish()?
    } else {
        encoded
    };

    fs::write(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), compressed = is_bz2, "saved dlib model");
    Ok(())
}
