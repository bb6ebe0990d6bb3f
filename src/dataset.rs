//! Annotated image datasets.
//!
//! Datasets use dlib's imglab XML layout:
//!
//! ```xml
//! <dataset>
//!   <images>
//!     <image file='faces/2008_002470.jpg'>
//!       <box top='78' left='74' width='138' height='140'>
//!         <part name='00' x='98' y='132'/>
//!         <part name='01' x='103' y='152'/>
//!       </box>
//!     </image>
//!   </images>
//! </dataset>
//! ```
//!
//! Image paths are relative to the XML file. Landmarks are ordered by part
//! name (numerically when every name is an integer) and a part missing from a
//! box is treated as an occluded landmark. Boxes with `ignore='1'` are
//! skipped. Any other problem aborts the whole load.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::features::GrayImage;
use crate::types::{BoundingBox, Point};

/// An annotated object: its bounding box and landmark positions in image
/// coordinates, `None` for missing landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDetection {
    pub rect: BoundingBox,
    pub parts: Vec<Option<Point>>,
}

impl ObjectDetection {
    pub fn new(rect: BoundingBox, parts: Vec<Option<Point>>) -> Self {
        Self { rect, parts }
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }
}

/// Images with their annotated objects; `objects()[i]` belongs to `images()[i]`.
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Vec<GrayImage>,
    objects: Vec<Vec<ObjectDetection>>,
    part_names: Vec<String>,
}

impl Dataset {
    /// Build an in-memory dataset, checking that it is usable for training
    /// and evaluation.
    pub fn new(images: Vec<GrayImage>, objects: Vec<Vec<ObjectDetection>>) -> Result<Self> {
        let num_parts = objects
            .iter()
            .flatten()
            .next()
            .map(ObjectDetection::num_parts)
            .unwrap_or(0);
        let part_names = (0..num_parts).map(|i| i.to_string()).collect();
        Self::with_part_names(images, objects, part_names)
    }

    fn with_part_names(
        images: Vec<GrayImage>,
        objects: Vec<Vec<ObjectDetection>>,
        part_names: Vec<String>,
    ) -> Result<Self> {
        if images.len() != objects.len() {
            return Err(Error::Dataset(format!(
                "{} images but {} object lists",
                images.len(),
                objects.len()
            )));
        }
        if objects.iter().all(Vec::is_empty) {
            return Err(Error::Dataset("dataset contains no objects".into()));
        }
        if part_names.is_empty() {
            return Err(Error::Dataset("objects have no landmarks".into()));
        }
        for (i, object) in objects.iter().flatten().enumerate() {
            if object.num_parts() != part_names.len() {
                return Err(Error::Dataset(format!(
                    "object {} has {} landmarks, expected {}",
                    i,
                    object.num_parts(),
                    part_names.len()
                )));
            }
            if !object.rect.is_valid() {
                return Err(Error::Dataset(format!(
                    "object {} has invalid bounding box {:?}",
                    i, object.rect
                )));
            }
        }
        Ok(Self {
            images,
            objects,
            part_names,
        })
    }

    pub fn images(&self) -> &[GrayImage] {
        &self.images
    }

    pub fn objects(&self) -> &[Vec<ObjectDetection>] {
        &self.objects
    }

    /// Landmark names in landmark-index order.
    pub fn part_names(&self) -> &[String] {
        &self.part_names
    }

    pub fn num_landmarks(&self) -> usize {
        self.part_names.len()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.iter().map(Vec::len).sum()
    }
}

/// A `<box>` as read from XML, before landmark ordering is known.
struct RawBox {
    rect: BoundingBox,
    parts: Vec<(String, Point)>,
}

fn attr<T: FromStr>(node: &roxmltree::Node, name: &str, context: &str) -> Result<T> {
    let raw = node
        .attribute(name)
        .ok_or_else(|| Error::Dataset(format!("{}: missing attribute `{}`", context, name)))?;
    raw.trim().parse().map_err(|_| {
        Error::Dataset(format!(
            "{}: attribute `{}` has invalid value {:?}",
            context, name, raw
        ))
    })
}

fn parse_box(node: &roxmltree::Node, context: &str) -> Result<RawBox> {
    let rect = BoundingBox::new(
        attr(node, "left", context)?,
        attr(node, "top", context)?,
        attr(node, "width", context)?,
        attr(node, "height", context)?,
    );
    if !rect.is_valid() {
        return Err(Error::Dataset(format!(
            "{}: bounding box must have positive size, got {:?}",
            context, rect
        )));
    }

    let mut parts = Vec::new();
    for part in node.children().filter(|n| n.has_tag_name("part")) {
        let name: String = attr(&part, "name", context)?;
        let point = Point::new(attr(&part, "x", context)?, attr(&part, "y", context)?);
        if parts.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::Dataset(format!(
                "{}: part `{}` appears twice",
                context, name
            )));
        }
        parts.push((name, point));
    }

    Ok(RawBox { rect, parts })
}

/// Sort landmark names numerically when they are all integers.
fn order_part_names(names: BTreeSet<String>) -> Vec<String> {
    let mut names: Vec<String> = names.into_iter().collect();
    if names.iter().all(|n| n.parse::<u64>().is_ok()) {
        names.sort_by_key(|n| n.parse::<u64>().unwrap_or(u64::MAX));
    }
    names
}

fn load_gray_image(path: &Path) -> Result<GrayImage> {
    let img = image::open(path)
        .map_err(|e| Error::Dataset(format!("cannot read image {}: {}", path.display(), e)))?;
    Ok(GrayImage::from(img.to_luma8()))
}

/// Load an imglab XML dataset and decode its images to grayscale.
pub fn load_image_dataset<P: AsRef<Path>>(path: P) -> Result<Dataset> {
    let path = path.as_ref();
    let xml = fs::read_to_string(path)
        .map_err(|e| Error::Dataset(format!("cannot read {}: {}", path.display(), e)))?;
    let doc = roxmltree::Document::parse(&xml)
        .map_err(|e| Error::Dataset(format!("{}: malformed XML: {}", path.display(), e)))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));

    let images_node = doc
        .descendants()
        .find(|n| n.has_tag_name("images"))
        .ok_or_else(|| Error::Dataset(format!("{}: no <images> element", path.display())))?;

    let mut image_paths = Vec::new();
    let mut raw_boxes: Vec<Vec<RawBox>> = Vec::new();
    let mut names = BTreeSet::new();

    for image_node in images_node.children().filter(|n| n.has_tag_name("image")) {
        let file: String = attr(&image_node, "file", "<image>")?;
        let context = format!("image {}", file);

        let mut boxes = Vec::new();
        for box_node in image_node.children().filter(|n| n.has_tag_name("box")) {
            if matches!(box_node.attribute("ignore"), Some(v) if v.trim() != "0") {
                continue;
            }
            let raw = parse_box(&box_node, &context)?;
            names.extend(raw.parts.iter().map(|(name, _)| name.clone()));
            boxes.push(raw);
        }

        image_paths.push(base_dir.join(file));
        raw_boxes.push(boxes);
    }

    let part_names = order_part_names(names);

    let mut images = Vec::with_capacity(image_paths.len());
    for image_path in &image_paths {
        images.push(load_gray_image(image_path)?);
    }

    let objects = raw_boxes
        .into_iter()
        .map(|boxes| {
            boxes
                .into_iter()
                .map(|raw| {
                    let parts = part_names
                        .iter()
                        .map(|name| {
                            raw.parts
                                .iter()
                                .find(|(n, _)| n == name)
                                .map(|(_, p)| *p)
                        })
                        .collect();
                    ObjectDetection::new(raw.rect, parts)
                })
                .collect()
        })
        .collect();

    let dataset = Dataset::with_part_names(images, objects, part_names)?;
    debug!(
        path = %path.display(),
        images = dataset.images().len(),
        objects = dataset.num_objects(),
        landmarks = dataset.num_landmarks(),
        "loaded dataset"
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ImageAccess;

    fn write_image(dir: &Path, name: &str) {
        let img = image::GrayImage::from_fn(20, 10, |x, _| image::Luma([(x * 10) as u8]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn loads_boxes_parts_and_missing_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let xml = r#"<?xml version='1.0' encoding='ISO-8859-1'?>
<dataset>
  <name>test</name>
  <images>
    <image file='a.png'>
      <box top='1' left='2' width='10' height='8'>
        <part name='10' x='3' y='4'/>
        <part name='2' x='5' y='6'/>
      </box>
      <box top='0' left='0' width='5' height='5'>
        <part name='2' x='1' y='1'/>
      </box>
      <box top='0' left='0' width='5' height='5' ignore='1'/>
    </image>
  </images>
</dataset>"#;
        let path = dir.path().join("train.xml");
        fs::write(&path, xml).unwrap();

        let dataset = load_image_dataset(&path).unwrap();
        assert_eq!(dataset.images().len(), 1);
        assert_eq!(dataset.images()[0].width(), 20);
        assert_eq!(dataset.images()[0].get_pixel(3, 0), 30);
        assert_eq!(dataset.part_names(), &["2".to_string(), "10".to_string()]);
        assert_eq!(dataset.num_objects(), 2);

        let first = &dataset.objects()[0][0];
        assert_eq!(first.rect, BoundingBox::new(2.0, 1.0, 10.0, 8.0));
        assert_eq!(first.parts[0], Some(Point::new(5.0, 6.0)));
        assert_eq!(first.parts[1], Some(Point::new(3.0, 4.0)));

        let second = &dataset.objects()[0][1];
        assert_eq!(second.parts[1], None);
    }

    #[test]
    fn missing_image_aborts_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let xml = "<dataset><images><image file='nope.png'>\
                   <box top='0' left='0' width='4' height='4'><part name='0' x='1' y='1'/></box>\
                   </image></images></dataset>";
        let path = dir.path().join("d.xml");
        fs::write(&path, xml).unwrap();
        assert!(matches!(load_image_dataset(&path), Err(Error::Dataset(_))));
    }

    #[test]
    fn malformed_inputs_are_dataset_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");

        let cases = [
            "<dataset><images>",
            "<dataset></dataset>",
            "<dataset><images></images></dataset>",
            "<dataset><images><image file='a.png'>\
             <box top='0' left='0' width='0' height='4'><part name='0' x='1' y='1'/></box>\
             </image></images></dataset>",
            "<dataset><images><image file='a.png'>\
             <box top='0' left='0' width='4' height='4'><part name='0' x='one' y='1'/></box>\
             </image></images></dataset>",
            "<dataset><images><image file='a.png'>\
             <box top='0' left='0' width='4' height='4'/>\
             </image></images></dataset>",
        ];
        for (i, xml) in cases.iter().enumerate() {
            let path = dir.path().join(format!("bad{}.xml", i));
            fs::write(&path, xml).unwrap();
            assert!(
                matches!(load_image_dataset(&path), Err(Error::Dataset(_))),
                "case {} should fail",
                i
            );
        }
    }

    #[test]
    fn in_memory_dataset_validation() {
        let img = GrayImage::from_fn(4, 4, |_, _| 0);
        let rect = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let ok = Dataset::new(
            vec![img.clone()],
            vec![vec![ObjectDetection::new(rect, vec![Some(Point::new(1.0, 1.0))])]],
        )
        .unwrap();
        assert_eq!(ok.num_landmarks(), 1);

        assert!(Dataset::new(vec![img.clone()], vec![vec![]]).is_err());
        assert!(Dataset::new(vec![img.clone()], vec![]).is_err());
        assert!(Dataset::new(
            vec![img],
            vec![vec![
                ObjectDetection::new(rect, vec![None]),
                ObjectDetection::new(rect, vec![None, None]),
            ]],
        )
        .is_err());
    }
}
