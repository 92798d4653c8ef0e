use crate::error::{Error, Result};
use crate::frame::Frame;
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use image::imageops::FilterType;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, trace};

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamps the box to `[0, width] x [0, height]`.
    pub fn clamp(self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

/// Anything that turns a frame into scored regions.
pub trait Detector {
    fn detect(&mut self, frame: &Frame, confidence: f32) -> Result<Vec<Detection>>;
}

#[derive(Clone, Debug, Default)]
pub struct Labels(Vec<String>);

impl Labels {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// One class name per non-empty line.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        ))
    }

    pub fn name(&self, class_id: usize, num_classes: usize) -> String {
        if let Some(name) = self.0.get(class_id) {
            return name.clone();
        }
        if num_classes == COCO_CLASSES.len() {
            return COCO_CLASSES[class_id].to_string();
        }
        format!("class{class_id}")
    }
}

/// YOLOv8-style detector evaluated with candle's ONNX interpreter.
pub struct YoloDetector {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
    /// Model input as (width, height).
    input_size: (u32, u32),
    iou: f32,
    labels: Labels,
    device: Device,
}

impl YoloDetector {
    pub fn load(path: &Path, labels: Labels, iou: f32) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ModelNotFound(path.to_path_buf()));
        }
        let load_err = |reason: String| Error::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };
        let mut model = read_file(path).map_err(|e| load_err(e.to_string()))?;
        patch_maxpool_padding(&mut model);
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| load_err("model graph missing".into()))?;
        let input = graph
            .input
            .first()
            .ok_or_else(|| load_err("model has no inputs".into()))?;
        let input_name = input.name.clone();
        let input_size = input_dims(input);
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| load_err("model has no outputs".into()))?;
        info!(
            model = %path.display(),
            input = %input_name,
            output = %output_name,
            width = input_size.0,
            height = input_size.1,
            "model loaded"
        );
        Ok(Self {
            model,
            input_name,
            output_name,
            input_size,
            iou,
            labels,
            device: Device::Cpu,
        })
    }

    fn prepare(&self, frame: &Frame) -> Result<Tensor> {
        let (width, height) = self.input_size;
        let img = image::imageops::resize(frame, width, height, FilterType::Triangle);
        let data = img.into_raw();
        let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?;
        Ok(tensor)
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &Frame, confidence: f32) -> Result<Vec<Detection>> {
        let input = self.prepare(frame)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), input);
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs.remove(&self.output_name).ok_or_else(|| {
            Error::Inference(candle_core::Error::Msg(format!(
                "model output {} missing",
                self.output_name
            )))
        })?;
        let mut rows = output.squeeze(0)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        // Some exports emit [anchors, 4 + classes] instead of [4 + classes, anchors].
        if rows.len() > rows.first().map_or(0, Vec::len) {
            rows = transpose(&rows);
        }
        let scale = (
            frame.width() as f32 / self.input_size.0 as f32,
            frame.height() as f32 / self.input_size.1 as f32,
        );
        let mut dets = decode_predictions(&rows, confidence, scale, &self.labels);
        dets = non_max_suppression(dets, self.iou);
        for d in &mut dets {
            d.bbox = d.bbox.clamp(frame.width(), frame.height());
        }
        trace!(count = dets.len(), "frame inferred");
        Ok(dets)
    }
}

/// Fixed input side used when the model leaves its spatial dims dynamic.
const DEFAULT_INPUT_SIZE: u32 = 640;

/// Reads (width, height) from an NCHW image input, falling back to
/// [`DEFAULT_INPUT_SIZE`] for dims that are symbolic or missing.
fn input_dims(input: &onnx::ValueInfoProto) -> (u32, u32) {
    use onnx::tensor_shape_proto::{dimension::Value, Dimension};
    let dims: &[Dimension] = match input.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(onnx::type_proto::Value::TensorType(t)) => {
            t.shape.as_ref().map(|s| s.dim.as_slice()).unwrap_or_default()
        }
        _ => &[],
    };
    let fixed = |idx: usize| match dims.get(idx).and_then(|d| d.value.as_ref()) {
        Some(Value::DimValue(v)) if *v > 0 => u32::try_from(*v).unwrap_or(DEFAULT_INPUT_SIZE),
        _ => DEFAULT_INPUT_SIZE,
    };
    (fixed(3), fixed(2))
}

fn transpose(rows: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let cols = rows.first().map_or(0, Vec::len);
    (0..cols)
        .map(|c| rows.iter().map(|r| r[c]).collect())
        .collect()
}

/// Decodes channel-major predictions (`cx, cy, w, h, class scores...` per
/// anchor) into detections above `confidence`, scaled to frame pixels.
pub fn decode_predictions(
    rows: &[Vec<f32>],
    confidence: f32,
    scale: (f32, f32),
    labels: &Labels,
) -> Vec<Detection> {
    if rows.len() <= 4 {
        return Vec::new();
    }
    let num_classes = rows.len() - 4;
    let anchors = rows[0].len();
    let mut dets = Vec::new();
    for a in 0..anchors {
        let (class_id, score) = rows[4..]
            .iter()
            .enumerate()
            .map(|(c, r)| (c, r[a]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < confidence {
            continue;
        }
        let bbox = BoundingBox::from_center(
            rows[0][a] * scale.0,
            rows[1][a] * scale.1,
            rows[2][a] * scale.0,
            rows[3][a] * scale.1,
        );
        dets.push(Detection {
            bbox,
            confidence: score,
            class_id,
            label: labels.name(class_id, num_classes),
        });
    }
    debug!(candidates = dets.len(), "decoded predictions");
    dets
}

/// Greedy per-class suppression, highest confidence first.
pub fn non_max_suppression(mut dets: Vec<Detection>, iou: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(dets.len());
    for d in dets {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == d.class_id && k.bbox.iou(&d.bbox) > iou);
        if !suppressed {
            kept.push(d);
        }
    }
    kept
}

/// candle's MaxPool has no padding support, so padded pools get an explicit
/// reflect `Pad` node in front of them.
fn patch_maxpool_padding(model: &mut onnx::ModelProto) {
    let Some(graph) = model.graph.as_mut() else {
        return;
    };
    let mut new_nodes = Vec::with_capacity(graph.node.len());
    for mut node in std::mem::take(&mut graph.node) {
        if node.op_type == "MaxPool" {
            let mut pad_attr = None;
            for attr in node.attribute.iter_mut() {
                if attr.name == "pads" {
                    if attr.ints.iter().any(|&v| v != 0) {
                        pad_attr = Some(attr.ints.clone());
                        attr.ints.iter_mut().for_each(|v| *v = 0);
                    }
                    break;
                }
            }
            if let Some(pads) = pad_attr.filter(|p| p.len() == 4) {
                let pad_init_name = format!("{}_pads", node.name);
                // ONNX pads are [h_begin, w_begin, h_end, w_end] for 2D pools.
                let full_pads = vec![0, 0, pads[0], pads[1], 0, 0, pads[2], pads[3]];
                graph.initializer.push(onnx::TensorProto {
                    name: pad_init_name.clone(),
                    dims: vec![full_pads.len() as i64],
                    data_type: onnx::tensor_proto::DataType::Int64 as i32,
                    int64_data: full_pads,
                    ..Default::default()
                });

                let pad_output = format!("{}_pad_out", node.name);
                let mut pad_node = onnx::NodeProto {
                    input: vec![node.input[0].clone(), pad_init_name],
                    output: vec![pad_output.clone()],
                    name: format!("{}_pad", node.name),
                    op_type: "Pad".to_string(),
                    ..Default::default()
                };
                pad_node.attribute.push(onnx::AttributeProto {
                    name: "mode".to_string(),
                    r#type: onnx::attribute_proto::AttributeType::String as i32,
                    s: b"reflect".to_vec(),
                    ..Default::default()
                });
                new_nodes.push(pad_node);
                node.input[0] = pad_output;
            }
        }
        new_nodes.push(node);
    }
    graph.node = new_nodes;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: usize) -> Detection {
        Detection {
            bbox: BoundingBox { x1, y1, x2, y2 },
            confidence,
            class_id,
            label: format!("class{class_id}"),
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::from_center(10.0, 10.0, 4.0, 4.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::from_center(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::from_center(10.0, 10.0, 2.0, 2.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.6, 0),
            det(1.0, 1.0, 10.0, 10.0, 0.9, 0),
            det(1.0, 1.0, 10.0, 10.0, 0.8, 1),
        ];
        let kept = non_max_suppression(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn decode_filters_and_scales() {
        // Two anchors, two classes.
        let rows = vec![
            vec![320.0, 100.0],
            vec![320.0, 100.0],
            vec![64.0, 10.0],
            vec![64.0, 10.0],
            vec![0.1, 0.2],
            vec![0.7, 0.1],
        ];
        let labels = Labels::new(vec!["cat".into(), "person".into()]);
        let dets = decode_predictions(&rows, 0.25, (2.0, 0.5), &labels);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_id, 1);
        assert_eq!(d.label, "person");
        assert_eq!(d.bbox, BoundingBox::from_center(640.0, 160.0, 128.0, 32.0));
    }

    #[test]
    fn labels_fall_back_to_coco_or_index() {
        let labels = Labels::default();
        assert_eq!(labels.name(0, 80), "person");
        assert_eq!(labels.name(3, 5), "class3");
    }

    #[test]
    fn missing_model_is_reported() {
        let err = YoloDetector::load(Path::new("/nonexistent/best.onnx"), Labels::default(), 0.45)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    fn image_input(dims: Vec<onnx::tensor_shape_proto::dimension::Value>) -> onnx::ValueInfoProto {
        let dim = dims
            .into_iter()
            .map(|v| onnx::tensor_shape_proto::Dimension {
                value: Some(v),
                ..Default::default()
            })
            .collect();
        onnx::ValueInfoProto {
            name: "images".into(),
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                    elem_type: 1,
                    shape: Some(onnx::TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn input_size_is_read_from_model() {
        use onnx::tensor_shape_proto::dimension::Value::DimValue;
        let input = image_input(vec![DimValue(1), DimValue(3), DimValue(320), DimValue(416)]);
        assert_eq!(input_dims(&input), (416, 320));
    }

    #[test]
    fn dynamic_input_size_falls_back_to_640() {
        use onnx::tensor_shape_proto::dimension::Value::{DimParam, DimValue};
        let input = image_input(vec![
            DimParam("batch".into()),
            DimValue(3),
            DimParam("height".into()),
            DimParam("width".into()),
        ]);
        assert_eq!(input_dims(&input), (640, 640));
        assert_eq!(input_dims(&onnx::ValueInfoProto::default()), (640, 640));
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let b = BoundingBox {
            x1: -5.0,
            y1: -1.0,
            x2: 700.0,
            y2: 20.0,
        }
        .clamp(640, 480);
        let inside = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 640.0,
            y2: 20.0,
        };
        assert_eq!(b, inside);
    }
}
