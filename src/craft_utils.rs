use std::collections::VecDeque;

use float_ord::FloatOrd;
use geo::{Coord, MinimumRotatedRect, MultiPoint, Point};
use image::{GrayImage, Luma};
use imageproc::{distance_transform::Norm, morphology::dilate_mut};
use ndarray::{Array2, Axis};
use tracing::instrument;

use crate::{
    craft_net::NetOutput, util::ResizeParameters, Error, Original, Padded, Quad, Result,
};

/// Components smaller than this many cells are treated as noise.
pub const MIN_REGION_SIZE: usize = 10;

/// Text and link confidence over the network output grid. Both maps always
/// share one shape.
#[derive(Debug, Clone)]
pub struct ScoreMaps {
    text: Array2<f32>,
    link: Array2<f32>,
    stride: f32,
}

impl ScoreMaps {
    pub fn new(text: Array2<f32>, link: Array2<f32>, stride: f32) -> Result<Self> {
        if text.dim() != link.dim() {
            return Err(Error::Device(format!(
                "text map {:?} and link map {:?} differ in shape",
                text.shape(),
                link.shape()
            )));
        }
        if !stride.is_finite() || stride <= 0.0 {
            return Err(Error::InvalidScale(format!("score map stride {stride}")));
        }
        Ok(Self { text, link, stride })
    }

    pub fn from_net_output(output: &NetOutput, params: &ResizeParameters) -> Result<Self> {
        let (channels, _, width) = output.scoremap.dim();
        if channels < 2 || width == 0 {
            return Err(Error::Device(format!(
                "score map of shape {:?} has no text/link channels",
                output.scoremap.shape()
            )));
        }
        Self::new(
            output.scoremap.index_axis(Axis(0), 0).to_owned(),
            output.scoremap.index_axis(Axis(0), 1).to_owned(),
            params.padded_width as f32 / width as f32,
        )
    }

    pub fn text(&self) -> &Array2<f32> {
        &self.text
    }

    pub fn link(&self) -> &Array2<f32> {
        &self.link
    }

    /// Padded input pixels per map cell.
    pub fn stride(&self) -> f32 {
        self.stride
    }

    /// `(width, height)`
    pub fn size(&self) -> (usize, usize) {
        let (height, width) = self.text.dim();
        (width, height)
    }
}

/// One connected region. Its pixels live in `Components::arena`.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    len: usize,
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
}

struct Components {
    arena: Vec<usize>,
    spans: Vec<Span>,
}

impl Components {
    fn pixels(&self, span: &Span) -> &[usize] {
        &self.arena[span.start..span.start + span.len]
    }
}

/// 4-connected labelling by breadth-first fill. `labels` doubles as the
/// visited bitmap, so no pixel is queued twice.
fn label_components(mask: &[bool], width: usize, height: usize) -> Components {
    let mut labels = vec![0u32; mask.len()];
    let mut arena = Vec::new();
    let mut spans = Vec::new();
    let mut queue = VecDeque::new();

    for seed in 0..mask.len() {
        if !mask[seed] || labels[seed] != 0 {
            continue;
        }
        let label = spans.len() as u32 + 1;
        let start = arena.len();
        let mut span = Span {
            start,
            len: 0,
            min_x: usize::MAX,
            min_y: usize::MAX,
            max_x: 0,
            max_y: 0,
        };
        labels[seed] = label;
        queue.push_back(seed);

        while let Some(idx) = queue.pop_front() {
            arena.push(idx);
            let (x, y) = (idx % width, idx / width);
            span.min_x = span.min_x.min(x);
            span.min_y = span.min_y.min(y);
            span.max_x = span.max_x.max(x);
            span.max_y = span.max_y.max(y);

            let neighbours = [
                (x > 0).then(|| idx - 1),
                (x + 1 < width).then(|| idx + 1),
                (y > 0).then(|| idx - width),
                (y + 1 < height).then(|| idx + width),
            ];
            for next in neighbours.into_iter().flatten() {
                if mask[next] && labels[next] == 0 {
                    labels[next] = label;
                    queue.push_back(next);
                }
            }
        }

        span.len = arena.len() - start;
        spans.push(span);
    }

    Components { arena, spans }
}

/// Extracts text regions as quads in padded input space.
///
/// Cells above `low_text` form text, cells above `link_threshold` join
/// neighbouring text into one region. A region survives if it has at least
/// [`MIN_REGION_SIZE`] cells and its text peak reaches `text_threshold`. Each
/// survivor is dilated in proportion to its density and fitted with a
/// minimum-area rectangle, or with its axis-aligned bounds when that rectangle
/// is nearly square.
///
/// Returns `(boxes, polys)`; both carry the same quads.
#[instrument(level = "debug", skip(maps), fields(size = ?maps.size()))]
pub fn get_det_boxes(
    maps: &ScoreMaps,
    text_threshold: f32,
    link_threshold: f32,
    low_text: f32,
) -> (Vec<Quad<Padded>>, Vec<Quad<Padded>>) {
    let (width, height) = maps.size();
    let text = maps.text.iter().copied().collect::<Vec<_>>();
    let text_mask = text.iter().map(|v| *v > low_text).collect::<Vec<_>>();
    let link_mask = maps
        .link
        .iter()
        .map(|v| *v > link_threshold)
        .collect::<Vec<_>>();
    let combined = text_mask
        .iter()
        .zip(&link_mask)
        .map(|(t, l)| *t || *l)
        .collect::<Vec<_>>();

    let components = label_components(&combined, width, height);
    log::debug!(
        "Found {} connected regions in a {width}x{height} score map",
        components.spans.len()
    );

    let boxes = components
        .spans
        .iter()
        .filter(|span| span.len >= MIN_REGION_SIZE)
        .filter(|span| {
            let peak = components
                .pixels(span)
                .iter()
                .map(|&idx| FloatOrd(text[idx]))
                .max()
                .map_or(f32::NEG_INFINITY, |peak| peak.0);
            peak >= text_threshold
        })
        .filter_map(|span| {
            let pixels = components
                .pixels(span)
                .iter()
                .copied()
                .filter(|&idx| text_mask[idx] || !link_mask[idx]);
            region_quad(span, pixels, width, height)
        })
        .map(|corners| {
            Quad::new(corners.map(|p| Coord {
                x: p.x * maps.stride,
                y: p.y * maps.stride,
            }))
        })
        .collect::<Vec<_>>();

    log::debug!("Kept {} text regions", boxes.len());
    (boxes.clone(), boxes)
}

fn region_quad(
    span: &Span,
    pixels: impl Iterator<Item = usize>,
    width: usize,
    height: usize,
) -> Option<[Coord<f32>; 4]> {
    let w = span.max_x - span.min_x + 1;
    let h = span.max_y - span.min_y + 1;
    let niter = (((span.len * w.min(h)) as f32 / (w * h) as f32).sqrt() * 2.0) as usize;

    let sx = span.min_x.saturating_sub(niter);
    let sy = span.min_y.saturating_sub(niter);
    let ex = (span.min_x + w + niter + 1).min(width);
    let ey = (span.min_y + h + niter + 1).min(height);

    let mut segmap = GrayImage::new((ex - sx) as u32, (ey - sy) as u32);
    for idx in pixels {
        let (x, y) = (idx % width, idx / width);
        segmap.put_pixel((x - sx) as u32, (y - sy) as u32, Luma([255]));
    }
    dilate_mut(&mut segmap, Norm::LInf, (niter / 2).min(u8::MAX as usize) as u8);

    let points = segmap
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0[0] != 0)
        .map(|(x, y, _)| Coord {
            x: (x as usize + sx) as f32,
            y: (y as usize + sy) as f32,
        })
        .collect::<Vec<_>>();
    if points.is_empty() {
        return None;
    }

    let rotated = MultiPoint::new(points.iter().copied().map(Point::from).collect())
        .minimum_rotated_rect()
        .and_then(|rect| {
            let corners = rect.exterior().0.get(..4)?.to_vec();
            <[Coord<f32>; 4]>::try_from(corners).ok()
        })
        .filter(|corners| !is_near_square(corners));

    Some(order_clockwise(rotated.unwrap_or_else(|| axis_aligned(&points))))
}

fn distance(a: Coord<f32>, b: Coord<f32>) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Diamond-shaped regions give unstable rotated rects; bounds fit them better.
fn is_near_square(corners: &[Coord<f32>; 4]) -> bool {
    let w = distance(corners[0], corners[1]);
    let h = distance(corners[1], corners[2]);
    let ratio = w.max(h) / (w.min(h) + 1e-5);
    (1.0 - ratio).abs() <= 0.1
}

fn axis_aligned(points: &[Coord<f32>]) -> [Coord<f32>; 4] {
    let (l, t, r, b) = points.iter().fold(
        (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
        |(l, t, r, b), p| (l.min(p.x), t.min(p.y), r.max(p.x), b.max(p.y)),
    );
    Quad::<Padded>::from_bounds(l, t, r, b).points
}

/// Clockwise with y pointing down, starting from the corner nearest the
/// origin.
fn order_clockwise(mut corners: [Coord<f32>; 4]) -> [Coord<f32>; 4] {
    let signed_area: f32 = (0..4)
        .map(|i| {
            let (a, b) = (corners[i], corners[(i + 1) % 4]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    if signed_area < 0.0 {
        corners.reverse();
    }
    let start = (0..4)
        .min_by_key(|&i| FloatOrd(corners[i].x + corners[i].y))
        .unwrap_or(0);
    corners.rotate_left(start);
    corners
}

/// Maps quads from the padded network frame back onto the source image:
/// `(x / ratio_w, y / ratio_h)`, where the ratios are the forward resize
/// factors from [`ResizeParameters::ratio`].
pub fn adjust_result_coordinates(
    quads: &[Quad<Padded>],
    ratio_w: f32,
    ratio_h: f32,
) -> Result<Vec<Quad<Original>>> {
    for ratio in [ratio_w, ratio_h] {
        if !ratio.is_finite() || ratio == 0.0 {
            return Err(Error::InvalidScale(format!(
                "cannot rescale coordinates by {ratio}"
            )));
        }
    }
    Ok(quads
        .iter()
        .map(|quad| {
            Quad::new(quad.map_points(|p| Coord {
                x: p.x / ratio_w,
                y: p.y / ratio_h,
            }))
        })
        .collect())
}

/// Fixed boxes used when no detector is loaded and the caller still wants
/// something to render.
pub fn mock_det_boxes() -> Vec<Quad<Padded>> {
    vec![
        Quad::from_bounds(100.0, 100.0, 200.0, 150.0),
        Quad::from_bounds(100.0, 200.0, 200.0, 250.0),
        Quad::from_bounds(100.0, 300.0, 200.0, 350.0),
    ]
}
