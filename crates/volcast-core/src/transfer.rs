use crate::types::Timestamp;

/// Which color curve a table is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorChannel {
    Main,
    /// Color of label 1 in a label-map mask.
    Mask1,
    /// Color of label 2 in a label-map mask.
    Mask2,
}

/// Curve evaluation boundary. The mapper decides when tables are refreshed and
/// uploads them; implementors only sample their curves over a scalar range.
pub trait TransferFunction {
    /// `size` opacity samples evenly spaced over `range`, uncorrected.
    fn opacity_table(&self, range: [f64; 2], size: usize) -> Vec<f32>;

    /// `size` RGB samples evenly spaced over `range`.
    fn color_table(&self, channel: ColorChannel, range: [f64; 2], size: usize) -> Vec<[f32; 3]>;

    /// Stamp of the last curve edit.
    fn modified(&self) -> Timestamp;
}

/// Scalar value of table entry `i` of `size` over `range`.
pub fn table_sample(range: [f64; 2], i: usize, size: usize) -> f64 {
    if size <= 1 {
        return range[0];
    }
    range[0] + (range[1] - range[0]) * i as f64 / (size - 1) as f64
}

/// Piecewise-linear opacity and color curves, clamped beyond the end points.
#[derive(Debug, Clone)]
pub struct PiecewiseTransferFunction {
    opacity: Vec<(f64, f32)>,
    colors: [Vec<(f64, [f32; 3])>; 3],
    modified: Timestamp,
}

impl PiecewiseTransferFunction {
    pub fn new() -> Self {
        Self {
            opacity: Vec::new(),
            colors: [Vec::new(), Vec::new(), Vec::new()],
            modified: Timestamp::now(),
        }
    }

    /// Constant opacity and color everywhere.
    pub fn constant(opacity: f32, color: [f32; 3]) -> Self {
        let mut tf = Self::new();
        tf.add_opacity_point(0.0, opacity);
        tf.add_color_point(ColorChannel::Main, 0.0, color);
        tf
    }

    pub fn add_opacity_point(&mut self, x: f64, opacity: f32) {
        insert_sorted(&mut self.opacity, x, opacity.clamp(0.0, 1.0));
        self.modified = Timestamp::now();
    }

    pub fn add_color_point(&mut self, channel: ColorChannel, x: f64, rgb: [f32; 3]) {
        insert_sorted(&mut self.colors[channel_index(channel)], x, rgb);
        self.modified = Timestamp::now();
    }

    pub fn opacity_at(&self, x: f64) -> f32 {
        evaluate(&self.opacity, x, 0.0, |a, b, t| a + (b - a) * t)
    }

    pub fn color_at(&self, channel: ColorChannel, x: f64) -> [f32; 3] {
        evaluate(&self.colors[channel_index(channel)], x, [1.0; 3], |a, b, t| {
            [
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
            ]
        })
    }
}

impl Default for PiecewiseTransferFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferFunction for PiecewiseTransferFunction {
    fn opacity_table(&self, range: [f64; 2], size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| self.opacity_at(table_sample(range, i, size)))
            .collect()
    }

    fn color_table(&self, channel: ColorChannel, range: [f64; 2], size: usize) -> Vec<[f32; 3]> {
        (0..size)
            .map(|i| self.color_at(channel, table_sample(range, i, size)))
            .collect()
    }

    fn modified(&self) -> Timestamp {
        self.modified
    }
}

fn channel_index(channel: ColorChannel) -> usize {
    match channel {
        ColorChannel::Main => 0,
        ColorChannel::Mask1 => 1,
        ColorChannel::Mask2 => 2,
    }
}

fn insert_sorted<T>(points: &mut Vec<(f64, T)>, x: f64, value: T) {
    match points.iter().position(|(px, _)| *px >= x) {
        Some(i) if points[i].0 == x => points[i].1 = value,
        Some(i) => points.insert(i, (x, value)),
        None => points.push((x, value)),
    }
}

fn evaluate<T: Copy>(points: &[(f64, T)], x: f64, empty: T, lerp: impl Fn(T, T, f32) -> T) -> T {
    let (first, last) = match (points.first(), points.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return empty,
    };
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }
    for pair in points.windows(2) {
        let (x0, v0) = pair[0];
        let (x1, v1) = pair[1];
        if x <= x1 {
            let t = ((x - x0) / (x1 - x0)) as f32;
            return lerp(v0, v1, t);
        }
    }
    last.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opacity_interpolates_between_points() {
        let mut tf = PiecewiseTransferFunction::new();
        tf.add_opacity_point(0.0, 0.0);
        tf.add_opacity_point(10.0, 1.0);
        assert!((tf.opacity_at(5.0) - 0.5).abs() < 1e-6);
        assert_eq!(tf.opacity_at(-3.0), 0.0);
        assert_eq!(tf.opacity_at(20.0), 1.0);
    }

    #[test]
    fn test_table_covers_range_end_points() {
        let mut tf = PiecewiseTransferFunction::new();
        tf.add_opacity_point(0.0, 0.0);
        tf.add_opacity_point(1.0, 1.0);
        let table = tf.opacity_table([0.0, 1.0], 1024);
        assert_eq!(table.len(), 1024);
        assert_eq!(table[0], 0.0);
        assert_eq!(table[1023], 1.0);
    }

    #[test]
    fn test_degenerate_range_table_is_constant() {
        let mut tf = PiecewiseTransferFunction::new();
        tf.add_opacity_point(0.0, 0.0);
        tf.add_opacity_point(1.0, 0.5);
        let table = tf.opacity_table([1.0, 1.0], 16);
        assert!(table.iter().all(|&a| a == 0.5));
    }

    #[test]
    fn test_edit_bumps_modified() {
        let mut tf = PiecewiseTransferFunction::new();
        let before = tf.modified();
        tf.add_color_point(ColorChannel::Mask1, 0.0, [1.0, 0.0, 0.0]);
        assert!(tf.modified() > before);
        assert_eq!(tf.color_at(ColorChannel::Mask1, 3.0), [1.0, 0.0, 0.0]);
        assert_eq!(tf.color_at(ColorChannel::Main, 3.0), [1.0, 1.0, 1.0]);
    }
}
