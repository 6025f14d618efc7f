use volcast_core::constants::{OPACITY_CORRECTION_EPSILON, TABLE_SIZE};
use volcast_core::transfer::{ColorChannel, TransferFunction};
use volcast_core::types::{BlendMode, Timestamp};

use crate::backend::GpuBackend;
use crate::bindings::TextureSlot;

/// Inputs the uploaded opacity table was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OpacityKey {
    modified: Timestamp,
    range: [f64; 2],
    blend: BlendMode,
    /// Only meaningful for composite and additive blending.
    sample_distance: Option<f64>,
    unit_distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColorKey {
    modified: Timestamp,
    range: [f64; 2],
}

/// Which tables were rebuilt by one `TransferTables::update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRefresh {
    pub opacity: bool,
    pub colors: u32,
}

/// Decides when the lookup tables must be rebuilt and uploads them.
pub struct TransferTables {
    opacity: Option<OpacityKey>,
    colors: [Option<ColorKey>; 3],
    uploads: u64,
}

impl TransferTables {
    pub fn new() -> Self {
        Self {
            opacity: None,
            colors: [None; 3],
            uploads: 0,
        }
    }

    /// Table uploads issued so far, opacity and color.
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Refresh whatever is stale for this frame. `label_colors` adds the two
    /// mask color tables.
    #[allow(clippy::too_many_arguments)]
    pub fn update<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        transfer: &dyn TransferFunction,
        range: [f64; 2],
        blend: BlendMode,
        sample_distance: f64,
        unit_distance: f64,
        label_colors: bool,
    ) -> TableRefresh {
        let mut refresh = TableRefresh::default();
        let distance_sensitive = matches!(blend, BlendMode::Composite | BlendMode::Additive);
        let key = OpacityKey {
            modified: transfer.modified(),
            range,
            blend,
            sample_distance: distance_sensitive.then_some(sample_distance),
            unit_distance: distance_sensitive.then_some(unit_distance),
        };
        if self.opacity != Some(key) {
            let mut table = transfer.opacity_table(range, TABLE_SIZE);
            correct_opacity(&mut table, blend, sample_distance, unit_distance);
            backend.upload_opacity_table(&table);
            self.opacity = Some(key);
            self.uploads += 1;
            refresh.opacity = true;
        }

        let channels: &[(ColorChannel, TextureSlot)] = if label_colors {
            &[
                (ColorChannel::Main, TextureSlot::ColorTable),
                (ColorChannel::Mask1, TextureSlot::Mask1ColorTable),
                (ColorChannel::Mask2, TextureSlot::Mask2ColorTable),
            ]
        } else {
            &[(ColorChannel::Main, TextureSlot::ColorTable)]
        };
        let color_key = ColorKey {
            modified: transfer.modified(),
            range,
        };
        for (i, &(channel, slot)) in channels.iter().enumerate() {
            if self.colors[i] != Some(color_key) {
                let table = transfer.color_table(channel, range, TABLE_SIZE);
                backend.upload_color_table(slot, &table);
                self.colors[i] = Some(color_key);
                self.uploads += 1;
                refresh.colors += 1;
            }
        }
        refresh
    }

    /// Forget uploaded tables so the next update rebuilds all of them.
    pub fn release(&mut self) {
        self.opacity = None;
        self.colors = [None; 3];
    }
}

impl Default for TransferTables {
    fn default() -> Self {
        Self::new()
    }
}

/// Rescale table opacities, defined per `unit_distance`, to one ray step of
/// `sample_distance`.
pub fn correct_opacity(table: &mut [f32], blend: BlendMode, sample_distance: f64, unit_distance: f64) {
    if !(unit_distance > 0.0) {
        return;
    }
    let ratio = sample_distance / unit_distance;
    match blend {
        BlendMode::Composite => {
            for a in table.iter_mut() {
                if *a > OPACITY_CORRECTION_EPSILON {
                    *a = (1.0 - (1.0 - *a as f64).powf(ratio)) as f32;
                }
            }
        }
        BlendMode::Additive => {
            for a in table.iter_mut() {
                *a = (*a as f64 * ratio) as f32;
            }
        }
        BlendMode::MaximumIntensity | BlendMode::MinimumIntensity => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcast_core::transfer::PiecewiseTransferFunction;

    use crate::software::SoftwareBackend;

    #[test]
    fn test_composite_correction() {
        let mut table = vec![0.5, 0.0, 0.00005];
        correct_opacity(&mut table, BlendMode::Composite, 2.0, 1.0);
        assert!((table[0] - 0.75).abs() < 1e-6);
        assert_eq!(table[1], 0.0);
        assert_eq!(table[2], 0.00005);
    }

    #[test]
    fn test_additive_correction_is_linear() {
        let mut table = vec![0.5, 0.2];
        correct_opacity(&mut table, BlendMode::Additive, 0.5, 1.0);
        assert_eq!(table, vec![0.25, 0.1]);
        let mut mip = vec![0.5];
        correct_opacity(&mut mip, BlendMode::MaximumIntensity, 0.5, 1.0);
        assert_eq!(mip, vec![0.5]);
    }

    #[test]
    fn test_refresh_triggers() {
        let mut backend = SoftwareBackend::new();
        let mut tables = TransferTables::new();
        let mut tf = PiecewiseTransferFunction::constant(0.5, [1.0, 0.0, 0.0]);

        let r = tables.update(&mut backend, &tf, [0.0, 1.0], BlendMode::Composite, 1.0, 1.0, false);
        assert_eq!(r, TableRefresh { opacity: true, colors: 1 });
        let r = tables.update(&mut backend, &tf, [0.0, 1.0], BlendMode::Composite, 1.0, 1.0, false);
        assert_eq!(r, TableRefresh::default());

        let r = tables.update(&mut backend, &tf, [0.0, 1.0], BlendMode::Composite, 0.5, 1.0, false);
        assert_eq!(r, TableRefresh { opacity: true, colors: 0 });

        let r = tables.update(&mut backend, &tf, [0.0, 2.0], BlendMode::Composite, 0.5, 1.0, false);
        assert_eq!(r, TableRefresh { opacity: true, colors: 1 });

        tf.add_opacity_point(0.0, 0.1);
        let r = tables.update(&mut backend, &tf, [0.0, 2.0], BlendMode::Composite, 0.5, 1.0, false);
        assert!(r.opacity);

        tables.release();
        let r = tables.update(&mut backend, &tf, [0.0, 2.0], BlendMode::Composite, 0.5, 1.0, true);
        assert_eq!(r, TableRefresh { opacity: true, colors: 3 });
    }

    #[test]
    fn test_mip_ignores_sample_distance() {
        let mut backend = SoftwareBackend::new();
        let mut tables = TransferTables::new();
        let tf = PiecewiseTransferFunction::constant(0.5, [1.0; 3]);
        let blend = BlendMode::MaximumIntensity;
        assert!(tables.update(&mut backend, &tf, [0.0, 1.0], blend, 1.0, 1.0, false).opacity);
        assert!(!tables.update(&mut backend, &tf, [0.0, 1.0], blend, 3.0, 1.0, false).opacity);
        assert!(tables.update(&mut backend, &tf, [0.0, 1.0], BlendMode::Composite, 3.0, 1.0, false).opacity);
    }

    #[test]
    fn test_uploaded_table_is_corrected() {
        let mut backend = SoftwareBackend::new();
        let mut tables = TransferTables::new();
        let tf = PiecewiseTransferFunction::constant(0.5, [1.0; 3]);
        tables.update(&mut backend, &tf, [0.0, 1.0], BlendMode::Composite, 2.0, 1.0, false);
        let uploaded = backend.opacity_table();
        assert_eq!(uploaded.len(), TABLE_SIZE);
        assert!((uploaded[0] - 0.75).abs() < 1e-6);
    }
}
