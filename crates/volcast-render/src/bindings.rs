use crate::shader_variant::{ComponentMode, MethodFamily, ShaderVariant};

/// Texture resources the ray-cast program samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureSlot {
    Scalar,
    ColorTable,
    OpacityTable,
    DepthGrab,
    AccumulationInput,
    ScalarAccumulationInput,
    Noise,
    Mask,
    Mask1ColorTable,
    Mask2ColorTable,
}

impl TextureSlot {
    pub const ALL: [TextureSlot; 10] = [
        TextureSlot::Scalar,
        TextureSlot::ColorTable,
        TextureSlot::OpacityTable,
        TextureSlot::DepthGrab,
        TextureSlot::AccumulationInput,
        TextureSlot::ScalarAccumulationInput,
        TextureSlot::Noise,
        TextureSlot::Mask,
        TextureSlot::Mask1ColorTable,
        TextureSlot::Mask2ColorTable,
    ];

    /// Binding index in the ray-cast bind group. Must match the shader declarations.
    pub const fn binding(self) -> u32 {
        match self {
            TextureSlot::Scalar => 0,
            TextureSlot::ColorTable => 1,
            TextureSlot::OpacityTable => 2,
            TextureSlot::DepthGrab => 3,
            TextureSlot::AccumulationInput => 4,
            TextureSlot::ScalarAccumulationInput => 5,
            TextureSlot::Noise => 6,
            TextureSlot::Mask => 7,
            TextureSlot::Mask1ColorTable => 8,
            TextureSlot::Mask2ColorTable => 9,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextureSlot::Scalar => "scalar",
            TextureSlot::ColorTable => "color-table",
            TextureSlot::OpacityTable => "opacity-table",
            TextureSlot::DepthGrab => "depth-grab",
            TextureSlot::AccumulationInput => "accumulation-input",
            TextureSlot::ScalarAccumulationInput => "scalar-accumulation-input",
            TextureSlot::Noise => "noise",
            TextureSlot::Mask => "mask",
            TextureSlot::Mask1ColorTable => "mask1-color-table",
            TextureSlot::Mask2ColorTable => "mask2-color-table",
        }
    }
}

/// Slots a variant binds, in bind order. Resolved once per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    slots: Vec<TextureSlot>,
}

impl SlotTable {
    pub fn for_variant(variant: &ShaderVariant) -> Self {
        let family = variant.method.family();
        let mut slots = vec![TextureSlot::Scalar];
        if variant.components == ComponentMode::One && family != MethodFamily::Additive {
            slots.push(TextureSlot::ColorTable);
        }
        slots.push(TextureSlot::OpacityTable);
        slots.push(TextureSlot::DepthGrab);
        if variant.cropping {
            slots.push(TextureSlot::AccumulationInput);
            if family != MethodFamily::Composite {
                slots.push(TextureSlot::ScalarAccumulationInput);
            }
        }
        slots.push(TextureSlot::Noise);
        if variant.method.uses_mask() {
            slots.push(TextureSlot::Mask);
        }
        if variant.method.uses_label_colors() {
            slots.push(TextureSlot::Mask1ColorTable);
            slots.push(TextureSlot::Mask2ColorTable);
        }
        Self { slots }
    }

    pub fn slots(&self) -> &[TextureSlot] {
        &self.slots
    }

    pub fn contains(&self, slot: TextureSlot) -> bool {
        self.slots.contains(&slot)
    }

    /// Unbind order: the reverse of bind order.
    pub fn release_order(&self) -> impl Iterator<Item = TextureSlot> + '_ {
        self.slots.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader_variant::{Projection, RayMethod, Shading};

    fn variant(method: RayMethod, cropping: bool, components: ComponentMode) -> ShaderVariant {
        ShaderVariant {
            projection: Projection::Perspective,
            method,
            cropping,
            shading: Shading::NotApplicable,
            components,
        }
    }

    #[test]
    fn test_bindings_are_unique() {
        let mut seen: Vec<u32> = TextureSlot::ALL.iter().map(|s| s.binding()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), TextureSlot::ALL.len());
    }

    #[test]
    fn test_single_pass_composite_slots() {
        let table = SlotTable::for_variant(&variant(RayMethod::Composite, false, ComponentMode::One));
        assert_eq!(
            table.slots(),
            &[
                TextureSlot::Scalar,
                TextureSlot::ColorTable,
                TextureSlot::OpacityTable,
                TextureSlot::DepthGrab,
                TextureSlot::Noise,
            ]
        );
    }

    #[test]
    fn test_multi_pass_mip_reads_both_accumulators() {
        let table = SlotTable::for_variant(&variant(RayMethod::MipBinaryMask, true, ComponentMode::One));
        assert!(table.contains(TextureSlot::AccumulationInput));
        assert!(table.contains(TextureSlot::ScalarAccumulationInput));
        assert!(table.contains(TextureSlot::Mask));
        assert!(!table.contains(TextureSlot::Mask1ColorTable));
    }

    #[test]
    fn test_label_mask_binds_label_tables() {
        let table = SlotTable::for_variant(&variant(RayMethod::CompositeLabelMask, false, ComponentMode::One));
        assert!(table.contains(TextureSlot::Mask1ColorTable));
        assert!(table.contains(TextureSlot::Mask2ColorTable));
        assert_eq!(table.release_order().next(), Some(TextureSlot::Mask2ColorTable));
    }

    #[test]
    fn test_four_component_skips_color_table() {
        let table = SlotTable::for_variant(&variant(RayMethod::Composite, false, ComponentMode::Four));
        assert!(!table.contains(TextureSlot::ColorTable));
    }
}
